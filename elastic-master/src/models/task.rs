use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::dataset::{DatasetSpec, StorageType, TaskType};

/// The ID of a task, unique within its dataset.
pub type TaskId = u64;

/// A contiguous half-open range of record indices `[start, end)` within one epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub epoch: u32,
    pub start: u64,
    pub end: u64,
}

impl Shard {
    /// The number of records covered by this shard.
    pub fn num_records(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// The lifecycle status of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Finished,
    Failed,
}

impl TaskStatus {
    /// Finished & failed tasks never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// A unit of work wrapping one shard.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub shard: Shard,
    pub status: TaskStatus,
    /// The worker which currently holds, or last held, this task.
    pub worker_id: Option<String>,
    pub assigned_at: Option<Instant>,
    pub deadline: Option<Instant>,
    /// The number of failed or timed out attempts of this task.
    pub retry_count: u32,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: TaskId, shard: Shard) -> Self {
        Self {
            id,
            shard,
            status: TaskStatus::Pending,
            worker_id: None,
            assigned_at: None,
            deadline: None,
            retry_count: 0,
        }
    }
}

/// The outcome of a task, as reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Succeeded,
    Failed {
        /// Whether the task may be retried.
        #[serde(default = "TaskOutcome::default_recoverable")]
        recoverable: bool,
        #[serde(default)]
        message: String,
    },
}

impl TaskOutcome {
    fn default_recoverable() -> bool {
        true
    }
}

/// The effect of a report on the task queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The task finished, covering the given number of records.
    Finished { records: u64 },
    /// The task failed recoverably and was placed back in the queue.
    Requeued,
    /// The task failed permanently.
    Failed,
    /// The task was not assigned to the reporting worker; nothing changed.
    Stale,
}

/// A task handed out to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub dataset_name: String,
    pub epoch: u32,
    pub start: u64,
    pub end: u64,
    pub task_type: TaskType,
    pub storage_type: StorageType,
    pub batch_size: u64,
}

impl TaskAssignment {
    /// Build the assignment of the given task of the given dataset.
    pub fn new(task: &Task, spec: &DatasetSpec) -> Self {
        Self {
            task_id: task.id,
            dataset_name: spec.name.clone(),
            epoch: task.shard.epoch,
            start: task.shard.start,
            end: task.shard.end,
            task_type: spec.task_type,
            storage_type: spec.storage_type,
            batch_size: spec.batch_size,
        }
    }
}

/// A point in time summary of a dataset's progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub name: String,
    /// The latest materialized epoch.
    pub epoch: u32,
    pub num_epochs: u32,
    pub pending: usize,
    pub assigned: usize,
    pub finished: u64,
    /// The IDs of the tasks which failed permanently.
    pub failed: Vec<TaskId>,
    pub epoch_complete: bool,
    pub dataset_complete: bool,
}

/// A task which still has to be processed, or which failed permanently, as recorded in a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTask {
    pub id: TaskId,
    pub shard: Shard,
    pub retry_count: u32,
}

/// The persistable state of a dataset's task queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetCheckpoint {
    pub spec: DatasetSpec,
    pub epoch: u32,
    pub epoch_seed: u64,
    pub next_task_id: TaskId,
    pub finished_count: u64,
    /// In-flight tasks followed by pending tasks, in dispatch order.
    pub pending: Vec<CheckpointTask>,
    pub failed: Vec<CheckpointTask>,
    /// Unix timestamp of when the checkpoint was taken.
    pub created_at: i64,
}
