//! The task queue of a single dataset.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::models::{
    CheckpointTask, DatasetCheckpoint, DatasetSpec, DatasetStatus, ReportOutcome, Task, TaskId, TaskOutcome, TaskStatus,
};
use crate::shard;

/// The dispatch policy shared by all task queues.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuePolicy {
    /// The time a worker has to report a task before it is reclaimed.
    pub task_timeout: Duration,
    /// The number of retries a task gets before it fails permanently.
    pub max_task_retries: u32,
}

/// The timed out tasks of one reclaim pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reclaimed {
    /// Tasks returned to the queue.
    pub requeued: Vec<TaskId>,
    /// Tasks which exhausted their retries.
    pub failed: Vec<TaskId>,
}

impl Reclaimed {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

/// The task queue of a dataset.
///
/// Epochs are materialized lazily, one at a time. Pending tasks are dispatched in FIFO order;
/// tasks which return to the queue go to its back.
#[derive(Debug)]
pub struct TaskQueue {
    spec: DatasetSpec,
    name: String,
    policy: QueuePolicy,

    /// The latest materialized epoch.
    epoch: u32,
    /// The shuffle seed of the latest materialized epoch.
    epoch_seed: u64,
    next_task_id: TaskId,
    finished_count: u64,

    /// Pending tasks in dispatch order.
    todo: VecDeque<TaskId>,
    /// Assigned tasks.
    doing: BTreeSet<TaskId>,
    /// All tracked tasks. Finished tasks of older epochs are pruned.
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskQueue {
    /// Create a new queue for the given dataset, materializing its first epoch.
    pub fn new(spec: DatasetSpec, policy: QueuePolicy) -> Result<Self, AppError> {
        spec.validate()?;
        let mut queue = Self::empty(spec, policy);
        queue.materialize(0, rand::random())?;
        Ok(queue)
    }

    /// Restore a queue from a checkpoint.
    ///
    /// Tasks which were in flight when the checkpoint was taken are pending again.
    pub fn restore(checkpoint: DatasetCheckpoint, policy: QueuePolicy) -> Result<Self, AppError> {
        checkpoint.spec.validate()?;
        if checkpoint.epoch >= checkpoint.spec.num_epochs {
            return Err(AppError::InvalidInput(format!(
                "checkpoint of dataset {} is at epoch {} of {}",
                checkpoint.spec.name, checkpoint.epoch, checkpoint.spec.num_epochs
            )));
        }
        let mut queue = Self::empty(checkpoint.spec, policy);
        queue.epoch = checkpoint.epoch;
        queue.epoch_seed = checkpoint.epoch_seed;
        queue.finished_count = checkpoint.finished_count;
        let mut max_id = None;
        for (ckpt_task, status) in checkpoint
            .pending
            .into_iter()
            .map(|task| (task, TaskStatus::Pending))
            .chain(checkpoint.failed.into_iter().map(|task| (task, TaskStatus::Failed)))
        {
            max_id = max_id.max(Some(ckpt_task.id));
            let mut task = Task::new(ckpt_task.id, ckpt_task.shard);
            task.retry_count = ckpt_task.retry_count;
            task.status = status;
            if status == TaskStatus::Pending {
                queue.todo.push_back(task.id);
            }
            queue.tasks.insert(task.id, task);
        }
        queue.next_task_id = checkpoint.next_task_id.max(max_id.map(|id| id + 1).unwrap_or_default());
        Ok(queue)
    }

    fn empty(spec: DatasetSpec, policy: QueuePolicy) -> Self {
        Self {
            name: spec.name.clone(),
            spec,
            policy,
            epoch: 0,
            epoch_seed: 0,
            next_task_id: 0,
            finished_count: 0,
            todo: VecDeque::new(),
            doing: BTreeSet::new(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    /// The latest materialized epoch.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Whether epochs remain to be materialized.
    pub fn has_next_epoch(&self) -> bool {
        self.epoch + 1 < self.spec.num_epochs
    }

    /// Whether any task is waiting to be dispatched.
    pub fn has_pending(&self) -> bool {
        !self.todo.is_empty()
    }

    /// Materialize the epoch following the current one, returning the number of new tasks.
    pub fn enqueue_epoch(&mut self, epoch: u32) -> Result<usize, AppError> {
        if epoch >= self.spec.num_epochs {
            return Err(AppError::InvalidInput(format!("dataset {} has only {} epochs", self.name, self.spec.num_epochs)));
        }
        if epoch != self.epoch + 1 {
            return Err(AppError::InvalidInput(format!(
                "dataset {} can not materialize epoch {} after epoch {}",
                self.name, epoch, self.epoch
            )));
        }
        self.materialize(epoch, rand::random())
    }

    fn materialize(&mut self, epoch: u32, seed: u64) -> Result<usize, AppError> {
        let shards = shard::generate(&self.spec, epoch, seed)?;
        self.tasks
            .retain(|_, task| !(task.status == TaskStatus::Finished && task.shard.epoch < epoch));
        self.epoch = epoch;
        self.epoch_seed = seed;
        let count = shards.len();
        for shard in shards {
            let id = self.next_task_id;
            self.next_task_id += 1;
            self.tasks.insert(id, Task::new(id, shard));
            self.todo.push_back(id);
        }
        tracing::debug!(dataset = %self.name, epoch, tasks = count, "materialized epoch");
        Ok(count)
    }

    /// Hand the oldest pending task to the given worker.
    pub fn checkout(&mut self, worker_id: &str, now: Instant) -> Option<Task> {
        while let Some(id) = self.todo.pop_front() {
            let task = match self.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => task,
                _ => continue,
            };
            task.status = TaskStatus::Assigned;
            task.worker_id = Some(worker_id.to_string());
            task.assigned_at = Some(now);
            task.deadline = Some(now + self.policy.task_timeout);
            self.doing.insert(id);
            return Some(task.clone());
        }
        None
    }

    /// Apply a worker's report on a task.
    pub fn report(&mut self, task_id: TaskId, worker_id: &str, outcome: &TaskOutcome) -> ReportOutcome {
        let is_holder = self
            .tasks
            .get(&task_id)
            .map(|task| task.status == TaskStatus::Assigned && task.worker_id.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !is_holder {
            return ReportOutcome::Stale;
        }
        match outcome {
            TaskOutcome::Succeeded => {
                self.doing.remove(&task_id);
                let records = match self.tasks.get_mut(&task_id) {
                    Some(task) => {
                        task.status = TaskStatus::Finished;
                        task.deadline = None;
                        task.shard.num_records()
                    }
                    None => 0,
                };
                self.finished_count += 1;
                ReportOutcome::Finished { records }
            }
            TaskOutcome::Failed { recoverable: true, .. } => match self.release(task_id, true) {
                TaskStatus::Pending => ReportOutcome::Requeued,
                _ => ReportOutcome::Failed,
            },
            TaskOutcome::Failed { recoverable: false, .. } => {
                self.doing.remove(&task_id);
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Failed;
                    task.deadline = None;
                }
                ReportOutcome::Failed
            }
        }
    }

    /// Return assigned tasks whose deadline has passed to the queue, consuming a retry.
    pub fn reclaim_timeouts(&mut self, now: Instant) -> Reclaimed {
        let expired: Vec<TaskId> = self
            .doing
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .and_then(|task| task.deadline)
                    .map(|deadline| deadline <= now)
                    .unwrap_or(true)
            })
            .collect();
        let mut reclaimed = Reclaimed::default();
        for id in expired {
            match self.release(id, true) {
                TaskStatus::Pending => reclaimed.requeued.push(id),
                _ => reclaimed.failed.push(id),
            }
        }
        reclaimed
    }

    /// Return the tasks assigned to a lost worker to the queue, without consuming a retry.
    pub fn recover_worker(&mut self, worker_id: &str) -> Vec<TaskId> {
        let held: Vec<TaskId> = self
            .doing
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .map(|task| task.worker_id.as_deref() == Some(worker_id))
                    .unwrap_or(false)
            })
            .collect();
        for id in held.iter() {
            self.release(*id, false);
        }
        held
    }

    /// Move an assigned task back to pending, or to failed once its retries are exhausted.
    fn release(&mut self, task_id: TaskId, consume_retry: bool) -> TaskStatus {
        self.doing.remove(&task_id);
        let task = match self.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => return TaskStatus::Failed,
        };
        task.worker_id = None;
        task.assigned_at = None;
        task.deadline = None;
        if consume_retry {
            task.retry_count += 1;
        }
        if task.retry_count > self.policy.max_task_retries {
            task.status = TaskStatus::Failed;
        } else {
            task.status = TaskStatus::Pending;
            self.todo.push_back(task_id);
        }
        task.status
    }

    /// Whether every task of the latest materialized epoch is finished or failed.
    pub fn epoch_complete(&self) -> bool {
        self.tasks
            .values()
            .filter(|task| task.shard.epoch == self.epoch)
            .all(|task| task.status.is_terminal())
    }

    /// Whether all epochs have been materialized & nothing is left to dispatch or await.
    pub fn is_complete(&self) -> bool {
        !self.has_next_epoch() && self.todo.is_empty() && self.doing.is_empty()
    }

    /// The IDs of the tasks which failed permanently.
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| task.id)
            .collect()
    }

    pub fn status(&self) -> DatasetStatus {
        DatasetStatus {
            name: self.spec.name.clone(),
            epoch: self.epoch,
            num_epochs: self.spec.num_epochs,
            pending: self.todo.len(),
            assigned: self.doing.len(),
            finished: self.finished_count,
            failed: self.failed_tasks(),
            epoch_complete: self.epoch_complete(),
            dataset_complete: self.is_complete(),
        }
    }

    /// Capture the state needed to resume this queue.
    pub fn checkpoint(&self) -> DatasetCheckpoint {
        let to_ckpt = |task: &Task| CheckpointTask {
            id: task.id,
            shard: task.shard,
            retry_count: task.retry_count,
        };
        let pending = self
            .doing
            .iter()
            .chain(self.todo.iter())
            .filter_map(|id| self.tasks.get(id))
            .map(to_ckpt)
            .collect();
        let failed = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(to_ckpt)
            .collect();
        DatasetCheckpoint {
            spec: self.spec.clone(),
            epoch: self.epoch,
            epoch_seed: self.epoch_seed,
            next_task_id: self.next_task_id,
            finished_count: self.finished_count,
            pending,
            failed,
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// The shards of the current epoch which have not been dispatched yet.
    #[cfg(test)]
    pub fn pending_shards(&self) -> Vec<crate::models::Shard> {
        self.todo.iter().filter_map(|id| self.tasks.get(id)).map(|task| task.shard).collect()
    }
}
