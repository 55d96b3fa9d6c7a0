//! Data models of the task dispatch system.

mod dataset;
mod task;

pub use dataset::{DatasetSpec, StorageType, TaskType, MAX_SHARDS_PER_EPOCH};
pub use task::{
    CheckpointTask, DatasetCheckpoint, DatasetStatus, ReportOutcome, Shard, Task, TaskAssignment, TaskId, TaskOutcome, TaskStatus,
};
