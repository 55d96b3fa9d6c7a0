//! Task management.
//!
//! The task manager owns one task queue per registered dataset. Each queue sits behind its own
//! lock, while the map of datasets is swapped atomically, so that workers of different datasets
//! never contend & lookups never wait on a registration.

mod ctl;
mod queue;
#[cfg(test)]
mod queue_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::database::Database;
use crate::error::{AppError, ShutdownResult};
use crate::models::{DatasetCheckpoint, DatasetSpec, DatasetStatus, ReportOutcome, TaskAssignment, TaskId, TaskOutcome};
use crate::speed::SpeedMonitor;
pub use ctl::{CheckpointCtl, ReclaimCtl};
pub use queue::{QueuePolicy, Reclaimed, TaskQueue};

pub const METRIC_TASKS_DISPATCHED: &str = "elastic_tasks_dispatched";
pub const METRIC_TASKS_FINISHED: &str = "elastic_tasks_finished";
pub const METRIC_TASKS_FAILED: &str = "elastic_tasks_failed";
pub const METRIC_TASKS_RECLAIMED: &str = "elastic_tasks_reclaimed";
pub const METRIC_STALE_REPORTS: &str = "elastic_stale_reports";

/// All registered datasets mapped from their name to their task queue.
pub type DatasetsMap = Arc<ArcSwap<HashMap<Arc<String>, DatasetHandle>>>;

/// A handle to the task queue of a dataset.
#[derive(Clone)]
pub struct DatasetHandle {
    queue: Arc<Mutex<TaskQueue>>,
}

impl DatasetHandle {
    fn new(queue: TaskQueue) -> Self {
        Self {
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Lock the queue.
    ///
    /// A panic while holding the lock leaves the queue in a consistent state between operations,
    /// so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The task manager of the job.
pub struct TaskManager {
    datasets: DatasetsMap,
    policy: QueuePolicy,
    speed: Arc<SpeedMonitor>,
    /// Held while checkpoints are written, and while a dataset & its checkpoint are removed.
    checkpoint_lock: AsyncMutex<()>,
}

impl TaskManager {
    /// Create a new instance.
    pub fn new(policy: QueuePolicy, speed: Arc<SpeedMonitor>) -> Self {
        metrics::describe_counter!(METRIC_TASKS_DISPATCHED, "tasks handed out to workers");
        metrics::describe_counter!(METRIC_TASKS_FINISHED, "tasks reported as finished");
        metrics::describe_counter!(METRIC_TASKS_FAILED, "tasks which failed permanently");
        metrics::describe_counter!(METRIC_TASKS_RECLAIMED, "tasks reclaimed from timed out or lost workers");
        metrics::describe_counter!(METRIC_STALE_REPORTS, "reports on tasks not held by the reporting worker");
        Self {
            datasets: Default::default(),
            policy,
            speed,
            checkpoint_lock: AsyncMutex::new(()),
        }
    }

    fn handle(&self, name: &str) -> Result<DatasetHandle, AppError> {
        self.datasets
            .load()
            .get(&name.to_string())
            .cloned()
            .ok_or_else(|| AppError::UnknownDataset(name.into()))
    }

    /// Register a dataset, returning `false` if a dataset of the same name is already registered.
    #[tracing::instrument(level = "debug", skip(self, spec), fields(dataset = %spec.name))]
    pub fn new_dataset(&self, spec: DatasetSpec) -> Result<bool, AppError> {
        spec.validate()?;
        if self.datasets.load().contains_key(&spec.name) {
            return Ok(false);
        }
        let name = Arc::new(spec.name.clone());
        let (num_epochs, shuffle) = (spec.num_epochs, spec.shuffle);
        let handle = DatasetHandle::new(TaskQueue::new(spec, self.policy.clone())?);
        let inserted = self.insert_if_absent(name.clone(), handle);
        if inserted {
            tracing::info!(dataset = %name, num_epochs, shuffle, "registered dataset");
        }
        Ok(inserted)
    }

    /// Register a dataset from a checkpoint, returning `false` if it is already registered.
    pub fn restore_dataset(&self, checkpoint: DatasetCheckpoint) -> Result<bool, AppError> {
        let name = Arc::new(checkpoint.spec.name.clone());
        let handle = DatasetHandle::new(TaskQueue::restore(checkpoint, self.policy.clone())?);
        let inserted = self.insert_if_absent(name.clone(), handle);
        if inserted {
            tracing::info!(dataset = %name, "restored dataset from checkpoint");
        }
        Ok(inserted)
    }

    fn insert_if_absent(&self, name: Arc<String>, handle: DatasetHandle) -> bool {
        let mut inserted = false;
        self.datasets.rcu(|datasets| {
            let mut updated = HashMap::clone(datasets);
            inserted = !updated.contains_key(&name);
            if inserted {
                updated.insert(name.clone(), handle.clone());
            }
            updated
        });
        inserted
    }

    /// Remove a dataset, returning `false` if it was not registered.
    pub fn remove_dataset(&self, name: &str) -> bool {
        let name = name.to_string();
        let mut removed = false;
        self.datasets.rcu(|datasets| {
            let mut updated = HashMap::clone(datasets);
            removed = updated.remove(&name).is_some();
            updated
        });
        if removed {
            tracing::info!(dataset = %name, "removed dataset");
        }
        removed
    }

    /// Remove a dataset along with its persisted checkpoint, returning `false` if it was not registered.
    ///
    /// A checkpoint pass in progress completes first, so it can not write the dataset back.
    pub async fn remove_persisted_dataset(&self, name: &str, db: &Database) -> ShutdownResult<bool> {
        let _guard = self.checkpoint_lock.lock().await;
        if !self.remove_dataset(name) {
            return Ok(false);
        }
        db.delete_checkpoint(name).await?;
        Ok(true)
    }

    /// Acquire the lock which excludes dataset removal while checkpoints are written.
    pub async fn checkpoint_guard(&self) -> AsyncMutexGuard<'_, ()> {
        self.checkpoint_lock.lock().await
    }

    /// Hand the next task of a dataset to a worker.
    ///
    /// When the current epoch has nothing left to dispatch and epochs remain, the next epoch is
    /// materialized under the same lock.
    #[tracing::instrument(level = "debug", skip(self, now))]
    pub fn get_task(&self, name: &str, worker_id: &str, now: Instant) -> Result<Option<TaskAssignment>, AppError> {
        let handle = self.handle(name)?;
        let mut queue = handle.lock();
        let mut task = queue.checkout(worker_id, now);
        if task.is_none() && !queue.has_pending() && queue.has_next_epoch() {
            let epoch = queue.epoch() + 1;
            queue.enqueue_epoch(epoch)?;
            tracing::info!(dataset = name, epoch, "advanced to next epoch");
            task = queue.checkout(worker_id, now);
        }
        Ok(task.map(|task| {
            metrics::increment_counter!(METRIC_TASKS_DISPATCHED);
            tracing::debug!(dataset = name, task_id = task.id, worker_id, epoch = task.shard.epoch, "dispatched task");
            TaskAssignment::new(&task, queue.spec())
        }))
    }

    /// Apply a worker's report on a task.
    #[tracing::instrument(level = "debug", skip(self, outcome, now))]
    pub fn report_task(&self, name: &str, task_id: TaskId, worker_id: &str, outcome: &TaskOutcome, now: Instant) -> Result<ReportOutcome, AppError> {
        let handle = self.handle(name)?;
        let (res, complete) = {
            let mut queue = handle.lock();
            let res = queue.report(task_id, worker_id, outcome);
            (res, queue.is_complete())
        };
        match res {
            ReportOutcome::Finished { records } => {
                metrics::increment_counter!(METRIC_TASKS_FINISHED);
                self.speed.collect(now, records);
                if complete {
                    tracing::info!(dataset = name, "dataset complete");
                }
            }
            ReportOutcome::Requeued => {
                tracing::warn!(dataset = name, task_id, worker_id, ?outcome, "task failed, requeued");
            }
            ReportOutcome::Failed => {
                metrics::increment_counter!(METRIC_TASKS_FAILED);
                tracing::error!(dataset = name, task_id, worker_id, ?outcome, "task failed permanently");
            }
            ReportOutcome::Stale => {
                metrics::increment_counter!(METRIC_STALE_REPORTS);
                tracing::debug!(dataset = name, task_id, worker_id, "ignoring stale task report");
            }
        }
        Ok(res)
    }

    /// Whether all epochs of a dataset have been dispatched & every task is finished or failed.
    pub fn is_dataset_complete(&self, name: &str) -> Result<bool, AppError> {
        Ok(self.handle(name)?.lock().is_complete())
    }

    pub fn dataset_status(&self, name: &str) -> Result<DatasetStatus, AppError> {
        Ok(self.handle(name)?.lock().status())
    }

    /// Surface the tasks of a dataset which failed permanently.
    pub fn dataset_errors(&self, name: &str) -> Result<(), AppError> {
        let failed = self.handle(name)?.lock().failed_tasks();
        if failed.is_empty() {
            return Ok(());
        }
        Err(AppError::TaskRetryExhausted {
            dataset: name.into(),
            tasks: failed,
        })
    }

    /// Reclaim timed out tasks of all datasets, returning the number of reclaimed tasks.
    ///
    /// Tasks which exhaust their retries by timing out fail permanently.
    pub fn reclaim_timeouts(&self, now: Instant) -> usize {
        let datasets = self.datasets.load();
        let (mut total, mut failed) = (0, 0);
        for (name, handle) in datasets.iter() {
            let reclaimed = handle.lock().reclaim_timeouts(now);
            if !reclaimed.requeued.is_empty() {
                tracing::warn!(dataset = %name, tasks = ?reclaimed.requeued, "reclaimed timed out tasks");
            }
            if !reclaimed.failed.is_empty() {
                tracing::error!(dataset = %name, tasks = ?reclaimed.failed, "tasks failed permanently after timing out");
            }
            total += reclaimed.len();
            failed += reclaimed.failed.len();
        }
        metrics::counter!(METRIC_TASKS_RECLAIMED, total as u64);
        metrics::counter!(METRIC_TASKS_FAILED, failed as u64);
        total
    }

    /// Requeue the tasks held by a lost worker, returning the number of recovered tasks.
    pub fn recover_worker_tasks(&self, worker_id: &str) -> usize {
        let datasets = self.datasets.load();
        let mut total = 0;
        for (name, handle) in datasets.iter() {
            let recovered = handle.lock().recover_worker(worker_id);
            if !recovered.is_empty() {
                tracing::info!(dataset = %name, worker_id, tasks = ?recovered, "recovered tasks of lost worker");
                total += recovered.len();
            }
        }
        metrics::counter!(METRIC_TASKS_RECLAIMED, total as u64);
        total
    }

    /// Checkpoints of all datasets.
    pub fn checkpoints(&self) -> Vec<DatasetCheckpoint> {
        self.datasets.load().values().map(|handle| handle.lock().checkpoint()).collect()
    }

    /// The names of all registered datasets, sorted.
    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.datasets.load().keys().map(|name| name.to_string()).collect();
        names.sort();
        names
    }
}
