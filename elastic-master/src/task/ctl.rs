//! Background controllers of the task manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use super::TaskManager;
use crate::database::Database;

/// A controller which periodically reclaims timed out tasks.
pub struct ReclaimCtl {
    tasks: Arc<TaskManager>,
    interval: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ReclaimCtl {
    /// Create a new instance.
    pub fn new(tasks: Arc<TaskManager>, interval: Duration, shutdown_tx: &broadcast::Sender<()>) -> Self {
        Self {
            tasks,
            interval,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("task reclaim controller has started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.handle_tick(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("task reclaim controller has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_tick(&self) {
        let reclaimed = self.tasks.reclaim_timeouts(Instant::now());
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaim pass finished");
        }
    }
}

/// A controller which periodically persists checkpoints of all datasets.
///
/// A final checkpoint is taken on shutdown.
pub struct CheckpointCtl {
    tasks: Arc<TaskManager>,
    db: Database,
    interval: Duration,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl CheckpointCtl {
    /// Create a new instance.
    pub fn new(tasks: Arc<TaskManager>, db: Database, interval: Duration, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            tasks,
            db,
            interval,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("checkpoint controller has started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately, and there is nothing to persist yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.persist().await {
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => {
                    self.persist().await;
                    break;
                }
            }
        }

        tracing::debug!("checkpoint controller has shutdown");
        Ok(())
    }

    /// Persist checkpoints of all datasets, returning `false` if a fatal error was hit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn persist(&self) -> bool {
        let _guard = self.tasks.checkpoint_guard().await;
        let checkpoints = self.tasks.checkpoints();
        let count = checkpoints.len();
        match self.db.save_checkpoints(checkpoints).await {
            Ok(()) => {
                tracing::debug!(datasets = count, "persisted dataset checkpoints");
                true
            }
            Err(err) => {
                tracing::error!(error = ?err, "error persisting dataset checkpoints");
                let _res = self.shutdown_tx.send(());
                false
            }
        }
    }
}
