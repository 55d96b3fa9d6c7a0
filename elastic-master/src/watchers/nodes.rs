use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::{ClusterClient, NodeInfo, NodePhase};
use crate::speed::SpeedMonitor;
use crate::task::TaskManager;
use elastic_core::node::NodeType;

pub const METRIC_NODES_WATCHER_ERRORS: &str = "elastic_nodes_watcher_errors";

/// The names of the job's running pods, `None` until the first listing succeeded.
pub type LiveWorkers = Arc<ArcSwapOption<HashSet<String>>>;

/// A watcher of the job's pods.
///
/// Pods which stop running have their tasks recovered, and the running workers are reported to
/// the speed monitor.
pub struct NodeWatcher {
    client: Arc<dyn ClusterClient>,
    tasks: Arc<TaskManager>,
    speed: Arc<SpeedMonitor>,
    interval: Duration,

    /// The published set of running pods.
    live: LiveWorkers,
    /// The running pods of the last snapshot.
    known: HashSet<String>,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl NodeWatcher {
    /// Create a new instance.
    pub fn new(
        client: Arc<dyn ClusterClient>, tasks: Arc<TaskManager>, speed: Arc<SpeedMonitor>, interval: Duration, shutdown_tx: &broadcast::Sender<()>,
    ) -> (Self, LiveWorkers) {
        metrics::describe_counter!(METRIC_NODES_WATCHER_ERRORS, "errors listing the job's pods");
        let live: LiveWorkers = Default::default();
        (
            Self {
                client,
                tasks,
                speed,
                interval,
                live: live.clone(),
                known: Default::default(),
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            },
            live,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("node watcher initialized");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("node watcher has shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn refresh(&mut self) {
        match self.client.list_nodes().await {
            Ok(nodes) => self.apply_snapshot(&nodes),
            Err(err) => {
                metrics::increment_counter!(METRIC_NODES_WATCHER_ERRORS);
                tracing::error!(error = ?err, "error listing job nodes");
            }
        }
    }

    /// Apply a listing of the job's nodes.
    pub(crate) fn apply_snapshot(&mut self, nodes: &[NodeInfo]) {
        let running: HashSet<String> = nodes
            .iter()
            .filter(|node| node.phase == NodePhase::Running)
            .map(|node| node.name.clone())
            .collect();
        let workers: HashSet<&str> = nodes
            .iter()
            .filter(|node| node.phase == NodePhase::Running && node.role == NodeType::Worker)
            .map(|node| node.name.as_str())
            .collect();

        for gone in self.known.difference(&running) {
            let recovered = self.tasks.recover_worker_tasks(gone);
            self.speed.remove_running_worker(gone);
            tracing::info!(node = %gone, recovered, "node is no longer running");
        }
        for worker in workers {
            if self.speed.add_running_worker(worker) {
                tracing::debug!(node = %worker, "worker is running");
            }
        }

        self.live.store(Some(Arc::new(running.clone())));
        self.known = running;
    }
}
