use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use kube::Api;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::cluster::{ClusterClient, KubeClusterClient, PodSettings, ScalerCtl, SharedJobParams};
use crate::config::Config;
use crate::database::Database;
use crate::server::{spawn_prom_server, AppServer, AppState};
use crate::speed::SpeedMonitor;
use crate::task::{CheckpointCtl, ReclaimCtl, TaskManager};
use crate::watchers::NodeWatcher;
use elastic_core::crd::ElasticJob;
use elastic_core::node::JobParams;

/// The application object of the elastic master.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The task manager of all registered datasets.
    _tasks: Arc<TaskManager>,
    /// The desired shape of the job.
    _job: SharedJobParams,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the pod watcher.
    nodes_handle: JoinHandle<Result<()>>,
    /// The join handle of the task reclaim controller.
    reclaim_handle: JoinHandle<Result<()>>,
    /// The join handle of the checkpoint controller.
    checkpoint_handle: JoinHandle<Result<()>>,
    /// The join handle of the scaler, if enabled.
    scaler_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the task HTTP server.
    client_server: JoinHandle<()>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;

        // Initialize K8s client & fetch the job this master manages.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let job: ElasticJob = Api::namespaced(client.clone(), &config.namespace)
            .get(&config.job_name)
            .await
            .with_context(|| format!("error fetching ElasticJob {}/{}", config.namespace, config.job_name))?;
        let job = Arc::new(job);
        let params: SharedJobParams = Arc::new(ArcSwap::from_pointee(
            JobParams::from_elastic_job(&job).context("error building job parameters")?,
        ));

        // Rebuild the task queues of a previous incarnation.
        let speed = Arc::new(SpeedMonitor::new(config.speed_config()));
        let tasks = Arc::new(TaskManager::new(config.queue_policy(), speed.clone()));
        for checkpoint in db.load_checkpoints().await.context("error loading dataset checkpoints")? {
            let name = checkpoint.spec.name.clone();
            match tasks.restore_dataset(checkpoint) {
                Ok(_) => tracing::info!(dataset = %name, "restored dataset from checkpoint"),
                Err(err) => tracing::error!(error = ?err, dataset = %name, "error restoring dataset from checkpoint, skipping"),
            }
        }

        // Spawn various core tasks.
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client, &config.namespace, &config.job_name));
        let (nodes, live_workers) = NodeWatcher::new(
            cluster.clone(),
            tasks.clone(),
            speed.clone(),
            Config::interval(config.node_refresh_seconds),
            &shutdown_tx,
        );
        let nodes_handle = nodes.spawn();
        let reclaim_handle = ReclaimCtl::new(tasks.clone(), Config::interval(config.reclaim_interval_seconds), &shutdown_tx).spawn();
        let checkpoint_handle = CheckpointCtl::new(
            tasks.clone(),
            db.clone(),
            Config::interval(config.checkpoint_interval_seconds),
            shutdown_tx.clone(),
        )
        .spawn();
        let scaler_handle = if config.enable_scaler {
            let settings = PodSettings {
                master_addr: config.master_addr(),
            };
            let scaler = ScalerCtl::new(
                cluster,
                job,
                params.clone(),
                settings,
                Config::interval(config.scale_interval_seconds),
                &shutdown_tx,
            );
            Some(scaler.spawn())
        } else {
            None
        };

        let state = AppState::new(config.clone(), db.clone(), tasks.clone(), speed, params.clone(), live_workers);
        let client_server = AppServer::new(state, shutdown_tx.clone()).spawn();
        let metrics_server = spawn_prom_server(config.clone(), metrics, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            _tasks: tasks,
            _job: params,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            nodes_handle,
            reclaim_handle,
            checkpoint_handle,
            scaler_handle,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("elastic master is shutting down");
        if let Err(err) = self.nodes_handle.await.context("error joining pod watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down pod watcher");
        }
        if let Err(err) = self.reclaim_handle.await.context("error joining reclaim controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down reclaim controller");
        }
        if let Some(handle) = self.scaler_handle {
            if let Err(err) = handle.await.context("error joining scaler handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down scaler");
            }
        }
        if let Err(err) = self.client_server.await {
            tracing::error!(error = ?err, "error joining task HTTP server");
        }
        if let Err(err) = self.checkpoint_handle.await.context("error joining checkpoint controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down checkpoint controller");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("elastic master shutdown complete");
        Ok(())
    }
}
