//! The worker facing HTTP server.

mod prom;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cluster::SharedJobParams;
use crate::config::Config;
use crate::database::Database;
use crate::error::{AppError, AppErrorExt, HttpError, HttpResult};
use crate::models::{DatasetSpec, DatasetStatus, ReportOutcome, TaskAssignment, TaskId, TaskOutcome};
use crate::speed::{SpeedMonitor, SpeedReport};
use crate::task::TaskManager;
use crate::watchers::LiveWorkers;
use elastic_core::node::{JobParams, NodeType};
pub use prom::spawn_prom_server;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterDatasetResponse {
    pub registered: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub worker_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetTaskResponse {
    /// The assigned task, `null` if nothing is pending.
    pub task: Option<TaskAssignment>,
    pub dataset_complete: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportTaskRequest {
    pub worker_id: String,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportTaskResponse {
    /// `false` if the report was stale & ignored.
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetStatusResponse {
    #[serde(flatten)]
    pub status: DatasetStatus,
    /// The error of a dataset whose tasks failed permanently.
    pub error: Option<String>,
}

/// The state shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    db: Database,
    tasks: Arc<TaskManager>,
    speed: Arc<SpeedMonitor>,
    job: SharedJobParams,
    live_workers: LiveWorkers,
}

impl AppState {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: Database, tasks: Arc<TaskManager>, speed: Arc<SpeedMonitor>, job: SharedJobParams, live_workers: LiveWorkers) -> Self {
        Self {
            config,
            db,
            tasks,
            speed,
            job,
            live_workers,
        }
    }

    /// Ensure the given worker may be handed tasks.
    ///
    /// Until the first listing of the job's pods succeeded, every worker is accepted.
    fn ensure_live_worker(&self, worker_id: &str) -> Result<(), AppError> {
        if worker_id.trim().is_empty() {
            return Err(AppError::InvalidInput("worker_id may not be empty".into()));
        }
        if !self.config.enforce_live_workers {
            return Ok(());
        }
        let live = self.live_workers.load();
        match &*live {
            Some(live) if !live.contains(worker_id) => Err(AppError::UnknownWorker(worker_id.into())),
            _ => Ok(()),
        }
    }
}

/// Application server.
pub struct AppServer {
    state: AppState,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(state: AppState, shutdown: broadcast::Sender<()>) -> Self {
        Self { state, shutdown }
    }

    /// Build the router of the server.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/datasets", post(register_dataset))
            .route("/datasets/:name", get(dataset_status).delete(remove_dataset))
            .route("/datasets/:name/tasks", post(get_task))
            .route("/datasets/:name/tasks/:task_id/report", post(report_task))
            .route("/speed", get(speed))
            .route("/nodes", get(nodes))
            .route("/nodes/:role/scale", post(scale_nodes))
            .with_state(state)
    }

    /// Spawn this controller which also creates the HTTP server.
    pub fn spawn(self) -> JoinHandle<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let (shutdown, mut shutdown_rx) = (self.shutdown.clone(), self.shutdown.subscribe());
        let router = Self::router(self.state);
        tokio::spawn(async move {
            let res = async {
                let listener = TcpListener::bind(addr).await.context("error binding HTTP listener")?;
                tracing::info!("task server is listening at {}", addr);
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _res = shutdown_rx.recv().await;
                    })
                    .await
                    .context("error from HTTP server")
            }
            .await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from task HTTP server");
            }
            let _res = shutdown.send(());
        })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_dataset(State(state): State<AppState>, Json(spec): Json<DatasetSpec>) -> HttpResult<RegisterDatasetResponse> {
    tracing::debug!(dataset = %spec.name, "registering dataset");
    let registered = state.tasks.new_dataset(spec).map_err(AppError::into_http)?;
    Ok(Json(RegisterDatasetResponse { registered }))
}

async fn get_task(State(state): State<AppState>, Path(name): Path<String>, Json(req): Json<GetTaskRequest>) -> HttpResult<GetTaskResponse> {
    state.ensure_live_worker(&req.worker_id).map_err(AppError::into_http)?;
    let task = state
        .tasks
        .get_task(&name, &req.worker_id, Instant::now())
        .map_err(AppError::into_http)?;
    let dataset_complete = match task {
        Some(_) => false,
        None => state.tasks.is_dataset_complete(&name).map_err(AppError::into_http)?,
    };
    Ok(Json(GetTaskResponse { task, dataset_complete }))
}

async fn report_task(
    State(state): State<AppState>, Path((name, task_id)): Path<(String, TaskId)>, Json(req): Json<ReportTaskRequest>,
) -> HttpResult<ReportTaskResponse> {
    let res = state
        .tasks
        .report_task(&name, task_id, &req.worker_id, &req.outcome, Instant::now())
        .map_err(AppError::into_http)?;
    Ok(Json(ReportTaskResponse {
        accepted: res != ReportOutcome::Stale,
    }))
}

async fn dataset_status(State(state): State<AppState>, Path(name): Path<String>) -> HttpResult<DatasetStatusResponse> {
    let status = state.tasks.dataset_status(&name).map_err(AppError::into_http)?;
    let error = state.tasks.dataset_errors(&name).err().map(|err| err.to_string());
    Ok(Json(DatasetStatusResponse { status, error }))
}

async fn remove_dataset(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), HttpError> {
    match state.tasks.remove_persisted_dataset(&name, &state.db).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(AppError::UnknownDataset(name).into_http()),
        Err(err) => Err(AppError::http(err.into())),
    }
}

async fn speed(State(state): State<AppState>) -> HttpResult<SpeedReport> {
    Ok(Json(state.speed.report()))
}

async fn nodes(State(state): State<AppState>) -> HttpResult<JobParams> {
    Ok(Json(JobParams::clone(&state.job.load())))
}

async fn scale_nodes(State(state): State<AppState>, Path(role): Path<String>, Json(req): Json<ScaleRequest>) -> HttpResult<JobParams> {
    let role: NodeType = role.parse().map_err(AppError::into_http)?;
    let mut res = Ok(());
    state.job.rcu(|params| {
        let mut updated = JobParams::clone(params);
        res = updated.scale_to(role, req.replicas);
        updated
    });
    res.map_err(AppError::into_http)?;
    tracing::info!(%role, replicas = req.replicas, "scaled node group");
    Ok(Json(JobParams::clone(&state.job.load())))
}
