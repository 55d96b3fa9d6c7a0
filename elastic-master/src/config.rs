//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::speed::SpeedConfig;
use crate::task::QueuePolicy;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port of the worker facing HTTP server.
    pub http_port: u16,
    /// The port of the metrics server.
    pub metrics_port: u16,

    /// The Kubernetes namespace of the job.
    pub namespace: String,
    /// The name of the ElasticJob CR managed by this master.
    pub job_name: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The address workers use to reach this master, defaults to the job's master service.
    #[serde(default)]
    pub master_addr: Option<String>,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The seconds a worker has to report a task before it is reclaimed.
    #[serde(default = "Config::default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    /// The number of retries a task gets before it fails permanently.
    #[serde(default = "Config::default_max_task_retries")]
    pub max_task_retries: u32,
    /// The seconds between timeout reclaim passes.
    #[serde(default = "Config::default_reclaim_interval_seconds")]
    pub reclaim_interval_seconds: u64,
    /// The seconds between refreshes of the job's pods.
    #[serde(default = "Config::default_node_refresh_seconds")]
    pub node_refresh_seconds: u64,
    /// The seconds between dataset checkpoints.
    #[serde(default = "Config::default_checkpoint_interval_seconds")]
    pub checkpoint_interval_seconds: u64,
    /// The seconds between pod reconciliation passes.
    #[serde(default = "Config::default_scale_interval_seconds")]
    pub scale_interval_seconds: u64,
    /// Create & delete the job's pods to match the desired replica counts.
    #[serde(default = "Config::default_enable_scaler")]
    pub enable_scaler: bool,

    /// The max number of speed samples held.
    #[serde(default = "Config::default_speed_window_size")]
    pub speed_window_size: usize,
    /// The max age in seconds of a speed sample.
    #[serde(default = "Config::default_speed_window_seconds")]
    pub speed_window_seconds: u64,
    /// The number of speed samples needed to judge stability.
    #[serde(default = "Config::default_speed_min_samples")]
    pub speed_min_samples: usize,
    /// The max coefficient of variation of a stable speed.
    #[serde(default = "Config::default_speed_stable_threshold")]
    pub speed_stable_threshold: f64,

    /// Only hand out tasks to workers which are running pods of the job.
    #[serde(default)]
    pub enforce_live_workers: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    fn default_task_timeout_seconds() -> u64 {
        1800
    }

    fn default_max_task_retries() -> u32 {
        3
    }

    fn default_reclaim_interval_seconds() -> u64 {
        30
    }

    fn default_node_refresh_seconds() -> u64 {
        15
    }

    fn default_checkpoint_interval_seconds() -> u64 {
        60
    }

    fn default_scale_interval_seconds() -> u64 {
        30
    }

    fn default_enable_scaler() -> bool {
        true
    }

    fn default_speed_window_size() -> usize {
        50
    }

    fn default_speed_window_seconds() -> u64 {
        600
    }

    fn default_speed_min_samples() -> usize {
        6
    }

    fn default_speed_stable_threshold() -> f64 {
        0.2
    }

    /// The address handed to the pods of the job for reaching this master.
    pub fn master_addr(&self) -> String {
        self.master_addr
            .clone()
            .unwrap_or_else(|| format!("elasticjob-{}-master.{}:{}", self.job_name, self.namespace, self.http_port))
    }

    /// The dispatch policy of all task queues.
    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            task_timeout: Duration::from_secs(self.task_timeout_seconds),
            max_task_retries: self.max_task_retries,
        }
    }

    /// The tuning of the speed monitor.
    pub fn speed_config(&self) -> SpeedConfig {
        SpeedConfig {
            window_size: self.speed_window_size,
            window: Duration::from_secs(self.speed_window_seconds),
            min_samples: self.speed_min_samples,
            stable_threshold: self.speed_stable_threshold,
        }
    }

    /// The period of a background loop, which is never zero.
    pub fn interval(seconds: u64) -> Duration {
        Duration::from_secs(seconds.max(1))
    }

    /// Create a config for testing, along with the temp dir holding its database.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config: Config = envy::from_iter(vec![
            ("RUST_LOG".into(), "error".into()),
            ("HTTP_PORT".into(), "7000".into()),
            ("METRICS_PORT".into(), "7002".into()),
            ("NAMESPACE".into(), "default".into()),
            ("JOB_NAME".into(), "test".into()),
            ("POD_NAME".into(), "test-master-0".into()),
            ("STORAGE_DATA_PATH".into(), tmpdir.path().to_string_lossy().to_string()),
        ])
        .context("error building test config")?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
