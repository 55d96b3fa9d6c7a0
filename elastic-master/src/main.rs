//! The elastic job master.

mod app;
mod cluster;
mod config;
mod database;
mod error;
#[cfg(test)]
mod fixtures;
mod models;
mod server;
mod shard;
mod speed;
mod task;
mod watchers;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics = PrometheusBuilder::new()
        .add_global_label("namespace", cfg.namespace.clone())
        .add_global_label("job", cfg.job_name.clone())
        .add_global_label("pod", cfg.pod_name.clone())
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;
    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        job_name = %cfg.job_name,
        pod_name = %cfg.pod_name,
        storage_data_path = %cfg.storage_data_path,
        "starting elastic master",
    );
    match App::new(cfg, metrics).await?.spawn().await {
        Ok(Err(err)) => tracing::error!(error = ?err),
        Err(err) => tracing::error!(error = ?err, "error joining application task"),
        Ok(Ok(())) => (),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
