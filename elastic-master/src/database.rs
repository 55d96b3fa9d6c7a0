//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH};
use crate::models::DatasetCheckpoint;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/elastic/db";
/// The DB tree holding dataset checkpoints keyed by dataset name.
const TREE_DATASETS: &str = "datasets";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the master's database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.pod_name.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for elastic master database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree of dataset checkpoints.
    pub async fn get_datasets_tree(&self) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(TREE_DATASETS));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", TREE_DATASETS, err))))?;
        Ok(tree)
    }

    /// Persist the given checkpoints in a single batch, replacing any previous checkpoint of the same dataset.
    #[tracing::instrument(level = "debug", skip(self, checkpoints))]
    pub async fn save_checkpoints(&self, checkpoints: Vec<DatasetCheckpoint>) -> ShutdownResult<()> {
        let tree = self.get_datasets_tree().await?;
        let mut batch = sled::Batch::default();
        for checkpoint in checkpoints.iter() {
            let val = serde_json::to_vec(checkpoint)
                .with_context(|| format!("error encoding checkpoint of dataset {}", checkpoint.spec.name))
                .map_err(ShutdownError::from)?;
            batch.insert(checkpoint.spec.name.as_str(), val);
        }
        Self::spawn_blocking(move || -> Result<()> {
            tree.apply_batch(batch).context("error applying checkpoint batch")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)
    }

    /// Load all persisted checkpoints.
    ///
    /// Entries which can not be decoded are logged & skipped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn load_checkpoints(&self) -> ShutdownResult<Vec<DatasetCheckpoint>> {
        let tree = self.get_datasets_tree().await?;
        Self::spawn_blocking(move || -> Result<Vec<DatasetCheckpoint>> {
            let mut checkpoints = vec![];
            for kv_res in tree.iter() {
                let (key, val) = kv_res.context("error returned during key/value iteration from database")?;
                match serde_json::from_slice::<DatasetCheckpoint>(&val) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(err) => tracing::error!(error = ?err, key = %String::from_utf8_lossy(&key), "error decoding dataset checkpoint, skipping"),
                }
            }
            Ok(checkpoints)
        })
        .await?
        .map_err(ShutdownError::from)
    }

    /// Delete the checkpoint of the given dataset.
    pub async fn delete_checkpoint(&self, name: &str) -> ShutdownResult<()> {
        let tree = self.get_datasets_tree().await?;
        let key = IVec::from(name);
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(key).context("error deleting dataset checkpoint")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)
    }
}
