//! Elastic master error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The dataset parameters given at registration are invalid.
    #[error("invalid dataset spec: {0}")]
    InvalidDatasetSpec(String),
    /// The referenced dataset was never registered.
    #[error("unknown dataset {0}")]
    UnknownDataset(String),
    /// One or more tasks of the dataset failed permanently after exhausting their retries.
    #[error("tasks {tasks:?} of dataset {dataset} failed permanently after exhausting retries")]
    TaskRetryExhausted { dataset: String, tasks: Vec<u64> },
    /// A scale request fell outside of the configured replica bounds of a node group.
    #[error("requested {requested} replicas for {role}, which is outside of the allowed range [{min}, {max}]")]
    OutOfBounds { role: String, requested: u32, min: u32, max: u32 },
    /// The calling worker is not a live member of the job.
    #[error("worker {0} is not a live member of this job")]
    UnknownWorker(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The resource specified in the path is not found.
    #[error("the resource specified in the path is not found")]
    ResourceNotFound,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}
