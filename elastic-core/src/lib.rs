pub mod crd;
pub mod error;
pub mod node;

pub use error::AppError;

/// The label holding the name of the ElasticJob which owns a pod.
pub const LABEL_JOB_NAME: &str = "elasticjob-name";
/// The label holding the replica type (role) of a pod.
pub const LABEL_REPLICA_TYPE: &str = "replica-type";
/// The label holding the index of a pod within its replica group.
pub const LABEL_REPLICA_INDEX: &str = "replica-index";
/// The label holding the training task index of a pod.
pub const LABEL_TRAINING_TASK_INDEX: &str = "training-task-index";
