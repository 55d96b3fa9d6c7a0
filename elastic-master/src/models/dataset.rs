use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The default number of epochs of a dataset.
const DEFAULT_NUM_EPOCHS: u32 = 1;
/// The default number of minibatches grouped into one shard.
const DEFAULT_MINIBATCHES_PER_SHARD: u64 = 10;
/// The max number of shards in one epoch of a dataset.
pub const MAX_SHARDS_PER_EPOCH: u64 = 1_000_000;

/// The kind of work performed on a dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Training,
    Evaluation,
    Prediction,
}

/// The storage backing a dataset, which tells workers how to read a shard's record range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Table,
    Text,
}

/// The description of a dataset to be sharded & dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// The unique name of the dataset.
    pub name: String,
    /// The total number of records of the dataset.
    pub dataset_size: u64,
    /// The number of records of one minibatch.
    pub batch_size: u64,
    /// The number of passes over the dataset.
    #[serde(default = "DatasetSpec::default_num_epochs")]
    pub num_epochs: u32,
    /// Randomize the order in which the shards of an epoch are dispatched.
    #[serde(default)]
    pub shuffle: bool,
    /// The number of minibatches grouped into one shard.
    #[serde(default = "DatasetSpec::default_minibatches_per_shard")]
    pub num_minibatches_per_shard: u64,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub storage_type: StorageType,
}

impl DatasetSpec {
    fn default_num_epochs() -> u32 {
        DEFAULT_NUM_EPOCHS
    }

    fn default_minibatches_per_shard() -> u64 {
        DEFAULT_MINIBATCHES_PER_SHARD
    }

    /// Validate the sharding parameters of this dataset.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidDatasetSpec("dataset name may not be empty".into()));
        }
        if self.dataset_size == 0 {
            return Err(AppError::InvalidDatasetSpec(format!("dataset {} must have a positive size", self.name)));
        }
        if self.batch_size == 0 {
            return Err(AppError::InvalidDatasetSpec(format!("dataset {} must have a positive batch size", self.name)));
        }
        if self.num_minibatches_per_shard == 0 {
            return Err(AppError::InvalidDatasetSpec(format!(
                "dataset {} must have a positive number of minibatches per shard",
                self.name
            )));
        }
        if self.num_epochs == 0 {
            return Err(AppError::InvalidDatasetSpec(format!("dataset {} must have at least one epoch", self.name)));
        }
        let shards = self.num_shards();
        if shards > MAX_SHARDS_PER_EPOCH {
            return Err(AppError::InvalidDatasetSpec(format!(
                "dataset {} would have {} shards per epoch, at most {} are allowed",
                self.name, shards, MAX_SHARDS_PER_EPOCH
            )));
        }
        Ok(())
    }

    /// The number of shards in one epoch, `ceil(ceil(dataset_size / batch_size) / num_minibatches_per_shard)`.
    ///
    /// Only meaningful for a spec with positive sizes.
    pub fn num_shards(&self) -> u64 {
        let minibatches = div_ceil(self.dataset_size, self.batch_size);
        div_ceil(minibatches, self.num_minibatches_per_shard)
    }

    /// The number of records covered by a full shard.
    pub fn records_per_shard(&self) -> u64 {
        self.batch_size.saturating_mul(self.num_minibatches_per_shard)
    }
}

fn div_ceil(val: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    val / divisor + u64::from(val % divisor != 0)
}
