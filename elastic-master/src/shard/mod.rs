//! Shard generation.
//!
//! An epoch of a dataset is cut into `ceil(dataset_size / batch_size)` minibatches, which are
//! grouped into shards of `num_minibatches_per_shard` minibatches each. Shards are half-open
//! record ranges, and only the last shard of an epoch may be partial. Shuffling permutes the
//! order of the shards, never their content.


use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::AppError;
use crate::models::{DatasetSpec, Shard};

/// The number of shards in one epoch of the given dataset.
pub fn shard_count(spec: &DatasetSpec) -> Result<u64, AppError> {
    spec.validate()?;
    Ok(spec.num_shards())
}

/// Generate the shards of the given epoch of a dataset.
///
/// The output only depends on the arguments. When the dataset is shuffled, `seed` drives the
/// permutation of the shard order.
pub fn generate(spec: &DatasetSpec, epoch: u32, seed: u64) -> Result<Vec<Shard>, AppError> {
    let count = shard_count(spec)?;
    let records_per_shard = spec.records_per_shard();
    let mut shards: Vec<Shard> = (0..count)
        .map(|idx| {
            let start = idx.saturating_mul(records_per_shard);
            let end = start.saturating_add(records_per_shard).min(spec.dataset_size);
            Shard { epoch, start, end }
        })
        .collect();
    if spec.shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        shards.shuffle(&mut rng);
    }
    Ok(shards)
}
