//! Reference trainers over a CSV snapshot.
//!
//! These keep the dispatch pipeline usable end to end without an external
//! model library: `baseline` predicts the training mean, `linear` fits a
//! ridge regression by gradient descent. Both evaluate on a seeded holdout.

mod baseline;
mod linear;

pub use baseline::BaselineTrainer;
pub use linear::LinearTrainer;

use crate::dataset::{DataSnapshot, DatasetOptions, TabularDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::job::JobConfig;

/// Load the snapshot as CSV and split it per the job config.
fn load_split(config: &JobConfig, data: &DataSnapshot) -> TrainingResult<(TabularDataset, TabularDataset)> {
    let opts = DatasetOptions::from_config(config)?;
    let dataset = TabularDataset::load_csv(data.require_path()?, &opts)?;
    let (train, test) = dataset.split(opts.test_fraction, opts.seed);
    if train.is_empty() {
        return Err(TrainingError::Dataset("training split is empty".to_string()));
    }
    Ok((train, test))
}

/// Run CPU-bound fitting off the async workers.
async fn run_blocking<T, F>(f: F) -> TrainingResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TrainingResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TrainingError::Trainer(format!("training task aborted: {e}")))?
}

fn get_f64(config: &JobConfig, key: &str, default: f64) -> TrainingResult<f64> {
    match config.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| TrainingError::InvalidSpec(format!("{key} must be a finite number"))),
    }
}

fn get_u64(config: &JobConfig, key: &str, default: u64) -> TrainingResult<u64> {
    match config.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| TrainingError::InvalidSpec(format!("{key} must be a non-negative integer"))),
    }
}
