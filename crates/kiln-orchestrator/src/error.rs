// Error types for dispatch and execution

use kiln_store::{RunId, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Why a single training execution did not produce a completed run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A run store call failed. `run_id` is `None` when `begin_run` itself
    /// failed and no record exists.
    #[error("run store error{}: {source}", run_suffix(.run_id.as_ref()))]
    Store {
        run_id: Option<RunId>,
        #[source]
        source: StoreError,
    },

    /// The trainer returned an error.
    #[error("training failed for run {run_id}: {message}")]
    TrainingFailed { run_id: RunId, message: String },

    /// The trainer did not finish within the job timeout.
    #[error("run {run_id} timed out after {}s", .after.as_secs_f64())]
    Timeout { run_id: RunId, after: Duration },
}

fn run_suffix(run_id: Option<&RunId>) -> String {
    run_id.map(|id| format!(" (run {id})")).unwrap_or_default()
}

impl ExecutionError {
    /// The run record this error left behind, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Store { run_id, .. } => run_id.as_ref(),
            Self::TrainingFailed { run_id, .. } | Self::Timeout { run_id, .. } => Some(run_id),
        }
    }
}

/// Errors that abort a whole dispatch before any job runs.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no jobs to dispatch")]
    EmptyBatch,

    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
}

pub type Result<T> = std::result::Result<T, DispatchError>;
