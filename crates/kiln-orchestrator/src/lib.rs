//! Training dispatch for Kiln.
//!
//! Turns a batch of [`JobSpec`](kiln_training::JobSpec)s into a
//! [`DispatchReport`]: jobs whose signature already has a completed run are
//! skipped, the rest are trained concurrently and recorded in a
//! [`RunStore`](kiln_store::RunStore). The selector then picks the best run by
//! a metric.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod progress;
pub mod report;
pub mod selector;

pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::{DispatchError, ExecutionError, Result};
pub use executor::TrainingExecutor;
pub use progress::{DispatchEvent, ProgressReporter, ProgressSnapshot};
pub use report::{
    DispatchOutcome, DispatchReport, FailureKind, JobFailure, ReportCounters, ReportEntry, SkipReason,
};
pub use selector::{
    DEFAULT_EPSILON, Direction, LeaderboardEntry, ModelSelector, SelectedModel, Selection, select_best,
};
