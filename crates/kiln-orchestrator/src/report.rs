//! Per-job outcomes and the dispatch report.

use crate::error::ExecutionError;
use chrono::{DateTime, Utc};
use kiln_store::{RunId, RunRecord, StoreError};
use kiln_training::Signature;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Why a job was not trained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A completed run with the same signature already exists.
    AlreadyCompleted,
    /// Another dispatcher holds a running run for this signature.
    ActiveElsewhere { run_id: String },
    /// An earlier job in this dispatch has the same signature.
    DuplicateInBatch { leader: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCompleted => f.write_str("already completed"),
            Self::ActiveElsewhere { run_id } => write!(f, "running elsewhere as {run_id}"),
            Self::DuplicateInBatch { leader } => write!(f, "same signature as {leader}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConfigInvalid,
    StoreUnavailable,
    StoreCorrupt,
    InvalidTransition,
    TrainingFailed,
    ExecutionTimeout,
    BatchCancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config invalid",
            Self::StoreUnavailable => "store unavailable",
            Self::StoreCorrupt => "store corrupt",
            Self::InvalidTransition => "invalid transition",
            Self::TrainingFailed => "training failed",
            Self::ExecutionTimeout => "timeout",
            Self::BatchCancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job that ended without a usable run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub run_id: Option<RunId>,
    /// Only transient store failures are worth retrying unchanged.
    pub retryable: bool,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            run_id: None,
            retryable: kind == FailureKind::StoreUnavailable,
        }
    }

    #[must_use]
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn from_store(err: &StoreError) -> Self {
        let kind = match err {
            StoreError::Unavailable(_) => FailureKind::StoreUnavailable,
            StoreError::InvalidTransition { .. } => FailureKind::InvalidTransition,
            _ => FailureKind::StoreCorrupt,
        };
        Self::new(kind, err.to_string())
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::BatchCancelled, "dispatch cancelled before the job started")
    }
}

/// Terminal result of one job in a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Skipped {
        reason: SkipReason,
        existing: Option<RunRecord>,
    },
    Succeeded(RunRecord),
    Failed(JobFailure),
    /// Dry run only: the job would have been trained.
    WouldRun,
}

impl DispatchOutcome {
    /// Map an executor result onto an outcome.
    pub fn from_execution(result: std::result::Result<RunRecord, ExecutionError>) -> Self {
        match result {
            Ok(record) => Self::Succeeded(record),
            Err(ExecutionError::Store { source: StoreError::DuplicateActiveRun { run_id, .. }, .. }) => {
                Self::Skipped { reason: SkipReason::ActiveElsewhere { run_id }, existing: None }
            }
            Err(ExecutionError::Store { run_id, source }) => {
                let failure = JobFailure::from_store(&source);
                Self::Failed(match run_id {
                    Some(id) => failure.with_run(id),
                    None => failure,
                })
            }
            Err(err @ ExecutionError::TrainingFailed { .. }) => {
                let run_id = err.run_id().cloned();
                Self::Failed(JobFailure {
                    run_id,
                    ..JobFailure::new(FailureKind::TrainingFailed, err.to_string())
                })
            }
            Err(err @ ExecutionError::Timeout { .. }) => {
                let run_id = err.run_id().cloned();
                Self::Failed(JobFailure {
                    run_id,
                    ..JobFailure::new(FailureKind::ExecutionTimeout, err.to_string())
                })
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::WouldRun => "would run",
        }
    }

    /// The completed run this outcome points at, if any.
    pub fn completed_record(&self) -> Option<&RunRecord> {
        match self {
            Self::Succeeded(record) => Some(record),
            Self::Skipped { existing: Some(record), .. } => Some(record),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub model_id: String,
    /// Manifest file the job came from.
    pub source: Option<PathBuf>,
    pub signature: Option<Signature>,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounters {
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub would_run: usize,
}

/// Everything a dispatch did, in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub entries: Vec<ReportEntry>,
    pub snapshot_id: String,
    pub store: String,
    pub dry_run: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "duration_secs")]
    pub elapsed: Duration,
    pub counters: ReportCounters,
}

fn duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl DispatchReport {
    pub(crate) fn count(entries: &[ReportEntry]) -> ReportCounters {
        let mut counters = ReportCounters::default();
        for entry in entries {
            match entry.outcome {
                DispatchOutcome::Skipped { .. } => counters.skipped += 1,
                DispatchOutcome::Succeeded(_) => counters.succeeded += 1,
                DispatchOutcome::Failed(_) => counters.failed += 1,
                DispatchOutcome::WouldRun => counters.would_run += 1,
            }
        }
        counters
    }

    pub fn has_failures(&self) -> bool {
        self.counters.failed > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ReportEntry, &JobFailure)> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            DispatchOutcome::Failed(f) => Some((e, f)),
            _ => None,
        })
    }

    pub fn entry(&self, model_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.model_id == model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(JobFailure::from_store(&StoreError::Unavailable("down".into())).retryable);
        let corrupt = JobFailure::from_store(&StoreError::Corrupt("bad row".into()));
        assert_eq!(corrupt.kind, FailureKind::StoreCorrupt);
        assert!(!corrupt.retryable);
        assert!(!JobFailure::cancelled().retryable);
    }

    #[test]
    fn test_duplicate_active_becomes_skip() {
        let err = ExecutionError::Store {
            run_id: None,
            source: StoreError::DuplicateActiveRun {
                signature: Signature::from_bytes([1; 32]),
                run_id: "other".into(),
            },
        };
        let outcome = DispatchOutcome::from_execution(Err(err));
        assert_eq!(
            outcome,
            DispatchOutcome::Skipped {
                reason: SkipReason::ActiveElsewhere { run_id: "other".into() },
                existing: None
            }
        );
    }

    #[test]
    fn test_timeout_keeps_run_id() {
        let err = ExecutionError::Timeout { run_id: RunId::from("r1"), after: Duration::from_secs(2) };
        let DispatchOutcome::Failed(failure) = DispatchOutcome::from_execution(Err(err)) else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::ExecutionTimeout);
        assert_eq!(failure.run_id, Some(RunId::from("r1")));
    }
}
