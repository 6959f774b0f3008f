//! Run records as the store reports them.

use chrono::{DateTime, SubsecRound, Utc};
use kiln_training::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque identifier assigned by the run store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// A fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a run.
///
/// `Running` moves to `Completed` or `Failed` exactly once; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Pointer to an artifact stored alongside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub uri: String,
    pub sha256: String,
    pub size: u64,
}

/// One training attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub model_id: String,
    pub signature: Signature,
    pub status: RunStatus,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifact_refs: Vec<ArtifactRef>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunRecord {
    /// A fresh `Running` record.
    pub fn start(run_id: RunId, model_id: impl Into<String>, signature: Signature) -> Self {
        Self {
            run_id,
            model_id: model_id.into(),
            signature,
            status: RunStatus::Running,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifact_refs: Vec::new(),
            // stores keep microsecond precision
            started_at: Utc::now().trunc_subsecs(6),
            ended_at: None,
            error: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Query for [`RunStore::list_runs`](crate::RunStore::list_runs).
///
/// Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub model_id: Option<String>,
    pub status: Option<RunStatus>,
    pub signature: Option<Signature>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` satisfies every set criterion.
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.model_id.as_ref().is_none_or(|m| *m == record.model_id)
            && self.status.is_none_or(|s| s == record.status)
            && self.signature.is_none_or(|s| s == record.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("FINISHED".parse::<RunStatus>().is_err());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_filter_matches() {
        let sig = Signature::from_bytes([7; 32]);
        let mut record = RunRecord::start(RunId::generate(), "xgb", sig);
        assert!(RunFilter::default().matches(&record));
        assert!(RunFilter::default().model("xgb").signature(sig).matches(&record));
        assert!(!RunFilter::default().status(RunStatus::Completed).matches(&record));
        record.status = RunStatus::Completed;
        assert!(RunFilter::default().status(RunStatus::Completed).matches(&record));
        assert!(!RunFilter::default().model("rf").matches(&record));
    }
}
