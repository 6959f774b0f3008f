//! Kiln Store
//!
//! Client side of the run store, the system of record for training attempts.
//! The store answers "has this signature already been trained?" and records
//! the lifecycle of every run the dispatcher starts.
//!
//! Backends:
//! - [`SqliteRunStore`]: embedded database behind a single writer thread
//! - [`MlflowRunStore`]: MLflow tracking server over its REST API
//!
//! [`open_store`] picks a backend from an endpoint string.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod error;
pub mod mlflow;
pub mod record;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use mlflow::MlflowRunStore;
pub use record::{ArtifactRef, RunFilter, RunId, RunRecord, RunStatus};
pub use sqlite::SqliteRunStore;
pub use store::RunStore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Backend-independent options for [`open_store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Experiment that groups Kiln runs on a tracking server.
    pub experiment: String,
    /// Per-request timeout for network backends.
    pub request_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { experiment: "kiln".to_string(), request_timeout: Duration::from_secs(30) }
    }
}

/// Parsed run store endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    SqliteMemory,
    SqliteFile(PathBuf),
    Tracking(String),
}

impl Endpoint {
    /// Parse `sqlite::memory:`, `sqlite://<path>`, `http(s)://...` or a bare
    /// filesystem path (treated as SQLite).
    pub fn parse(endpoint: &str) -> StoreResult<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(StoreError::InvalidEndpoint("endpoint is empty".to_string()));
        }
        if endpoint == "sqlite::memory:" {
            return Ok(Self::SqliteMemory);
        }
        if let Some(path) = endpoint.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(StoreError::InvalidEndpoint("sqlite:// needs a path".to_string()));
            }
            return Ok(Self::SqliteFile(PathBuf::from(path)));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Self::Tracking(endpoint.trim_end_matches('/').to_string()));
        }
        if endpoint.contains("://") {
            return Err(StoreError::InvalidEndpoint(format!("unsupported scheme: {endpoint}")));
        }
        Ok(Self::SqliteFile(PathBuf::from(endpoint)))
    }
}

/// Open the run store named by `endpoint`.
pub fn open_store(endpoint: &str, options: &StoreOptions) -> StoreResult<Arc<dyn RunStore>> {
    Endpoint::parse(endpoint)?.open(options)
}

impl Endpoint {
    /// Anchor a relative SQLite path at `root`.
    #[must_use]
    pub fn relative_to(self, root: &Path) -> Self {
        match self {
            Self::SqliteFile(path) if path.is_relative() => Self::SqliteFile(root.join(path)),
            other => other,
        }
    }

    pub fn open(self, options: &StoreOptions) -> StoreResult<Arc<dyn RunStore>> {
        Ok(match self {
            Self::SqliteMemory => Arc::new(SqliteRunStore::open_in_memory()?),
            Self::SqliteFile(path) => Arc::new(SqliteRunStore::open(&path)?),
            Self::Tracking(url) => Arc::new(MlflowRunStore::new(url, options)?),
        })
    }

    /// Like [`Endpoint::open`], but a SQLite file is opened without creating
    /// or modifying it.
    pub fn open_read_only(self, options: &StoreOptions) -> StoreResult<Arc<dyn RunStore>> {
        match self {
            Self::SqliteFile(path) => Ok(Arc::new(SqliteRunStore::open_read_only(&path)?)),
            other => other.open(options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("sqlite::memory:").unwrap(), Endpoint::SqliteMemory);
        assert_eq!(
            Endpoint::parse("sqlite://runs/kiln.db").unwrap(),
            Endpoint::SqliteFile(PathBuf::from("runs/kiln.db"))
        );
        assert_eq!(
            Endpoint::parse("http://mlflow:5000/").unwrap(),
            Endpoint::Tracking("http://mlflow:5000".to_string())
        );
        assert_eq!(Endpoint::parse(".kiln/runs.db").unwrap(), Endpoint::SqliteFile(PathBuf::from(".kiln/runs.db")));
        assert!(Endpoint::parse("s3://bucket/runs").is_err());
        assert!(Endpoint::parse("  ").is_err());

        let root = Path::new("/srv/project");
        assert_eq!(
            Endpoint::parse("runs.db").unwrap().relative_to(root),
            Endpoint::SqliteFile(root.join("runs.db"))
        );
        assert_eq!(Endpoint::SqliteMemory.relative_to(root), Endpoint::SqliteMemory);
    }
}
