//! Error types for run store clients.

use crate::record::RunStatus;
use kiln_training::Signature;
use thiserror::Error;

/// Errors returned by [`RunStore`](crate::RunStore) operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient I/O failure; the caller may retry later.
    #[error("run store unavailable: {0}")]
    Unavailable(String),

    /// The store returned data that cannot be interpreted. Not retryable.
    #[error("run store corrupt: {0}")]
    Corrupt(String),

    /// Another run with the same signature is currently running.
    #[error("run {run_id} with signature {signature} is already running")]
    DuplicateActiveRun { signature: Signature, run_id: String },

    /// A lifecycle transition was requested from the wrong status.
    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition { run_id: String, from: RunStatus, to: RunStatus },

    /// No run or artifact with this id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint string could not be understood.
    #[error("invalid run store endpoint: {0}")]
    InvalidEndpoint(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::OutOfMemory
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied => Self::Unavailable(err.to_string()),
                _ => Self::Corrupt(err.to_string()),
            },
            _ => Self::Corrupt(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(format!("malformed stored JSON: {err}"))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Corrupt(format!("malformed tracking server response: {err}"))
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Result type alias for run store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(StoreError::from(err).is_transient());
    }

    #[test]
    fn test_corrupt_is_permanent() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        );
        let err = StoreError::from(err);
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(!err.is_transient());
    }
}
