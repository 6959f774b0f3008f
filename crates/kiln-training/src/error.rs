use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("signature input missing or unreadable: {path}")]
    SignatureInputMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no trainer registered for entry point '{0}'")]
    UnknownEntryPoint(String),

    #[error("trainer already registered for entry point '{0}'")]
    DuplicateEntryPoint(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
