//! Kiln Training
//!
//! Backend-agnostic training primitives for:
//! - Declaring trainable units (`JobSpec`) and loading them from manifests
//! - Fingerprinting (config, code, data) tuples (`SignatureComputer`)
//! - Identifying the training data snapshot (`DataSnapshot`)
//! - Implementing and registering training entry points (`Trainer`, `TrainerRegistry`)

pub mod artifacts;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod job;
pub mod manifest;
pub mod registry;
pub mod signature;
pub mod trainer;
pub mod trainers;

pub use artifacts::{TrainingArtifact, sha256_bytes};
pub use dataset::{DataSnapshot, DatasetOptions, TabularDataset};
pub use error::{TrainingError, TrainingResult};
pub use evaluation::RegressionMetrics;
pub use job::{JobConfig, JobSpec};
pub use manifest::{ManifestFailure, ManifestLoader, ManifestSet};
pub use registry::TrainerRegistry;
pub use signature::{Signature, SignatureComputer, canonical_config};
pub use trainer::{TrainOutput, Trainer};
pub use trainers::{BaselineTrainer, LinearTrainer};
