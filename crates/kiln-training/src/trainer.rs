use crate::artifacts::TrainingArtifact;
use crate::dataset::DataSnapshot;
use crate::error::TrainingResult;
use crate::job::JobConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// What a training entry point hands back on success.
#[derive(Debug, Clone, Default)]
pub struct TrainOutput {
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainOutput {
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_artifact(mut self, artifact: TrainingArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// A model family's training entry point.
///
/// Implementations are registered explicitly in a
/// [`TrainerRegistry`](crate::TrainerRegistry) under the name manifests use as
/// `entry_point`. They must treat `data` as read-only and must not talk to the
/// run store; the executor records everything they return.
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Short human-readable description for listings.
    fn describe(&self) -> &str;

    async fn train(&self, config: &JobConfig, data: &DataSnapshot) -> TrainingResult<TrainOutput>;
}
