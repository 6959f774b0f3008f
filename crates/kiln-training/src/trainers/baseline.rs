use super::{load_split, run_blocking};
use crate::artifacts::TrainingArtifact;
use crate::dataset::DataSnapshot;
use crate::error::{TrainingError, TrainingResult};
use crate::evaluation::RegressionMetrics;
use crate::job::JobConfig;
use crate::trainer::{TrainOutput, Trainer};
use async_trait::async_trait;
use serde_json::json;

/// Predicts the mean training target for every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineTrainer;

#[async_trait]
impl Trainer for BaselineTrainer {
    fn describe(&self) -> &str {
        "mean-of-target baseline"
    }

    async fn train(&self, config: &JobConfig, data: &DataSnapshot) -> TrainingResult<TrainOutput> {
        let config = config.clone();
        let data = data.clone();
        run_blocking(move || {
            let (train, test) = load_split(&config, &data)?;
            let mean = train.targets.iter().sum::<f64>() / train.len() as f64;

            let eval = if test.is_empty() { &train } else { &test };
            let preds = vec![mean; eval.len()];
            let metrics = RegressionMetrics::evaluate(&eval.targets, &preds)
                .ok_or_else(|| TrainingError::Trainer("evaluation set is empty".to_string()))?;

            let model = json!({"kind": "mean", "value": mean, "train_rows": train.len()});
            let mut output = TrainOutput::default().with_artifact(TrainingArtifact::json("model.json", &model)?);
            output.metrics = metrics.to_map();
            Ok(output)
        })
        .await
    }
}
