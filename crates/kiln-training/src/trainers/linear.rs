use super::{get_f64, get_u64, load_split, run_blocking};
use crate::artifacts::TrainingArtifact;
use crate::dataset::{DataSnapshot, TabularDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluation::RegressionMetrics;
use crate::job::JobConfig;
use crate::trainer::{TrainOutput, Trainer};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Ridge regression fitted by full-batch gradient descent on standardized
/// features.
///
/// Config: `learning_rate` (0.05), `epochs` (500), `l2` (0.0), plus the
/// dataset keys understood by [`crate::DatasetOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearTrainer;

#[derive(Debug, Clone, Serialize)]
struct LinearModel {
    feature_names: Vec<String>,
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl LinearModel {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut y = self.bias;
        for (j, x) in row.iter().enumerate() {
            y += self.weights[j] * (x - self.means[j]) / self.scales[j];
        }
        y
    }
}

fn fit(train: &TabularDataset, learning_rate: f64, epochs: u64, l2: f64) -> LinearModel {
    let n = train.len() as f64;
    let d = train.feature_names.len();

    let mut means = vec![0.0; d];
    for row in &train.rows {
        for (j, x) in row.iter().enumerate() {
            means[j] += x / n;
        }
    }
    let mut scales = vec![0.0; d];
    for row in &train.rows {
        for (j, x) in row.iter().enumerate() {
            scales[j] += (x - means[j]).powi(2) / n;
        }
    }
    for s in &mut scales {
        *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
    }

    let mut model = LinearModel {
        feature_names: train.feature_names.clone(),
        means,
        scales,
        weights: vec![0.0; d],
        bias: 0.0,
    };

    for epoch in 0..epochs {
        let mut grad_w = vec![0.0; d];
        let mut grad_b = 0.0;
        for (row, target) in train.rows.iter().zip(&train.targets) {
            let err = model.predict(row) - target;
            grad_b += err;
            for j in 0..d {
                grad_w[j] += err * (row[j] - model.means[j]) / model.scales[j];
            }
        }
        for j in 0..d {
            let g = 2.0 * grad_w[j] / n + 2.0 * l2 * model.weights[j];
            model.weights[j] -= learning_rate * g;
        }
        model.bias -= learning_rate * 2.0 * grad_b / n;

        if epoch % 100 == 0 {
            debug!(epoch, bias = model.bias, "linear trainer progress");
        }
    }
    model
}

#[async_trait]
impl Trainer for LinearTrainer {
    fn describe(&self) -> &str {
        "ridge regression (gradient descent)"
    }

    async fn train(&self, config: &JobConfig, data: &DataSnapshot) -> TrainingResult<TrainOutput> {
        let learning_rate = get_f64(config, "learning_rate", 0.05)?;
        let epochs = get_u64(config, "epochs", 500)?;
        let l2 = get_f64(config, "l2", 0.0)?;
        if learning_rate <= 0.0 {
            return Err(TrainingError::InvalidSpec("learning_rate must be > 0".to_string()));
        }
        if l2 < 0.0 {
            return Err(TrainingError::InvalidSpec("l2 must be >= 0".to_string()));
        }

        let config = config.clone();
        let data = data.clone();
        run_blocking(move || {
            let (train, test) = load_split(&config, &data)?;
            let model = fit(&train, learning_rate, epochs, l2);
            if !model.bias.is_finite() || model.weights.iter().any(|w| !w.is_finite()) {
                return Err(TrainingError::Trainer(format!(
                    "training diverged (learning_rate={learning_rate})"
                )));
            }

            let eval = if test.is_empty() { &train } else { &test };
            let preds: Vec<f64> = eval.rows.iter().map(|r| model.predict(r)).collect();
            let metrics = RegressionMetrics::evaluate(&eval.targets, &preds)
                .ok_or_else(|| TrainingError::Trainer("evaluation set is empty".to_string()))?;

            let mut output = TrainOutput::default().with_artifact(TrainingArtifact::json("model.json", &model)?);
            output.metrics = metrics.to_map();
            Ok(output)
        })
        .await
    }
}
