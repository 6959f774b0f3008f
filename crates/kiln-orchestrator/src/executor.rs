//! Runs one training job against the run store.
//!
//! The executor owns the run lifecycle: it opens a run, records params, calls
//! the trainer under a timeout, uploads artifacts and closes the run. Any
//! failure after `begin_run` still tries to move the record to `Failed`, so a
//! run is never left `Running` by this process.

use crate::error::ExecutionError;
use kiln_store::{RunId, RunRecord, RunStore, StoreError};
use kiln_training::{DataSnapshot, JobSpec, Signature, Trainer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Executes training jobs and records them in a [`RunStore`].
#[derive(Clone)]
pub struct TrainingExecutor {
    store: Arc<dyn RunStore>,
    default_timeout: Option<Duration>,
}

impl TrainingExecutor {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store, default_timeout: None }
    }

    /// Timeout for jobs that do not declare their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Train `job` and record the attempt.
    ///
    /// Creates exactly one run record unless `begin_run` itself fails. No
    /// retries happen here.
    pub async fn execute(
        &self,
        job: &JobSpec,
        signature: &Signature,
        trainer: &dyn Trainer,
        snapshot: &DataSnapshot,
    ) -> Result<RunRecord, ExecutionError> {
        let run = self
            .store
            .begin_run(&job.model_id, signature)
            .await
            .map_err(|source| ExecutionError::Store { run_id: None, source })?;
        let run_id = run.run_id;
        info!(
            model_id = %job.model_id,
            run_id = %run_id,
            signature = %signature.short(),
            trainer = trainer.describe(),
            "Training started"
        );

        let started = Instant::now();
        match self.run_started(&run_id, job, trainer, snapshot).await {
            Ok(record) => {
                info!(
                    model_id = %job.model_id,
                    run_id = %run_id,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Training completed"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(model_id = %job.model_id, run_id = %run_id, error = %err, "Training did not complete");
                self.abandon(&run_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run_started(
        &self,
        run_id: &RunId,
        job: &JobSpec,
        trainer: &dyn Trainer,
        snapshot: &DataSnapshot,
    ) -> Result<RunRecord, ExecutionError> {
        let store_err = |source: StoreError| ExecutionError::Store { run_id: Some(run_id.clone()), source };

        self.store.log_params(run_id, &job.params()).await.map_err(store_err)?;

        let training = trainer.train(&job.config, snapshot);
        let result = match job.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, training)
                .await
                .map_err(|_| ExecutionError::Timeout { run_id: run_id.clone(), after: limit })?,
            None => training.await,
        };
        let output = result.map_err(|e| ExecutionError::TrainingFailed {
            run_id: run_id.clone(),
            message: e.to_string(),
        })?;

        let mut artifact_refs = Vec::with_capacity(output.artifacts.len());
        for artifact in &output.artifacts {
            let reference = self
                .store
                .log_artifact(run_id, &artifact.name, &artifact.bytes)
                .await
                .map_err(store_err)?;
            artifact_refs.push(reference);
        }

        let metrics = finite_metrics(&output.metrics);
        self.store.complete_run(run_id, &metrics, &artifact_refs).await.map_err(store_err)
    }

    async fn abandon(&self, run_id: &RunId, err: &ExecutionError) {
        match self.store.fail_run(run_id, &err.to_string()).await {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(run_id = %run_id, status = %from, "Run already terminal, leaving it as is");
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Could not mark run failed; it stays running until reaped");
            }
        }
    }
}

fn finite_metrics(metrics: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    metrics
        .iter()
        .filter(|(name, value)| {
            let keep = value.is_finite();
            if !keep {
                warn!(metric = %name, value = %value, "Dropping non-finite metric");
            }
            keep
        })
        .map(|(k, v)| (k.clone(), *v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_store::{RunFilter, RunStatus, SqliteRunStore};
    use kiln_training::{JobConfig, TrainOutput, TrainingArtifact, TrainingError, TrainingResult};

    struct Fixed;

    #[async_trait]
    impl Trainer for Fixed {
        fn describe(&self) -> &str {
            "fixed"
        }

        async fn train(&self, _: &JobConfig, _: &DataSnapshot) -> TrainingResult<TrainOutput> {
            Ok(TrainOutput::default()
                .with_metric("rmse", 0.25)
                .with_metric("r2", f64::NAN)
                .with_artifact(TrainingArtifact::new("model.bin", vec![1, 2, 3])))
        }
    }

    struct Broken;

    #[async_trait]
    impl Trainer for Broken {
        fn describe(&self) -> &str {
            "broken"
        }

        async fn train(&self, _: &JobConfig, _: &DataSnapshot) -> TrainingResult<TrainOutput> {
            Err(TrainingError::Trainer("loss is NaN".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl Trainer for Slow {
        fn describe(&self) -> &str {
            "slow"
        }

        async fn train(&self, _: &JobConfig, _: &DataSnapshot) -> TrainingResult<TrainOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(TrainOutput::default())
        }
    }

    fn setup() -> (Arc<dyn RunStore>, TrainingExecutor, JobSpec, DataSnapshot) {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        let executor = TrainingExecutor::new(Arc::clone(&store));
        let job = JobSpec::new("xgb", "fixed").with_param("lr", serde_json::json!(0.1));
        (store, executor, job, DataSnapshot::with_id("snap", None))
    }

    #[tokio::test]
    async fn test_success_records_metrics_and_artifacts() {
        let (store, executor, job, snapshot) = setup();
        let sig = Signature::from_bytes([1; 32]);
        let record = executor.execute(&job, &sig, &Fixed, &snapshot).await.unwrap();

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.metric("rmse"), Some(0.25));
        assert_eq!(record.metric("r2"), None);
        assert_eq!(record.params.get("lr").map(String::as_str), Some("0.1"));
        assert_eq!(record.artifact_refs.len(), 1);
        assert_eq!(store.read_artifact(&record.run_id, "model.bin").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_trainer_error_fails_run() {
        let (store, executor, job, snapshot) = setup();
        let sig = Signature::from_bytes([2; 32]);
        let err = executor.execute(&job, &sig, &Broken, &snapshot).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TrainingFailed { .. }));

        let run = store.get_run(err.run_id().unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("loss is NaN"));
    }

    #[tokio::test]
    async fn test_timeout_fails_run() {
        let (store, executor, job, snapshot) = setup();
        let job = job.with_timeout(Duration::from_millis(50));
        let sig = Signature::from_bytes([3; 32]);
        let err = executor.execute(&job, &sig, &Slow, &snapshot).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));

        let running = store.list_runs(&RunFilter::default().status(RunStatus::Running)).await.unwrap();
        assert!(running.is_empty());
    }
}
