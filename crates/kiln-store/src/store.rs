//! The run store contract shared by every backend.

use crate::error::StoreResult;
use crate::record::{ArtifactRef, RunFilter, RunId, RunRecord};
use async_trait::async_trait;
use kiln_training::Signature;
use std::collections::BTreeMap;
use std::time::Duration;

/// Client for the system of record for training runs.
///
/// Implementations must be safe to share across tasks. Concurrent calls are
/// allowed; a backend serializes writes internally if it has to.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Human-readable endpoint, for logs and reports.
    fn endpoint(&self) -> String;

    /// The most recent `Completed` run with this signature, if any.
    ///
    /// Ties on `started_at` break by the larger run id.
    async fn find_completed_run(&self, signature: &Signature) -> StoreResult<Option<RunRecord>>;

    /// Start a `Running` run.
    ///
    /// Fails with `DuplicateActiveRun` when another run with the same
    /// signature is still running.
    async fn begin_run(&self, model_id: &str, signature: &Signature) -> StoreResult<RunRecord>;

    /// Record the flattened job config on a running run.
    async fn log_params(&self, run_id: &RunId, params: &BTreeMap<String, String>) -> StoreResult<()>;

    /// Store an artifact and return a reference to it.
    async fn log_artifact(&self, run_id: &RunId, name: &str, bytes: &[u8]) -> StoreResult<ArtifactRef>;

    /// Transition `Running -> Completed`, attaching metrics and artifacts.
    async fn complete_run(
        &self,
        run_id: &RunId,
        metrics: &BTreeMap<String, f64>,
        artifacts: &[ArtifactRef],
    ) -> StoreResult<RunRecord>;

    /// Transition `Running -> Failed`, attaching the error detail.
    async fn fail_run(&self, run_id: &RunId, detail: &str) -> StoreResult<RunRecord>;

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord>;

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<RunRecord>>;

    /// Mark runs that have been `Running` for longer than `older_than` as
    /// `Failed`. Returns the reaped records.
    async fn reap_stale_runs(&self, older_than: Duration) -> StoreResult<Vec<RunRecord>>;

    async fn read_artifact(&self, run_id: &RunId, name: &str) -> StoreResult<Vec<u8>>;
}
