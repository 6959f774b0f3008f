//! Run store on an MLflow tracking server (REST API 2.0).
//!
//! Runs live in a single experiment (`kiln` unless configured). The job
//! signature and model id are stored as run tags; artifact references and
//! failure details ride along as `kiln.*` tags. Writes from one client are
//! serialized by an async lock so the duplicate-active check in
//! [`RunStore::begin_run`] and the create that follows are not interleaved
//! with another task's begin.

use crate::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::record::{ArtifactRef, RunFilter, RunId, RunRecord, RunStatus};
use crate::store::RunStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_training::{Signature, sha256_bytes};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

const TAG_SIGNATURE: &str = "signature";
const TAG_MODEL_ID: &str = "model_id";
const TAG_ARTIFACTS: &str = "kiln.artifacts";
const TAG_ERROR: &str = "kiln.error";
const MAX_TAG_VALUE: usize = 5000;
const MAX_PARAM_VALUE: usize = 6000;
const PARAMS_PER_BATCH: usize = 100;
const METRICS_PER_BATCH: usize = 1000;
const SEARCH_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
struct ExperimentEnvelope {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: MlflowRun,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    runs: Vec<MlflowRun>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MlflowRun {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
    status: String,
    #[serde(default, deserialize_with = "millis")]
    start_time: Option<i64>,
    #[serde(default, deserialize_with = "millis")]
    end_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RunData {
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    key: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    value: String,
}

/// Epoch milliseconds arrive as numbers or, from protobuf JSON, as strings.
fn millis<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64()),
        Some(Value::String(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!("expected epoch millis, got {other}"))),
    }
}

fn parse_status(status: &str) -> StoreResult<RunStatus> {
    match status {
        "RUNNING" | "SCHEDULED" => Ok(RunStatus::Running),
        "FINISHED" => Ok(RunStatus::Completed),
        "FAILED" | "KILLED" => Ok(RunStatus::Failed),
        other => Err(StoreError::Corrupt(format!("unknown MLflow run status: {other}"))),
    }
}

fn server_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "FINISHED",
        RunStatus::Failed => "FAILED",
    }
}

fn from_millis(column: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {ms}")))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Quote a value for an MLflow search filter.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl MlflowRun {
    fn into_record(self) -> StoreResult<RunRecord> {
        let run_id = self.info.run_id;
        let tags: BTreeMap<String, String> =
            self.data.tags.into_iter().map(|t| (t.key, t.value)).collect();

        let signature = tags
            .get(TAG_SIGNATURE)
            .ok_or_else(|| StoreError::Corrupt(format!("run {run_id} has no signature tag")))
            .and_then(|s| {
                Signature::from_hex(s).map_err(|e| StoreError::Corrupt(format!("run {run_id}: {e}")))
            })?;
        let model_id = tags
            .get(TAG_MODEL_ID)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("run {run_id} has no model_id tag")))?;
        let artifact_refs = match tags.get(TAG_ARTIFACTS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let start = self
            .info
            .start_time
            .ok_or_else(|| StoreError::Corrupt(format!("run {run_id} has no start_time")))?;

        Ok(RunRecord {
            status: parse_status(&self.info.status)?,
            params: self.data.params.into_iter().map(|p| (p.key, p.value)).collect(),
            metrics: self.data.metrics.into_iter().map(|m| (m.key, m.value)).collect(),
            artifact_refs,
            started_at: from_millis("start_time", start)?,
            ended_at: self.info.end_time.map(|ms| from_millis("end_time", ms)).transpose()?,
            error: tags.get(TAG_ERROR).cloned(),
            signature,
            model_id,
            run_id: RunId::from(run_id),
        })
    }
}

/// Run store client for an MLflow tracking server.
#[derive(Debug)]
pub struct MlflowRunStore {
    base_url: String,
    experiment: String,
    client: Client,
    experiment_id: OnceCell<String>,
    write_lock: Mutex<()>,
}

impl MlflowRunStore {
    /// Create a client for the server at `base_url` (e.g. `http://mlflow:5000`).
    pub fn new(base_url: impl Into<String>, options: &StoreOptions) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            experiment: options.experiment.clone(),
            client,
            experiment_id: OnceCell::new(),
            write_lock: Mutex::new(()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.0/{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> StoreResult<Response> {
        let response = request.send().await.map_err(|e| {
            error!(error = %e, endpoint = %self.base_url, "MLflow request failed: {what}");
            StoreError::Unavailable(format!("{what}: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %body, "MLflow error response: {what}");
        Err(if status == StatusCode::NOT_FOUND {
            StoreError::NotFound(format!("{what}: {body}"))
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            StoreError::Unavailable(format!("{what}: HTTP {status}: {body}"))
        } else {
            StoreError::Corrupt(format!("{what}: HTTP {status}: {body}"))
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> StoreResult<T> {
        let request = self.client.get(self.url(path)).query(query);
        Ok(self.send(request, path).await?.json().await?)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> StoreResult<T> {
        let request = self.client.post(self.url(path)).json(body);
        Ok(self.send(request, path).await?.json().await?)
    }

    async fn experiment_id(&self) -> StoreResult<&str> {
        let id = self
            .experiment_id
            .get_or_try_init(|| async {
                let found: StoreResult<ExperimentEnvelope> = self
                    .get_json("mlflow/experiments/get-by-name", &[("experiment_name", self.experiment.as_str())])
                    .await;
                match found {
                    Ok(envelope) => Ok(envelope.experiment.experiment_id),
                    Err(StoreError::NotFound(_)) => {
                        info!(experiment = %self.experiment, "Creating MLflow experiment");
                        self.post_json::<Experiment>("mlflow/experiments/create", &json!({ "name": self.experiment }))
                            .await
                            .map(|created| created.experiment_id)
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(id.as_str())
    }

    /// All runs matching `filter` (a search filter string), newest first.
    async fn search(&self, filter: &str, limit: Option<usize>) -> StoreResult<Vec<RunRecord>> {
        let experiment_id = self.experiment_id().await?.to_string();
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let remaining = limit.map_or(SEARCH_PAGE, |l| l.saturating_sub(records.len()).min(SEARCH_PAGE));
            if remaining == 0 {
                break;
            }
            let mut body = json!({
                "experiment_ids": [experiment_id],
                "filter": filter,
                "max_results": remaining,
                "order_by": ["attributes.start_time DESC", "attributes.run_id DESC"],
            });
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }
            let page: SearchResponse = self.post_json("mlflow/runs/search", &body).await?;
            for run in page.runs {
                records.push(run.into_record()?);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(records)
    }

    async fn fetch(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        let envelope: RunEnvelope = self.get_json("mlflow/runs/get", &[("run_id", run_id.as_str())]).await?;
        envelope.run.into_record()
    }

    async fn require_running(&self, run_id: &RunId, to: RunStatus) -> StoreResult<RunRecord> {
        let record = self.fetch(run_id).await?;
        if record.status != RunStatus::Running {
            return Err(StoreError::InvalidTransition { run_id: run_id.to_string(), from: record.status, to });
        }
        Ok(record)
    }

    async fn log_batch(&self, run_id: &RunId, body: Value) -> StoreResult<()> {
        let mut body = body;
        body["run_id"] = json!(run_id.as_str());
        let _: Value = self.post_json("mlflow/runs/log-batch", &body).await?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &RunId, key: &str, value: &str) -> StoreResult<()> {
        let body = json!({ "run_id": run_id.as_str(), "key": key, "value": truncate(value, MAX_TAG_VALUE) });
        let _: Value = self.post_json("mlflow/runs/set-tag", &body).await?;
        Ok(())
    }

    async fn update_status(&self, run_id: &RunId, status: RunStatus) -> StoreResult<()> {
        let body = json!({
            "run_id": run_id.as_str(),
            "status": server_status(status),
            "end_time": now_millis(),
        });
        let _: Value = self.post_json("mlflow/runs/update", &body).await?;
        Ok(())
    }

    fn artifact_path(&self, experiment_id: &str, run_id: &RunId, name: &str) -> String {
        format!("{experiment_id}/{run_id}/artifacts/{name}")
    }

    async fn fail_locked(&self, run_id: &RunId, detail: &str) -> StoreResult<RunRecord> {
        self.require_running(run_id, RunStatus::Failed).await?;
        self.set_tag(run_id, TAG_ERROR, detail).await?;
        self.update_status(run_id, RunStatus::Failed).await?;
        self.fetch(run_id).await
    }
}

#[async_trait]
impl RunStore for MlflowRunStore {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn find_completed_run(&self, signature: &Signature) -> StoreResult<Option<RunRecord>> {
        let filter = format!(
            "tags.{TAG_SIGNATURE} = {} and attributes.status = 'FINISHED'",
            quote(&signature.to_hex())
        );
        Ok(self.search(&filter, Some(1)).await?.into_iter().next())
    }

    async fn begin_run(&self, model_id: &str, signature: &Signature) -> StoreResult<RunRecord> {
        let _guard = self.write_lock.lock().await;
        let experiment_id = self.experiment_id().await?.to_string();

        let active = format!(
            "tags.{TAG_SIGNATURE} = {} and attributes.status = 'RUNNING'",
            quote(&signature.to_hex())
        );
        if let Some(existing) = self.search(&active, Some(1)).await?.into_iter().next() {
            return Err(StoreError::DuplicateActiveRun {
                signature: *signature,
                run_id: existing.run_id.to_string(),
            });
        }

        let body = json!({
            "experiment_id": experiment_id,
            "run_name": format!("{model_id}-{}", signature.short()),
            "start_time": now_millis(),
            "tags": [
                { "key": TAG_SIGNATURE, "value": signature.to_hex() },
                { "key": TAG_MODEL_ID, "value": model_id },
            ],
        });
        let created: RunEnvelope = self.post_json("mlflow/runs/create", &body).await?;
        let record = created.run.into_record()?;
        debug!(run_id = %record.run_id, model_id, signature = %signature.short(), "Run started");
        Ok(record)
    }

    async fn log_params(&self, run_id: &RunId, params: &BTreeMap<String, String>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.require_running(run_id, RunStatus::Running).await?;
        let entries: Vec<Value> = params
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": truncate(v, MAX_PARAM_VALUE) }))
            .collect();
        for chunk in entries.chunks(PARAMS_PER_BATCH) {
            self.log_batch(run_id, json!({ "params": chunk })).await?;
        }
        Ok(())
    }

    async fn log_artifact(&self, run_id: &RunId, name: &str, bytes: &[u8]) -> StoreResult<ArtifactRef> {
        let _guard = self.write_lock.lock().await;
        self.require_running(run_id, RunStatus::Running).await?;
        let experiment_id = self.experiment_id().await?.to_string();
        let path = self.artifact_path(&experiment_id, run_id, name);

        let request = self
            .client
            .put(self.url(&format!("mlflow-artifacts/artifacts/{path}")))
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec());
        self.send(request, "mlflow-artifacts/artifacts").await?;

        let reference = ArtifactRef {
            name: name.to_string(),
            uri: format!("mlflow-artifacts:/{path}"),
            sha256: sha256_bytes(bytes),
            size: bytes.len() as u64,
        };
        debug!(uri = %reference.uri, size = reference.size, "Artifact stored");
        Ok(reference)
    }

    async fn complete_run(
        &self,
        run_id: &RunId,
        metrics: &BTreeMap<String, f64>,
        artifacts: &[ArtifactRef],
    ) -> StoreResult<RunRecord> {
        let _guard = self.write_lock.lock().await;
        self.require_running(run_id, RunStatus::Completed).await?;

        let timestamp = now_millis();
        let entries: Vec<Value> = metrics
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v, "timestamp": timestamp, "step": 0 }))
            .collect();
        for chunk in entries.chunks(METRICS_PER_BATCH) {
            self.log_batch(run_id, json!({ "metrics": chunk })).await?;
        }
        if !artifacts.is_empty() {
            self.set_tag(run_id, TAG_ARTIFACTS, &serde_json::to_string(artifacts)?).await?;
        }
        self.update_status(run_id, RunStatus::Completed).await?;

        let record = self.fetch(run_id).await?;
        info!(run_id = %record.run_id, model_id = %record.model_id, "Run completed");
        Ok(record)
    }

    async fn fail_run(&self, run_id: &RunId, detail: &str) -> StoreResult<RunRecord> {
        let _guard = self.write_lock.lock().await;
        let record = self.fail_locked(run_id, detail).await?;
        warn!(run_id = %record.run_id, model_id = %record.model_id, "Run failed");
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        self.fetch(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<RunRecord>> {
        let mut clauses = Vec::new();
        if let Some(model_id) = &filter.model_id {
            clauses.push(format!("tags.{TAG_MODEL_ID} = {}", quote(model_id)));
        }
        if let Some(signature) = &filter.signature {
            clauses.push(format!("tags.{TAG_SIGNATURE} = {}", quote(&signature.to_hex())));
        }
        if let Some(status) = filter.status {
            clauses.push(format!("attributes.status = '{}'", server_status(status)));
        }
        let records = self.search(&clauses.join(" and "), filter.limit).await?;
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn reap_stale_runs(&self, older_than: Duration) -> StoreResult<Vec<RunRecord>> {
        let _guard = self.write_lock.lock().await;
        let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(age);
        let filter = format!("attributes.status = 'RUNNING' and attributes.start_time < {cutoff}");
        let detail = format!("reaped: still running after {}s", older_than.as_secs());

        let mut reaped = Vec::new();
        for stale in self.search(&filter, None).await? {
            reaped.push(self.fail_locked(&stale.run_id, &detail).await?);
        }
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "Reaped stale runs");
        }
        Ok(reaped)
    }

    async fn read_artifact(&self, run_id: &RunId, name: &str) -> StoreResult<Vec<u8>> {
        let experiment_id = self.experiment_id().await?.to_string();
        let path = self.artifact_path(&experiment_id, run_id, name);
        let request = self.client.get(self.url(&format!("mlflow-artifacts/artifacts/{path}")));
        let response = self.send(request, "mlflow-artifacts/artifacts").await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(parse_status("SCHEDULED").unwrap(), RunStatus::Running);
        assert_eq!(parse_status("FINISHED").unwrap(), RunStatus::Completed);
        assert_eq!(parse_status("KILLED").unwrap(), RunStatus::Failed);
        assert!(parse_status("PAUSED").is_err());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("xgb"), "'xgb'");
        assert_eq!(quote("o'brien"), "'o\\'brien'");
    }

    #[test]
    fn test_run_parses_with_string_millis() {
        let raw = json!({
            "info": { "run_id": "abc", "status": "FINISHED", "start_time": "1700000000000", "end_time": 1700000001000_i64 },
            "data": {
                "metrics": [{ "key": "rmse", "value": 0.5, "timestamp": 1, "step": 0 }],
                "params": [{ "key": "lr", "value": "0.1" }],
                "tags": [
                    { "key": "signature", "value": "ab".repeat(32) },
                    { "key": "model_id", "value": "xgb" },
                    { "key": "kiln.artifacts", "value": "[{\"name\":\"model.json\",\"uri\":\"u\",\"sha256\":\"s\",\"size\":2}]" }
                ]
            }
        });
        let run: MlflowRun = serde_json::from_value(raw).unwrap();
        let record = run.into_record().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.model_id, "xgb");
        assert_eq!(record.metric("rmse"), Some(0.5));
        assert_eq!(record.params["lr"], "0.1");
        assert_eq!(record.artifact_refs.len(), 1);
        assert_eq!(record.started_at.timestamp_millis(), 1_700_000_000_000);
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn test_run_without_signature_is_corrupt() {
        let raw = json!({ "info": { "run_id": "abc", "status": "RUNNING", "start_time": 1 }, "data": {} });
        let run: MlflowRun = serde_json::from_value(raw).unwrap();
        assert!(matches!(run.into_record(), Err(StoreError::Corrupt(_))));
    }
}
