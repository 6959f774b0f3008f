//! Embedded run store on SQLite.
//!
//! Every call, reads included, goes through the [`writer`] actor. Artifacts
//! live as BLOBs next to the run rows and are addressed as
//! `kiln://runs/<run_id>/artifacts/<name>`.

mod schema;
mod writer;

use crate::error::{StoreError, StoreResult};
use crate::record::{ArtifactRef, RunFilter, RunId, RunRecord, RunStatus};
use crate::store::RunStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kiln_training::{Signature, sha256_bytes};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use writer::Writer;

const RUN_COLUMNS: &str = "run_id, model_id, signature, status, params_json, metrics_json, artifacts_json, started_at, ended_at, error";

/// Run store backed by a local SQLite database.
#[derive(Clone)]
pub struct SqliteRunStore {
    writer: Writer,
    label: String,
}

impl std::fmt::Debug for SqliteRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRunStore").field("endpoint", &self.label).finish()
    }
}

impl SqliteRunStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        schema::configure(&conn, true)?;
        schema::init_schema(&conn)?;
        let label = format!("sqlite://{}", path.display());
        info!(endpoint = %label, "Opened run store");
        Self::start(conn, label)
    }

    /// Open `path` without ever writing to it.
    ///
    /// A missing database is served as an empty in-memory store under the
    /// same label, so nothing is created on disk. Writes against an existing
    /// file fail as `Unavailable`.
    pub fn open_read_only(path: &Path) -> StoreResult<Self> {
        let label = format!("sqlite://{}", path.display());
        if !path.exists() {
            debug!(endpoint = %label, "Run store does not exist yet; using an empty read-only view");
            let conn = Connection::open_in_memory()?;
            schema::configure(&conn, false)?;
            schema::init_schema(&conn)?;
            schema::configure_read_only(&conn)?;
            return Self::start(conn, label);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
        schema::configure_read_only(&conn)?;
        info!(endpoint = %label, "Opened run store read-only");
        Self::start(conn, label)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::configure(&conn, false)?;
        schema::init_schema(&conn)?;
        Self::start(conn, "sqlite::memory:".to_string())
    }

    fn start(conn: Connection, label: String) -> StoreResult<Self> {
        let writer = Writer::spawn(conn, label.clone())?;
        Ok(Self { writer, label })
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{column} '{value}': {e}")))
}

fn artifact_uri(run_id: &RunId, name: &str) -> String {
    format!("kiln://runs/{run_id}/artifacts/{name}")
}

/// Row exactly as stored; converted to [`RunRecord`] after the statement.
struct RunRow {
    run_id: String,
    model_id: String,
    signature: String,
    status: String,
    params_json: String,
    metrics_json: String,
    artifacts_json: String,
    started_at: String,
    ended_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            model_id: row.get(1)?,
            signature: row.get(2)?,
            status: row.get(3)?,
            params_json: row.get(4)?,
            metrics_json: row.get(5)?,
            artifacts_json: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            error: row.get(9)?,
        })
    }

    fn into_record(self) -> StoreResult<RunRecord> {
        let signature = Signature::from_hex(&self.signature)
            .map_err(|e| StoreError::Corrupt(format!("run {}: {e}", self.run_id)))?;
        let status = self.status.parse::<RunStatus>().map_err(StoreError::Corrupt)?;
        Ok(RunRecord {
            signature,
            status,
            params: serde_json::from_str(&self.params_json)?,
            metrics: serde_json::from_str(&self.metrics_json)?,
            artifact_refs: serde_json::from_str(&self.artifacts_json)?,
            started_at: parse_ts("started_at", &self.started_at)?,
            ended_at: self.ended_at.as_deref().map(|s| parse_ts("ended_at", s)).transpose()?,
            error: self.error,
            run_id: RunId::from(self.run_id),
            model_id: self.model_id,
        })
    }
}

/// Write transactions take the database lock up front so a check and the
/// write that depends on it cannot interleave with another process.
fn write_tx(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// The partial unique index on running signatures rejected an insert.
fn is_active_signature_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.code == ErrorCode::ConstraintViolation && msg.contains("runs.signature")
    )
}

fn active_run(conn: &Connection, signature_hex: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT run_id FROM runs WHERE signature = ?1 AND status = 'running' LIMIT 1",
            [signature_hex],
            |row| row.get(0),
        )
        .optional()?)
}

fn fetch_run(conn: &Connection, run_id: &str) -> StoreResult<Option<RunRecord>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
    conn.query_row(&sql, [run_id], RunRow::from_row)
        .optional()?
        .map(RunRow::into_record)
        .transpose()
}

fn require_run(conn: &Connection, run_id: &str) -> StoreResult<RunRecord> {
    fetch_run(conn, run_id)?.ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
}

fn require_running(conn: &Connection, run_id: &str, to: RunStatus) -> StoreResult<RunRecord> {
    let record = require_run(conn, run_id)?;
    if record.status != RunStatus::Running {
        return Err(StoreError::InvalidTransition {
            run_id: run_id.to_string(),
            from: record.status,
            to,
        });
    }
    Ok(record)
}

fn query_runs(conn: &Connection, filter: &RunFilter) -> StoreResult<Vec<RunRecord>> {
    let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(model_id) = &filter.model_id {
        args.push(SqlValue::Text(model_id.clone()));
        sql.push_str(&format!(" AND model_id = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(SqlValue::Text(status.as_str().to_string()));
        sql.push_str(&format!(" AND status = ?{}", args.len()));
    }
    if let Some(signature) = &filter.signature {
        args.push(SqlValue::Text(signature.to_hex()));
        sql.push_str(&format!(" AND signature = ?{}", args.len()));
    }
    sql.push_str(" ORDER BY started_at DESC, run_id DESC");
    if let Some(limit) = filter.limit {
        args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), RunRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RunRow::into_record).collect()
}

fn finish_run(
    conn: &mut Connection,
    run_id: &str,
    status: RunStatus,
    metrics: Option<&BTreeMap<String, f64>>,
    artifacts: Option<&[ArtifactRef]>,
    error: Option<&str>,
) -> StoreResult<RunRecord> {
    let tx = write_tx(conn)?;
    require_running(&tx, run_id, status)?;
    let ended_at = format_ts(&Utc::now());
    tx.execute(
        "UPDATE runs SET status = ?2, ended_at = ?3,
             metrics_json = COALESCE(?4, metrics_json),
             artifacts_json = COALESCE(?5, artifacts_json),
             error = ?6
         WHERE run_id = ?1 AND status = 'running'",
        params![
            run_id,
            status.as_str(),
            ended_at,
            metrics.map(serde_json::to_string).transpose()?,
            artifacts.map(serde_json::to_string).transpose()?,
            error,
        ],
    )?;
    let record = require_run(&tx, run_id)?;
    tx.commit()?;
    Ok(record)
}

#[async_trait]
impl RunStore for SqliteRunStore {
    fn endpoint(&self) -> String {
        self.label.clone()
    }

    async fn find_completed_run(&self, signature: &Signature) -> StoreResult<Option<RunRecord>> {
        let filter = RunFilter::default().signature(*signature).status(RunStatus::Completed).limit(1);
        let found = self.writer.call(move |conn| query_runs(conn, &filter)).await?;
        Ok(found.into_iter().next())
    }

    async fn begin_run(&self, model_id: &str, signature: &Signature) -> StoreResult<RunRecord> {
        let record = RunRecord::start(RunId::generate(), model_id, *signature);
        let record = self
            .writer
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let signature_hex = record.signature.to_hex();
                if let Some(run_id) = active_run(&tx, &signature_hex)? {
                    return Err(StoreError::DuplicateActiveRun { signature: record.signature, run_id });
                }
                let inserted = tx.execute(
                    "INSERT INTO runs (run_id, model_id, signature, status, started_at)
                     VALUES (?1, ?2, ?3, 'running', ?4)",
                    params![record.run_id.as_str(), record.model_id, signature_hex, format_ts(&record.started_at)],
                );
                if let Err(e) = inserted {
                    if is_active_signature_conflict(&e) {
                        let run_id = active_run(&tx, &signature_hex)?.unwrap_or_default();
                        return Err(StoreError::DuplicateActiveRun { signature: record.signature, run_id });
                    }
                    return Err(e.into());
                }
                tx.commit()?;
                Ok(record)
            })
            .await?;
        debug!(run_id = %record.run_id, model_id = %record.model_id, signature = %record.signature.short(), "Run started");
        Ok(record)
    }

    async fn log_params(&self, run_id: &RunId, params: &BTreeMap<String, String>) -> StoreResult<()> {
        let run_id = run_id.to_string();
        let params = params.clone();
        self.writer
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let mut record = require_running(&tx, &run_id, RunStatus::Running)?;
                record.params.extend(params);
                tx.execute(
                    "UPDATE runs SET params_json = ?2 WHERE run_id = ?1",
                    params![run_id, serde_json::to_string(&record.params)?],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn log_artifact(&self, run_id: &RunId, name: &str, bytes: &[u8]) -> StoreResult<ArtifactRef> {
        let reference = ArtifactRef {
            name: name.to_string(),
            uri: artifact_uri(run_id, name),
            sha256: sha256_bytes(bytes),
            size: bytes.len() as u64,
        };
        let run_id = run_id.to_string();
        let data = bytes.to_vec();
        let stored = reference.clone();
        self.writer
            .call(move |conn| {
                let tx = write_tx(conn)?;
                require_running(&tx, &run_id, RunStatus::Running)?;
                tx.execute(
                    "INSERT OR REPLACE INTO artifacts (run_id, name, sha256, size, data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        run_id,
                        stored.name,
                        stored.sha256,
                        i64::try_from(stored.size).unwrap_or(i64::MAX),
                        data,
                        format_ts(&Utc::now()),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(uri = %reference.uri, size = reference.size, "Artifact stored");
        Ok(reference)
    }

    async fn complete_run(
        &self,
        run_id: &RunId,
        metrics: &BTreeMap<String, f64>,
        artifacts: &[ArtifactRef],
    ) -> StoreResult<RunRecord> {
        let run_id = run_id.to_string();
        let metrics = metrics.clone();
        let artifacts = artifacts.to_vec();
        let record = self
            .writer
            .call(move |conn| {
                finish_run(conn, &run_id, RunStatus::Completed, Some(&metrics), Some(artifacts.as_slice()), None)
            })
            .await?;
        info!(run_id = %record.run_id, model_id = %record.model_id, "Run completed");
        Ok(record)
    }

    async fn fail_run(&self, run_id: &RunId, detail: &str) -> StoreResult<RunRecord> {
        let run_id = run_id.to_string();
        let detail = detail.to_string();
        let record = self
            .writer
            .call(move |conn| finish_run(conn, &run_id, RunStatus::Failed, None, None, Some(detail.as_str())))
            .await?;
        warn!(run_id = %record.run_id, model_id = %record.model_id, "Run failed");
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        let run_id = run_id.to_string();
        self.writer.call(move |conn| require_run(conn, &run_id)).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<RunRecord>> {
        let filter = filter.clone();
        self.writer.call(move |conn| query_runs(conn, &filter)).await
    }

    async fn reap_stale_runs(&self, older_than: Duration) -> StoreResult<Vec<RunRecord>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::Corrupt(format!("reap age out of range: {e}")))?;
        // No run can be older than the earliest representable instant.
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(Vec::new());
        };
        let cutoff = format_ts(&cutoff);
        let detail = format!("reaped: still running after {}s", older_than.as_secs());
        let reaped = self
            .writer
            .call(move |conn| {
                let stale: Vec<String> = {
                    let mut stmt = conn.prepare(
                        "SELECT run_id FROM runs WHERE status = 'running' AND started_at < ?1 ORDER BY started_at",
                    )?;
                    stmt.query_map([cutoff], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                stale
                    .iter()
                    .map(|run_id| finish_run(conn, run_id, RunStatus::Failed, None, None, Some(detail.as_str())))
                    .collect::<StoreResult<Vec<_>>>()
            })
            .await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "Reaped stale runs");
        }
        Ok(reaped)
    }

    async fn read_artifact(&self, run_id: &RunId, name: &str) -> StoreResult<Vec<u8>> {
        let run_id = run_id.to_string();
        let name = name.to_string();
        self.writer
            .call(move |conn| {
                conn.query_row(
                    "SELECT data FROM artifacts WHERE run_id = ?1 AND name = ?2",
                    [&run_id, &name],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("artifact {name} of run {run_id}")))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(byte: u8) -> Signature {
        Signature::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_begin_and_complete() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = store.begin_run("xgb", &sig(1)).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let params = BTreeMap::from([("lr".to_string(), "0.1".to_string())]);
        store.log_params(&run.run_id, &params).await.unwrap();
        let artifact = store.log_artifact(&run.run_id, "model.json", b"{}").await.unwrap();
        assert_eq!(artifact.uri, format!("kiln://runs/{}/artifacts/model.json", run.run_id));
        assert_eq!(artifact.size, 2);

        let metrics = BTreeMap::from([("rmse".to_string(), 0.42)]);
        let done = store.complete_run(&run.run_id, &metrics, &[artifact]).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.params, params);
        assert_eq!(done.metric("rmse"), Some(0.42));
        assert!(done.ended_at.is_some());
        assert_eq!(store.read_artifact(&run.run_id, "model.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_terminal_runs_reject_writes() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = store.begin_run("xgb", &sig(2)).await.unwrap();
        store.fail_run(&run.run_id, "boom").await.unwrap();

        let err = store.complete_run(&run.run_id, &BTreeMap::new(), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: RunStatus::Failed, to: RunStatus::Completed, .. }
        ));
        assert!(store.log_artifact(&run.run_id, "late.bin", b"x").await.is_err());
        assert!(store.log_params(&run.run_id, &BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let err = store.get_run(&RunId::from("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = store.read_artifact(&RunId::from("missing"), "model.json").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
