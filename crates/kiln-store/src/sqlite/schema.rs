//! Database schema for the embedded run store.

use crate::error::StoreResult;
use rusqlite::Connection;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pragmas. WAL only applies to file databases.
pub(crate) fn configure(conn: &Connection, file_backed: bool) -> StoreResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if file_backed {
        // journal_mode returns the resulting mode as a row
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    Ok(())
}

/// Pragmas for a connection that never writes.
pub(crate) fn configure_read_only(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(())
}

/// Create tables and indexes if they do not exist yet.
pub(crate) fn init_schema(conn: &Connection) -> StoreResult<()> {
    info!("Initializing run store schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            signature TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
            params_json TEXT NOT NULL DEFAULT '{}',
            metrics_json TEXT NOT NULL DEFAULT '{}',
            artifacts_json TEXT NOT NULL DEFAULT '[]',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_runs_signature_status
            ON runs(signature, status, started_at);

        CREATE INDEX IF NOT EXISTS idx_runs_model
            ON runs(model_id, started_at);

        -- at most one running run per signature
        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active_signature
            ON runs(signature) WHERE status = 'running';

        CREATE TABLE IF NOT EXISTS artifacts (
            run_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            size INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (run_id, name),
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure(&conn, false).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('runs', 'artifacts')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn test_second_running_row_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let insert = "INSERT INTO runs (run_id, model_id, signature, status, started_at) VALUES (?1, 'm', 'abc', ?2, '2026-01-01T00:00:00Z')";
        conn.execute(insert, ["r1", "running"]).unwrap();
        conn.execute(insert, ["r2", "completed"]).unwrap();
        assert!(conn.execute(insert, ["r3", "running"]).is_err());
    }
}
