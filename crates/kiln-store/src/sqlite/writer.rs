//! Single-writer actor around a SQLite connection.
//!
//! One OS thread owns the [`Connection`]. Callers send closures over a bounded
//! channel and await the result on a oneshot, so every statement runs in
//! submission order on the same connection.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

const QUEUE_DEPTH: usize = 256;

/// Handle to the writer thread. Cloning shares the same thread.
#[derive(Clone)]
pub(crate) struct Writer {
    tx: mpsc::Sender<Job>,
}

impl Writer {
    pub(crate) fn spawn(mut conn: Connection, label: String) -> StoreResult<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("kiln-sqlite-writer".to_string())
            .spawn(move || {
                debug!(store = %label, "SQLite writer started");
                while let Some(job) = rx.blocking_recv() {
                    job(&mut conn);
                }
                debug!(store = %label, "SQLite writer stopped");
            })
            .map_err(|e| StoreError::Unavailable(format!("cannot start SQLite writer: {e}")))?;
        Ok(Self { tx })
    }

    /// Run `f` on the writer thread and wait for its result.
    pub(crate) async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // receiver gone means the caller was cancelled
            let _ = reply_tx.send(f(conn));
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| StoreError::Unavailable("SQLite writer has stopped".to_string()))?;
        reply_rx.await.map_err(|_| {
            error!("SQLite writer dropped a request");
            StoreError::Unavailable("SQLite writer dropped the request".to_string())
        })?
    }
}
