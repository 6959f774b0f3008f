//! Progress reporting for dispatches.
//!
//! The dispatcher emits an event whenever a job changes state. Subscribers
//! (the CLI's live output, tests) receive them over a broadcast channel; a
//! counter snapshot is kept for polling.

use crate::report::{FailureKind, SkipReason};
use kiln_store::RunId;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Progress event types.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Signatures computed; `scheduled` jobs will be trained.
    Planned { total: usize, scheduled: usize },
    /// A job acquired a slot and its executor started.
    JobStarted { model_id: String },
    JobSkipped { model_id: String, reason: SkipReason, started: bool },
    JobSucceeded { model_id: String, run_id: RunId },
    /// `started` is false for jobs that ended before reaching the executor.
    JobFailed { model_id: String, kind: FailureKind, message: String, started: bool },
    /// Every job has a terminal outcome.
    Finished { cancelled: bool },
}

/// Progress counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub queued: usize,
    pub active: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Progress reporter for the dispatcher.
#[derive(Debug)]
pub struct ProgressReporter {
    broadcast_tx: broadcast::Sender<DispatchEvent>,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { broadcast_tx, snapshot: Arc::new(Mutex::new(ProgressSnapshot::default())) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.broadcast_tx.subscribe()
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        *self.snapshot.lock().await
    }

    /// Update counters and broadcast `event`.
    pub async fn emit(&self, event: DispatchEvent) {
        {
            let mut snap = self.snapshot.lock().await;
            match &event {
                DispatchEvent::Planned { scheduled, .. } => snap.queued = *scheduled,
                DispatchEvent::JobStarted { .. } => {
                    snap.queued = snap.queued.saturating_sub(1);
                    snap.active += 1;
                }
                DispatchEvent::JobSkipped { started, .. } => {
                    if *started {
                        snap.active = snap.active.saturating_sub(1);
                    }
                    snap.skipped += 1;
                }
                DispatchEvent::JobSucceeded { .. } => {
                    snap.active = snap.active.saturating_sub(1);
                    snap.succeeded += 1;
                }
                DispatchEvent::JobFailed { started, .. } => {
                    if *started {
                        snap.active = snap.active.saturating_sub(1);
                    }
                    snap.failed += 1;
                }
                DispatchEvent::Finished { .. } => {
                    snap.queued = 0;
                    snap.active = 0;
                }
            }
        }
        debug!("Progress event: {:?}", event);
        // no subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }
}
