//! Dispatcher: the dedup-and-schedule loop over a set of jobs.
//!
//! A dispatch runs in two phases. The planning phase walks the jobs in
//! declaration order, resolves trainers, computes signatures and asks the run
//! store for completed runs. The execution phase trains the remaining jobs on
//! tokio tasks bounded by a semaphore. Every job ends with exactly one
//! terminal entry in the [`DispatchReport`]; per-job errors never abort the
//! batch.

use crate::error::{DispatchError, Result};
use crate::executor::TrainingExecutor;
use crate::progress::{DispatchEvent, ProgressReporter};
use crate::report::{DispatchOutcome, DispatchReport, FailureKind, JobFailure, ReportEntry, SkipReason};
use chrono::Utc;
use futures::future::join_all;
use kiln_store::RunStore;
use kiln_training::{DataSnapshot, JobSpec, ManifestFailure, ManifestSet, Signature, SignatureComputer, Trainer, TrainerRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-dispatch knobs.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum number of jobs training at once.
    pub concurrency_limit: usize,
    /// Plan only: report what would run without touching the store's write path.
    pub dry_run: bool,
    /// Timeout for jobs that do not declare one. `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Train even when a completed run with the same signature exists.
    pub force: bool,
    pub cancel: CancellationToken,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            dry_run: false,
            default_timeout: None,
            force: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl DispatchOptions {
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A job that survived planning and needs training.
struct Scheduled {
    index: usize,
    job: JobSpec,
    trainer: Arc<dyn Trainer>,
    signature: Signature,
}

/// A job whose signature an earlier job in the batch already claimed. It is
/// resolved from the leader's final outcome.
struct Follower {
    index: usize,
    leader: usize,
}

/// Output of the planning phase.
struct Plan {
    entries: Vec<ReportEntry>,
    scheduled: Vec<Scheduled>,
    followers: Vec<Follower>,
}

/// Decides which jobs to train and runs them.
pub struct Dispatcher {
    store: Arc<dyn RunStore>,
    registry: Arc<TrainerRegistry>,
    computer: SignatureComputer,
    progress: Option<Arc<ProgressReporter>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RunStore>, registry: Arc<TrainerRegistry>) -> Self {
        Self { store, registry, computer: SignatureComputer::new(), progress: None }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Dispatch `jobs` in the given (declaration) order.
    pub async fn dispatch(
        &self,
        jobs: Vec<JobSpec>,
        snapshot: &DataSnapshot,
        options: &DispatchOptions,
    ) -> Result<DispatchReport> {
        self.run(jobs.into_iter().map(Ok).collect(), snapshot, options).await
    }

    /// Dispatch a manifest directory, reporting each invalid manifest as a
    /// `ConfigInvalid` failure at its position.
    pub async fn dispatch_manifests(
        &self,
        manifests: &ManifestSet,
        snapshot: &DataSnapshot,
        options: &DispatchOptions,
    ) -> Result<DispatchReport> {
        self.run(manifests.entries.clone(), snapshot, options).await
    }

    async fn run(
        &self,
        entries: Vec<std::result::Result<JobSpec, ManifestFailure>>,
        snapshot: &DataSnapshot,
        options: &DispatchOptions,
    ) -> Result<DispatchReport> {
        if entries.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        if options.concurrency_limit == 0 {
            return Err(DispatchError::ZeroConcurrency);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            jobs = entries.len(),
            snapshot = %snapshot.id,
            store = %self.store.endpoint(),
            concurrency = options.concurrency_limit,
            dry_run = options.dry_run,
            force = options.force,
            "Dispatch started"
        );

        let Plan { mut entries, scheduled, followers } = self.plan(entries, snapshot, options).await;
        self.emit(DispatchEvent::Planned { total: entries.len(), scheduled: scheduled.len() }).await;

        if !scheduled.is_empty() {
            for (index, outcome) in self.execute_all(scheduled, snapshot, options).await {
                entries[index].outcome = outcome;
            }
        }
        for Follower { index, leader } in followers {
            let outcome = follower_outcome(&entries[leader], options.dry_run);
            report_outcome(self.progress.as_deref(), &entries[index].model_id, &outcome, false).await;
            entries[index].outcome = outcome;
        }

        let cancelled = options.cancel.is_cancelled();
        self.emit(DispatchEvent::Finished { cancelled }).await;

        let report = DispatchReport {
            counters: DispatchReport::count(&entries),
            entries,
            snapshot_id: snapshot.id.clone(),
            store: self.store.endpoint(),
            dry_run: options.dry_run,
            cancelled,
            started_at,
            elapsed: clock.elapsed(),
        };
        info!(
            succeeded = report.counters.succeeded,
            skipped = report.counters.skipped,
            failed = report.counters.failed,
            would_run = report.counters.would_run,
            cancelled,
            elapsed_ms = report.elapsed.as_millis(),
            "Dispatch finished"
        );
        Ok(report)
    }

    /// Declaration-order planning. Returns one entry per input (scheduled jobs
    /// and followers hold a placeholder outcome), the jobs to train and the
    /// in-batch duplicates to resolve once their leaders are done.
    async fn plan(
        &self,
        entries: Vec<std::result::Result<JobSpec, ManifestFailure>>,
        snapshot: &DataSnapshot,
        options: &DispatchOptions,
    ) -> Plan {
        let mut planned = Vec::with_capacity(entries.len());
        let mut scheduled = Vec::new();
        let mut followers = Vec::new();
        let mut leaders: HashMap<Signature, usize> = HashMap::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let job = match entry {
                Ok(job) => job,
                Err(failure) => {
                    let model_id = failure
                        .path
                        .file_stem()
                        .map_or_else(|| failure.path.display().to_string(), |s| s.to_string_lossy().into_owned());
                    let outcome = DispatchOutcome::Failed(JobFailure::new(FailureKind::ConfigInvalid, failure.to_string()));
                    planned.push(self.finish_planned(model_id, Some(failure.path), None, outcome).await);
                    continue;
                }
            };
            let model_id = job.model_id.clone();
            let source = job.source.clone();

            if options.cancel.is_cancelled() {
                let outcome = DispatchOutcome::Failed(JobFailure::cancelled());
                planned.push(self.finish_planned(model_id, source, None, outcome).await);
                continue;
            }

            let trainer = match job.validate().and_then(|()| self.registry.resolve(&job.entry_point)) {
                Ok(trainer) => trainer,
                Err(e) => {
                    let outcome = DispatchOutcome::Failed(JobFailure::new(FailureKind::ConfigInvalid, e.to_string()));
                    planned.push(self.finish_planned(model_id, source, None, outcome).await);
                    continue;
                }
            };

            let signature = match self.computer.compute(&job, &snapshot.id) {
                Ok(signature) => signature,
                Err(e) => {
                    let outcome = DispatchOutcome::Failed(JobFailure::new(FailureKind::ConfigInvalid, e.to_string()));
                    planned.push(self.finish_planned(model_id, source, None, outcome).await);
                    continue;
                }
            };
            debug!(model_id = %model_id, signature = %signature.short(), "Signature computed");

            if let Some(&leader) = leaders.get(&signature) {
                debug!(model_id = %model_id, leader = %planned[leader].model_id, "Same signature as an earlier job");
                planned.push(ReportEntry { model_id, source, signature: Some(signature), outcome: DispatchOutcome::WouldRun });
                followers.push(Follower { index, leader });
                continue;
            }
            leaders.insert(signature, index);

            let lookup = if options.force { Ok(None) } else { self.store.find_completed_run(&signature).await };
            let outcome = match lookup {
                Ok(Some(existing)) => {
                    debug!(model_id = %model_id, run_id = %existing.run_id, "Reusing completed run");
                    DispatchOutcome::Skipped { reason: SkipReason::AlreadyCompleted, existing: Some(existing) }
                }
                Ok(None) if options.dry_run => DispatchOutcome::WouldRun,
                Ok(None) => {
                    planned.push(ReportEntry {
                        model_id,
                        source,
                        signature: Some(signature),
                        outcome: DispatchOutcome::WouldRun,
                    });
                    scheduled.push(Scheduled { index, job, trainer, signature });
                    continue;
                }
                Err(e) => {
                    warn!(model_id = %model_id, error = %e, "Run store lookup failed");
                    DispatchOutcome::Failed(JobFailure::from_store(&e))
                }
            };
            planned.push(self.finish_planned(model_id, source, Some(signature), outcome).await);
        }
        Plan { entries: planned, scheduled, followers }
    }

    async fn finish_planned(
        &self,
        model_id: String,
        source: Option<std::path::PathBuf>,
        signature: Option<Signature>,
        outcome: DispatchOutcome,
    ) -> ReportEntry {
        report_outcome(self.progress.as_deref(), &model_id, &outcome, false).await;
        ReportEntry { model_id, source, signature, outcome }
    }

    /// Train scheduled jobs, at most `concurrency_limit` at a time.
    async fn execute_all(
        &self,
        scheduled: Vec<Scheduled>,
        snapshot: &DataSnapshot,
        options: &DispatchOptions,
    ) -> Vec<(usize, DispatchOutcome)> {
        let semaphore = Arc::new(Semaphore::new(options.concurrency_limit));
        let executor = TrainingExecutor::new(Arc::clone(&self.store)).with_default_timeout(options.default_timeout);

        let mut handles = Vec::with_capacity(scheduled.len());
        for Scheduled { index, job, trainer, signature } in scheduled {
            let semaphore = Arc::clone(&semaphore);
            let executor = executor.clone();
            let snapshot = snapshot.clone();
            let cancel = options.cancel.clone();
            let progress = self.progress.clone();
            let model_id = job.model_id.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    debug!(model_id = %job.model_id, "Job cancelled before it started");
                    let outcome = DispatchOutcome::Failed(JobFailure::cancelled());
                    report_outcome(progress.as_deref(), &job.model_id, &outcome, false).await;
                    return outcome;
                };
                if let Some(progress) = &progress {
                    progress.emit(DispatchEvent::JobStarted { model_id: job.model_id.clone() }).await;
                }
                let result = executor.execute(&job, &signature, trainer.as_ref(), &snapshot).await;
                let outcome = DispatchOutcome::from_execution(result);
                report_outcome(progress.as_deref(), &job.model_id, &outcome, true).await;
                outcome
            });
            handles.push((index, model_id, handle));
        }

        let joined = join_all(handles.into_iter().map(|(index, model_id, handle)| async move {
            (index, model_id, handle.await)
        }))
        .await;

        let mut outcomes = Vec::with_capacity(joined.len());
        for (index, model_id, joined) in joined {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(model_id = %model_id, error = %e, "Job task panicked");
                    let outcome =
                        DispatchOutcome::Failed(JobFailure::new(FailureKind::TrainingFailed, format!("job task panicked: {e}")));
                    report_outcome(self.progress.as_deref(), &model_id, &outcome, true).await;
                    outcome
                }
            };
            outcomes.push((index, outcome));
        }
        outcomes
    }

    async fn emit(&self, event: DispatchEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event).await;
        }
    }
}

/// Outcome of an in-batch duplicate, derived from its leader's outcome.
///
/// A follower is only reported as skipped when the leader left a completed
/// run behind, found its signature running elsewhere or, in a dry run, would
/// train. A failed leader fails its followers with the same kind.
fn follower_outcome(leader: &ReportEntry, dry_run: bool) -> DispatchOutcome {
    let reason = SkipReason::DuplicateInBatch { leader: leader.model_id.clone() };
    match &leader.outcome {
        DispatchOutcome::Succeeded(record) | DispatchOutcome::Skipped { existing: Some(record), .. } => {
            DispatchOutcome::Skipped { reason, existing: Some(record.clone()) }
        }
        DispatchOutcome::WouldRun if dry_run => DispatchOutcome::Skipped { reason, existing: None },
        DispatchOutcome::Skipped { reason: active @ SkipReason::ActiveElsewhere { .. }, existing: None } => {
            DispatchOutcome::Skipped { reason: active.clone(), existing: None }
        }
        DispatchOutcome::Skipped { existing: None, .. } => DispatchOutcome::Skipped { reason, existing: None },
        DispatchOutcome::Failed(failure) => DispatchOutcome::Failed(JobFailure::new(
            failure.kind,
            format!("same signature as {}, which failed: {}", leader.model_id, failure.message),
        )),
        DispatchOutcome::WouldRun => DispatchOutcome::Failed(JobFailure::new(
            FailureKind::TrainingFailed,
            format!("same signature as {}, which never finished", leader.model_id),
        )),
    }
}

async fn report_outcome(progress: Option<&ProgressReporter>, model_id: &str, outcome: &DispatchOutcome, started: bool) {
    let Some(progress) = progress else {
        return;
    };
    let model_id = model_id.to_string();
    let event = match outcome {
        DispatchOutcome::Skipped { reason, .. } => {
            DispatchEvent::JobSkipped { model_id, reason: reason.clone(), started }
        }
        DispatchOutcome::Succeeded(record) => DispatchEvent::JobSucceeded { model_id, run_id: record.run_id.clone() },
        DispatchOutcome::Failed(failure) => DispatchEvent::JobFailed {
            model_id,
            kind: failure.kind,
            message: failure.message.clone(),
            started,
        },
        DispatchOutcome::WouldRun => return,
    };
    progress.emit(event).await;
}
