//! `kiln dispatch`: train every manifest whose signature has no completed run.

use super::exit;
use crate::output;
use crate::workspace::Workspace;
use anyhow::{Context, Result, bail};
use clap::Args;
use colored::Colorize;
use kiln_orchestrator::{
    DispatchEvent, DispatchOptions, DispatchReport, Dispatcher, Direction, LeaderboardEntry, ModelSelector,
    ProgressReporter, Selection,
};
use kiln_training::TrainerRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Compute signatures and skip decisions without training anything
    #[arg(long)]
    pub dry_run: bool,

    /// Retrain jobs even when a completed run with the same signature exists
    #[arg(long)]
    pub force: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Maximum number of jobs training at once
    #[arg(short = 'j', long, env = "KILN_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Timeout in seconds for jobs whose manifest sets none
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// After dispatching, pick the best run by this metric
    #[arg(long, value_name = "METRIC")]
    pub select: Option<String>,

    /// Whether lower (min) or higher (max) metric values are better
    #[arg(long, default_value = "min")]
    pub direction: Direction,
}

#[derive(Serialize)]
struct DispatchOutput<'a> {
    report: &'a DispatchReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    selection: Option<&'a Selection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    leaderboard: Vec<LeaderboardEntry>,
}

pub async fn execute(ws: &Workspace, args: DispatchArgs) -> Result<u8> {
    let manifests = ws.load_manifests()?;
    if manifests.is_empty() {
        bail!("No manifests found in {}", ws.manifests.display());
    }
    let snapshot = ws.snapshot()?;
    let store = if args.dry_run { ws.open_store_read_only()? } else { ws.open_store()? };

    let default_timeout = match args.timeout {
        Some(secs) if secs > 0.0 => {
            Some(Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid --timeout {secs}"))?)
        }
        Some(secs) => bail!("--timeout must be > 0 (got {secs})"),
        None => ws.default_timeout,
    };

    let cancel = CancellationToken::new();
    let mut options = DispatchOptions::default()
        .dry_run(args.dry_run)
        .force(args.force)
        .with_default_timeout(default_timeout)
        .with_cancel(cancel.clone());
    if let Some(limit) = args.concurrency.or(ws.concurrency) {
        options = options.with_concurrency(limit);
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling dispatch");
            cancel.cancel();
        }
    });

    let progress = Arc::new(ProgressReporter::new());
    let printer = (!args.json).then(|| tokio::spawn(print_progress(progress.subscribe())));

    let dispatcher =
        Dispatcher::new(store, Arc::new(TrainerRegistry::with_builtin())).with_progress(Arc::clone(&progress));
    let report = dispatcher.dispatch_manifests(&manifests, &snapshot, &options).await.context("Dispatch failed")?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let (selection, leaderboard) = match &args.select {
        Some(metric) => {
            let selector = ModelSelector::new(metric.as_str(), args.direction);
            (Some(selector.select_best(&report)), selector.leaderboard(&report))
        }
        None => (None, Vec::new()),
    };

    if args.json {
        let out = DispatchOutput { report: &report, selection: selection.as_ref(), leaderboard };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        output::print_report(&report);
        if let Some(selection) = &selection {
            output::print_selection(selection, &leaderboard);
        }
    }

    Ok(if manifests.has_failures() {
        exit::MANIFEST_INVALID
    } else if report.has_failures() {
        exit::JOB_FAILED
    } else {
        exit::SUCCESS
    })
}

/// Live job lines on stderr until the dispatch finishes.
async fn print_progress(mut rx: broadcast::Receiver<DispatchEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            DispatchEvent::Planned { total, scheduled } => {
                eprintln!("{} {} job(s), {} to train", "Planned".bold(), total, scheduled);
            }
            DispatchEvent::JobStarted { model_id } => eprintln!("  {} {}", "▸".cyan(), model_id),
            DispatchEvent::JobSkipped { model_id, reason, .. } => {
                eprintln!("  {} {} skipped: {}", "↷".dimmed(), model_id, reason);
            }
            DispatchEvent::JobSucceeded { model_id, run_id } => {
                eprintln!("  {} {} ({})", "✓".green(), model_id, run_id.to_string().dimmed());
            }
            DispatchEvent::JobFailed { model_id, kind, message, .. } => {
                eprintln!("  {} {} {}: {}", "✗".red(), model_id, kind, message);
            }
            DispatchEvent::Finished { .. } => break,
        }
    }
}
