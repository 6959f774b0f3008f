//! `kiln runs`: inspect and maintain run records.

use crate::output;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use kiln_store::{RunFilter, RunId, RunStatus};
use kiln_training::Signature;
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum RunsCommand {
    /// List runs, newest first
    List {
        /// Only runs of this model
        #[arg(long)]
        model: Option<String>,

        /// Only runs in this status (running, completed, failed)
        #[arg(long)]
        status: Option<RunStatus>,

        /// Only runs with this signature (64 hex chars)
        #[arg(long)]
        signature: Option<Signature>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one run in detail
    Show {
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Mark runs stuck in `running` as failed
    Reap {
        /// Minimum age in seconds of a running run before it is reaped
        #[arg(long, value_name = "SECS", default_value = "86400")]
        older_than: u64,

        #[arg(long)]
        json: bool,
    },
}

pub async fn execute(ws: &Workspace, cmd: RunsCommand) -> Result<()> {
    let store = ws.open_store()?;
    match cmd {
        RunsCommand::List { model, status, signature, limit, json } => {
            let mut filter = RunFilter::default().limit(limit);
            if let Some(model) = model {
                filter = filter.model(model);
            }
            if let Some(status) = status {
                filter = filter.status(status);
            }
            if let Some(signature) = signature {
                filter = filter.signature(signature);
            }
            let runs = store.list_runs(&filter).await.context("Failed to list runs")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                output::print_runs(&runs);
            }
        }
        RunsCommand::Show { run_id, json } => {
            let run = store
                .get_run(&RunId::from(run_id.as_str()))
                .await
                .with_context(|| format!("Failed to load run {run_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                output::print_run(&run);
            }
        }
        RunsCommand::Reap { older_than, json } => {
            let reaped = store
                .reap_stale_runs(Duration::from_secs(older_than))
                .await
                .context("Failed to reap stale runs")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reaped)?);
            } else if reaped.is_empty() {
                println!("  {}", "No stale runs.".dimmed());
            } else {
                println!("  {} reaped {} run(s)", "✓".green(), reaped.len());
                output::print_runs(&reaped);
            }
        }
    }
    Ok(())
}
