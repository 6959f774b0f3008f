//! Human-readable rendering of reports and runs.

use chrono::{DateTime, Utc};
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use kiln_orchestrator::{DispatchOutcome, DispatchReport, LeaderboardEntry, SelectedModel, Selection};
use kiln_store::{RunRecord, RunStatus};

fn outcome_cell(outcome: &DispatchOutcome) -> Cell {
    let cell = Cell::new(outcome.label());
    match outcome {
        DispatchOutcome::Succeeded(_) => cell.fg(Color::Green),
        DispatchOutcome::Skipped { .. } => cell.fg(Color::Cyan),
        DispatchOutcome::Failed(_) => cell.fg(Color::Red),
        DispatchOutcome::WouldRun => cell.fg(Color::Yellow),
    }
}

fn status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status);
    match status {
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Running => cell.fg(Color::Yellow),
        RunStatus::Failed => cell.fg(Color::Red),
    }
}

fn detail(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Skipped { reason, existing: Some(run) } => format!("{reason} (run {})", run.run_id),
        DispatchOutcome::Skipped { reason, existing: None } => reason.to_string(),
        DispatchOutcome::Succeeded(run) => format!("run {} in {}", run.run_id, elapsed(run)),
        DispatchOutcome::Failed(failure) => format!("{}: {}", failure.kind, failure.message),
        DispatchOutcome::WouldRun => String::new(),
    }
}

fn elapsed(run: &RunRecord) -> String {
    run.duration().map_or_else(|| "-".to_string(), |d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn print_report(report: &DispatchReport) {
    println!();
    let title = if report.dry_run { "Dispatch plan (dry run)" } else { "Dispatch report" };
    println!("{}", title.bold().cyan());
    println!("  Snapshot: {}", report.snapshot_id.dimmed());
    println!("  Store:    {}", report.store.dimmed());
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Model", "Signature", "Outcome", "Detail"]);
    for entry in &report.entries {
        table.add_row(vec![
            Cell::new(&entry.model_id).fg(Color::Cyan),
            Cell::new(entry.signature.map_or_else(|| "-".to_string(), |s| s.short())),
            outcome_cell(&entry.outcome),
            Cell::new(detail(&entry.outcome)),
        ]);
    }
    println!("{table}");
    println!();

    let c = report.counters;
    let summary = format!(
        "{} succeeded, {} skipped, {} failed, {} would run in {:.1}s",
        c.succeeded,
        c.skipped,
        c.failed,
        c.would_run,
        report.elapsed.as_secs_f64()
    );
    if report.has_failures() {
        println!("  {} {}", "✗".red(), summary);
    } else {
        println!("  {} {}", "✓".green(), summary);
    }
    if report.cancelled {
        println!("  {} dispatch was cancelled", "!".yellow());
    }
}

pub fn print_selection(selection: &Selection, leaderboard: &[LeaderboardEntry]) {
    println!();
    match selection {
        Selection::Selected(SelectedModel { metric, direction, best, candidates }) => {
            println!(
                "{} {} ({} {} = {}) from {} candidate(s)",
                "Best model:".bold(),
                best.model_id.green().bold(),
                metric,
                direction,
                best.metric_value,
                candidates
            );
            println!("  Run: {}", best.run_id.to_string().dimmed());
        }
        Selection::NoCandidate => {
            println!("{}", "No completed run reports this metric.".yellow());
            return;
        }
    }

    let mut table = Table::new();
    table.set_header(vec!["Rank", "Model", "Value", "Run", "Started"]);
    for (rank, entry) in leaderboard.iter().enumerate() {
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(&entry.model_id).fg(Color::Cyan),
            Cell::new(entry.metric_value),
            Cell::new(&entry.run_id),
            Cell::new(timestamp(entry.started_at)),
        ]);
    }
    println!("{table}");
}

pub fn print_runs(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("  {}", "No runs found.".dimmed());
        return;
    }
    let mut table = Table::new();
    table.set_header(vec!["Run", "Model", "Status", "Signature", "Started", "Duration", "Metrics"]);
    for run in runs {
        let metrics = run.metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ");
        table.add_row(vec![
            Cell::new(&run.run_id),
            Cell::new(&run.model_id).fg(Color::Cyan),
            status_cell(run.status),
            Cell::new(run.signature.short()),
            Cell::new(timestamp(run.started_at)),
            Cell::new(elapsed(run)),
            Cell::new(metrics),
        ]);
    }
    println!("{table}");
    println!("  {} run(s)", runs.len());
}

pub fn print_run(run: &RunRecord) {
    println!();
    println!("{} {}", "Run".bold(), run.run_id.to_string().cyan());
    println!("  Model:     {}", run.model_id);
    println!("  Status:    {}", run.status);
    println!("  Signature: {}", run.signature);
    println!("  Started:   {}", timestamp(run.started_at));
    if let Some(ended) = run.ended_at {
        println!("  Ended:     {} ({})", timestamp(ended), elapsed(run));
    }
    if let Some(error) = &run.error {
        println!("  Error:     {}", error.red());
    }
    if !run.params.is_empty() {
        println!("  Params:");
        for (k, v) in &run.params {
            println!("    {k} = {v}");
        }
    }
    if !run.metrics.is_empty() {
        println!("  Metrics:");
        for (k, v) in &run.metrics {
            println!("    {k} = {v}");
        }
    }
    if !run.artifact_refs.is_empty() {
        println!("  Artifacts:");
        for a in &run.artifact_refs {
            println!("    {} ({} bytes) {}", a.name, a.size, a.uri.dimmed());
        }
    }
}
