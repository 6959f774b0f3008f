//! `kiln select`: pick the best completed run in the store.

use crate::output;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use clap::Args;
use kiln_orchestrator::{Direction, ModelSelector};
use kiln_store::{RunFilter, RunStatus};
use serde_json::json;

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Metric to rank by (e.g. rmse)
    pub metric: String,

    /// Whether lower (min) or higher (max) values are better
    #[arg(long, default_value = "min")]
    pub direction: Direction,

    /// Only consider runs of this model
    #[arg(long)]
    pub model: Option<String>,

    /// Show at most this many leaderboard rows
    #[arg(short = 'n', long, default_value = "10")]
    pub top: usize,

    /// Tolerance under which two values tie
    #[arg(long)]
    pub epsilon: Option<f64>,

    #[arg(long)]
    pub json: bool,
}

pub async fn execute(ws: &Workspace, args: SelectArgs) -> Result<()> {
    let store = ws.open_store()?;
    let mut filter = RunFilter::default().status(RunStatus::Completed);
    if let Some(model) = &args.model {
        filter = filter.model(model.as_str());
    }
    let runs = store.list_runs(&filter).await.context("Failed to list completed runs")?;

    let mut selector = ModelSelector::new(args.metric.as_str(), args.direction);
    if let Some(epsilon) = args.epsilon {
        selector = selector.with_epsilon(epsilon);
    }
    let selection = selector.select_from(&runs);
    let mut leaderboard = selector.rank(&runs);
    leaderboard.truncate(args.top);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&json!({ "selection": selection, "leaderboard": leaderboard }))?);
    } else {
        output::print_selection(&selection, &leaderboard);
    }
    Ok(())
}
