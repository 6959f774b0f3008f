//! Kiln CLI
//!
//! The `kiln` command dispatches training jobs declared in manifests, skipping
//! any job whose (config, code, data) signature already has a completed run,
//! and inspects the run store.

mod commands;
mod config;
mod output;
mod workspace;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::dispatch::DispatchArgs;
use commands::runs::RunsCommand;
use commands::select::SelectArgs;
use commands::signature::SignatureArgs;
use config::KilnConfig;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use workspace::{GlobalArgs, Workspace};

/// Kiln - training dispatch with signature-based deduplication
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train every manifest whose signature has no completed run
    ///
    /// Exits 0 when every job succeeded or was skipped, 1 when a manifest is
    /// invalid and 2 when a job failed.
    Dispatch(DispatchArgs),

    /// Pick the best completed run by a metric
    Select(SelectArgs),

    /// Inspect and maintain run records
    #[command(subcommand)]
    Runs(RunsCommand),

    /// Print job signatures for the current manifests and data snapshot
    Signature(SignatureArgs),
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    if json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))
    } else {
        builder.without_time().try_init().map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))
    }
}

async fn run(args: Args) -> Result<u8> {
    let config = match &args.global.config {
        Some(path) => KilnConfig::load_from_file(path)?,
        None => KilnConfig::discover_and_load()?,
    };
    let level = args.log_level.clone().or_else(|| config.log_level.clone()).unwrap_or_else(|| "warn".to_string());
    init_tracing(&level, args.log_json)?;

    let ws = Workspace::resolve(&args.global, config)?;
    match args.command {
        Command::Dispatch(cmd) => commands::dispatch::execute(&ws, cmd).await,
        Command::Select(cmd) => commands::select::execute(&ws, cmd).await.map(|()| commands::exit::SUCCESS),
        Command::Runs(cmd) => commands::runs::execute(&ws, cmd).await.map(|()| commands::exit::SUCCESS),
        Command::Signature(cmd) => commands::signature::execute(&ws, &cmd),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
