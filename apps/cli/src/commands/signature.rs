//! `kiln signature`: print job signatures without touching the run store.

use super::exit;
use crate::workspace::Workspace;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use kiln_training::{SignatureComputer, canonical_config};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SignatureArgs {
    /// Only these models (default: every manifest)
    pub models: Vec<String>,

    /// Also print the canonical config each signature hashes
    #[arg(long)]
    pub canonical: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Line {
    model_id: String,
    source: Option<PathBuf>,
    signature: Option<String>,
    canonical_config: Option<String>,
    error: Option<String>,
}

pub fn execute(ws: &Workspace, args: &SignatureArgs) -> Result<u8> {
    let manifests = ws.load_manifests()?;
    let snapshot = ws.snapshot()?;
    let computer = SignatureComputer::new();

    let mut lines = Vec::with_capacity(manifests.len());
    for entry in &manifests.entries {
        let line = match entry {
            Ok(job) => {
                let (signature, error) = match computer.compute(job, &snapshot.id) {
                    Ok(sig) => (Some(sig.to_hex()), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                Line {
                    model_id: job.model_id.clone(),
                    source: job.source.clone(),
                    signature,
                    canonical_config: Some(canonical_config(&job.config)),
                    error,
                }
            }
            Err(failure) => Line {
                model_id: failure.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
                source: Some(failure.path.clone()),
                signature: None,
                canonical_config: None,
                error: Some(failure.reason.clone()),
            },
        };
        if args.models.is_empty() || args.models.contains(&line.model_id) {
            lines.push(line);
        }
    }

    if args.json {
        let out = serde_json::json!({ "snapshot_id": snapshot.id, "jobs": lines });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{} {}", "Snapshot:".bold(), snapshot.id.dimmed());
        let mut table = Table::new();
        table.set_header(vec!["Model", "Manifest", "Signature"]);
        for line in &lines {
            let manifest = line.source.as_deref().map(|p| ws.display_path(p).to_string()).unwrap_or_default();
            let signature = match (&line.signature, &line.error) {
                (Some(sig), _) => Cell::new(sig),
                (None, Some(err)) => Cell::new(err).fg(Color::Red),
                (None, None) => Cell::new("-"),
            };
            table.add_row(vec![Cell::new(&line.model_id).fg(Color::Cyan), Cell::new(manifest), signature]);
        }
        println!("{table}");
        if args.canonical {
            for line in &lines {
                if let Some(config) = &line.canonical_config {
                    println!("{} {config}", format!("{}:", line.model_id).cyan());
                }
            }
        }
    }

    Ok(if lines.iter().any(|l| l.error.is_some()) { exit::MANIFEST_INVALID } else { exit::SUCCESS })
}
