//! Resolved settings for one CLI invocation.

use crate::config::{DEFAULT_MANIFESTS, DEFAULT_STORE, KilnConfig};
use anyhow::{Context, Result, bail};
use clap::Args;
use kiln_store::{Endpoint, RunStore, StoreOptions};
use kiln_training::{DataSnapshot, ManifestLoader, ManifestSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Run store endpoint (sqlite://path, sqlite::memory: or http(s)://tracking-server)
    #[arg(long, env = "KILN_STORE", global = true)]
    pub store: Option<String>,

    /// Training data snapshot (file or directory)
    #[arg(long, env = "KILN_DATA", global = true)]
    pub data: Option<PathBuf>,

    /// Explicit data snapshot id (skips hashing --data)
    #[arg(long, env = "KILN_SNAPSHOT_ID", global = true)]
    pub snapshot_id: Option<String>,

    /// Manifest directory
    #[arg(long, env = "KILN_MANIFESTS", global = true)]
    pub manifests: Option<PathBuf>,

    /// Project root for relative paths (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    /// Config file to use instead of ./kiln.toml and ~/.kiln/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub project_root: PathBuf,
    pub store: String,
    pub experiment: Option<String>,
    pub manifests: PathBuf,
    pub data: Option<PathBuf>,
    pub snapshot_id: Option<String>,
    pub concurrency: Option<usize>,
    pub default_timeout: Option<Duration>,
}

impl Workspace {
    pub fn resolve(args: &GlobalArgs, config: KilnConfig) -> Result<Self> {
        let project_root = match args.project_root.clone().or(config.project_root) {
            Some(root) => root,
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        let anchor = |path: PathBuf| if path.is_relative() { project_root.join(path) } else { path };

        let default_timeout = match config.default_timeout_secs {
            Some(secs) if secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid default_timeout_secs: {secs}"))?,
            ),
            Some(secs) => bail!("default_timeout_secs must be > 0 (got {secs})"),
            None => None,
        };

        let workspace = Self {
            store: args.store.clone().or(config.store).unwrap_or_else(|| DEFAULT_STORE.to_string()),
            experiment: config.experiment,
            manifests: anchor(args.manifests.clone().or(config.manifests).unwrap_or_else(|| DEFAULT_MANIFESTS.into())),
            data: args.data.clone().or(config.data).map(anchor),
            snapshot_id: args.snapshot_id.clone().or(config.snapshot_id),
            concurrency: config.concurrency,
            default_timeout,
            project_root: project_root.clone(),
        };
        debug!(?workspace, "Resolved workspace");
        Ok(workspace)
    }

    pub fn open_store(&self) -> Result<Arc<dyn RunStore>> {
        self.open_store_with(false)
    }

    /// Open the store for lookups only; a missing SQLite file is not created.
    pub fn open_store_read_only(&self) -> Result<Arc<dyn RunStore>> {
        self.open_store_with(true)
    }

    fn open_store_with(&self, read_only: bool) -> Result<Arc<dyn RunStore>> {
        let mut options = StoreOptions::default();
        if let Some(experiment) = &self.experiment {
            options.experiment.clone_from(experiment);
        }
        Endpoint::parse(&self.store)
            .and_then(|endpoint| {
                let endpoint = endpoint.relative_to(&self.project_root);
                if read_only { endpoint.open_read_only(&options) } else { endpoint.open(&options) }
            })
            .with_context(|| format!("Failed to open run store {}", self.store))
    }

    /// The data snapshot for this invocation: an explicit id wins, otherwise
    /// the content hash of `data`.
    pub fn snapshot(&self) -> Result<DataSnapshot> {
        match (&self.snapshot_id, &self.data) {
            (Some(id), data) => Ok(DataSnapshot::with_id(id.clone(), data.clone())),
            (None, Some(path)) => DataSnapshot::from_path(path)
                .with_context(|| format!("Failed to fingerprint data snapshot {}", path.display())),
            (None, None) => bail!("No data snapshot given; set --data/KILN_DATA or --snapshot-id/KILN_SNAPSHOT_ID"),
        }
    }

    pub fn load_manifests(&self) -> Result<ManifestSet> {
        self.loader()
            .load_dir(&self.manifests)
            .with_context(|| format!("Failed to read manifest directory {}", self.manifests.display()))
    }

    pub fn loader(&self) -> ManifestLoader {
        ManifestLoader::new(&self.project_root)
    }

    pub fn display_path<'a>(&self, path: &'a Path) -> std::path::Display<'a> {
        path.strip_prefix(&self.project_root).unwrap_or(path).display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(root: &Path) -> GlobalArgs {
        GlobalArgs { project_root: Some(root.to_path_buf()), ..GlobalArgs::default() }
    }

    #[test]
    fn test_cli_beats_config() {
        let root = Path::new("/srv/kiln");
        let config = KilnConfig {
            store: Some("http://tracking:5000".into()),
            manifests: Some("jobs".into()),
            ..KilnConfig::default()
        };
        let mut cli = args(root);
        cli.store = Some("sqlite::memory:".into());

        let ws = Workspace::resolve(&cli, config).unwrap();
        assert_eq!(ws.store, "sqlite::memory:");
        assert_eq!(ws.manifests, root.join("jobs"));
    }

    #[test]
    fn test_defaults() {
        let root = Path::new("/srv/kiln");
        let ws = Workspace::resolve(&args(root), KilnConfig::default()).unwrap();
        assert_eq!(ws.store, DEFAULT_STORE);
        assert_eq!(ws.manifests, root.join("manifests"));
        assert!(ws.snapshot().is_err());
    }

    #[test]
    fn test_snapshot_id_wins_over_data() {
        let root = Path::new("/srv/kiln");
        let mut cli = args(root);
        cli.snapshot_id = Some("dvc-123".into());
        cli.data = Some("data/train.csv".into());

        let snapshot = Workspace::resolve(&cli, KilnConfig::default()).unwrap().snapshot().unwrap();
        assert_eq!(snapshot.id, "dvc-123");
        assert_eq!(snapshot.path, Some(root.join("data/train.csv")));
    }

    #[test]
    fn test_rejects_non_positive_timeout() {
        let config = KilnConfig { default_timeout_secs: Some(0.0), ..KilnConfig::default() };
        assert!(Workspace::resolve(&args(Path::new("/tmp")), config).is_err());
    }
}
