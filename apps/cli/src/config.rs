//! CLI configuration loading and merging.
//!
//! Precedence, highest first:
//! 1. CLI arguments and `KILN_*` environment variables (handled by clap)
//! 2. Local config file (`./kiln.toml`)
//! 3. Global config file (`~/.kiln/config.toml`)
//! 4. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default run store, relative to the project root.
pub const DEFAULT_STORE: &str = "sqlite://.kiln/runs.db";
pub const DEFAULT_MANIFESTS: &str = "manifests";

/// Settings read from `kiln.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Run store endpoint (`sqlite://path`, `sqlite::memory:` or an http(s) tracking URL).
    pub store: Option<String>,
    /// Experiment name on a tracking server.
    pub experiment: Option<String>,
    /// Data snapshot file or directory.
    pub data: Option<PathBuf>,
    /// Explicit snapshot id; wins over hashing `data`.
    pub snapshot_id: Option<String>,
    pub manifests: Option<PathBuf>,
    /// Base for relative paths in manifests.
    pub project_root: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub default_timeout_secs: Option<f64>,
    pub log_level: Option<String>,
}

impl KilnConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn default_global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".kiln").join("config.toml"))
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from("kiln.toml")
    }

    /// Load global then local config. Missing files are skipped; unreadable or
    /// malformed ones are errors.
    pub fn discover_and_load() -> Result<Self> {
        let mut config = Self::default();
        let candidates = Self::default_global_path().into_iter().chain(std::iter::once(Self::default_local_path()));
        for path in candidates {
            if path.is_file() {
                config.merge(Self::load_from_file(&path)?);
            }
        }
        Ok(config)
    }

    /// Overlay `other` onto `self`; set fields in `other` win.
    pub fn merge(&mut self, other: Self) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        overlay!(
            store,
            experiment,
            data,
            snapshot_id,
            manifests,
            project_root,
            concurrency,
            default_timeout_secs,
            log_level
        );
    }
}
