//! Declarative job manifests, one file per model family.
//!
//! ```yaml
//! model_id: xgb
//! entry_point: linear
//! timeout_secs: 600
//! signature_files:
//!   - models/xgb/train.py
//!   - utils/preprocessing.py
//!   - configs/xgb.yaml
//! config:
//!   learning_rate: 0.1
//!   target: pIC50
//! ```
//!
//! Declaration order is the sorted file name order inside the manifest
//! directory. Signature file paths are resolved against the project root.

use crate::error::TrainingResult;
use crate::job::{JobConfig, JobSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const EXTENSIONS: &[&str] = &["yaml", "yml", "toml", "json"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    model_id: Option<String>,
    config: Option<JobConfig>,
    signature_files: Option<Vec<PathBuf>>,
    entry_point: Option<String>,
    timeout_secs: Option<f64>,
}

/// A manifest file that could not be turned into a [`JobSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFailure {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for ManifestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Every manifest in a directory, valid or not, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    pub entries: Vec<Result<JobSpec, ManifestFailure>>,
}

impl ManifestSet {
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.entries.iter().filter_map(|e| e.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ManifestFailure> {
        self.entries.iter().filter_map(|e| e.as_ref().err())
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads manifests and resolves their paths.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    project_root: PathBuf,
}

impl ManifestLoader {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self { project_root: project_root.into() }
    }

    /// Load every manifest in `dir`.
    ///
    /// # Errors
    /// Only when the directory itself cannot be listed; broken manifests are
    /// returned as [`ManifestFailure`] entries.
    pub fn load_dir(&self, dir: &Path) -> TrainingResult<ManifestSet> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || is_hidden(&path) || !has_manifest_extension(&path) {
                continue;
            }
            paths.push(path);
        }
        paths.sort();
        debug!(dir = %dir.display(), count = paths.len(), "Discovered manifests");

        let mut set = ManifestSet::default();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let entry = self.load_file(&path).and_then(|job| match seen.get(&job.model_id) {
                Some(first) => Err(ManifestFailure {
                    path: path.clone(),
                    reason: format!(
                        "duplicate model_id '{}' (first declared in {})",
                        job.model_id,
                        first.display()
                    ),
                }),
                None => {
                    seen.insert(job.model_id.clone(), path.clone());
                    Ok(job)
                }
            });
            if let Err(failure) = &entry {
                warn!(path = %failure.path.display(), reason = %failure.reason, "Invalid manifest");
            }
            set.entries.push(entry);
        }
        Ok(set)
    }

    /// Load a single manifest file.
    pub fn load_file(&self, path: &Path) -> Result<JobSpec, ManifestFailure> {
        let fail = |reason: String| ManifestFailure { path: path.to_path_buf(), reason };

        let text = std::fs::read_to_string(path).map_err(|e| fail(format!("cannot read: {e}")))?;
        let raw: RawManifest = match extension(path).as_deref() {
            Some("toml") => toml::from_str(&text).map_err(|e| fail(e.to_string()))?,
            Some("json") => serde_json::from_str(&text).map_err(|e| fail(e.to_string()))?,
            _ => serde_yaml::from_str(&text).map_err(|e| fail(e.to_string()))?,
        };

        let missing = |field: &str| fail(format!("missing required field '{field}'"));
        let model_id = raw.model_id.ok_or_else(|| missing("model_id"))?;
        let config = raw.config.ok_or_else(|| missing("config"))?;
        let signature_files = raw.signature_files.ok_or_else(|| missing("signature_files"))?;
        let entry_point = raw.entry_point.ok_or_else(|| missing("entry_point"))?;

        let timeout = raw
            .timeout_secs
            .map(|s| {
                if s > 0.0 {
                    Duration::try_from_secs_f64(s).map_err(|e| fail(format!("timeout_secs: {e}")))
                } else {
                    Err(fail("timeout_secs must be > 0".to_string()))
                }
            })
            .transpose()?;

        let job = JobSpec {
            model_id,
            config,
            signature_inputs: signature_files.iter().map(|p| self.resolve(p)).collect(),
            entry_point,
            timeout,
            source: Some(path.to_path_buf()),
        };
        job.validate().map_err(|e| fail(e.to_string()))?;
        Ok(job)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.project_root.join(path) }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn has_manifest_extension(path: &Path) -> bool {
    extension(path).is_some_and(|e| EXTENSIONS.contains(&e.as_str()))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.'))
}
