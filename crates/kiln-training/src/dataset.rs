use crate::error::{TrainingError, TrainingResult};
use crate::job::JobConfig;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Identity (and optional location) of the training data for one dispatch.
///
/// The id participates in every job signature, so two dispatches over the
/// same snapshot id share results. Jobs only ever read from `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DataSnapshot {
    /// Snapshot with an externally supplied version id (e.g. a DVC hash).
    #[must_use]
    pub fn with_id(id: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self { id: id.into(), path }
    }

    /// Snapshot identified by the content hash of a file or directory.
    ///
    /// Directories are walked in sorted relative-path order; each file
    /// contributes its relative path and its bytes.
    pub fn from_path(path: &Path) -> TrainingResult<Self> {
        let id = if path.is_dir() { hash_dir(path)? } else { hash_file(path)? };
        Ok(Self { id, path: Some(path.to_path_buf()) })
    }

    /// Dataset location, or a `Dataset` error when only an id was supplied.
    pub fn require_path(&self) -> TrainingResult<&Path> {
        self.path.as_deref().ok_or_else(|| {
            TrainingError::Dataset(format!("data snapshot {} has no location", self.id))
        })
    }
}

fn hash_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| TrainingError::Dataset(format!("cannot read {}: {e}", path.display())))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn hash_dir(root: &Path) -> TrainingResult<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| TrainingError::Dataset(format!("cannot walk {}: {e}", root.display())))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let rel = file.strip_prefix(root).unwrap_or(&file);
        let rel = rel.to_string_lossy().replace('\\', "/");
        let bytes = std::fs::read(&file)
            .map_err(|e| TrainingError::Dataset(format!("cannot read {}: {e}", file.display())))?;
        hasher.update((rel.len() as u64).to_be_bytes());
        hasher.update(rel.as_bytes());
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Dataset knobs shared by the reference trainers, read from the job config.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOptions {
    pub target: String,
    pub features: Option<Vec<String>>,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self { target: "target".to_string(), features: None, test_fraction: 0.2, seed: 42 }
    }
}

impl DatasetOptions {
    pub fn from_config(config: &JobConfig) -> TrainingResult<Self> {
        let mut opts = Self::default();
        if let Some(target) = config.get("target") {
            opts.target = target
                .as_str()
                .ok_or_else(|| TrainingError::InvalidSpec("target must be a string".to_string()))?
                .to_string();
        }
        if let Some(features) = config.get("features") {
            let list = features
                .as_array()
                .ok_or_else(|| TrainingError::InvalidSpec("features must be a list".to_string()))?;
            let names = list
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        TrainingError::InvalidSpec("features must be strings".to_string())
                    })
                })
                .collect::<TrainingResult<Vec<_>>>()?;
            opts.features = Some(names);
        }
        if let Some(fraction) = config.get("test_fraction") {
            opts.test_fraction = fraction.as_f64().ok_or_else(|| {
                TrainingError::InvalidSpec("test_fraction must be a number".to_string())
            })?;
        }
        if !(0.0..1.0).contains(&opts.test_fraction) {
            return Err(TrainingError::InvalidSpec("test_fraction must be in [0, 1)".to_string()));
        }
        if let Some(seed) = config.get("seed") {
            opts.seed = seed
                .as_u64()
                .ok_or_else(|| TrainingError::InvalidSpec("seed must be a non-negative integer".to_string()))?;
        }
        Ok(opts)
    }
}

/// Numeric table: one target column plus feature columns.
#[derive(Debug, Clone, Default)]
pub struct TabularDataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl TabularDataset {
    /// Load a CSV file with a header row.
    ///
    /// Rows whose target or any selected feature is empty or non-numeric are
    /// dropped. Without an explicit feature list every other column that
    /// parses as a number on the first kept row is used.
    pub fn load_csv(path: &Path, opts: &DatasetOptions) -> TrainingResult<Self> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| TrainingError::Dataset(format!("cannot open {}: {e}", path.display())))?;
        let headers = reader
            .headers()
            .map_err(|e| TrainingError::Dataset(format!("bad CSV header: {e}")))?
            .clone();

        let target_idx = headers.iter().position(|h| h == opts.target).ok_or_else(|| {
            TrainingError::Dataset(format!("target column '{}' not found", opts.target))
        })?;

        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrainingError::Dataset(format!("bad CSV row: {e}")))?;

        let feature_idx: Vec<usize> = match &opts.features {
            Some(names) => names
                .iter()
                .map(|n| {
                    headers.iter().position(|h| h == n).ok_or_else(|| {
                        TrainingError::Dataset(format!("feature column '{n}' not found"))
                    })
                })
                .collect::<TrainingResult<_>>()?,
            None => {
                let sample = records.iter().find(|r| parse_cell(r.get(target_idx)).is_some());
                (0..headers.len())
                    .filter(|&i| i != target_idx)
                    .filter(|&i| sample.is_some_and(|r| parse_cell(r.get(i)).is_some()))
                    .collect()
            }
        };
        if feature_idx.is_empty() {
            return Err(TrainingError::Dataset("no numeric feature columns".to_string()));
        }

        let mut data = Self {
            feature_names: feature_idx.iter().map(|&i| headers[i].to_string()).collect(),
            ..Self::default()
        };
        for record in &records {
            let Some(target) = parse_cell(record.get(target_idx)) else { continue };
            let row: Option<Vec<f64>> = feature_idx.iter().map(|&i| parse_cell(record.get(i))).collect();
            if let Some(row) = row {
                data.rows.push(row);
                data.targets.push(target);
            }
        }
        if data.rows.is_empty() {
            return Err(TrainingError::Dataset("dataset has no usable rows".to_string()));
        }
        Ok(data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Seeded shuffle split into (train, test).
    ///
    /// The test side gets `round(len * fraction)` rows but never all of them.
    #[must_use]
    pub fn split(&self, test_fraction: f64, seed: u64) -> (Self, Self) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let n_test = ((self.len() as f64) * test_fraction).round() as usize;
        let n_test = n_test.min(self.len().saturating_sub(1));
        let (test_idx, train_idx) = indices.split_at(n_test);
        (self.subset(train_idx), self.subset(test_idx))
    }

    fn subset(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
        }
    }
}

fn parse_cell(cell: Option<&str>) -> Option<f64> {
    let value = cell?.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_id_stable_for_same_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.csv");
        std::fs::write(&path, "x,target\n1,2\n").unwrap();

        let a = DataSnapshot::from_path(&path).unwrap();
        let b = DataSnapshot::from_path(&path).unwrap();
        assert_eq!(a.id, b.id);

        std::fs::write(&path, "x,target\n1,3\n").unwrap();
        let c = DataSnapshot::from_path(&path).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_snapshot_dir_includes_file_names() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("d")).unwrap();
        std::fs::write(temp.path().join("d/a.csv"), "1").unwrap();
        let before = DataSnapshot::from_path(&temp.path().join("d")).unwrap();

        std::fs::rename(temp.path().join("d/a.csv"), temp.path().join("d/b.csv")).unwrap();
        let after = DataSnapshot::from_path(&temp.path().join("d")).unwrap();
        assert_ne!(before.id, after.id);
    }

    #[test]
    fn test_load_csv_drops_incomplete_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.csv");
        std::fs::write(&path, "fp1,fp2,label,target\n1,0,a,2.5\n0,1,b,\n1,,c,1.0\n0,0,d,0.5\n").unwrap();

        let data = TabularDataset::load_csv(&path, &DatasetOptions::default()).unwrap();
        assert_eq!(data.feature_names, vec!["fp1", "fp2"]);
        assert_eq!(data.len(), 2);
        assert_eq!(data.targets, vec![2.5, 0.5]);
    }

    #[test]
    fn test_split_is_seeded() {
        let data = TabularDataset {
            feature_names: vec!["x".into()],
            rows: (0..10).map(|i| vec![f64::from(i)]).collect(),
            targets: (0..10).map(f64::from).collect(),
        };
        let (train_a, test_a) = data.split(0.2, 7);
        let (train_b, test_b) = data.split(0.2, 7);
        assert_eq!(test_a.len(), 2);
        assert_eq!(train_a.len(), 8);
        assert_eq!(test_a.targets, test_b.targets);
        assert_eq!(train_a.targets, train_b.targets);
    }

    #[test]
    fn test_options_from_config() {
        let config = json!({"target": "pIC50", "features": ["a", "b"], "test_fraction": 0.25, "seed": 3});
        let opts = DatasetOptions::from_config(config.as_object().unwrap()).unwrap();
        assert_eq!(opts.target, "pIC50");
        assert_eq!(opts.features, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(opts.seed, 3);

        let bad = json!({"test_fraction": 1.5});
        assert!(DatasetOptions::from_config(bad.as_object().unwrap()).is_err());
    }
}
