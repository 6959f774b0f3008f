use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hyperparameter mapping for one job. Values may nest.
pub type JobConfig = serde_json::Map<String, serde_json::Value>;

/// One trainable unit: a model family paired with a config.
///
/// Loaded from a manifest (see [`crate::ManifestLoader`]) and never mutated
/// afterwards; every dispatch re-reads the manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique per model family (e.g. "rf", "xgb").
    pub model_id: String,
    /// Hyperparameters passed to the trainer.
    #[serde(default)]
    pub config: JobConfig,
    /// Files whose content feeds the signature, in significance order.
    pub signature_inputs: Vec<PathBuf>,
    /// Name of the registered trainer that performs training.
    pub entry_point: String,
    /// Maximum wall-clock training duration.
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    /// Manifest this job was loaded from, if any.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl JobSpec {
    #[must_use]
    pub fn new(model_id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            config: JobConfig::new(),
            signature_inputs: Vec::new(),
            entry_point: entry_point.into(),
            timeout: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_signature_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.signature_inputs.push(path.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("model_id is required".to_string()));
        }
        if self.entry_point.trim().is_empty() {
            return Err(TrainingError::InvalidSpec(format!(
                "entry_point is required (model_id={})",
                self.model_id
            )));
        }
        if self.signature_inputs.is_empty() {
            return Err(TrainingError::InvalidSpec(format!(
                "signature_files must list at least one file (model_id={})",
                self.model_id
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(TrainingError::InvalidSpec(format!(
                "timeout must be > 0 (model_id={})",
                self.model_id
            )));
        }
        Ok(())
    }

    /// Flatten the config into string parameters for the run store.
    ///
    /// Nested keys are joined with `.`; scalars use their JSON rendering
    /// except strings, which are stored bare.
    #[must_use]
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        flatten_into(&mut out, None, &self.config);
        out
    }
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: Option<&str>, map: &JobConfig) {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            serde_json::Value::Object(inner) => flatten_into(out, Some(&name), inner),
            serde_json::Value::String(s) => {
                out.insert(name, s.clone());
            }
            other => {
                out.insert(name, other.to_string());
            }
        }
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        secs.map(|s| {
            Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_spec_validate_requires_fields() {
        let spec = JobSpec::new("", "linear");
        assert!(spec.validate().is_err());

        let spec = JobSpec::new("rf", "").with_signature_input("models/rf.py");
        assert!(spec.validate().is_err());

        let spec = JobSpec::new("rf", "linear");
        assert!(spec.validate().is_err(), "empty signature inputs must be rejected");

        let spec = JobSpec::new("rf", "linear").with_signature_input("models/rf.py");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let spec = JobSpec::new("rf", "linear")
            .with_signature_input("a.py")
            .with_timeout(Duration::ZERO);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_params_flatten_nested_config() {
        let spec = JobSpec::new("xgb", "linear")
            .with_param("learning_rate", json!(0.1))
            .with_param("objective", json!("reg:squarederror"))
            .with_param("tree", json!({"depth": 6, "subsample": 0.8}));

        let params = spec.params();
        assert_eq!(params.get("learning_rate").map(String::as_str), Some("0.1"));
        assert_eq!(params.get("objective").map(String::as_str), Some("reg:squarederror"));
        assert_eq!(params.get("tree.depth").map(String::as_str), Some("6"));
        assert_eq!(params.get("tree.subsample").map(String::as_str), Some("0.8"));
    }
}
