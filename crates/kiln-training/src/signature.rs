//! Deterministic fingerprints for (config, code, data) tuples.
//!
//! Two jobs with equal [`Signature`]s are training-equivalent: the dispatcher
//! reuses a completed run for one as the result of the other. The computation
//! only reads the declared signature inputs; it never touches the run store.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{JobConfig, JobSpec};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::path::Path;

const DOMAIN_TAG: &[u8] = b"kiln-signature/v1\0";

/// SHA-256 fingerprint of a job's config, code and data snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; 32]);

impl Signature {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines and tables.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    pub fn from_hex(s: &str) -> TrainingResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| TrainingError::InvalidSpec(format!("invalid signature hex: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            TrainingError::InvalidSpec(format!("signature must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.short())
    }
}

impl std::str::FromStr for Signature {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Computes [`Signature`]s for job specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureComputer;

impl SignatureComputer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint `job` against the data snapshot `snapshot_id`.
    ///
    /// # Errors
    /// `SignatureInputMissing` if any declared input cannot be read.
    pub fn compute(&self, job: &JobSpec, snapshot_id: &str) -> TrainingResult<Signature> {
        let config_digest = self.config_digest(&job.config);

        let mut file_digests = Vec::with_capacity(job.signature_inputs.len());
        for path in &job.signature_inputs {
            file_digests.push(self.file_digest(path)?);
        }

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        hasher.update(config_digest);
        hasher.update((file_digests.len() as u64).to_be_bytes());
        for digest in &file_digests {
            hasher.update(digest);
        }
        hasher.update((snapshot_id.len() as u64).to_be_bytes());
        hasher.update(snapshot_id.as_bytes());

        Ok(Signature(hasher.finalize().into()))
    }

    #[must_use]
    pub fn config_digest(&self, config: &JobConfig) -> [u8; 32] {
        Sha256::digest(canonical_config(config).as_bytes()).into()
    }

    pub fn file_digest(&self, path: &Path) -> TrainingResult<[u8; 32]> {
        let bytes = std::fs::read(path).map_err(|source| TrainingError::SignatureInputMissing {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Sha256::digest(&bytes).into())
    }
}

/// Canonical text form of a config.
///
/// Object keys are sorted at every level. Integers print as integers and
/// floats in shortest round-trip form with a mandatory fraction or exponent,
/// so `1` and `1.0` stay distinct while `0.001` and `1e-3` coincide.
#[must_use]
pub fn canonical_config(config: &JobConfig) -> String {
    let mut out = String::new();
    write_object(&mut out, config);
    out
}

fn write_object(out: &mut String, map: &serde_json::Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, &map[key]);
    }
    out.push('}');
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_number(out: &mut String, n: &Number) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        // -0.0 == 0.0
        let f = if f == 0.0 { 0.0 } else { f };
        // Debug always renders a '.' or an exponent for floats.
        let _ = write!(out, "{f:?}");
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(value: Value) -> JobConfig {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_canonical_config_sorts_keys_recursively() {
        let a = config(json!({"b": 1, "a": {"z": true, "y": [3, 2]}}));
        let b = config(json!({"a": {"y": [3, 2], "z": true}, "b": 1}));
        assert_eq!(canonical_config(&a), canonical_config(&b));
        assert_eq!(canonical_config(&a), r#"{"a":{"y":[3,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_config_keeps_int_float_distinction() {
        let int = config(json!({"depth": 1}));
        let float = config(json!({"depth": 1.0}));
        assert_ne!(canonical_config(&int), canonical_config(&float));
    }

    #[test]
    fn test_canonical_config_normalizes_float_notation() {
        let a: JobConfig = serde_json::from_str(r#"{"lr": 0.001}"#).unwrap();
        let b: JobConfig = serde_json::from_str(r#"{"lr": 1e-3}"#).unwrap();
        let c: JobConfig = serde_json::from_str(r#"{"lr": 1.000e-3}"#).unwrap();
        assert_eq!(canonical_config(&a), canonical_config(&b));
        assert_eq!(canonical_config(&a), canonical_config(&c));
    }

    #[test]
    fn test_signature_hex_roundtrip() {
        let sig = Signature::from_bytes([7u8; 32]);
        let parsed: Signature = sig.to_hex().parse().unwrap();
        assert_eq!(sig, parsed);
        assert!(Signature::from_hex("abcd").is_err());
        assert!(Signature::from_hex("zz").is_err());
    }

    #[test]
    fn test_compute_missing_input_fails() {
        let temp = TempDir::new().unwrap();
        let job = JobSpec::new("rf", "linear").with_signature_input(temp.path().join("missing.py"));
        let err = SignatureComputer::new().compute(&job, "snap").unwrap_err();
        assert!(matches!(err, TrainingError::SignatureInputMissing { .. }));
    }

    #[test]
    fn test_file_order_matters() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.py");
        let b = temp.path().join("b.py");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let computer = SignatureComputer::new();
        let ab = JobSpec::new("m", "linear").with_signature_input(&a).with_signature_input(&b);
        let ba = JobSpec::new("m", "linear").with_signature_input(&b).with_signature_input(&a);
        assert_ne!(computer.compute(&ab, "s").unwrap(), computer.compute(&ba, "s").unwrap());
    }
}
