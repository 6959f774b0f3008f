use crate::error::TrainingResult;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A blob produced by a trainer, uploaded through the run store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingArtifact {
    /// Store-relative name, e.g. `model.json`.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl TrainingArtifact {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), bytes }
    }

    /// Pretty-printed JSON artifact.
    pub fn json<T: Serialize>(name: impl Into<String>, value: &T) -> TrainingResult<Self> {
        Ok(Self::new(name, serde_json::to_vec_pretty(value)?))
    }
}

#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_artifact_is_pretty_printed() {
        let artifact = TrainingArtifact::json("model.json", &json!({ "w": 2 })).unwrap();
        assert_eq!(artifact.name, "model.json");
        assert_eq!(artifact.bytes, b"{\n  \"w\": 2\n}");
    }

    #[test]
    fn test_sha256_bytes_is_hex() {
        assert_eq!(sha256_bytes(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
