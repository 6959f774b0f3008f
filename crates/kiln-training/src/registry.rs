use crate::error::{TrainingError, TrainingResult};
use crate::trainer::Trainer;
use crate::trainers::{BaselineTrainer, LinearTrainer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Explicit mapping from entry-point name to trainer.
///
/// Nothing is discovered by naming convention: a manifest whose
/// `entry_point` was never registered fails as a config error.
#[derive(Clone, Default)]
pub struct TrainerRegistry {
    trainers: BTreeMap<String, Arc<dyn Trainer>>,
}

impl std::fmt::Debug for TrainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerRegistry")
            .field("entry_points", &self.trainers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TrainerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the reference trainers shipped in this crate.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.trainers.insert("baseline".to_string(), Arc::new(BaselineTrainer));
        registry.trainers.insert("linear".to_string(), Arc::new(LinearTrainer));
        registry
    }

    pub fn register(&mut self, entry_point: impl Into<String>, trainer: Arc<dyn Trainer>) -> TrainingResult<()> {
        let entry_point = entry_point.into();
        if entry_point.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("entry point name must not be empty".to_string()));
        }
        if self.trainers.contains_key(&entry_point) {
            return Err(TrainingError::DuplicateEntryPoint(entry_point));
        }
        debug!(entry_point = %entry_point, "Registered trainer");
        self.trainers.insert(entry_point, trainer);
        Ok(())
    }

    pub fn resolve(&self, entry_point: &str) -> TrainingResult<Arc<dyn Trainer>> {
        self.trainers
            .get(entry_point)
            .cloned()
            .ok_or_else(|| TrainingError::UnknownEntryPoint(entry_point.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trainers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trainers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_entry_points() {
        let registry = TrainerRegistry::with_builtin();
        assert!(registry.resolve("baseline").is_ok());
        assert!(registry.resolve("linear").is_ok());
        assert!(matches!(registry.resolve("forest"), Err(TrainingError::UnknownEntryPoint(_))));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = TrainerRegistry::with_builtin();
        let err = registry.register("linear", Arc::new(LinearTrainer)).unwrap_err();
        assert!(matches!(err, TrainingError::DuplicateEntryPoint(name) if name == "linear"));
        assert_eq!(registry.len(), 2);
    }
}
