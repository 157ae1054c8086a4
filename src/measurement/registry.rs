//! Name-to-factory registry of available measurements.

use super::{DummyMeas, Measurement, MeasurementHandle};
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::sync::Arc;

type MeasurementFactory = Box<dyn Fn() -> Arc<dyn Measurement> + Send + Sync>;

pub struct MeasurementRegistry {
    factories: BTreeMap<String, MeasurementFactory>,
}

impl Default for MeasurementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementRegistry {
    /// Registry with the built-in measurements.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("DummyMeas", || Arc::new(DummyMeas));
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory. A later registration under the same name is ignored,
    /// so the first source of a name wins.
    pub fn register<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: Fn() -> Arc<dyn Measurement> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return false;
        }
        self.factories.insert(name.to_string(), Box::new(factory));
        true
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate a measurement with its default parameters.
    pub fn create(&self, name: &str) -> AppResult<MeasurementHandle> {
        self.factories
            .get(name)
            .map(|factory| MeasurementHandle::new(factory()))
            .ok_or_else(|| DaqError::UnknownMeasurement(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registered() {
        let registry = MeasurementRegistry::new();
        assert_eq!(registry.names(), ["DummyMeas"]);
        let handle = registry.create("DummyMeas").unwrap();
        assert_eq!(handle.name(), "DummyMeas");
    }

    #[test]
    fn test_unknown_name_errors() {
        let err = MeasurementRegistry::new().create("IL_sweep").unwrap_err();
        assert!(matches!(err, DaqError::UnknownMeasurement(n) if n == "IL_sweep"));
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = MeasurementRegistry::empty();
        assert!(registry.register("A", || Arc::new(DummyMeas)));
        assert!(!registry.register("A", || Arc::new(DummyMeas)));
        assert_eq!(registry.names().len(), 1);
    }
}
