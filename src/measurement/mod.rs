//! The measurement contract.
//!
//! A [`Measurement`] is the piece of lab knowledge the engine executes: it declares
//! the instruments it wants and its default parameters, and its `algorithm` drives the
//! instruments and writes results into the `values` section of the record it is handed.
//!
//! A [`MeasurementHandle`] is one configured instance of a measurement as it sits
//! in a ToDo: a shared measurement, a process-unique instance id, its own parameters
//! and its instrument assignment. Handles are cheap to clone and share the
//! underlying measurement.
//!
//! Algorithms that run for a long time poll the [`AbortSignal`] and return
//! [`MeasurementError::Aborted`] when it is set.

use crate::device::Device;
use crate::error::MeasurementError;
use crate::experiment::document::RecordSink;
use crate::hardware::Instrument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub mod dummy;
pub mod registry;

pub use dummy::DummyMeas;
pub use registry::MeasurementRegistry;

/// Instruments assigned to a measurement, by role.
pub type Instruments = BTreeMap<String, Arc<dyn Instrument>>;

static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(1);

// =============================================================================
// Parameters
// =============================================================================

/// Ordered measurement parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Overwrite entries with those present in `overrides`.
    pub fn merge(&mut self, overrides: &Parameters) {
        for (k, v) in &overrides.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    fn require(&self, name: &str) -> Result<&Value, MeasurementError> {
        self.0
            .get(name)
            .ok_or_else(|| MeasurementError::msg("KeyError", format!("missing parameter '{name}'")))
    }

    fn wrong_type(name: &str, expected: &str, got: &Value) -> MeasurementError {
        MeasurementError::msg(
            "TypeError",
            format!("parameter '{name}' must be {expected}, got {got}"),
        )
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, MeasurementError> {
        let v = self.require(name)?;
        v.as_f64().ok_or_else(|| Self::wrong_type(name, "a number", v))
    }

    pub fn get_u64(&self, name: &str) -> Result<u64, MeasurementError> {
        let v = self.require(name)?;
        v.as_u64()
            .ok_or_else(|| Self::wrong_type(name, "a non-negative integer", v))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, MeasurementError> {
        let v = self.require(name)?;
        v.as_bool().ok_or_else(|| Self::wrong_type(name, "a boolean", v))
    }

    pub fn get_str(&self, name: &str) -> Result<&str, MeasurementError> {
        let v = self.require(name)?;
        v.as_str().ok_or_else(|| Self::wrong_type(name, "a string", v))
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// =============================================================================
// AbortSignal
// =============================================================================

/// Cooperative user abort. Cloned handles share one flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running measurement to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Aborted)` once triggered. Meant for `?` inside measurement loops.
    pub fn check(&self) -> Result<(), MeasurementError> {
        if self.is_triggered() {
            Err(MeasurementError::Aborted)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Measurement
// =============================================================================

/// A measurement routine.
#[async_trait]
pub trait Measurement: Send + Sync {
    /// Measurement name, used in file names and records.
    fn name(&self) -> &str;

    /// Instrument roles this measurement needs.
    fn wanted_instruments(&self) -> Vec<String> {
        Vec::new()
    }

    /// Default parameter set.
    fn default_parameters(&self) -> Parameters;

    /// Run the measurement on `device`, writing results into `record`.
    ///
    /// Any error is recorded in the record's `error` section; it never stops the engine.
    async fn algorithm(
        &self,
        device: &Device,
        record: &mut RecordSink,
        instruments: &Instruments,
        parameters: &Parameters,
        abort: &AbortSignal,
    ) -> Result<(), MeasurementError>;
}

/// One configured instance of a measurement.
#[derive(Clone)]
pub struct MeasurementHandle {
    measurement: Arc<dyn Measurement>,
    id: u32,
    parameters: Parameters,
    instruments: Instruments,
}

impl fmt::Debug for MeasurementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementHandle")
            .field("name", &self.measurement.name())
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .field("instruments", &self.instruments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MeasurementHandle {
    /// New instance with the measurement's default parameters and no instruments.
    pub fn new(measurement: Arc<dyn Measurement>) -> Self {
        let parameters = measurement.default_parameters();
        Self {
            measurement,
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            parameters,
            instruments: Instruments::new(),
        }
    }

    /// Override some of the parameters.
    pub fn with_parameters(mut self, overrides: &Parameters) -> Self {
        self.parameters.merge(overrides);
        self
    }

    pub fn with_instrument(mut self, role: &str, instrument: Arc<dyn Instrument>) -> Self {
        self.instruments.insert(role.to_string(), instrument);
        self
    }

    /// Copy parameters and instruments into a new instance with a fresh id.
    pub fn duplicate(&self) -> Self {
        Self {
            measurement: Arc::clone(&self.measurement),
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            parameters: self.parameters.clone(),
            instruments: self.instruments.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.measurement.name()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Identity of this instance, also the row id in a sweep table.
    pub fn name_with_id(&self) -> String {
        format!("{}_id{}", self.name(), self.id)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    /// Wanted instrument roles without an assigned instrument.
    pub fn missing_instruments(&self) -> Vec<String> {
        self.measurement
            .wanted_instruments()
            .into_iter()
            .filter(|role| !self.instruments.contains_key(role))
            .collect()
    }

    /// Current settings of every assigned instrument, by role.
    pub fn instrument_snapshot(&self) -> Value {
        Value::Object(
            self.instruments
                .iter()
                .map(|(role, inst)| (role.clone(), inst.snapshot()))
                .collect(),
        )
    }

    /// Run the algorithm with this instance's instruments and parameters.
    pub async fn measure(
        &self,
        device: &Device,
        record: &mut RecordSink,
        abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        self.measurement
            .algorithm(device, record, &self.instruments, &self.parameters, abort)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockInstrument;

    #[test]
    fn test_parameter_getters() {
        let p = Parameters::new()
            .with("points", 10)
            .with("time", 0.5)
            .with("fail", false);
        assert_eq!(p.get_u64("points").unwrap(), 10);
        assert_eq!(p.get_f64("time").unwrap(), 0.5);
        assert!(!p.get_bool("fail").unwrap());
        match p.get_bool("points").unwrap_err() {
            MeasurementError::Failed { kind, .. } => assert_eq!(kind, "TypeError"),
            MeasurementError::Aborted => panic!("expected type error"),
        }
        assert!(p.get_f64("missing").is_err());
    }

    #[test]
    fn test_handles_get_distinct_ids() {
        let m: Arc<dyn Measurement> = Arc::new(DummyMeas);
        let a = MeasurementHandle::new(Arc::clone(&m));
        let b = a.duplicate();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.name_with_id(), b.name_with_id());
        assert!(a.name_with_id().starts_with("DummyMeas_id"));
        assert_eq!(a.parameters(), b.parameters());
    }

    #[test]
    fn test_overrides_and_snapshot() {
        let handle = MeasurementHandle::new(Arc::new(DummyMeas))
            .with_parameters(&Parameters::new().with("number of points", 3))
            .with_instrument("power meter", Arc::new(MockInstrument::new("pm")));
        assert_eq!(handle.parameters().get_u64("number of points").unwrap(), 3);
        assert!(handle.parameters().get("simulate measurement error").is_some());
        assert_eq!(handle.instrument_snapshot()["power meter"]["name"], "pm");
        assert!(handle.missing_instruments().is_empty());
    }

    #[test]
    fn test_abort_signal_shared_between_clones() {
        let signal = AbortSignal::new();
        let other = signal.clone();
        assert!(signal.check().is_ok());
        other.trigger();
        assert!(signal.check().unwrap_err().is_abort());
        signal.reset();
        assert!(!other.is_triggered());
    }
}
