//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rust_labexec::config::Settings;
use rust_labexec::device::Device;
use rust_labexec::error::MeasurementError;
use rust_labexec::experiment::{RecordSink, ToDo};
use rust_labexec::measurement::{
    AbortSignal, DummyMeas, Instruments, Measurement, MeasurementHandle, Parameters,
};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Settings writing into `dir`, chip `wafer7`, no waits.
pub fn settings_in(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.chip.name = "wafer7".into();
    settings.output.raw_output_path = dir.to_path_buf();
    settings
}

pub fn dummy() -> MeasurementHandle {
    MeasurementHandle::new(Arc::new(DummyMeas))
        .with_parameters(&Parameters::new().with("number of points", 5))
}

pub fn dummy_todo(id: &str, device_type: &str) -> ToDo {
    ToDo::new(Device::new(id, device_type), dummy())
}

/// File names in `dir` (not recursive), sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn names_ending(dir: &Path, suffix: &str) -> Vec<String> {
    file_names(dir)
        .into_iter()
        .filter(|n| n.ends_with(suffix))
        .collect()
}

pub fn read_json(path: &Path) -> Value {
    let text = fs::read_to_string(path).expect("read record");
    serde_json::from_str(&text).expect("parse record")
}

/// Writes one value, then fails with a `ValueError`.
pub struct FailingMeas;

#[async_trait]
impl Measurement for FailingMeas {
    fn name(&self) -> &str {
        "FailingMeas"
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    async fn algorithm(
        &self,
        _device: &Device,
        record: &mut RecordSink,
        _instruments: &Instruments,
        _parameters: &Parameters,
        _abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        record.set_value("partial", 1.5)?;
        Err(MeasurementError::msg("ValueError", "x"))
    }
}

/// Fails its first `failures` runs, then succeeds.
pub struct FlakyMeas {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyMeas {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Measurement for FlakyMeas {
    fn name(&self) -> &str {
        "FlakyMeas"
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    async fn algorithm(
        &self,
        _device: &Device,
        record: &mut RecordSink,
        _instruments: &Instruments,
        _parameters: &Parameters,
        _abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(MeasurementError::msg(
                "TimeoutError",
                format!("attempt {} timed out", call + 1),
            ));
        }
        record.set_value("attempt", call + 1)?;
        Ok(())
    }
}

/// Presses its own abort button halfway through.
pub struct AbortingMeas;

#[async_trait]
impl Measurement for AbortingMeas {
    fn name(&self) -> &str {
        "AbortingMeas"
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    async fn algorithm(
        &self,
        _device: &Device,
        record: &mut RecordSink,
        _instruments: &Instruments,
        _parameters: &Parameters,
        abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        for i in 0..10 {
            abort.check()?;
            record.push_value("points", i)?;
            if i == 4 {
                abort.trigger();
            }
        }
        Ok(())
    }
}

/// Writes one value, then indexes past the end of an empty sample buffer.
pub struct PanickingMeas;

#[async_trait]
impl Measurement for PanickingMeas {
    fn name(&self) -> &str {
        "PanickingMeas"
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    async fn algorithm(
        &self,
        _device: &Device,
        record: &mut RecordSink,
        _instruments: &Instruments,
        _parameters: &Parameters,
        _abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        record.set_value("partial", 2.5)?;
        let samples: Vec<f64> = record
            .document()
            .values
            .get("samples")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        record.set_value("third sample", samples[3])?;
        Ok(())
    }
}
