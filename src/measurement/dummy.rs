//! Built-in software-only measurement.
//!
//! `DummyMeas` needs no instruments. It writes `number of points` random values
//! into `point values` together with their indices, spread over
//! `total measurement time` seconds, and fails on purpose when
//! `simulate measurement error` is set. Useful for exercising the engine and
//! the record pipeline on a machine without hardware.

use super::{AbortSignal, Instruments, Measurement, Parameters};
use crate::device::Device;
use crate::error::MeasurementError;
use crate::experiment::document::RecordSink;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

pub const POINTS: &str = "number of points";
pub const TOTAL_TIME: &str = "total measurement time";
pub const SIMULATE_ERROR: &str = "simulate measurement error";

/// Upper bound for `number of points`.
pub const MAX_POINTS: u64 = 10_000_000;

/// Software-only measurement producing random data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyMeas;

#[async_trait]
impl Measurement for DummyMeas {
    fn name(&self) -> &str {
        "DummyMeas"
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
            .with(POINTS, 10)
            .with(TOTAL_TIME, 0.0)
            .with(SIMULATE_ERROR, false)
    }

    async fn algorithm(
        &self,
        device: &Device,
        record: &mut RecordSink,
        _instruments: &Instruments,
        parameters: &Parameters,
        abort: &AbortSignal,
    ) -> Result<(), MeasurementError> {
        let n_points = parameters.get_u64(POINTS)?;
        let total_time = parameters.get_f64(TOTAL_TIME)?;
        let simulate_error = parameters.get_bool(SIMULATE_ERROR)?;

        if n_points > MAX_POINTS {
            return Err(MeasurementError::msg(
                "ValueError",
                format!("{POINTS} must not exceed {MAX_POINTS}, got {n_points}"),
            ));
        }

        record.set_measurement_setting(POINTS, n_points)?;
        record.set_measurement_setting(TOTAL_TIME, total_time)?;

        if simulate_error {
            return Err(MeasurementError::msg(
                "SimulatedError",
                "Simulated measurement error requested by parameter.",
            ));
        }

        let step = if n_points > 0 && total_time > 0.0 {
            Duration::try_from_secs_f64(total_time / n_points as f64)
                .map_err(|e| MeasurementError::failed("ValueError", e))?
        } else {
            Duration::ZERO
        };

        let mut indices = Vec::new();
        let mut values = Vec::new();
        for i in 0..n_points {
            abort.check()?;
            if !step.is_zero() {
                tokio::time::sleep(step).await;
            }
            indices.push(i);
            values.push(rand::thread_rng().gen_range(-1.0..1.0_f64));
        }

        record.set_value("point indices", &indices)?;
        record.set_value("point values", &values)?;
        debug!(device = %device, points = n_points, "DummyMeas finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::document::MeasurementRecord;
    use crate::metadata::Metadata;
    use serde_json::json;
    use tempfile::TempDir;

    fn sink(dir: &TempDir) -> RecordSink {
        let rec = MeasurementRecord::new(
            &Metadata::default(),
            json!({"id": "D1", "type": "grating"}),
            &chrono::Local::now(),
        );
        RecordSink::open(dir.path().join("dummy"), 50, rec).unwrap()
    }

    #[tokio::test]
    async fn test_default_parameters() {
        let dir = TempDir::new().unwrap();
        let mut record = sink(&dir);
        let meas = DummyMeas;
        let params = meas.default_parameters();

        meas.algorithm(
            &Device::new("D1", "grating"),
            &mut record,
            &Instruments::new(),
            &params,
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        let values = &record.document().values;
        let indices = values["point indices"].as_array().unwrap();
        assert_eq!(indices.len(), 10);
        assert_eq!(indices[9], 9);
        let points = values["point values"].as_array().unwrap();
        assert!(points.iter().all(|v| v.as_f64().unwrap().is_finite()));
    }

    #[tokio::test]
    async fn test_raise_error() {
        let dir = TempDir::new().unwrap();
        let mut record = sink(&dir);
        let params = DummyMeas.default_parameters().with(SIMULATE_ERROR, true);
        let err = DummyMeas
            .algorithm(
                &Device::new("D1", "grating"),
                &mut record,
                &Instruments::new(),
                &params,
                &AbortSignal::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("SimulatedError"));
    }

    async fn run_with(params: &Parameters) -> Result<(), MeasurementError> {
        let dir = TempDir::new().unwrap();
        let mut record = sink(&dir);
        DummyMeas
            .algorithm(
                &Device::new("D1", "grating"),
                &mut record,
                &Instruments::new(),
                params,
                &AbortSignal::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_huge_point_count_is_a_value_error() {
        let params = DummyMeas
            .default_parameters()
            .with(POINTS, u64::MAX / 2);
        let err = run_with(&params).await.unwrap_err();
        assert!(err.to_string().starts_with("ValueError"), "{err}");
    }

    #[tokio::test]
    async fn test_unrepresentable_step_is_a_value_error() {
        let params = DummyMeas
            .default_parameters()
            .with(POINTS, 1)
            .with(TOTAL_TIME, 1e300);
        let err = run_with(&params).await.unwrap_err();
        assert!(err.to_string().starts_with("ValueError"), "{err}");
    }

    #[tokio::test]
    async fn test_honors_abort() {
        let dir = TempDir::new().unwrap();
        let mut record = sink(&dir);
        let abort = AbortSignal::new();
        abort.trigger();
        let err = DummyMeas
            .algorithm(
                &Device::new("D1", "grating"),
                &mut record,
                &Instruments::new(),
                &DummyMeas.default_parameters(),
                &abort,
            )
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert!(record.document().values.is_empty());
    }
}
