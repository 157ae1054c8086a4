//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole execution
//! engine. Using the `thiserror` crate, it provides a centralized and consistent way
//! to handle the kinds of errors that can stop an engine invocation, from I/O and
//! configuration issues to record validation problems.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the infrastructure failures of the engine:
//!
//! - **`Config`** / **`Configuration`**: figment load errors and semantic validation errors.
//! - **`Io`** / **`Serialization`**: filesystem and JSON failures while writing records.
//! - **`RecordInUse`**: a second writer targeted the temp file of an open durable record.
//! - **`SweepFolderExists`**, **`UnknownSweep`**, **`SweepRowMissing`**, **`DuplicateSweepId`**:
//!   logic errors in sweep bookkeeping. They are not retryable.
//! - **`MissingKey`**, **`Validation`**, **`DuplicateMeasurement`**: raised when a finished
//!   record is ingested into the result store.
//!
//! Errors raised *by a measurement algorithm* are a separate type, [`MeasurementError`],
//! because they are contained and written into the measurement's own record instead of
//! stopping the engine.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record temp file {0} is already in use by another writer")]
    RecordInUse(PathBuf),

    #[error("Sweep subfolder {0} already exists")]
    SweepFolderExists(PathBuf),

    #[error("Unknown sweep group #{0}")]
    UnknownSweep(usize),

    #[error("Sweep #{sweep} has no row with id '{id}'")]
    SweepRowMissing { sweep: usize, id: String },

    #[error("Duplicate sweep row id '{0}'")]
    DuplicateSweepId(String),

    #[error("Record is missing required key: {0}")]
    MissingKey(String),

    #[error("Record validation error: {0}")]
    Validation(String),

    #[error("Duplicate measurement found: {0}")]
    DuplicateMeasurement(String),

    #[error("Unknown measurement '{0}'")]
    UnknownMeasurement(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Short, stable name of the variant, used as the `error.type` of a record.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Config(_) => "ConfigError",
            DaqError::Configuration(_) => "ConfigurationError",
            DaqError::Io(_) => "IoError",
            DaqError::Serialization(_) => "SerializationError",
            DaqError::RecordInUse(_) => "RecordInUse",
            DaqError::SweepFolderExists(_) => "SweepFolderExists",
            DaqError::UnknownSweep(_) => "UnknownSweep",
            DaqError::SweepRowMissing { .. } => "SweepRowMissing",
            DaqError::DuplicateSweepId(_) => "DuplicateSweepId",
            DaqError::MissingKey(_) => "MissingKey",
            DaqError::Validation(_) => "ValidationError",
            DaqError::DuplicateMeasurement(_) => "DuplicateMeasurement",
            DaqError::UnknownMeasurement(_) => "UnknownMeasurement",
            DaqError::Collaborator(_) => "CollaboratorError",
        }
    }
}

/// Error returned by a measurement algorithm or by a collaborator running inside
/// the protected region of a ToDo.
#[derive(Error, Debug)]
pub enum MeasurementError {
    /// The user tripped the abort signal and the algorithm honored it.
    #[error("Measurement aborted by user.")]
    Aborted,

    /// Any other failure. `kind` names the error class written to the record.
    #[error("{kind}: {source}")]
    Failed {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
}

impl MeasurementError {
    /// Build a failure with an explicit error class name.
    pub fn failed(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        MeasurementError::Failed {
            kind: kind.into(),
            source: source.into(),
        }
    }

    /// Build a failure from a plain message.
    pub fn msg(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MeasurementError::Failed {
            kind: kind.into(),
            source: anyhow::anyhow!("{message}"),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, MeasurementError::Aborted)
    }
}

/// Error class of an `anyhow` chain, taken from its root cause when that is a known type.
fn kind_of(source: &anyhow::Error) -> &'static str {
    let root = source.root_cause();
    if let Some(err) = root.downcast_ref::<DaqError>() {
        err.kind()
    } else if root.is::<std::io::Error>() {
        "IoError"
    } else if root.is::<serde_json::Error>() {
        "SerializationError"
    } else if root.is::<std::num::ParseFloatError>() || root.is::<std::num::ParseIntError>() {
        "ValueError"
    } else {
        "Error"
    }
}

impl From<anyhow::Error> for MeasurementError {
    fn from(source: anyhow::Error) -> Self {
        MeasurementError::Failed {
            kind: kind_of(&source).to_string(),
            source,
        }
    }
}

impl From<DaqError> for MeasurementError {
    fn from(err: DaqError) -> Self {
        MeasurementError::Failed {
            kind: err.kind().to_string(),
            source: err.into(),
        }
    }
}

impl From<std::io::Error> for MeasurementError {
    fn from(err: std::io::Error) -> Self {
        DaqError::Io(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::DuplicateMeasurement("2024-01-01D1grating".to_string());
        assert_eq!(
            err.to_string(),
            "Duplicate measurement found: 2024-01-01D1grating"
        );
    }

    #[test]
    fn test_measurement_error_kind_from_daq_error() {
        let err: MeasurementError = DaqError::Collaborator("stage stuck".into()).into();
        match err {
            MeasurementError::Failed { kind, source } => {
                assert_eq!(kind, "CollaboratorError");
                assert!(source.to_string().contains("stage stuck"));
            }
            MeasurementError::Aborted => panic!("expected failure"),
        }
    }

    #[test]
    fn test_anyhow_kind_follows_root_cause() {
        use anyhow::Context;

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "detector timeout");
        let wrapped = Err::<(), _>(io).context("reading detector").unwrap_err();
        match MeasurementError::from(wrapped) {
            MeasurementError::Failed { kind, source } => {
                assert_eq!(kind, "IoError");
                assert!(format!("{source:#}").contains("detector timeout"));
            }
            MeasurementError::Aborted => panic!("expected failure"),
        }

        let parse = "1.2.3".parse::<f64>().unwrap_err();
        let err = MeasurementError::from(anyhow::Error::new(parse));
        assert!(err.to_string().starts_with("ValueError"));

        let plain = MeasurementError::from(anyhow::anyhow!("stage drifted"));
        assert!(plain.to_string().starts_with("Error: stage drifted"));
    }

    #[test]
    fn test_abort_display_is_fixed() {
        assert_eq!(
            MeasurementError::Aborted.to_string(),
            "Measurement aborted by user."
        );
        assert!(MeasurementError::Aborted.is_abort());
    }
}
