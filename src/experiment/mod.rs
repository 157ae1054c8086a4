//! Experiment orchestration.
//!
//! An experiment is a FIFO queue of [`ToDo`]s, each pairing a device with a
//! configured measurement. The [`ExecutionEngine`] runs them one at a time,
//! writing one crash-safe JSON record per ToDo, rolling sweep members up into
//! a shared summary, and collecting successful records in a
//! [`ResultStore`](crate::data::ResultStore).
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_labexec::config::Settings;
//! use rust_labexec::device::Device;
//! use rust_labexec::experiment::{ExecutionEngine, ToDo};
//! use rust_labexec::measurement::MeasurementRegistry;
//!
//! let registry = MeasurementRegistry::new();
//! let mut engine = ExecutionEngine::new(Settings::from_env()?);
//! engine.enqueue(ToDo::new(Device::new("D1", "grating"), registry.create("DummyMeas")?));
//!
//! let report = engine.run().await?;
//! if report.pause_requested {
//!     // a measurement failed; the failed ToDo is still at the queue head
//! }
//! ```

pub mod document;
pub mod engine;
pub mod sweep;
pub mod todo;

pub use document::{ErrorSection, MeasurementRecord, RecordSink, SweepInformation};
pub use engine::{
    EngineEvent, ExecutionEngine, MeasurementOutcome, RunReport, StopReason, TaskReport,
};
pub use sweep::{SweepGroup, SweepHandle, SweepRegistry, SweepRow, SweepTable};
pub use todo::{TaskState, ToDo};
