//! Core library for the rust_labexec measurement executor.
//!
//! This library contains the execution engine, the crash-safe record format,
//! sweep aggregation and the result store used to run queued measurements
//! against devices under test. It is used by the `rust_labexec` binary and by
//! lab front ends that embed the engine.

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod measurement;
pub mod metadata;
