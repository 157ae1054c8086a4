//! Hardware collaborators seen from the execution engine.
//!
//! The engine never talks to instruments or stages directly. It only needs:
//!
//! - [`Instrument`]: something that can describe its current settings, so every
//!   record carries an instrument snapshot from before and after the measurement.
//! - [`StageMover`]: moves the probe to a device (used when automatic stage
//!   movement is enabled).
//! - [`PeakSearcher`]: optimizes coupling before measuring and reports what it found
//!   (used when search for peak is enabled).
//!
//! Both collaborators may fail; the engine records such failures like a failed
//! measurement.

use crate::device::{Chip, Device};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod mock;

/// An instrument assigned to a measurement.
pub trait Instrument: Send + Sync {
    /// Instrument name, e.g. the VISA address or a driver name.
    fn name(&self) -> &str;

    /// Current settings, written into the `instruments` section of a record.
    fn snapshot(&self) -> Value;
}

/// Moves the stages so that the probe sits on a device.
#[async_trait]
pub trait StageMover: Send + Sync {
    async fn move_to_device(&self, chip: &Chip, device: &Device) -> Result<()>;
}

/// Automatic alignment that runs before a measurement.
#[async_trait]
pub trait PeakSearcher: Send + Sync {
    /// Reload search parameters from their persisted settings, if any.
    async fn update_params_from_savefile(&self) -> Result<()> {
        Ok(())
    }

    /// Run the search and return its result document.
    async fn search_for_peak(&self) -> Result<Value>;
}
