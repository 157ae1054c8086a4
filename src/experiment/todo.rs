//! Queued units of work.

use super::sweep::SweepHandle;
use crate::device::Device;
use crate::measurement::MeasurementHandle;
use serde::{Deserialize, Serialize};

/// One scheduled (device, measurement) execution.
#[derive(Debug, Clone)]
pub struct ToDo {
    pub device: Device,
    pub measurement: MeasurementHandle,
    /// Sweep this ToDo belongs to, if any.
    pub sweep: Option<SweepHandle>,
}

impl ToDo {
    pub fn new(device: Device, measurement: MeasurementHandle) -> Self {
        Self {
            device,
            measurement,
            sweep: None,
        }
    }

    pub fn in_sweep(device: Device, measurement: MeasurementHandle, sweep: SweepHandle) -> Self {
        Self {
            device,
            measurement,
            sweep: Some(sweep),
        }
    }

    pub fn part_of_sweep(&self) -> bool {
        self.sweep.is_some()
    }
}

/// Lifecycle of a ToDo.
///
/// ```text
/// Pending ──► Running ──┬──► Completed   (popped from the queue)
///                       ├──► Failed      (stays at the queue head)
///                       └──► Aborted     (stays at the queue head)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted
        )
    }
}
