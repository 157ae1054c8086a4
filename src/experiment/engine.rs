//! The measurement execution engine.
//!
//! [`ExecutionEngine::run`] walks the ToDo queue head first. For every ToDo it:
//!
//! 1. peeks the head (the ToDo is only popped once it succeeded)
//! 2. derives a unique base name from chip, device, measurement and start time,
//!    inside the sweep subfolder for sweep members
//! 3. opens a [`RecordSink`] at `<base>.json.part` pre-filled with metadata
//! 4. moves the stages and runs the search for peak, if enabled
//! 5. runs the measurement algorithm
//! 6. classifies the result as [`MeasurementOutcome`]
//! 7. stamps the record finished and renames it to `.json`, `_error.json` or `_abort.json`
//! 8. updates the sweep summary for sweep members
//! 9. remembers the ToDo as last executed
//! 10. on success, adds the record to the [`ResultStore`] and pops the ToDo
//!
//! Steps 4 and 5 form the protected region: any error raised there, a panic
//! included, is written into the ToDo's own record and never stops the engine. Errors outside it (the output
//! folder, the record file, sweep bookkeeping, result validation) are returned from
//! `run` and leave the ToDo at the queue head.
//!
//! After each ToDo the engine stops if `pause_after_each_device` is set, if the
//! ToDo failed and the failure policy says to halt, if the user aborted, or if the
//! queue is empty. Otherwise it waits `inter_measurement_wait` and continues, unless
//! the user pressed abort in the meantime.

use super::document::{ErrorSection, MeasurementRecord, RecordSink, SweepInformation};
use super::sweep::{SweepHandle, SweepRegistry, SweepTable};
use super::todo::{TaskState, ToDo};
use crate::config::{OnFailure, Settings};
use crate::data::{make_filename_compliant, FileNamer, ResultStore};
use crate::device::{Chip, Device};
use crate::error::{AppResult, DaqError, MeasurementError};
use crate::hardware::{PeakSearcher, StageMover};
use crate::measurement::{AbortSignal, MeasurementHandle, Parameters};
use crate::metadata::Metadata;
use chrono::Local;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const ABORT_DESC: &str = "Measurement aborted by user.";
const PANIC_KIND: &str = "Panic";

/// Text of a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Classified result of the protected region of one ToDo.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementOutcome {
    Success,
    Failure {
        kind: String,
        message: String,
        traceback: String,
    },
    Aborted,
}

impl MeasurementOutcome {
    /// Classify the result of the protected region.
    ///
    /// The traceback is the `Debug` rendering of the error chain. It carries a
    /// stack trace only when `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` is set.
    pub fn from_result(result: Result<(), MeasurementError>) -> Self {
        match result {
            Ok(()) => MeasurementOutcome::Success,
            Err(MeasurementError::Aborted) => MeasurementOutcome::Aborted,
            Err(MeasurementError::Failed { kind, source }) => MeasurementOutcome::Failure {
                message: format!("{source:#}"),
                traceback: format!("{kind}: {source:?}"),
                kind,
            },
        }
    }

    /// A panic caught while running the protected region.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        MeasurementOutcome::Failure {
            kind: PANIC_KIND.to_string(),
            traceback: format!("{PANIC_KIND}: {message}"),
            message,
        }
    }

    /// Suffix the record is renamed to.
    pub fn terminal_suffix(&self) -> &'static str {
        match self {
            MeasurementOutcome::Success => ".json",
            MeasurementOutcome::Failure { .. } => "_error.json",
            MeasurementOutcome::Aborted => "_abort.json",
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            MeasurementOutcome::Success => TaskState::Completed,
            MeasurementOutcome::Failure { .. } => TaskState::Failed,
            MeasurementOutcome::Aborted => TaskState::Aborted,
        }
    }

    fn error_section(&self) -> ErrorSection {
        match self {
            MeasurementOutcome::Success => ErrorSection::default(),
            MeasurementOutcome::Failure {
                kind,
                message,
                traceback,
            } => ErrorSection::new(kind, message, traceback),
            MeasurementOutcome::Aborted => {
                ErrorSection::new("Abort", ABORT_DESC, "Abort signal honored by the measurement.")
            }
        }
    }
}

/// What happened to one ToDo during a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub device_id: String,
    pub measurement: String,
    pub state: TaskState,
    pub outcome: MeasurementOutcome,
    pub file_path: PathBuf,
}

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every ToDo completed.
    QueueEmpty,
    /// `pause_after_each_device` is set; the rest of the queue is left for the next run.
    PausedAfterDevice,
    /// A ToDo failed and the failure policy stops the run.
    HaltedOnFailure,
    /// The user aborted a measurement.
    Aborted,
}

/// Result of one [`ExecutionEngine::run`] invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub executed: Vec<TaskReport>,
    pub stop: StopReason,
    /// A measurement failed during this run; a UI should switch into pause mode.
    pub pause_requested: bool,
}

impl RunReport {
    fn new() -> Self {
        Self {
            executed: Vec::new(),
            stop: StopReason::QueueEmpty,
            pause_requested: false,
        }
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.executed.iter().filter(|t| t.state == state).count()
    }
}

/// Notifications for observers of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TaskStarted {
        device_id: String,
        measurement: String,
    },
    TaskFinished {
        device_id: String,
        measurement: String,
        state: TaskState,
        file_path: PathBuf,
    },
    /// Queue or result store changed.
    StateChanged { queued: usize, results: usize },
    /// The queue ran empty.
    QueueFinished,
}

/// Sequential executor of the ToDo queue.
pub struct ExecutionEngine {
    settings: Settings,
    metadata: Metadata,
    queue: VecDeque<ToDo>,
    sweeps: SweepRegistry,
    results: ResultStore,
    namer: FileNamer,
    mover: Option<Arc<dyn StageMover>>,
    peak_searcher: Option<Arc<dyn PeakSearcher>>,
    abort: AbortSignal,
    last_executed: Option<(Device, MeasurementHandle)>,
    events: broadcast::Sender<EngineEvent>,
}

impl ExecutionEngine {
    pub fn new(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            metadata: Metadata::from_settings(&settings),
            settings,
            queue: VecDeque::new(),
            sweeps: SweepRegistry::new(),
            results: ResultStore::new(),
            namer: FileNamer::new(),
            mover: None,
            peak_searcher: None,
            abort: AbortSignal::new(),
            last_executed: None,
            events,
        }
    }

    pub fn with_mover(mut self, mover: Arc<dyn StageMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    pub fn with_peak_searcher(mut self, searcher: Arc<dyn PeakSearcher>) -> Self {
        self.peak_searcher = Some(searcher);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execution flags may change between runs; they are read at the start of each run.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Handle for requesting a user abort of the running measurement.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut ResultStore {
        &mut self.results
    }

    pub fn sweeps(&self) -> &SweepRegistry {
        &self.sweeps
    }

    pub fn queue(&self) -> &VecDeque<ToDo> {
        &self.queue
    }

    pub fn enqueue(&mut self, todo: ToDo) {
        self.queue.push_back(todo);
        self.notify_state();
    }

    /// Queue one ToDo per parameter row, all sharing one sweep group.
    ///
    /// Each row gets its own copy of `template` with the row's parameters applied;
    /// the copy's `name_with_id` identifies the row in the sweep table.
    pub fn enqueue_sweep(
        &mut self,
        device: &Device,
        template: &MeasurementHandle,
        rows: &[Parameters],
    ) -> AppResult<SweepHandle> {
        if rows.is_empty() {
            return Err(DaqError::Validation("a sweep needs at least one row".into()));
        }
        let mut table = SweepTable::new();
        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            let handle = template.duplicate().with_parameters(row);
            table.push_row(&handle.name_with_id(), row.as_map().clone())?;
            handles.push(handle);
        }
        let sweep = self.sweeps.register(table);
        for handle in handles {
            self.queue.push_back(ToDo::in_sweep(device.clone(), handle, sweep));
        }
        info!(
            device = %device,
            measurement = template.name(),
            rows = rows.len(),
            "Queued sweep"
        );
        self.notify_state();
        Ok(sweep)
    }

    /// Drop the head ToDo without running it, e.g. to skip a failing device.
    pub fn discard_head(&mut self) -> Option<ToDo> {
        let todo = self.queue.pop_front();
        if let Some(t) = &todo {
            info!(
                device = %t.device,
                measurement = %t.measurement.name_with_id(),
                "Discarded ToDo"
            );
            self.notify_state();
        }
        todo
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
        self.notify_state();
    }

    /// The (device, measurement) of the most recently executed ToDo, whatever its outcome.
    pub fn last_executed(&self) -> Option<&(Device, MeasurementHandle)> {
        self.last_executed.as_ref()
    }

    /// Put a fresh copy of the last executed ToDo at the queue head.
    pub fn requeue_last(&mut self) -> bool {
        let Some((device, measurement)) = &self.last_executed else {
            return false;
        };
        let todo = ToDo::new(device.clone(), measurement.duplicate());
        self.queue.push_front(todo);
        self.notify_state();
        true
    }

    fn notify_state(&self) {
        let _ = self.events.send(EngineEvent::StateChanged {
            queued: self.queue.len(),
            results: self.results.len(),
        });
    }

    fn chip(&self) -> Chip {
        Chip::new(
            self.settings.chip.name.clone(),
            self.settings.chip.description_path.clone(),
        )
    }

    /// Execute ToDos from the queue head until the queue is empty or a stop condition hits.
    ///
    /// # Errors
    ///
    /// Infrastructure failures outside the protected region of a ToDo: the output
    /// folder, record files, sweep bookkeeping and result validation. The ToDo being
    /// executed stays at the queue head.
    pub async fn run(&mut self) -> AppResult<RunReport> {
        info!("Running experiment.");
        self.settings.validate()?;
        self.metadata = Metadata::from_settings(&self.settings);
        fs::create_dir_all(&self.settings.output.raw_output_path)?;

        let mut report = RunReport::new();
        let mut attempts = 0u32;

        if self.queue.is_empty() {
            info!("Queue is empty, nothing to execute.");
            let _ = self.events.send(EngineEvent::QueueFinished);
            return Ok(report);
        }

        loop {
            let task = self.execute_head().await?;
            let halt = match &task.outcome {
                MeasurementOutcome::Success => {
                    attempts = 0;
                    None
                }
                MeasurementOutcome::Aborted => Some(StopReason::Aborted),
                MeasurementOutcome::Failure { .. } => {
                    report.pause_requested = true;
                    attempts += 1;
                    let exec = &self.settings.execution;
                    match exec.on_failure {
                        OnFailure::Halt => Some(StopReason::HaltedOnFailure),
                        OnFailure::RetryHead if attempts >= exec.max_attempts => {
                            Some(StopReason::HaltedOnFailure)
                        }
                        OnFailure::RetryHead => {
                            warn!(attempt = attempts, "Retrying failed ToDo");
                            None
                        }
                    }
                }
            };
            report.executed.push(task);

            if let Some(reason) = halt {
                report.stop = reason;
                break;
            }
            if self.settings.execution.pause_after_each_device {
                report.stop = StopReason::PausedAfterDevice;
                break;
            }
            if self.queue.is_empty() {
                info!("Experiment and hereby all measurements finished.");
                let _ = self.events.send(EngineEvent::QueueFinished);
                report.stop = StopReason::QueueEmpty;
                break;
            }

            let wait = self.settings.execution.inter_measurement_wait;
            if !wait.is_zero() {
                info!("Waiting {:.0}s before continuing...", wait.as_secs_f64());
                tokio::time::sleep(wait).await;
            }
            // The signal is reset before each ToDo, so an abort pressed between
            // measurements has to stop the run here.
            if self.abort.is_triggered() {
                warn!("Abort requested between measurements, stopping.");
                report.stop = StopReason::Aborted;
                break;
            }
        }

        Ok(report)
    }

    async fn execute_head(&mut self) -> AppResult<TaskReport> {
        let Some(todo) = self.queue.front().cloned() else {
            return Err(DaqError::Validation("the ToDo queue is empty".into()));
        };
        let device = &todo.device;
        let measurement = &todo.measurement;
        let name_with_id = measurement.name_with_id();
        debug!(device = %device, measurement = %name_with_id, "Popped ToDo");
        let _ = self.events.send(EngineEvent::TaskStarted {
            device_id: device.id.clone(),
            measurement: name_with_id.clone(),
        });

        let missing = measurement.missing_instruments();
        if !missing.is_empty() {
            warn!(measurement = %name_with_id, ?missing, "Measurement has unassigned instruments");
        }

        // File name from chip, device, measurement and start time.
        let started = Local::now();
        let file_name = make_filename_compliant(&format!(
            "{}_id{}_{}_{}_{}",
            self.settings.chip.name,
            device.id,
            device.device_type,
            measurement.name(),
            super::document::format_timestamp(&started),
        ));
        let output = self.settings.output.raw_output_path.clone();
        let dir = match todo.sweep {
            Some(sweep) => self.sweeps.subfolder_for(sweep, &output, &file_name)?,
            None => output,
        };
        let base = self.namer.uniquify(&dir.join(&file_name))?;

        let mut doc = MeasurementRecord::new(&self.metadata, device.as_dict(), &started);
        doc.measurement_name = measurement.name().to_string();
        doc.measurement_name_and_id = name_with_id.clone();
        doc.instruments = measurement.instrument_snapshot();
        if let Some(sweep) = todo.sweep {
            doc.sweep_information = SweepInformation {
                part_of_sweep: true,
                sweep_association: self.sweeps.association(sweep)?,
            };
        }
        let mut record = RecordSink::open(&base, self.settings.execution.autosave_every, doc)?;

        self.abort.reset();
        let outcome = match AssertUnwindSafe(self.protected_region(&todo, &mut record))
            .catch_unwind()
            .await
        {
            Ok(result) => MeasurementOutcome::from_result(result),
            Err(payload) => MeasurementOutcome::from_panic(&*payload),
        };
        match &outcome {
            MeasurementOutcome::Success => {}
            MeasurementOutcome::Failure { message, .. } => {
                error!(
                    device = %device,
                    measurement = %name_with_id,
                    "Error occurred during measurement: {message}"
                );
            }
            MeasurementOutcome::Aborted => {
                warn!(device = %device, measurement = %name_with_id, "{ABORT_DESC}");
            }
        }

        // Whatever happened, the record ends up complete under its terminal name.
        let instruments = measurement.instrument_snapshot();
        let error_section = outcome.error_section();
        record.update(|doc| {
            doc.instruments = instruments;
            doc.error = error_section;
            doc.mark_finished(&Local::now());
        })?;
        let finalized = record.finalize(outcome.terminal_suffix())?;
        info!(
            measurement = %name_with_id,
            path = %finalized.path.display(),
            "Saved data of current measurement"
        );

        if let Some(sweep) = todo.sweep {
            self.sweeps.record_completion(
                sweep,
                &name_with_id,
                &finalized.path,
                &self.metadata,
                self.settings.execution.autosave_every,
            )?;
        }

        self.last_executed = Some((device.clone(), measurement.clone()));

        if outcome == MeasurementOutcome::Success {
            let value = serde_json::to_value(&finalized.document)?;
            self.results.ingest(value, &finalized.path)?;
            self.queue.pop_front();
        }

        let state = outcome.state();
        let _ = self.events.send(EngineEvent::TaskFinished {
            device_id: device.id.clone(),
            measurement: name_with_id.clone(),
            state,
            file_path: finalized.path.clone(),
        });
        self.notify_state();

        Ok(TaskReport {
            device_id: device.id.clone(),
            measurement: name_with_id,
            state,
            outcome,
            file_path: finalized.path,
        })
    }

    /// Stage movement, search for peak and the algorithm. Errors here are contained.
    async fn protected_region(
        &self,
        todo: &ToDo,
        record: &mut RecordSink,
    ) -> Result<(), MeasurementError> {
        let exec = &self.settings.execution;
        let device = &todo.device;

        if exec.auto_move_stages {
            let mover = self.mover.as_ref().ok_or_else(|| {
                DaqError::Collaborator(
                    "automatic stage movement is enabled but no stage mover is configured".into(),
                )
            })?;
            mover
                .move_to_device(&self.chip(), device)
                .await
                .map_err(|e| MeasurementError::failed("StageMoveError", e))?;
            info!(device = %device, "Automatically moved to device");
        }

        if exec.search_for_peak {
            let searcher = self.peak_searcher.as_ref().ok_or_else(|| {
                DaqError::Collaborator(
                    "search for peak is enabled but no peak searcher is configured".into(),
                )
            })?;
            searcher
                .update_params_from_savefile()
                .await
                .map_err(|e| MeasurementError::failed("PeakSearchError", e))?;
            let found = searcher
                .search_for_peak()
                .await
                .map_err(|e| MeasurementError::failed("PeakSearchError", e))?;
            record.update(|doc| doc.search_for_peak = Some(found))?;
            info!("Search for peak done.");
        } else {
            debug!("Search for peak not enabled. Not executing automatic search for peak.");
        }

        info!(
            measurement = %todo.measurement.name_with_id(),
            device = %device,
            "Executing measurement"
        );
        todo.measurement.measure(device, record, &self.abort).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::DummyMeas;
    use anyhow::anyhow;
    use tracing_test::traced_test;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            MeasurementOutcome::from_result(Ok(())),
            MeasurementOutcome::Success
        );
        assert_eq!(
            MeasurementOutcome::from_result(Err(MeasurementError::Aborted)).terminal_suffix(),
            "_abort.json"
        );
        let failed = MeasurementOutcome::from_result(Err(MeasurementError::failed(
            "ValueError",
            anyhow!("x"),
        )));
        match &failed {
            MeasurementOutcome::Failure {
                kind,
                message,
                traceback,
            } => {
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "x");
                assert!(traceback.starts_with("ValueError"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(failed.terminal_suffix(), "_error.json");
        assert_eq!(failed.state(), TaskState::Failed);
    }

    #[test]
    fn test_panic_payload_becomes_failure() {
        let outcome = MeasurementOutcome::from_panic(&"index out of bounds");
        assert_eq!(
            outcome,
            MeasurementOutcome::Failure {
                kind: "Panic".into(),
                message: "index out of bounds".into(),
                traceback: "Panic: index out of bounds".into(),
            }
        );
        let owned = MeasurementOutcome::from_panic(&String::from("len is 0"));
        assert_eq!(owned.terminal_suffix(), "_error.json");
        let opaque = MeasurementOutcome::from_panic(&42_u8);
        assert!(matches!(opaque, MeasurementOutcome::Failure { ref message, .. }
            if message.contains("non-string")));
    }

    #[test]
    fn test_abort_error_section_is_fixed() {
        let section = MeasurementOutcome::Aborted.error_section();
        assert_eq!(section.kind.as_deref(), Some("Abort"));
        assert_eq!(section.desc.as_deref(), Some("Measurement aborted by user."));
    }

    #[tokio::test]
    async fn test_empty_queue_returns_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.output.raw_output_path = dir.path().to_path_buf();
        let mut engine = ExecutionEngine::new(settings);
        let report = engine.run().await.unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.stop, StopReason::QueueEmpty);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_logs_queue_completion() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.output.raw_output_path = dir.path().to_path_buf();
        let mut engine = ExecutionEngine::new(settings);
        engine.enqueue(ToDo::new(
            Device::new("D1", "grating"),
            MeasurementHandle::new(Arc::new(DummyMeas)),
        ));

        engine.run().await.unwrap();

        assert!(logs_contain("Saved data of current measurement"));
        assert!(logs_contain("Experiment and hereby all measurements finished."));
    }
}
