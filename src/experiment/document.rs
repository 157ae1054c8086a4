//! Measurement record document.
//!
//! The typed form of the JSON file written for every executed ToDo. Field order
//! is the on-disk key order:
//!
//! ```text
//! software, experiment settings, chip          (provenance header)
//! device
//! timestamp start, timestamp iso start, timestamp
//! measurement name, measurement name and id
//! instruments, measurement settings
//! values                                       (free-form, written by the algorithm)
//! error                                        (empty unless failed or aborted)
//! sweep_information
//! finished
//! search for peak
//! timestamp end                                (only once finished)
//! ```
//!
//! Keys that a measurement adds beyond this schema are kept in `extra` and written
//! after the known ones.

use crate::data::DurableRecord;
use crate::error::AppResult;
use crate::metadata::{ChipInfo, ExperimentSettingsInfo, Metadata, SoftwareInfo};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Format of `timestamp`, `timestamp start` and `timestamp end`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Format of `timestamp iso start`.
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A measurement record sink as handed to measurement algorithms.
pub type RecordSink = DurableRecord<MeasurementRecord>;

pub fn format_timestamp(t: &DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_iso(t: &DateTime<Local>) -> String {
    t.format(ISO_FORMAT).to_string()
}

/// The `error` section. Empty on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSection {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorSection {
    pub fn new(kind: &str, desc: &str, traceback: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            desc: Some(desc.to_string()),
            traceback: Some(traceback.to_string()),
            extra: Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.desc.is_none() && self.extra.is_empty()
    }
}

/// The `sweep_information` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepInformation {
    pub part_of_sweep: bool,
    /// Every row of the sweep table keyed by row id, without bookkeeping columns.
    #[serde(default)]
    pub sweep_association: Map<String, Value>,
}

/// One measurement's output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub software: SoftwareInfo,
    #[serde(rename = "experiment settings")]
    pub experiment_settings: ExperimentSettingsInfo,
    pub chip: ChipInfo,
    pub device: Value,
    #[serde(rename = "timestamp start")]
    pub timestamp_start: String,
    #[serde(rename = "timestamp iso start")]
    pub timestamp_iso_start: String,
    pub timestamp: String,
    #[serde(rename = "measurement name")]
    pub measurement_name: String,
    #[serde(rename = "measurement name and id")]
    pub measurement_name_and_id: String,
    pub instruments: Value,
    #[serde(rename = "measurement settings", default)]
    pub measurement_settings: Map<String, Value>,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub error: ErrorSection,
    #[serde(default)]
    pub sweep_information: SweepInformation,
    #[serde(default)]
    pub finished: bool,
    #[serde(rename = "search for peak", default)]
    pub search_for_peak: Option<Value>,
    #[serde(
        rename = "timestamp end",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp_end: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MeasurementRecord {
    /// Start a new record with the provenance header and start timestamps filled in.
    pub fn new(metadata: &Metadata, device: Value, started: &DateTime<Local>) -> Self {
        let ts = format_timestamp(started);
        Self {
            software: metadata.software.clone(),
            experiment_settings: metadata.experiment_settings.clone(),
            chip: metadata.chip.clone(),
            device,
            timestamp_start: ts.clone(),
            timestamp_iso_start: format_iso(started),
            timestamp: ts,
            measurement_name: String::new(),
            measurement_name_and_id: String::new(),
            instruments: Value::Object(Map::new()),
            measurement_settings: Map::new(),
            values: Map::new(),
            error: ErrorSection::default(),
            sweep_information: SweepInformation::default(),
            finished: false,
            search_for_peak: None,
            timestamp_end: None,
            extra: Map::new(),
        }
    }

    /// Stamp the end time and mark the record finished.
    pub fn mark_finished(&mut self, ended: &DateTime<Local>) {
        let ts = format_timestamp(ended);
        self.timestamp = ts.clone();
        self.timestamp_end = Some(ts);
        self.finished = true;
    }
}

impl DurableRecord<MeasurementRecord> {
    /// Write one entry of the `values` section. May trigger a flush.
    pub fn set_value(&mut self, key: &str, value: impl Serialize) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.update(|rec| {
            rec.values.insert(key.to_string(), value);
        })
    }

    /// Append one point to an array entry of the `values` section, creating it if needed.
    pub fn push_value(&mut self, key: &str, value: impl Serialize) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.update(|rec| {
            let slot = rec
                .values
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => items.push(value),
                other => *other = Value::Array(vec![other.take(), value]),
            }
        })
    }

    /// Write one entry of the `measurement settings` section.
    pub fn set_measurement_setting(&mut self, key: &str, value: impl Serialize) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.update(|rec| {
            rec.measurement_settings.insert(key.to_string(), value);
        })
    }

    /// Write a top-level key outside the fixed schema.
    pub fn set_extra(&mut self, key: &str, value: impl Serialize) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.update(|rec| {
            rec.extra.insert(key.to_string(), value);
        })
    }
}
