//! In-memory collection of finished measurement records.
//!
//! The store holds every successfully finished record of a session, plus records
//! loaded back from disk. Each record is keyed by a fingerprint built from its
//! start timestamp, device id, device type and measurement name; a second record
//! with the same fingerprint is rejected.
//!
//! Observers (a GUI table, a plotter) subscribe to [`StoreEvent`]s.

use crate::error::{AppResult, DaqError};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info};

const TIMESTAMP_KEYS: [&str; 3] = ["timestamp start", "timestamp", "timestamp end"];
const NAME_KEYS: [&str; 2] = ["measurement name", "name"];

/// Change notification sent to store observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(String),
    Removed(String),
}

/// A finished record together with the keys resolved at ingest time.
#[derive(Debug, Clone)]
pub struct StoredMeasurement {
    pub fingerprint: String,
    pub file_path: PathBuf,
    /// First present of `timestamp start`, `timestamp`, `timestamp end`.
    pub timestamp_known: String,
    /// `timestamp iso start` if present, else `timestamp_known`.
    pub timestamp_iso_known: String,
    /// First present of `measurement name`, `name`.
    pub name_known: String,
    pub record: Value,
}

/// Render a JSON scalar the way it reads in a file name: strings without quotes.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The duplicate-detection key of a record. Not cryptographic.
pub fn fingerprint(timestamp_iso: &str, device_id: &str, device_type: &str, name: &str) -> String {
    format!("{timestamp_iso}{device_id}{device_type}{name}")
}

/// Deduplicated, observable collection of finished records.
#[derive(Debug)]
pub struct ResultStore {
    entries: Vec<StoredMeasurement>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Vec::new(),
            events,
        }
    }

    /// Subscribe to additions and removals.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Validate a record and add it to the store.
    ///
    /// # Errors
    ///
    /// - [`DaqError::MissingKey`] if `chip`, `device`, `device.id`, `device.type`, a
    ///   timestamp alias, a name alias or `values` is missing
    /// - [`DaqError::Validation`] if `values` is empty or not an object or array
    /// - [`DaqError::DuplicateMeasurement`] if the fingerprint is already present
    pub fn ingest(&mut self, record: Value, file_path: impl Into<PathBuf>) -> AppResult<String> {
        let entry = Self::validate(record, file_path.into())?;
        if self.contains(&entry.fingerprint) {
            return Err(DaqError::DuplicateMeasurement(entry.fingerprint));
        }
        let fp = entry.fingerprint.clone();
        info!(
            name = %entry.name_known,
            path = %entry.file_path.display(),
            "Added measurement to result store"
        );
        self.entries.push(entry);
        let _ = self.events.send(StoreEvent::Added(fp.clone()));
        Ok(fp)
    }

    /// Read a record from disk and ingest it.
    pub fn load_file(&mut self, path: &Path) -> AppResult<String> {
        let text = fs::read_to_string(path)?;
        let record: Value = serde_json::from_str(&text)?;
        self.ingest(record, path)
    }

    fn validate(record: Value, file_path: PathBuf) -> AppResult<StoredMeasurement> {
        let obj = record
            .as_object()
            .ok_or_else(|| DaqError::Validation("record is not a JSON object".into()))?;

        if !obj.contains_key("chip") {
            return Err(DaqError::MissingKey("chip".into()));
        }
        let device = obj
            .get("device")
            .ok_or_else(|| DaqError::MissingKey("device".into()))?;
        let mut identity = Vec::with_capacity(2);
        for key in ["id", "type"] {
            let v = device
                .get(key)
                .ok_or_else(|| DaqError::MissingKey(format!("device->{key}")))?;
            identity.push(plain(v));
        }

        let timestamp_known = TIMESTAMP_KEYS
            .iter()
            .find_map(|k| obj.get(*k))
            .map(plain)
            .ok_or_else(|| {
                DaqError::MissingKey(r#""timestamp" or "timestamp end" or "timestamp start""#.into())
            })?;
        let name_known = NAME_KEYS
            .iter()
            .find_map(|k| obj.get(*k))
            .map(plain)
            .ok_or_else(|| DaqError::MissingKey(r#""measurement name" or "name""#.into()))?;
        let timestamp_iso_known = obj
            .get("timestamp iso start")
            .map(plain)
            .unwrap_or_else(|| timestamp_known.clone());

        let values_len = match obj.get("values") {
            Some(Value::Object(m)) => m.len(),
            Some(Value::Array(a)) => a.len(),
            Some(other) => {
                return Err(DaqError::Validation(format!(
                    "values must be a JSON object or array, got {other}"
                )))
            }
            None => return Err(DaqError::MissingKey("values".into())),
        };
        if values_len == 0 {
            return Err(DaqError::Validation(
                "Measurement record needs to contain at least one values dict.".into(),
            ));
        }

        let fp = fingerprint(&timestamp_iso_known, &identity[0], &identity[1], &name_known);
        Ok(StoredMeasurement {
            fingerprint: fp,
            file_path,
            timestamp_known,
            timestamp_iso_known,
            name_known,
            record,
        })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.iter().any(|e| e.fingerprint == fingerprint)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&StoredMeasurement> {
        self.entries.iter().find(|e| e.fingerprint == fingerprint)
    }

    /// Remove by fingerprint. Returns the removed entry, if any.
    pub fn remove(&mut self, fingerprint: &str) -> Option<StoredMeasurement> {
        let idx = self.entries.iter().position(|e| e.fingerprint == fingerprint)?;
        let entry = self.entries.remove(idx);
        debug!(fingerprint, "Removed measurement from result store");
        let _ = self.events.send(StoreEvent::Removed(entry.fingerprint.clone()));
        Some(entry)
    }

    /// Remove the entry whose fingerprint matches `record`.
    pub fn remove_record(&mut self, record: &Value) -> AppResult<Option<StoredMeasurement>> {
        let probe = Self::validate(record.clone(), PathBuf::new())?;
        Ok(self.remove(&probe.fingerprint))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredMeasurement> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(values: Value) -> Value {
        json!({
            "chip": {"name": "wafer7"},
            "device": {"id": "D1", "type": "grating"},
            "timestamp start": "2024-01-01_120000",
            "timestamp iso start": "2024-01-01T12:00:00.000001",
            "measurement name": "DummyMeas",
            "values": values,
        })
    }

    #[test]
    fn test_ingest_and_fingerprint() {
        let mut store = ResultStore::new();
        let fp = store.ingest(record(json!({"p": [1]})), "/tmp/a.json").unwrap();
        assert_eq!(fp, "2024-01-01T12:00:00.000001D1gratingDummyMeas");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&fp).unwrap().timestamp_known, "2024-01-01_120000");
    }

    #[test]
    fn test_duplicate_fingerprint_rejected_even_with_other_content() {
        let mut store = ResultStore::new();
        store.ingest(record(json!({"p": [1]})), "/tmp/a.json").unwrap();
        let err = store
            .ingest(record(json!({"p": [2, 3]})), "/tmp/b.json")
            .unwrap_err();
        assert!(matches!(err, DaqError::DuplicateMeasurement(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_values_rejected() {
        let mut store = ResultStore::new();
        let err = store.ingest(record(json!({})), "/tmp/a.json").unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
    }

    #[test]
    fn test_null_and_scalar_values_rejected() {
        let mut store = ResultStore::new();
        for values in [Value::Null, json!(0), json!(""), json!(true)] {
            let err = store
                .ingest(record(values.clone()), "/tmp/a.json")
                .unwrap_err();
            assert!(matches!(err, DaqError::Validation(_)), "{values}: {err}");
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_device_type_names_the_key() {
        let mut rec = record(json!({"p": [1]}));
        rec["device"].as_object_mut().unwrap().remove("type");
        let err = ResultStore::new().ingest(rec, "/tmp/a.json").unwrap_err();
        match err {
            DaqError::MissingKey(k) => assert_eq!(k, "device->type"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_name_and_timestamp_aliases() {
        let rec = json!({
            "chip": {},
            "device": {"id": 4, "type": "ring"},
            "timestamp end": "2024-02-02_101010",
            "name": "legacy",
            "values": {"v": 1},
        });
        let mut store = ResultStore::new();
        let fp = store.ingest(rec, "/tmp/legacy.json").unwrap();
        assert_eq!(fp, "2024-02-02_1010104ringlegacy");
    }

    #[test]
    fn test_remove_notifies_observers() {
        let mut store = ResultStore::new();
        let mut rx = store.subscribe();
        let rec = record(json!({"p": [1]}));
        let fp = store.ingest(rec.clone(), "/tmp/a.json").unwrap();
        assert!(store.remove_record(&rec).unwrap().is_some());
        assert!(store.is_empty());

        assert_eq!(rx.try_recv().unwrap(), StoreEvent::Added(fp.clone()));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::Removed(fp));
    }
}
