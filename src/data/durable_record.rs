//! Crash-resilient, incrementally flushed JSON documents.
//!
//! A [`DurableRecord`] accumulates the output of one measurement in memory and
//! mirrors it to `<base>.json.part` every `flush_every` writes and on every explicit
//! [`save`](DurableRecord::save). Only [`finalize`](DurableRecord::finalize) makes the
//! record visible under its terminal name, by renaming the temp file to
//! `<base><terminal_suffix>`. The rename is atomic on one filesystem, so a terminal
//! file is either absent or complete; a crash mid-flush can only damage the `.part` file.
//!
//! ```text
//! open(base) ──► base.json.part (created, exclusive)
//!    │ set / update ... every Nth write rewrites base.json.part
//!    ▼
//! finalize("_error.json") ──► rename(base.json.part, base_error.json)
//! ```
//!
//! The temp file is created with `create_new`, so at most one record can target a
//! given temp path at a time.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Suffix of the file a record mirrors itself to before it is finalized.
pub const TEMP_SUFFIX: &str = ".json.part";

/// Append a suffix to the last path component, without treating it as an extension.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = base.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn create_temp(path: &Path) -> AppResult<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => DaqError::RecordInUse(path.to_path_buf()),
            _ => DaqError::Io(e),
        })
}

/// A document that survives crashes of its writer.
#[derive(Debug)]
pub struct DurableRecord<T: Serialize> {
    doc: T,
    base: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    flush_every: usize,
    writes_since_flush: usize,
    auto_save: bool,
}

/// A record after its temp file has been renamed to the terminal name.
#[derive(Debug, Clone)]
pub struct Finalized<T> {
    pub document: T,
    pub path: PathBuf,
}

impl<T: Serialize> DurableRecord<T> {
    /// Create a record at `base`, writing the initial document to `base.json.part`.
    ///
    /// Fails with [`DaqError::RecordInUse`] if the temp file already exists.
    pub fn open(base: impl Into<PathBuf>, flush_every: usize, doc: T) -> AppResult<Self> {
        let base = base.into();
        let temp_path = with_suffix(&base, TEMP_SUFFIX);
        let file = create_temp(&temp_path)?;
        let mut record = Self {
            doc,
            base,
            temp_path,
            file: Some(file),
            flush_every: flush_every.max(1),
            writes_since_flush: 0,
            auto_save: true,
        };
        record.save()?;
        debug!(path = %record.temp_path.display(), "Opened durable record");
        Ok(record)
    }

    pub fn document(&self) -> &T {
        &self.doc
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Number of writes since the last flush.
    pub fn pending_writes(&self) -> usize {
        self.writes_since_flush
    }

    /// Enable or disable the periodic flush. Explicit saves still write.
    pub fn set_auto_save(&mut self, enabled: bool) {
        self.auto_save = enabled;
    }

    /// Apply one mutation to the document. Counts as a single write.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> AppResult<R> {
        let out = f(&mut self.doc);
        self.touch()?;
        Ok(out)
    }

    fn touch(&mut self) -> AppResult<()> {
        self.writes_since_flush += 1;
        if self.auto_save && self.writes_since_flush >= self.flush_every {
            self.save()?;
        }
        Ok(())
    }

    /// Write the full document to the temp file and sync it.
    pub fn save(&mut self) -> AppResult<()> {
        let file = match self.file.take() {
            Some(f) => f,
            None => create_temp(&self.temp_path)?,
        };
        let file = self.file.insert(file);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        {
            let mut writer = BufWriter::new(&mut *file);
            serde_json::to_writer_pretty(&mut writer, &self.doc)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        file.sync_data()?;
        self.writes_since_flush = 0;
        trace!(path = %self.temp_path.display(), "Flushed durable record");
        Ok(())
    }

    /// Same as [`save`](Self::save); kept for symmetry with file-like handles.
    pub fn close(&mut self) -> AppResult<()> {
        self.save()
    }

    /// Flush and atomically rename the temp file to `base + terminal_suffix`,
    /// keeping the record open. The next save recreates the temp file.
    ///
    /// Used for documents that are republished several times, like sweep summaries.
    pub fn publish(&mut self, terminal_suffix: &str) -> AppResult<PathBuf> {
        self.save()?;
        self.file = None;
        let terminal = with_suffix(&self.base, terminal_suffix);
        fs::rename(&self.temp_path, &terminal)?;
        debug!(path = %terminal.display(), "Published durable record");
        Ok(terminal)
    }

    /// Flush, disable further auto-flush and rename to the terminal name.
    pub fn finalize(mut self, terminal_suffix: &str) -> AppResult<Finalized<T>> {
        self.auto_save = false;
        let path = self.publish(terminal_suffix)?;
        Ok(Finalized {
            document: self.doc,
            path,
        })
    }
}

impl DurableRecord<Map<String, Value>> {
    /// Open an empty key/value record.
    pub fn open_map(base: impl Into<PathBuf>, flush_every: usize) -> AppResult<Self> {
        Self::open(base, flush_every, Map::new())
    }

    /// Insert or replace `key`. May trigger a flush.
    pub fn set(&mut self, key: &str, value: impl Serialize) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.update(|doc| {
            doc.insert(key.to_string(), value);
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_flushes_every_nth_write() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("meas");
        let mut rec = DurableRecord::open_map(&base, 3).unwrap();

        rec.set("a", 1).unwrap();
        rec.set("b", 2).unwrap();
        assert_eq!(rec.pending_writes(), 2);
        assert_eq!(read_json(rec.temp_path()), json!({}));

        rec.set("c", 3).unwrap();
        assert_eq!(rec.pending_writes(), 0);
        assert_eq!(read_json(rec.temp_path()), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_disabled_auto_save_only_writes_on_save() {
        let dir = TempDir::new().unwrap();
        let mut rec = DurableRecord::open_map(dir.path().join("m"), 1).unwrap();
        rec.set_auto_save(false);
        rec.set("a", 1).unwrap();
        assert_eq!(read_json(rec.temp_path()), json!({}));
        rec.close().unwrap();
        assert_eq!(read_json(rec.temp_path()), json!({"a": 1}));
    }

    #[test]
    fn test_finalize_renames_to_terminal_suffix() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("chip_idD1_grating");
        let mut rec = DurableRecord::open_map(&base, 50).unwrap();
        rec.set("values", json!({"x": [1, 2]})).unwrap();

        assert!(!with_suffix(&base, ".json").exists());
        let done = rec.finalize("_error.json").unwrap();

        assert_eq!(done.path, with_suffix(&base, "_error.json"));
        assert!(!with_suffix(&base, TEMP_SUFFIX).exists());
        assert_eq!(read_json(&done.path)["values"]["x"], json!([1, 2]));
        assert_eq!(done.document["values"]["x"][1], 2);
    }

    #[test]
    fn test_second_writer_on_same_temp_path_rejected() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("m");
        let _first = DurableRecord::open_map(&base, 50).unwrap();
        let err = DurableRecord::open_map(&base, 50).unwrap_err();
        assert!(matches!(err, DaqError::RecordInUse(_)));
    }

    #[test]
    fn test_publish_replaces_terminal_file_and_keeps_record_open() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("sweep");
        let mut rec = DurableRecord::open_map(&base, 50).unwrap();
        rec.set("rows", 1).unwrap();
        let path = rec.publish("_sweep_summary.json").unwrap();
        assert_eq!(read_json(&path)["rows"], 1);

        rec.set("rows", 2).unwrap();
        let again = rec.publish("_sweep_summary.json").unwrap();
        assert_eq!(path, again);
        assert_eq!(read_json(&path)["rows"], 2);
        assert!(!rec.temp_path().exists());
    }

    #[test]
    fn test_interrupted_flush_never_damages_terminal_file() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("m");
        let mut rec = DurableRecord::open_map(&base, 1).unwrap();
        rec.set("values", json!({"p": [1.0, 2.0, 3.0]})).unwrap();
        let terminal = rec.finalize(".json").unwrap().path;

        // A writer killed halfway through a flush of the next record.
        let temp = with_suffix(&base, TEMP_SUFFIX);
        fs::write(&temp, b"{\n  \"values\": {\n    \"p\": [1.0, 2.").unwrap();

        assert!(serde_json::from_str::<Value>(&fs::read_to_string(&temp).unwrap()).is_err());
        assert_eq!(read_json(&terminal)["values"]["p"], json!([1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_with_suffix_keeps_dots_in_name() {
        let p = with_suffix(Path::new("/tmp/a.b_c"), ".json.part");
        assert_eq!(p, PathBuf::from("/tmp/a.b_c.json.part"));
    }
}
