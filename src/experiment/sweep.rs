//! Sweep aggregation.
//!
//! A sweep is a set of ToDos that run the same measurement with different
//! parameters. Its members write their records into one shared subfolder, and
//! their progress rolls up into one shared summary file,
//! `<subfolder>/<subfolder>_sweep_summary.json`.
//!
//! The [`SweepRegistry`] owns every sweep group; ToDos only carry a
//! [`SweepHandle`] into it. The subfolder is named and created by whichever member
//! runs first, and the summary record is opened on the first completion and
//! republished after every later one.

use crate::data::DurableRecord;
use crate::error::{AppResult, DaqError};
use crate::metadata::Metadata;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Terminal suffix of the summary record, appended to `<subfolder>_sweep_summary`.
const SUMMARY_STEM_SUFFIX: &str = "_sweep_summary";

/// Non-owning reference to a sweep group in a [`SweepRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SweepHandle(usize);

impl SweepHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One parameter combination of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRow {
    /// Identity of the ToDo that runs this row (`measurement name and id`).
    pub id: String,
    pub parameters: Map<String, Value>,
    pub finished: bool,
    pub file_path: Option<PathBuf>,
}

/// The parameter table of a sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepTable {
    rows: Vec<SweepRow>,
}

impl SweepTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row. Row ids must be unique.
    pub fn push_row(&mut self, id: &str, parameters: Map<String, Value>) -> AppResult<()> {
        if self.row(id).is_some() {
            return Err(DaqError::DuplicateSweepId(id.to_string()));
        }
        self.rows.push(SweepRow {
            id: id.to_string(),
            parameters,
            finished: false,
            file_path: None,
        });
        Ok(())
    }

    pub fn rows(&self) -> &[SweepRow] {
        &self.rows
    }

    pub fn row(&self, id: &str) -> Option<&SweepRow> {
        self.rows.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn mark_finished(&mut self, id: &str, file_path: &Path) -> bool {
        match self.rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.finished = true;
                row.file_path = Some(file_path.to_path_buf());
                true
            }
            None => false,
        }
    }

    fn row_object(row: &SweepRow) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(row.id.clone()));
        for (k, v) in &row.parameters {
            obj.insert(k.clone(), v.clone());
        }
        obj
    }

    /// Rows keyed by id, without bookkeeping columns. Written into member records.
    pub fn association(&self) -> Map<String, Value> {
        self.rows
            .iter()
            .map(|row| (row.id.clone(), Value::Object(Self::row_object(row))))
            .collect()
    }

    /// Rows keyed by id with `finished` and `file_path`. Written into the summary.
    pub fn association_list(&self) -> Map<String, Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = Self::row_object(row);
                obj.insert("finished".into(), Value::Bool(row.finished));
                obj.insert(
                    "file_path".into(),
                    row.file_path
                        .as_ref()
                        .map(|p| Value::String(p.display().to_string()))
                        .unwrap_or(Value::Null),
                );
                (row.id.clone(), Value::Object(obj))
            })
            .collect()
    }
}

/// State shared by all ToDos of one sweep.
#[derive(Debug)]
pub struct SweepGroup {
    table: SweepTable,
    subfolder: Option<PathBuf>,
    summary: Option<DurableRecord<Map<String, Value>>>,
    summary_path: Option<PathBuf>,
}

impl SweepGroup {
    pub fn table(&self) -> &SweepTable {
        &self.table
    }

    /// Subfolder assigned by the first member to run.
    pub fn subfolder(&self) -> Option<&Path> {
        self.subfolder.as_deref()
    }

    /// Path of the last published summary.
    pub fn summary_path(&self) -> Option<&Path> {
        self.summary_path.as_deref()
    }
}

/// Owner of all sweep groups of an engine.
#[derive(Debug, Default)]
pub struct SweepRegistry {
    groups: Vec<SweepGroup>,
}

impl SweepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: SweepTable) -> SweepHandle {
        self.groups.push(SweepGroup {
            table,
            subfolder: None,
            summary: None,
            summary_path: None,
        });
        SweepHandle(self.groups.len() - 1)
    }

    pub fn group(&self, handle: SweepHandle) -> AppResult<&SweepGroup> {
        self.groups
            .get(handle.0)
            .ok_or(DaqError::UnknownSweep(handle.0))
    }

    fn group_mut(&mut self, handle: SweepHandle) -> AppResult<&mut SweepGroup> {
        self.groups
            .get_mut(handle.0)
            .ok_or(DaqError::UnknownSweep(handle.0))
    }

    /// Directory the member records of `handle` go into.
    ///
    /// The first call creates `output_dir/name`; it is an error for that folder to
    /// exist already. Later calls return the same folder and ignore `name`.
    pub fn subfolder_for(
        &mut self,
        handle: SweepHandle,
        output_dir: &Path,
        name: &str,
    ) -> AppResult<PathBuf> {
        let group = self.group_mut(handle)?;
        if let Some(dir) = &group.subfolder {
            return Ok(dir.clone());
        }
        let dir = output_dir.join(name);
        fs::create_dir(&dir).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => DaqError::SweepFolderExists(dir.clone()),
            _ => DaqError::Io(e),
        })?;
        info!(sweep = handle.0, dir = %dir.display(), "Created sweep subfolder");
        group.subfolder = Some(dir.clone());
        Ok(dir)
    }

    /// Row association written into the record of a member ToDo.
    pub fn association(&self, handle: SweepHandle) -> AppResult<Map<String, Value>> {
        Ok(self.group(handle)?.table.association())
    }

    /// Mark the row of a finished member and republish the summary.
    ///
    /// Called for every outcome, success or not. Returns the summary path.
    pub fn record_completion(
        &mut self,
        handle: SweepHandle,
        row_id: &str,
        final_path: &Path,
        metadata: &Metadata,
        flush_every: usize,
    ) -> AppResult<PathBuf> {
        let group = self.group_mut(handle)?;
        if !group.table.mark_finished(row_id, final_path) {
            return Err(DaqError::SweepRowMissing {
                sweep: handle.0,
                id: row_id.to_string(),
            });
        }

        let summary = match group.summary.take() {
            Some(summary) => summary,
            None => {
                let dir = group
                    .subfolder
                    .clone()
                    .or_else(|| final_path.parent().map(Path::to_path_buf))
                    .unwrap_or_default();
                let stem = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("sweep{}", handle.0));
                let base = dir.join(format!("{stem}{SUMMARY_STEM_SUFFIX}"));
                let mut record = DurableRecord::open_map(base, flush_every)?;
                record.update(|doc| metadata.write_into(doc))??;
                record
            }
        };
        let summary = group.summary.insert(summary);
        summary.set("sweep_association_list", group.table.association_list())?;
        let path = summary.publish(".json")?;
        debug!(sweep = handle.0, row = row_id, path = %path.display(), "Updated sweep summary");
        group.summary_path = Some(path.clone());
        Ok(path)
    }
}
