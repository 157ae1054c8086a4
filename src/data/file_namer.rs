//! Collision-free base names for output files.
//!
//! A base path is "taken" when any directory entry next to it has a name that
//! starts with the base name: `chip_idD1` collides with `chip_idD1.json`,
//! `chip_idD1_error.json` and `chip_idD1_sweep_summary.json` alike. Taken bases get
//! `_2`, `_3`, ... appended until a free prefix is found.
//!
//! The namer also remembers what it handed out, so two calls in a row never return
//! the same path even if the caller has not created the file yet. A remembered name
//! is forgotten once a file with that prefix shows up on disk.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const NON_COMPLIANT_PATTERN: &str = r"[^A-Za-z0-9._\-]+";

/// Runs of characters that are unsafe in file names.
#[allow(clippy::panic)]
static NON_COMPLIANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(NON_COMPLIANT_PATTERN)
        .unwrap_or_else(|e| panic!("file name pattern failed to compile: {e}"))
});

/// Replace every run of characters that are unsafe in file names with `_`.
pub fn make_filename_compliant(name: &str) -> String {
    NON_COMPLIANT.replace_all(name, "_").into_owned()
}

/// Generates base paths that do not collide with existing files.
#[derive(Debug, Default)]
pub struct FileNamer {
    handed_out: HashSet<PathBuf>,
}

impl FileNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `desired` if nothing on disk or previously handed out starts with it,
    /// otherwise the first free `desired_N` for N = 2, 3, ...
    pub fn uniquify(&mut self, desired: &Path) -> io::Result<PathBuf> {
        self.forget_materialized();
        let mut candidate = desired.to_path_buf();
        let mut idx = 2u32;
        while self.is_taken(&candidate)? {
            let mut name = desired.as_os_str().to_owned();
            name.push(format!("_{idx}"));
            candidate = PathBuf::from(name);
            idx += 1;
        }
        self.handed_out.insert(candidate.clone());
        Ok(candidate)
    }

    /// Drop remembered names whose files exist; the directory scan covers them now.
    fn forget_materialized(&mut self) {
        self.handed_out
            .retain(|p| !prefix_exists(p).unwrap_or(false));
    }

    /// Names handed out whose files have not been seen on disk yet.
    pub fn pending(&self) -> usize {
        self.handed_out.len()
    }

    fn is_taken(&self, candidate: &Path) -> io::Result<bool> {
        let prefix = candidate.as_os_str().to_string_lossy();
        if self
            .handed_out
            .iter()
            .any(|p| p.as_os_str().to_string_lossy().starts_with(prefix.as_ref()))
        {
            return Ok(true);
        }
        prefix_exists(candidate)
    }
}

/// True if any entry in the parent directory has a name starting with the file name of `base`.
pub fn prefix_exists(base: &Path) -> io::Result<bool> {
    let Some(stem) = base.file_name().map(OsStr::to_string_lossy) else {
        return Ok(base.exists());
    };
    let parent = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        if entry?.file_name().to_string_lossy().starts_with(stem.as_ref()) {
            return Ok(true);
        }
    }
    Ok(false)
}
