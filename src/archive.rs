//! Run archive
//!
//! Read-only view over the run logs a [`Recorder`](crate::session::Recorder)
//! leaves in its data directory. Listing and loading never touch the active
//! session; a log that is still being written simply shows its current lines.

use crate::error::{Result, TestbedError};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOG_EXTENSION: &str = "jsonl";
const LOG_PREFIX: &str = "testbed_";

/// One archived run log
#[derive(Debug, Clone, Serialize)]
pub struct RunFile {
    pub path: PathBuf,
    pub name: String,
    /// Human readable label, the open time when the name carries one
    pub display: String,
    pub size_bytes: u64,
}

/// Parsed contents of a run log
#[derive(Debug, Clone, Serialize)]
pub struct LoadedRun {
    pub path: PathBuf,
    pub records: Vec<Value>,
    /// Lines that were not valid JSON
    pub skipped: usize,
}

/// List run logs in `data_dir`, oldest first.
///
/// A missing directory is an empty archive.
pub fn list_runs(data_dir: &Path) -> Result<Vec<RunFile>> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        runs.push(RunFile {
            display: display_name(&name),
            path,
            name,
            size_bytes: metadata.len(),
        });
    }
    runs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(runs)
}

/// `testbed_20250101_120000.jsonl` → `2025-01-01 12:00:00`
fn display_name(file_name: &str) -> String {
    let stem = file_name
        .strip_suffix(LOG_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(file_name);
    let stamp = stem.strip_prefix(LOG_PREFIX).unwrap_or(stem);

    // Collision suffixes (`_1`, `_2`, ...) follow the 15 character timestamp
    let (head, tail) = match (stamp.get(..15), stamp.get(15..)) {
        (Some(head), Some(tail)) => (head, tail),
        _ => (stamp, ""),
    };
    match NaiveDateTime::parse_from_str(head, "%Y%m%d_%H%M%S") {
        Ok(at) => {
            let label = at.format("%Y-%m-%d %H:%M:%S").to_string();
            match tail.strip_prefix('_') {
                Some(n) if !n.is_empty() => format!("{} ({})", label, n),
                _ => label,
            }
        }
        Err(_) => stamp.to_string(),
    }
}

/// Load every parsable line of a run log.
///
/// `path` may be absolute, relative to the working directory, or a bare file
/// name inside `data_dir`. Anything resolving outside `data_dir` is refused.
pub fn load_run(data_dir: &Path, path: &Path) -> Result<LoadedRun> {
    let resolved = resolve(data_dir, path)?;
    let file = File::open(&resolved)?;

    let mut records = Vec::new();
    let mut skipped = 0;
    // Raw bytes: a torn write can leave a line that is not even UTF-8
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Value>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                debug!(path = %resolved.display(), error = %e, "Skipping unparsable log line");
            }
        }
    }

    Ok(LoadedRun {
        path: resolved,
        records,
        skipped,
    })
}

fn resolve(data_dir: &Path, path: &Path) -> Result<PathBuf> {
    let candidate = if path.is_absolute() || path.starts_with(data_dir) {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    };

    let root = data_dir
        .canonicalize()
        .map_err(|_| TestbedError::RunNotFound(path.to_path_buf()))?;
    let resolved = candidate.canonicalize().map_err(|e| match e.kind() {
        ErrorKind::NotFound => TestbedError::RunNotFound(path.to_path_buf()),
        _ => TestbedError::Io(e),
    })?;

    if !resolved.starts_with(&root) {
        return Err(TestbedError::InvalidRequest(format!(
            "{} is outside the data directory",
            path.display()
        )));
    }
    if !resolved.is_file() {
        return Err(TestbedError::RunNotFound(path.to_path_buf()));
    }
    Ok(resolved)
}
