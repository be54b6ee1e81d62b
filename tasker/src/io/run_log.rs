//! `run.log` helpers: sanitization after a run and completion queries.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::completion::classify_log;
use crate::core::sanitize::{apply_backspaces, tail_lines};
use crate::core::types::RunStatus;

pub const LOG_FILE_NAME: &str = "run.log";

pub fn log_path(output_directory: &Path) -> PathBuf {
    output_directory.join(LOG_FILE_NAME)
}

/// Rewrite the log with backspaces applied. Returns whether it changed.
///
/// Clean logs are left untouched on disk.
pub fn sanitize_log_file(path: &Path) -> Result<bool> {
    let raw = fs::read(path).with_context(|| format!("read log {}", path.display()))?;
    let cleaned = apply_backspaces(&raw);
    if cleaned.as_ref() == raw.as_slice() {
        return Ok(false);
    }
    let tmp_path = path.with_extension("log.tmp");
    fs::write(&tmp_path, cleaned.as_ref())
        .with_context(|| format!("write temp log {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace log {}", path.display()))?;
    debug!(path = %path.display(), removed = raw.len() - cleaned.len(), "log sanitized");
    Ok(true)
}

/// Log contents, or `None` if the run has not started.
pub fn read_log(output_directory: &Path) -> Result<Option<String>> {
    let path = log_path(output_directory);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read log {}", path.display())),
    }
}

/// Last `count` lines of the log; empty if there is no log.
pub fn read_log_tail(output_directory: &Path, count: usize) -> Result<Vec<String>> {
    Ok(read_log(output_directory)?
        .map(|log| tail_lines(&log, count))
        .unwrap_or_default())
}

/// Completion status of a run directory.
pub fn run_status(output_directory: &Path) -> Result<RunStatus> {
    let log = read_log(output_directory)?;
    Ok(classify_log(log.as_deref()))
}

/// Run duration in seconds, if the run has completed.
pub fn run_duration(output_directory: &Path) -> Result<Option<f64>> {
    Ok(match run_status(output_directory)? {
        RunStatus::Complete { duration_secs } => Some(duration_secs),
        RunStatus::NotStarted | RunStatus::Incomplete => None,
    })
}
