//! Find task files under a directory and load them in parallel.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::io::persist::{TASK_FILE_NAME, try_load_task};
use crate::settings::SettingsRegistry;
use crate::task::TaskDescriptor;

/// Result of a discovery pass.
#[derive(Debug)]
pub struct Discovery {
    /// Successfully loaded tasks, oldest task file first.
    pub tasks: Vec<TaskDescriptor>,
    /// Number of task files found.
    pub attempted: usize,
}

impl Discovery {
    pub fn loaded(&self) -> usize {
        self.tasks.len()
    }
}

/// Task files under `root`, ordered by modification time (oldest first).
///
/// Non-recursive mode only looks at `root/*/taskfile.json`; recursive mode
/// matches the file name anywhere below `root`.
pub fn find_task_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let paths = if recursive {
        walk_task_files(root)
    } else {
        child_task_files(root)?
    };

    let mut dated: Vec<(Option<SystemTime>, PathBuf)> = paths
        .into_iter()
        .map(|path| {
            let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
            (modified, path)
        })
        .collect();
    dated.sort();
    Ok(dated.into_iter().map(|(_, path)| path).collect())
}

fn child_task_files(root: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(root).with_context(|| format!("read directory {}", root.display()))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        let candidate = entry.path().join(TASK_FILE_NAME);
        if candidate.is_file() {
            found.push(candidate);
        }
    }
    Ok(found)
}

fn walk_task_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(err = %err, "skipping unreadable path");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == TASK_FILE_NAME)
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Find and load every task under `root`.
///
/// Files that fail to load are reported and skipped; the loaded tasks keep
/// the modification-time order of their files.
#[instrument(skip_all, fields(root = %root.display(), recursive = recursive))]
pub fn discover_tasks(
    root: &Path,
    recursive: bool,
    registry: &SettingsRegistry,
) -> Result<Discovery> {
    let paths = find_task_files(root, recursive)?;
    let attempted = paths.len();
    debug!(attempted, "task files found");

    let tasks: Vec<TaskDescriptor> = paths
        .par_iter()
        .map(|path| try_load_task(path, registry))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    let loaded = tasks.len();
    info!(attempted, loaded, "loaded {loaded} of {attempted} tasks");
    Ok(Discovery { tasks, attempted })
}
