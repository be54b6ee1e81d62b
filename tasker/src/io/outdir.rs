//! Unique run directory allocation.
//!
//! Names are `task_<YYYYmmdd_HHMMSS>` with `_<n>` appended on collision. The
//! collision check is the directory creation itself, so concurrent callers
//! against the same base never share a directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use tracing::debug;

/// Prefix of auto-generated run directory names.
pub const RUN_DIR_PREFIX: &str = "task_";

const MAX_SUFFIX: u32 = 10_000;

/// Timestamp component of a run directory name, second resolution.
pub fn run_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn run_dir_name(timestamp: &str, suffix: Option<u32>) -> String {
    match suffix {
        None => format!("{RUN_DIR_PREFIX}{timestamp}"),
        Some(n) => format!("{RUN_DIR_PREFIX}{timestamp}_{n}"),
    }
}

/// Create and return a fresh run directory under `base`.
///
/// With `task_name`, that name is used verbatim and an existing directory is an
/// error rather than a reuse.
pub fn allocate_output_directory(base: &Path, task_name: Option<&str>) -> Result<PathBuf> {
    fs::create_dir_all(base).with_context(|| format!("create output base {}", base.display()))?;

    if let Some(name) = task_name {
        let dir = base.join(name);
        return match fs::create_dir(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "allocated named run directory");
                Ok(dir)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(anyhow!(
                "run directory {} already exists; refusing to reuse it",
                dir.display()
            )),
            Err(err) => {
                Err(err).with_context(|| format!("create run directory {}", dir.display()))
            }
        };
    }

    allocate_with_timestamp(base, &run_timestamp())
}

/// Allocation loop with a fixed timestamp (split out for deterministic tests).
pub fn allocate_with_timestamp(base: &Path, timestamp: &str) -> Result<PathBuf> {
    let mut suffix = None;
    loop {
        let dir = base.join(run_dir_name(timestamp, suffix));
        match fs::create_dir(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "allocated run directory");
                return Ok(dir);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let next = suffix.map_or(0, |n| n + 1);
                if next >= MAX_SUFFIX {
                    bail!(
                        "no free run directory for {timestamp} under {} \
                         after {MAX_SUFFIX} attempts",
                        base.display()
                    );
                }
                suffix = Some(next);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create run directory {}", dir.display()));
            }
        }
    }
}

/// Map a bare run identifier (`20110516_091754`) to its directory name.
pub fn dir_name_for_identifier(identifier: &str) -> String {
    if identifier.starts_with(RUN_DIR_PREFIX) {
        identifier.to_string()
    } else {
        format!("{RUN_DIR_PREFIX}{identifier}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_allocation_has_no_suffix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = allocate_with_timestamp(temp.path(), "20240101_120000").expect("alloc");
        assert_eq!(dir, temp.path().join("task_20240101_120000"));
        assert!(dir.is_dir());
    }

    #[test]
    fn collisions_get_increasing_suffixes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ts = "20240101_120000";
        let a = allocate_with_timestamp(temp.path(), ts).expect("a");
        let b = allocate_with_timestamp(temp.path(), ts).expect("b");
        let c = allocate_with_timestamp(temp.path(), ts).expect("c");
        assert!(a.ends_with("task_20240101_120000"));
        assert!(b.ends_with("task_20240101_120000_0"));
        assert!(c.ends_with("task_20240101_120000_1"));
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = Arc::new(temp.path().to_path_buf());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let base = Arc::clone(&base);
                thread::spawn(move || allocate_with_timestamp(&base, "20240101_120000"))
            })
            .collect();
        let dirs: Vec<PathBuf> = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("alloc"))
            .collect();
        let unique: HashSet<_> = dirs.iter().collect();
        assert_eq!(unique.len(), 16);
        assert!(dirs.iter().all(|d| d.is_dir()));
    }

    #[test]
    fn named_directory_is_used_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = allocate_output_directory(temp.path(), Some("bubble")).expect("alloc");
        assert_eq!(dir, temp.path().join("bubble"));
    }

    #[test]
    fn named_directory_is_never_reused() {
        let temp = tempfile::tempdir().expect("tempdir");
        allocate_output_directory(temp.path(), Some("bubble")).expect("first");
        let err = allocate_output_directory(temp.path(), Some("bubble")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn creates_missing_base() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("runs/nested");
        let dir = allocate_output_directory(&base, None).expect("alloc");
        assert!(dir.starts_with(&base));
        assert!(dir.is_dir());
    }

    #[test]
    fn identifier_maps_to_dir_name() {
        assert_eq!(
            dir_name_for_identifier("20110516_091754"),
            "task_20110516_091754"
        );
        assert_eq!(
            dir_name_for_identifier("task_20110516_091754_2"),
            "task_20110516_091754_2"
        );
    }
}
