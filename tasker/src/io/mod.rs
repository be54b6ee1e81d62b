//! I/O helpers for task runs.

pub mod config;
pub mod discover;
pub mod dispatch;
pub mod notify;
pub mod outdir;
pub mod persist;
pub mod process;
pub mod run_log;
pub mod tee;
