//! Pure, deterministic helpers for the task lifecycle.
//!
//! Nothing in here touches the filesystem or spawns processes.

pub mod completion;
pub mod lifecycle;
pub mod sanitize;
pub mod types;
