//! Stable exit codes for tasker CLI commands.

/// Command succeeded; for `status`, the run is complete.
pub const OK: i32 = 0;
/// Invalid arguments, config, or task file, or any other error.
pub const INVALID: i32 = 1;
/// The supervised run was killed or its last attempt exited non-zero.
pub const RUN_FAILED: i32 = 2;
/// `tasker status`: the log exists but has no completion marker.
pub const INCOMPLETE: i32 = 3;
/// `tasker status`: the run has not produced a log yet.
pub const NOT_STARTED: i32 = 4;
