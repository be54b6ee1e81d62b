//! Supervised, persistent, rerunnable solver tasks.
//!
//! A [`task::TaskDescriptor`] captures everything needed to run a solver: the
//! settings that produce its command line, auxiliary runfiles, and the text of
//! the generator that created it. Running a task allocates a timestamped run
//! directory, persists the descriptor there, and supervises the child process
//! (and its repeats) with all output captured to a single `run.log`.
//!
//! - **[`core`]**: Pure logic (phase transitions, log sanitization, completion
//!   detection). No I/O.
//! - **[`io`]**: Filesystem, process, and network side effects.
//!
//! [`supervisor`] drives one run through its lifecycle; [`submit`] chooses
//! between local, in-process, and remote execution.

pub mod core;
pub mod environment;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod settings;
pub mod submit;
pub mod supervisor;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
