//! Shared types for the supervisor state machine.

use serde::{Deserialize, Serialize};

/// Phase of one supervised task run.
///
/// `Repeating` loops back to `Spawned`. `Done` is terminal for both success and
/// failure; failures live in the run log and the attempt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Initializing,
    Spawned,
    Waiting,
    Finalizing,
    Repeating,
    Done,
}

/// What to do with the remaining repeats after an attempt exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Stop repeating once an attempt fails.
    #[default]
    AbortOnFailure,
    /// Run every declared repeat regardless of exit status.
    Continue,
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptExit {
    Success,
    Failure,
    Killed,
}

/// Record of a single attempt, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index (`current_run` at spawn time).
    pub index: u32,
    pub exit: AttemptExit,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Status of a run directory derived from its log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunStatus {
    /// No `run.log` exists yet.
    NotStarted,
    /// The log exists but has no completion marker (still running or killed).
    Incomplete,
    /// The completion marker was found.
    Complete { duration_secs: f64 },
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Complete { .. })
    }
}
