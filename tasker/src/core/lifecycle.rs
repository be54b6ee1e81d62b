//! Phase transitions for the supervisor.

use super::types::{AttemptExit, RepeatPolicy, RunPhase};

/// Decide the phase after an attempt has been waited on.
///
/// `current_run` is the zero-based index of the attempt that just exited. A
/// task with `num_repeats = k` runs `k + 1` attempts.
pub fn phase_after_exit(
    current_run: u32,
    num_repeats: u32,
    exit: AttemptExit,
    policy: RepeatPolicy,
) -> RunPhase {
    if exit == AttemptExit::Killed {
        return RunPhase::Finalizing;
    }
    if exit == AttemptExit::Failure && policy == RepeatPolicy::AbortOnFailure {
        return RunPhase::Finalizing;
    }
    if current_run < num_repeats {
        RunPhase::Repeating
    } else {
        RunPhase::Finalizing
    }
}

/// Whether moving from `from` to `to` is a legal supervisor transition.
pub fn is_valid_transition(from: RunPhase, to: RunPhase) -> bool {
    matches!(
        (from, to),
        (RunPhase::Initializing, RunPhase::Spawned)
            | (RunPhase::Initializing, RunPhase::Done)
            | (RunPhase::Spawned, RunPhase::Waiting)
            | (RunPhase::Waiting, RunPhase::Repeating)
            | (RunPhase::Waiting, RunPhase::Finalizing)
            | (RunPhase::Repeating, RunPhase::Spawned)
            | (RunPhase::Repeating, RunPhase::Finalizing)
            | (RunPhase::Finalizing, RunPhase::Done)
    )
}
