//! Completion marker parsing for run logs.
//!
//! Generator scripts print a line such as `Total time: 12.5s` when a solver run
//! finishes. A log without it belongs to a run that is still going or was
//! killed.

use std::sync::LazyLock;

use regex::Regex;

use super::types::RunStatus;

/// Substring that identifies the completion line.
pub const COMPLETION_MARKER: &str = "Total time";

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Total time\D*?(\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)").unwrap()
});

/// Extract the run duration in seconds from the first completion line.
///
/// A marker without a parseable number counts as complete with zero duration.
pub fn parse_run_duration(log: &str) -> Option<f64> {
    let line = log.lines().find(|line| line.contains(COMPLETION_MARKER))?;
    let seconds = DURATION_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    Some(seconds)
}

/// Classify a log's contents. `None` means the log does not exist.
pub fn classify_log(log: Option<&str>) -> RunStatus {
    match log {
        None => RunStatus::NotStarted,
        Some(contents) => match parse_run_duration(contents) {
            Some(duration_secs) => RunStatus::Complete { duration_secs },
            None => RunStatus::Incomplete,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_with_unit_suffix() {
        let log = "step 1\nstep 2\n==> Total time: 12.5s\n";
        assert_eq!(parse_run_duration(log), Some(12.5));
    }

    #[test]
    fn parses_scientific_notation() {
        let log = "Total time = 1.2e3 s\n";
        assert_eq!(parse_run_duration(log), Some(1200.0));
    }

    #[test]
    fn missing_marker_is_incomplete() {
        assert_eq!(parse_run_duration("step 1\n"), None);
        assert_eq!(classify_log(Some("step 1\n")), RunStatus::Incomplete);
    }

    #[test]
    fn missing_log_is_not_started() {
        assert_eq!(classify_log(None), RunStatus::NotStarted);
    }

    #[test]
    fn marker_without_number_is_complete() {
        let status = classify_log(Some("Total time unknown\n"));
        assert_eq!(status, RunStatus::Complete { duration_secs: 0.0 });
    }
}
