//! Diagnostic tracing for the supervisor.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Supervisor diagnostics on stderr, filtered by
//!   `-v` or `RUST_LOG`. Never written into a run directory.
//!
//! - **Run log (`io/run_log`)**: The child's own output in `<run dir>/run.log`.
//!   Always written, unaffected by either filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
///
/// Dependencies stay at `warn`; each `-v` raises this crate by one level.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,tasker=info",
        2 => "warn,tasker=debug",
        _ => "warn,tasker=trace",
    }
}

/// Install the stderr subscriber, compact format.
///
/// `RUST_LOG` wins over `verbosity` when set.
///
/// # Example
/// ```bash
/// tasker -vv run 20110516_091754
/// RUST_LOG=tasker::io::process=debug tasker run 20110516_091754
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_by_default() {
        assert_eq!(default_directive(0), "warn");
    }

    #[test]
    fn verbosity_only_raises_this_crate() {
        for level in 1..=5 {
            let directive = default_directive(level);
            assert!(directive.starts_with("warn,tasker="), "{directive}");
            assert!(EnvFilter::try_new(directive).is_ok());
        }
        assert_eq!(default_directive(2), "warn,tasker=debug");
        assert_eq!(default_directive(9), default_directive(3));
    }
}
