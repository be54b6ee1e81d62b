//! Explicit run environment handed to the supervisor.
//!
//! Holds the ambient facts a run needs (who is submitting, how to notify)
//! instead of reading them from process globals deep inside the lifecycle.

use std::fmt;
use std::sync::Arc;

use crate::io::notify::Notifier;

/// Fallback owner when no user can be determined.
pub const UNKNOWN_USER: &str = "unknown";

#[derive(Clone)]
pub struct RunEnvironment {
    /// Identity used as the default task owner.
    pub user: String,
    /// Optional desktop notifier; absence never fails a run.
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl RunEnvironment {
    /// Environment derived from the current process (`USER` / `USERNAME`).
    pub fn from_process() -> Self {
        let user = ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| UNKNOWN_USER.to_string());
        Self {
            user,
            notifier: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

impl fmt::Debug for RunEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEnvironment")
            .field("user", &self.user)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
