//! Tasker configuration stored in `tasker.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::RepeatPolicy;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "tasker.toml";

/// Tasker configuration (TOML).
///
/// Missing fields default to values that work without any config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskerConfig {
    /// Where new run directories are allocated. Defaults to the working directory.
    pub output_directory_base: Option<PathBuf>,

    /// Tee child output to the console as well as `run.log`.
    pub tee: bool,

    /// Whether a failed attempt stops the remaining repeats.
    pub repeat_policy: RepeatPolicy,

    /// How often the supervisor polls the child for exit.
    pub poll_interval_ms: u64,

    /// Grace period between a terminate request and a hard kill.
    pub kill_grace_secs: u64,

    /// Lines of the final log exposed by `communicate()`.
    pub log_tail_lines: usize,

    pub notify: NotifyConfig,

    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    /// Notifier command; title and body are appended as arguments.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: vec!["notify-send".to_string()],
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50007,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            output_directory_base: None,
            tee: false,
            repeat_policy: RepeatPolicy::AbortOnFailure,
            poll_interval_ms: 50,
            kill_grace_secs: 5,
            log_tail_lines: 20,
            notify: NotifyConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl TaskerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.notify.enabled
            && (self.notify.command.is_empty() || self.notify.command[0].trim().is_empty())
        {
            return Err(anyhow!(
                "notify.command must be a non-empty array when notify.enabled"
            ));
        }
        if self.dispatch.host.trim().is_empty() {
            return Err(anyhow!("dispatch.host must be non-empty"));
        }
        if self.dispatch.connect_timeout_secs == 0 {
            return Err(anyhow!("dispatch.connect_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TaskerConfig::default()`.
pub fn load_config(path: &Path) -> Result<TaskerConfig> {
    if !path.exists() {
        let cfg = TaskerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TaskerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
