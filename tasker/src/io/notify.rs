//! Best-effort completion notifications.
//!
//! Callers must treat every error from a [`Notifier`] as advisory.

use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::io::config::NotifyConfig;

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> Result<()>;
}

/// Notifier that runs a desktop command such as `notify-send <title> <body>`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Notifier described by config, or `None` when notifications are off.
    pub fn from_config(cfg: &NotifyConfig) -> Option<Arc<dyn Notifier>> {
        if !cfg.enabled || cfg.command.is_empty() {
            return None;
        }
        Some(Arc::new(Self::new(cfg.command.clone())))
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty notify command"))?;
        let status = Command::new(program)
            .args(args)
            .arg(title)
            .arg(body)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("run notifier {program}"))?;
        if !status.success() {
            return Err(anyhow!(
                "notifier {program} exited with status {:?}",
                status.code()
            ));
        }
        Ok(())
    }
}
