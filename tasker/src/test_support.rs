//! Test-only helpers: shell-backed tasks and recording fakes.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::RunEnvironment;
use crate::io::dispatch::Dispatcher;
use crate::io::notify::Notifier;
use crate::settings::{CommandSettings, CommandSpec, InProcessRun, Settings, SettingsRegistry};
use crate::supervisor::{OutputTarget, RunOptions};
use crate::task::TaskDescriptor;

/// Settings running `sh -c <script>`.
pub fn shell_settings(script: &str) -> CommandSettings {
    CommandSettings::new("sh").with_args(["-c", script])
}

/// Task owned by `tester` running `script` through the shell.
pub fn shell_task(script: &str) -> TaskDescriptor {
    let env = RunEnvironment::from_process().with_user("tester");
    TaskDescriptor::builder(shell_settings(script))
        .description(format!("sh -c {script}"))
        .build(&env)
        .unwrap_or_else(|err| panic!("shell task: {err:#}"))
}

/// Options allocating under `base` with short polling and grace periods.
pub fn fast_options(base: &Path) -> RunOptions {
    let mut options = RunOptions::new(OutputTarget::Allocate {
        base: base.to_path_buf(),
    });
    options.poll_interval = Duration::from_millis(10);
    options.kill_grace = Duration::from_secs(2);
    options
}

/// Registry with the built-in kinds plus [`MarkerSettings`].
pub fn test_registry() -> SettingsRegistry {
    let mut registry = SettingsRegistry::with_defaults();
    registry.register::<MarkerSettings>(MarkerSettings::KIND);
    registry
}

/// Notifier that records every call; optionally fails each one.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("notifier lock poisoned"))?
            .push((title.to_string(), body.to_string()));
        if self.fail {
            return Err(anyhow!("notification daemon unavailable"));
        }
        Ok(())
    }
}

/// Dispatcher that keeps payloads in memory.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads
            .lock()
            .map(|payloads| payloads.clone())
            .unwrap_or_default()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    fn dispatch(&self, payload: &[u8]) -> Result<()> {
        self.payloads
            .lock()
            .map_err(|_| anyhow!("dispatcher lock poisoned"))?
            .push(payload.to_vec());
        Ok(())
    }
}

/// Settings that run in-process by writing a marker file into the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSettings {
    pub marker: String,
    #[serde(default)]
    pub in_process: bool,
}

impl MarkerSettings {
    pub const KIND: &'static str = "marker";

    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            in_process: true,
        }
    }
}

impl Settings for MarkerSettings {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn command(&self, _output_directory: &Path) -> Result<CommandSpec> {
        Ok(CommandSpec {
            program: "touch".to_string(),
            args: vec![self.marker.clone()],
            env: Default::default(),
        })
    }

    fn in_process(&self) -> Option<&dyn InProcessRun> {
        if self.in_process { Some(self) } else { None }
    }

    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize marker settings")
    }
}

impl InProcessRun for MarkerSettings {
    fn run_in_process(&self, output_directory: &Path) -> Result<()> {
        std::fs::write(output_directory.join(&self.marker), b"ran\n")
            .with_context(|| format!("write marker {}", self.marker))
    }
}

impl std::fmt::Display for MarkerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "marker settings")?;
        writeln!(f, "\tmarker: {}", self.marker)
    }
}

/// Temporary directory that lives as long as the value.
pub struct TestRoot {
    dir: tempfile::TempDir,
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}")),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestRoot {
    fn default() -> Self {
        Self::new()
    }
}
