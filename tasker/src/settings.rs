//! Solver settings as seen by the task subsystem.
//!
//! Settings belong to the solver. The task subsystem only needs to turn them
//! into a command line, ask whether they can run in-process, and round-trip them
//! through the task file. Each settings kind registers a decoder in a
//! [`SettingsRegistry`]; there is no reflection over concrete types.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name the settings file is written to inside a run directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Resolved command line for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Settings that can run inside the calling process.
pub trait InProcessRun {
    fn run_in_process(&self, output_directory: &Path) -> Result<()>;
}

/// Capability interface implemented by every settings kind.
pub trait Settings: fmt::Display + Send + Sync {
    /// Tag stored alongside the serialized value; must match a registry entry.
    fn kind(&self) -> &str;

    /// Command line for a run whose output lives in `output_directory`.
    fn command(&self, output_directory: &Path) -> Result<CommandSpec>;

    /// `Some` when the settings ask to skip subprocess isolation.
    fn in_process(&self) -> Option<&dyn InProcessRun> {
        None
    }

    fn set_output_directory(&mut self, _output_directory: &Path) {}

    /// Structured form embedded in the task file.
    fn to_value(&self) -> Result<Value>;

    /// Write the standalone settings file. Defaults to pretty JSON.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.to_value()?)
            .context("serialize settings")?;
        buf.push('\n');
        writer
            .write_all(buf.as_bytes())
            .context("write settings")?;
        Ok(())
    }
}

type Decoder = fn(Value) -> Result<Box<dyn Settings>>;

fn decode_as<T>(value: Value) -> Result<Box<dyn Settings>>
where
    T: Settings + DeserializeOwned + 'static,
{
    let settings: T = serde_json::from_value(value)?;
    Ok(Box::new(settings))
}

/// Known settings kinds and how to rebuild them from a task file.
#[derive(Debug, Clone, Default)]
pub struct SettingsRegistry {
    decoders: BTreeMap<String, Decoder>,
}

impl SettingsRegistry {
    /// Empty registry; every kind is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in [`CommandSettings`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<CommandSettings>(CommandSettings::KIND);
        registry
    }

    pub fn register<T>(&mut self, kind: &str) -> &mut Self
    where
        T: Settings + DeserializeOwned + 'static,
    {
        self.decoders.insert(kind.to_string(), decode_as::<T>);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Rebuild settings of `kind`. Fails if the kind is unregistered.
    pub fn decode(&self, kind: &str, value: Value) -> Result<Box<dyn Settings>> {
        let Some(decoder) = self.decoders.get(kind) else {
            bail!("unknown settings type `{kind}`");
        };
        decoder(value).with_context(|| format!("decode `{kind}` settings"))
    }
}

/// Settings for a solver started as an external executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Number of solver processes; above one the parallel launcher is used.
    #[serde(default = "default_num_processes")]
    pub num_processes: u32,
    /// Launcher such as `mpirun`, invoked as `<launcher> -np <n> <executable> ...`.
    #[serde(default)]
    pub parallel_launcher: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Solver-specific payload, written to the settings file untouched.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
}

fn default_num_processes() -> u32 {
    1
}

impl CommandSettings {
    pub const KIND: &'static str = "command";

    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            num_processes: 1,
            parallel_launcher: None,
            env: BTreeMap::new(),
            parameters: Value::Null,
            output_directory: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    fn expand(&self, arg: &str, output_directory: &Path) -> String {
        let settings_path = output_directory.join(SETTINGS_FILE_NAME);
        arg.replace("{output_dir}", &output_directory.display().to_string())
            .replace("{settings}", &settings_path.display().to_string())
    }
}

impl Settings for CommandSettings {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn command(&self, output_directory: &Path) -> Result<CommandSpec> {
        if self.executable.trim().is_empty() {
            bail!("command settings have an empty executable");
        }
        if self.num_processes == 0 {
            bail!("num_processes must be > 0");
        }
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| self.expand(arg, output_directory))
            .collect();

        let (program, args) = match (&self.parallel_launcher, self.num_processes) {
            (Some(launcher), n) if n > 1 => {
                let mut full = vec!["-np".to_string(), n.to_string(), self.executable.clone()];
                full.extend(args);
                (launcher.clone(), full)
            }
            _ => (self.executable.clone(), args),
        };

        Ok(CommandSpec {
            program,
            args,
            env: self.env.clone(),
        })
    }

    fn set_output_directory(&mut self, output_directory: &Path) {
        self.output_directory = Some(output_directory.to_path_buf());
    }

    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize command settings")
    }
}

impl fmt::Display for CommandSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "command settings")?;
        writeln!(f, "\texecutable: {}", self.executable)?;
        if !self.args.is_empty() {
            writeln!(f, "\targs: {}", self.args.join(" "))?;
        }
        writeln!(f, "\tprocesses: {}", self.num_processes)?;
        if let Some(launcher) = &self.parallel_launcher {
            writeln!(f, "\tlauncher: {launcher}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_expands_placeholders() {
        let settings = CommandSettings::new("solver").with_args([
            "--config",
            "{settings}",
            "--out",
            "{output_dir}",
        ]);
        let spec = settings.command(Path::new("/runs/task_1")).expect("command");
        assert_eq!(spec.program, "solver");
        assert_eq!(
            spec.args,
            vec![
                "--config",
                "/runs/task_1/settings.json",
                "--out",
                "/runs/task_1"
            ]
        );
    }

    #[test]
    fn parallel_runs_use_launcher() {
        let mut settings = CommandSettings::new("lsc_amr").with_args(["{settings}"]);
        settings.num_processes = 4;
        settings.parallel_launcher = Some("mpirun".to_string());
        let spec = settings.command(Path::new("/r")).expect("command");
        assert_eq!(spec.program, "mpirun");
        assert_eq!(spec.args, vec!["-np", "4", "lsc_amr", "/r/settings.json"]);
    }

    #[test]
    fn empty_executable_is_rejected() {
        let settings = CommandSettings::new("  ");
        let err = settings.command(Path::new("/r")).unwrap_err();
        assert!(err.to_string().contains("empty executable"));
    }

    #[test]
    fn registry_decodes_registered_kind() {
        let registry = SettingsRegistry::with_defaults();
        let settings = CommandSettings::new("solver").with_parameters(json!({"dt": 0.5}));
        let value = settings.to_value().expect("value");
        let decoded = registry.decode(CommandSettings::KIND, value).expect("decode");
        assert_eq!(decoded.kind(), "command");
        assert_eq!(
            decoded.to_value().expect("value"),
            settings.to_value().expect("value")
        );
    }

    #[test]
    fn registry_rejects_unknown_kind() {
        let registry = SettingsRegistry::new();
        assert!(!registry.contains("command"));
        let err = registry.decode("command", Value::Null).err().unwrap();
        assert!(err.to_string().contains("unknown settings type"));
    }

    #[test]
    fn non_finite_parameters_serialize_as_null() {
        let settings = CommandSettings::new("solver").with_parameters(json!({"dt": 1.0}));
        let mut value = settings.to_value().expect("value");
        value["parameters"]["nan"] = serde_json::to_value(f64::NAN).expect("nan");
        assert_eq!(value["parameters"]["nan"], Value::Null);
    }

    #[test]
    fn save_writes_pretty_json() {
        let settings = CommandSettings::new("solver");
        let mut buf = Vec::new();
        settings.save(&mut buf).expect("save");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\"executable\": \"solver\""));
    }
}
