//! Task descriptor: one rerunnable unit of work.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::environment::RunEnvironment;
use crate::settings::Settings;

/// Named text blob materialized to `runfiles/<name>.dat` before a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runfile {
    pub name: String,
    pub content: String,
    /// Advisory only: not wired into the settings.
    #[serde(default)]
    pub settings_param: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl Runfile {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            settings_param: None,
            description: description.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.dat", self.name)
    }

    pub fn validate(&self) -> Result<()> {
        validate_leaf_name("runfile name", &self.name)
    }
}

impl fmt::Display for Runfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

/// Everything needed to run, persist, and later rerun a task.
///
/// Built once by a generator (or loaded from a task file) and then handed to a
/// single supervisor. `output_directory` is filled in when a run directory is
/// resolved; `source_path` is rebound on load so relative lookups keep working
/// after a run directory has been moved.
pub struct TaskDescriptor {
    pub owner: String,
    pub description: Option<String>,
    /// Verbatim text of the script or config that produced this task.
    pub generator: Option<String>,
    pub runfiles: Vec<Runfile>,
    pub settings: Box<dyn Settings>,
    /// Used verbatim as the run directory name instead of a timestamp.
    pub task_name: Option<String>,
    /// Extra attempts after the first one.
    pub num_repeats: u32,
    pub exit_on_complete: bool,
    pub output_directory: Option<PathBuf>,
    pub output_directory_base: Option<PathBuf>,
    /// Advisory; set once a supervisor has run this descriptor.
    pub already_run: bool,
    pub source_path: Option<PathBuf>,
}

impl TaskDescriptor {
    pub fn builder<S: Settings + 'static>(settings: S) -> TaskBuilder {
        TaskBuilder::new(Box::new(settings))
    }

    /// Human-readable summary of the task.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.settings.to_string());
        out.push_str("runfiles:\n");
        for runfile in &self.runfiles {
            out.push_str(&format!(
                "\t{}: {}\n",
                runfile.file_name(),
                runfile.description
            ));
        }
        out.push_str(&format!("\nOwner: {}\n", self.owner));
        out.push_str(&format!(
            "description: {}\n",
            self.description.as_deref().unwrap_or("")
        ));
        if self.num_repeats > 0 {
            out.push_str(&format!("repeats: {}\n", self.num_repeats));
        }
        if let Some(dir) = &self.output_directory {
            out.push_str(&format!("output directory: {}\n", dir.display()));
        }
        out
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("owner", &self.owner)
            .field("description", &self.description)
            .field("settings_kind", &self.settings.kind())
            .field("runfiles", &self.runfiles)
            .field("task_name", &self.task_name)
            .field("num_repeats", &self.num_repeats)
            .field("output_directory", &self.output_directory)
            .field("source_path", &self.source_path)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

pub struct TaskBuilder {
    settings: Box<dyn Settings>,
    owner: Option<String>,
    description: Option<String>,
    generator: Option<String>,
    runfiles: Vec<Runfile>,
    task_name: Option<String>,
    num_repeats: u32,
    exit_on_complete: bool,
    output_directory_base: Option<PathBuf>,
}

impl TaskBuilder {
    pub fn new(settings: Box<dyn Settings>) -> Self {
        Self {
            settings,
            owner: None,
            description: None,
            generator: None,
            runfiles: Vec::new(),
            task_name: None,
            num_repeats: 0,
            exit_on_complete: false,
            output_directory_base: None,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = Some(generator.into());
        self
    }

    pub fn runfile(mut self, runfile: Runfile) -> Self {
        self.runfiles.push(runfile);
        self
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn num_repeats(mut self, repeats: u32) -> Self {
        self.num_repeats = repeats;
        self
    }

    pub fn exit_on_complete(mut self, exit: bool) -> Self {
        self.exit_on_complete = exit;
        self
    }

    pub fn output_directory_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.output_directory_base = Some(base.into());
        self
    }

    /// Validate and build. The owner defaults to the environment's user.
    pub fn build(self, env: &RunEnvironment) -> Result<TaskDescriptor> {
        if let Some(name) = &self.task_name {
            validate_leaf_name("task_name", name)?;
        }
        for runfile in &self.runfiles {
            runfile.validate()?;
        }
        let mut names: Vec<&str> = self.runfiles.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                bail!("duplicate runfile name {}", pair[0]);
            }
        }

        Ok(TaskDescriptor {
            owner: self.owner.unwrap_or_else(|| env.user.clone()),
            description: self.description,
            generator: self.generator,
            runfiles: self.runfiles,
            settings: self.settings,
            task_name: self.task_name,
            num_repeats: self.num_repeats,
            exit_on_complete: self.exit_on_complete,
            output_directory: None,
            output_directory_base: self.output_directory_base,
            already_run: false,
            source_path: None,
        })
    }
}

/// Names that become a single path component inside a run directory.
pub(crate) fn validate_leaf_name(label: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("{label} must be non-empty");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("{label} must not contain path separators");
    }
    if name == "." || name.contains("..") {
        bail!("{label} must not contain '..'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CommandSettings;

    fn env() -> RunEnvironment {
        RunEnvironment::from_process().with_user("bob")
    }

    #[test]
    fn owner_defaults_to_environment_user() {
        let task = TaskDescriptor::builder(CommandSettings::new("solver"))
            .build(&env())
            .expect("build");
        assert_eq!(task.owner, "bob");
        assert!(!task.already_run);
    }

    #[test]
    fn explicit_owner_wins() {
        let task = TaskDescriptor::builder(CommandSettings::new("solver"))
            .owner("alice")
            .build(&env())
            .expect("build");
        assert_eq!(task.owner, "alice");
    }

    #[test]
    fn rejects_task_name_with_separator() {
        let err = TaskDescriptor::builder(CommandSettings::new("solver"))
            .task_name("a/b")
            .build(&env())
            .unwrap_err();
        assert!(err.to_string().contains("task_name"));
    }

    #[test]
    fn rejects_duplicate_runfiles() {
        let err = TaskDescriptor::builder(CommandSettings::new("solver"))
            .runfile(Runfile::new("grid", "1 2 3", "grid"))
            .runfile(Runfile::new("grid", "4 5 6", "grid again"))
            .build(&env())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate runfile"));
    }

    #[test]
    fn summary_lists_runfiles_and_owner() {
        let task = TaskDescriptor::builder(CommandSettings::new("solver"))
            .owner("alice")
            .description("smoke test")
            .runfile(Runfile::new("profile", "0.0 1.0", "initial profile"))
            .build(&env())
            .expect("build");
        let summary = task.summary();
        assert!(summary.contains("profile.dat: initial profile"));
        assert!(summary.contains("Owner: alice"));
        assert!(summary.contains("description: smoke test"));
    }
}
