//! Submission facade: run a task here, in-process, or on a task server.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{info, instrument, warn};

use crate::environment::RunEnvironment;
use crate::exit_codes;
use crate::io::dispatch::{Dispatcher, enqueue};
use crate::settings::SettingsRegistry;
use crate::supervisor::{DetachedRun, OutputTarget, RunHandle, RunOptions, RunReport, TaskRun};
use crate::task::TaskDescriptor;

/// Where a submitted task goes.
pub enum Target<'a> {
    Local(RunOptions),
    Remote(&'a dyn Dispatcher),
}

/// What happened to a submitted task.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Ran inside this process; no log or task file was written.
    InProcess { output_directory: PathBuf },
    /// Supervised run that has finished.
    Finished(RunReport),
    /// Handed to a detached supervisor.
    Detached(DetachedRun),
    /// Serialized and sent to a task server.
    Enqueued { endpoint: String, bytes: usize },
}

impl SubmitOutcome {
    pub fn output_directory(&self) -> Option<&Path> {
        match self {
            SubmitOutcome::InProcess { output_directory } => Some(output_directory),
            SubmitOutcome::Finished(report) => Some(&report.output_directory),
            SubmitOutcome::Detached(run) => Some(&run.output_directory),
            SubmitOutcome::Enqueued { .. } => None,
        }
    }
}

/// Run or enqueue `task`, blocking until a local attached run finishes.
///
/// A successful local run of a task with `exit_on_complete` ends the process.
#[instrument(skip_all, fields(owner = %task.owner))]
pub fn submit(
    task: TaskDescriptor,
    target: Target<'_>,
    env: RunEnvironment,
    registry: &SettingsRegistry,
) -> Result<SubmitOutcome> {
    let exit_on_complete = task.exit_on_complete;
    let outcome = match target {
        Target::Remote(dispatcher) => {
            let bytes = enqueue(&task, dispatcher, registry)?;
            return Ok(SubmitOutcome::Enqueued {
                endpoint: dispatcher.endpoint(),
                bytes,
            });
        }
        Target::Local(options) => run_local(task, options, env, registry)?,
    };

    let finished_ok = match &outcome {
        SubmitOutcome::InProcess { .. } => true,
        SubmitOutcome::Finished(report) => report.succeeded(),
        SubmitOutcome::Detached(_) | SubmitOutcome::Enqueued { .. } => false,
    };
    if exit_on_complete && finished_ok {
        info!("task requested exit on completion");
        std::process::exit(exit_codes::OK);
    }
    Ok(outcome)
}

fn run_local(
    mut task: TaskDescriptor,
    options: RunOptions,
    env: RunEnvironment,
    registry: &SettingsRegistry,
) -> Result<SubmitOutcome> {
    if task.settings.in_process().is_some() {
        let base = match &options.output {
            OutputTarget::Allocate { base } => base.clone(),
            OutputTarget::Existing(dir) => dir.clone(),
        };
        if options.detach.is_some() {
            bail!("in-process settings cannot be detached");
        }
        warn!(
            output_directory = %base.display(),
            "running in-process: no task file or log will be written"
        );
        task.settings.set_output_directory(&base);
        if let Some(runner) = task.settings.in_process() {
            runner.run_in_process(&base)?;
        }
        return Ok(SubmitOutcome::InProcess {
            output_directory: base,
        });
    }

    let handle = TaskRun::prepare(task, options, env, registry)?.start()?;
    Ok(match handle {
        RunHandle::Attached(run) => SubmitOutcome::Finished(run.communicate()?),
        RunHandle::Detached(run) => SubmitOutcome::Detached(run),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::persist::TASK_FILE_NAME;
    use crate::io::run_log::LOG_FILE_NAME;
    use crate::test_support::{
        MarkerSettings, RecordingDispatcher, fast_options, shell_task, test_registry,
    };

    #[test]
    fn in_process_settings_skip_persistence_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = TaskDescriptor::builder(MarkerSettings::new("done.txt"))
            .build(&RunEnvironment::from_process())
            .expect("build");
        let outcome = submit(
            task,
            Target::Local(fast_options(temp.path())),
            RunEnvironment::from_process(),
            &test_registry(),
        )
        .expect("submit");

        assert!(matches!(outcome, SubmitOutcome::InProcess { .. }));
        assert_eq!(outcome.output_directory(), Some(temp.path()));
        assert!(temp.path().join("done.txt").is_file());
        assert!(!temp.path().join(TASK_FILE_NAME).exists());
        assert!(!temp.path().join(LOG_FILE_NAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn local_target_runs_supervised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = submit(
            shell_task("echo local"),
            Target::Local(fast_options(temp.path())),
            RunEnvironment::from_process(),
            &test_registry(),
        )
        .expect("submit");
        let SubmitOutcome::Finished(report) = outcome else {
            panic!("expected finished run");
        };
        assert!(report.succeeded());
        assert!(report.output_directory.join(TASK_FILE_NAME).is_file());
    }

    #[test]
    fn remote_target_sends_task_file_bytes() {
        let dispatcher = RecordingDispatcher::new();
        let outcome = submit(
            shell_task("echo remote"),
            Target::Remote(&dispatcher),
            RunEnvironment::from_process(),
            &test_registry(),
        )
        .expect("submit");
        let SubmitOutcome::Enqueued { endpoint, bytes } = outcome else {
            panic!("expected enqueued");
        };
        assert_eq!(endpoint, "memory");
        let payloads = dispatcher.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), bytes);
        let value: serde_json::Value = serde_json::from_slice(&payloads[0]).expect("json");
        assert_eq!(value["owner"], "tester");
    }
}
