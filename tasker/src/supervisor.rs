//! Supervised execution of one task.
//!
//! A [`TaskRun`] owns a single descriptor and walks it through
//! `Initializing -> Spawned -> Waiting -> (Repeating -> Spawned ...) ->
//! Finalizing -> Done`. All attempts append to one `run.log`; the log is
//! sanitized once after the final attempt.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::{is_valid_transition, phase_after_exit};
use crate::core::types::{AttemptExit, AttemptRecord, RepeatPolicy, RunPhase};
use crate::environment::RunEnvironment;
use crate::io::config::TaskerConfig;
use crate::io::outdir::allocate_output_directory;
use crate::io::persist::save_task;
use crate::io::process::{KillSwitch, build_command, spawn_child, spawn_detached};
use crate::io::run_log::{log_path, read_log_tail, sanitize_log_file};
use crate::io::tee::{SharedSink, Sink, TeeHandle, spawn_tee};
use crate::settings::SettingsRegistry;
use crate::task::TaskDescriptor;

/// Where the run directory comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Allocate a fresh directory under `base` and persist the task into it.
    Allocate { base: PathBuf },
    /// Reuse an existing directory as-is; nothing is persisted.
    Existing(PathBuf),
}

/// Re-launch of the supervisor as an independent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachSpec {
    /// Supervisor binary, normally the current executable.
    pub program: PathBuf,
    /// Arguments placed before the `run` subcommand (e.g. `--config <path>`).
    pub leading_args: Vec<String>,
}

impl DetachSpec {
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("locate current executable")?,
            leading_args: Vec::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output: OutputTarget,
    /// Copy child output to the console as well as the log.
    pub tee: bool,
    pub detach: Option<DetachSpec>,
    /// Overrides the descriptor's `num_repeats`.
    pub num_repeats: Option<u32>,
    pub repeat_policy: RepeatPolicy,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub log_tail_lines: usize,
}

impl RunOptions {
    pub fn new(output: OutputTarget) -> Self {
        Self::from_config(&TaskerConfig::default(), output)
    }

    pub fn from_config(cfg: &TaskerConfig, output: OutputTarget) -> Self {
        Self {
            output,
            tee: cfg.tee,
            detach: None,
            num_repeats: None,
            repeat_policy: cfg.repeat_policy,
            poll_interval: cfg.poll_interval(),
            kill_grace: cfg.kill_grace(),
            log_tail_lines: cfg.log_tail_lines,
        }
    }
}

/// Summary returned once a run has finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub output_directory: PathBuf,
    pub log_path: PathBuf,
    /// One record per spawned attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    pub killed: bool,
    /// Whether finalization rewrote the log to apply backspaces.
    pub log_rewritten: bool,
    /// Last lines of the sanitized log.
    pub log_tail: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    /// True when the run was not killed and its last attempt exited zero.
    pub fn succeeded(&self) -> bool {
        !self.killed
            && self
                .attempts
                .last()
                .is_some_and(|attempt| attempt.exit == AttemptExit::Success)
    }
}

/// A task bound to a run directory, ready to start.
pub struct TaskRun {
    task: TaskDescriptor,
    options: RunOptions,
    env: RunEnvironment,
    output_directory: PathBuf,
    log_path: PathBuf,
    num_repeats: u32,
    current_run: u32,
    phase: RunPhase,
    kill_switch: KillSwitch,
    log: Option<File>,
    tees: Vec<TeeHandle>,
    attempt_started: Instant,
    attempts: Vec<AttemptRecord>,
    /// A kill arrived between attempts and cancelled the remaining repeats.
    repeats_cancelled: bool,
    started: Instant,
}

impl TaskRun {
    /// Resolve the run directory and persist the task into it.
    ///
    /// An [`OutputTarget::Existing`] directory must already exist and is not
    /// written to until the first spawn.
    #[instrument(skip_all, fields(owner = %task.owner))]
    pub fn prepare(
        mut task: TaskDescriptor,
        options: RunOptions,
        env: RunEnvironment,
        registry: &SettingsRegistry,
    ) -> Result<Self> {
        if task.already_run {
            warn!("task has already been run; running it again");
        }

        let output_directory = match &options.output {
            OutputTarget::Allocate { base } => {
                let base = std::path::absolute(base)
                    .with_context(|| format!("resolve {}", base.display()))?;
                let dir = allocate_output_directory(&base, task.task_name.as_deref())?;
                task.output_directory = Some(dir.clone());
                task.output_directory_base = Some(base);
                task.settings.set_output_directory(&dir);
                save_task(&task, &dir, registry)?;
                dir
            }
            OutputTarget::Existing(dir) => {
                if !dir.is_dir() {
                    bail!("output directory {} does not exist", dir.display());
                }
                let dir = std::path::absolute(dir)
                    .with_context(|| format!("resolve {}", dir.display()))?;
                task.output_directory = Some(dir.clone());
                task.settings.set_output_directory(&dir);
                dir
            }
        };
        info!(output_directory = %output_directory.display(), "run directory ready");

        let num_repeats = options.num_repeats.unwrap_or(task.num_repeats);
        Ok(Self {
            log_path: log_path(&output_directory),
            output_directory,
            num_repeats,
            current_run: 0,
            phase: RunPhase::Initializing,
            kill_switch: KillSwitch::new(),
            log: None,
            tees: Vec::new(),
            attempt_started: Instant::now(),
            attempts: Vec::new(),
            repeats_cancelled: false,
            started: Instant::now(),
            task,
            options,
            env,
        })
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn task(&self) -> &TaskDescriptor {
        &self.task
    }

    /// Handle that can cancel the run from another thread.
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    /// Spawn the first attempt, or hand the run to a detached supervisor.
    pub fn start(mut self) -> Result<RunHandle> {
        if let Some(detach) = self.options.detach.clone() {
            return self.start_detached(&detach).map(RunHandle::Detached);
        }
        self.spawn_attempt()?;
        Ok(RunHandle::Attached(AttachedRun { run: self }))
    }

    fn start_detached(mut self, detach: &DetachSpec) -> Result<DetachedRun> {
        let dir = self.output_directory.display().to_string();
        let mut args = detach.leading_args.clone();
        args.extend([
            "run".to_string(),
            dir.clone(),
            "--output-dir".to_string(),
            dir,
            "--repeats".to_string(),
            self.num_repeats.to_string(),
        ]);
        if self.options.repeat_policy == RepeatPolicy::Continue {
            args.push("--continue-on-failure".to_string());
        }

        let pid = spawn_detached(&detach.program, &args, &self.output_directory)?;
        info!(
            pid,
            output_directory = %self.output_directory.display(),
            "detached supervisor started"
        );
        self.transition(RunPhase::Done);
        Ok(DetachedRun {
            pid,
            output_directory: self.output_directory,
        })
    }

    fn transition(&mut self, to: RunPhase) {
        debug_assert!(
            is_valid_transition(self.phase, to),
            "invalid transition {:?} -> {:?}",
            self.phase,
            to
        );
        debug!(from = ?self.phase, to = ?to, attempt = self.current_run, "phase");
        self.phase = to;
    }

    /// Open `run.log` for appending, once per run.
    fn log_file(&mut self) -> Result<&File> {
        if self.log.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .with_context(|| format!("open {}", self.log_path.display()))?;
            self.log = Some(file);
        }
        self.log
            .as_ref()
            .ok_or_else(|| anyhow!("run log not open"))
    }

    fn spawn_attempt(&mut self) -> Result<()> {
        self.transition(RunPhase::Spawned);
        debug!(settings = %self.task.settings, "resolving command");
        let spec = self.task.settings.command(&self.output_directory)?;
        let tee = self.options.tee;
        let log = self.log_file()?.try_clone().context("clone log handle")?;

        let mut cmd = build_command(&spec, &self.output_directory);
        if tee {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            let err_log = log.try_clone().context("clone log handle")?;
            cmd.stdout(Stdio::from(log.try_clone().context("clone log handle")?))
                .stderr(Stdio::from(err_log));
        }

        let mut child = spawn_child(cmd, &spec.program, &self.output_directory)?;
        self.attempt_started = Instant::now();
        info!(
            attempt = self.current_run,
            pid = child.id(),
            program = %spec.program,
            "attempt started"
        );

        if tee {
            let sink = SharedSink::new(log);
            if let Some(stdout) = child.stdout.take() {
                let sinks: Vec<Sink> = vec![Box::new(sink.clone()), Box::new(std::io::stdout())];
                self.tees.push(spawn_tee("stdout", stdout, sinks)?);
            }
            if let Some(stderr) = child.stderr.take() {
                let sinks: Vec<Sink> = vec![Box::new(sink), Box::new(std::io::stderr())];
                self.tees.push(spawn_tee("stderr", stderr, sinks)?);
            }
        }

        self.kill_switch.install(child)?;
        self.transition(RunPhase::Waiting);
        Ok(())
    }

    fn join_tees(&mut self) -> Result<()> {
        for tee in self.tees.drain(..) {
            let stats = tee.join()?;
            debug!(lines = stats.lines, bytes = stats.bytes, "tee drained");
        }
        Ok(())
    }

    /// Wait out the current attempt and every remaining repeat, then finalize.
    fn run_to_completion(mut self) -> Result<RunReport> {
        loop {
            let outcome = self
                .kill_switch
                .wait(self.options.poll_interval, self.options.kill_grace)?;
            self.join_tees()?;
            let exit = classify_exit(outcome.status, outcome.killed);
            self.record_attempt(exit, outcome.status)?;

            match phase_after_exit(
                self.current_run,
                self.num_repeats,
                exit,
                self.options.repeat_policy,
            ) {
                RunPhase::Repeating => {
                    self.transition(RunPhase::Repeating);
                    if self.kill_switch.is_requested() {
                        self.repeats_cancelled = true;
                        break;
                    }
                    self.current_run += 1;
                    self.spawn_attempt()?;
                }
                _ => break,
            }
        }
        self.finalize()
    }

    fn record_attempt(&mut self, exit: AttemptExit, status: ExitStatus) -> Result<()> {
        let record = AttemptRecord {
            index: self.current_run,
            exit,
            exit_code: status.code(),
            duration_ms: u64::try_from(self.attempt_started.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        };
        match exit {
            AttemptExit::Success => {
                info!(attempt = record.index, duration_ms = record.duration_ms, "attempt finished");
            }
            AttemptExit::Failure => {
                warn!(attempt = record.index, code = ?record.exit_code, "attempt failed");
                self.append_log_note(&format!(
                    "attempt {} exited with status {}",
                    record.index, status
                ))?;
            }
            AttemptExit::Killed => {
                warn!(attempt = record.index, "attempt killed");
                self.append_log_note(&format!("attempt {} killed", record.index))?;
            }
        }
        self.attempts.push(record);
        Ok(())
    }

    fn append_log_note(&mut self, note: &str) -> Result<()> {
        let path = self.log_path.clone();
        let mut log = self.log_file()?;
        writeln!(log, "[tasker] {note}").with_context(|| format!("write {}", path.display()))
    }

    fn finalize(mut self) -> Result<RunReport> {
        self.transition(RunPhase::Finalizing);
        if let Some(log) = self.log.take() {
            log.sync_all()
                .with_context(|| format!("flush {}", self.log_path.display()))?;
        }

        let log_rewritten = sanitize_log_file(&self.log_path)?;
        let log_tail = read_log_tail(&self.output_directory, self.options.log_tail_lines)?;
        self.task.already_run = true;

        let attempts = std::mem::take(&mut self.attempts);
        let killed = self.repeats_cancelled
            || attempts.iter().any(|attempt| attempt.exit == AttemptExit::Killed);
        let report = RunReport {
            output_directory: self.output_directory.clone(),
            log_path: self.log_path.clone(),
            attempts,
            killed,
            log_rewritten,
            log_tail,
            elapsed: self.started.elapsed(),
        };
        self.notify(&report);
        self.transition(RunPhase::Done);
        info!(
            attempts = report.attempts.len(),
            killed = report.killed,
            elapsed_ms = report.elapsed.as_millis(),
            "run finished"
        );
        Ok(report)
    }

    fn notify(&self, report: &RunReport) {
        let Some(notifier) = &self.env.notifier else {
            return;
        };
        let title = if report.succeeded() {
            "Task finished"
        } else {
            "Task failed"
        };
        let body = match &self.task.description {
            Some(description) => format!("{description}\n{}", report.output_directory.display()),
            None => report.output_directory.display().to_string(),
        };
        if let Err(err) = notifier.notify(title, &body) {
            debug!(err = %err, "notification failed");
        }
    }
}

fn classify_exit(status: ExitStatus, killed: bool) -> AttemptExit {
    if killed {
        AttemptExit::Killed
    } else if status.success() {
        AttemptExit::Success
    } else {
        AttemptExit::Failure
    }
}

/// Run supervised by this process.
pub struct AttachedRun {
    run: TaskRun,
}

impl AttachedRun {
    pub fn pid(&self) -> Option<u32> {
        self.run.kill_switch.pid()
    }

    pub fn output_directory(&self) -> &Path {
        &self.run.output_directory
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.run.kill_switch()
    }

    /// Terminate the live attempt. Remaining repeats are skipped.
    pub fn kill(&self) {
        self.run.kill_switch.kill();
    }

    /// Block until every attempt has exited and the log is finalized.
    pub fn communicate(self) -> Result<RunReport> {
        self.run.run_to_completion()
    }
}

/// Run handed to an independent supervisor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedRun {
    pub pid: u32,
    pub output_directory: PathBuf,
}

pub enum RunHandle {
    Attached(AttachedRun),
    Detached(DetachedRun),
}

impl RunHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            RunHandle::Attached(run) => run.pid(),
            RunHandle::Detached(run) => Some(run.pid),
        }
    }

    pub fn output_directory(&self) -> &Path {
        match self {
            RunHandle::Attached(run) => run.output_directory(),
            RunHandle::Detached(run) => &run.output_directory,
        }
    }

    /// Kill the attached run. Detached runs are not controlled from here.
    pub fn kill(&self) {
        match self {
            RunHandle::Attached(run) => run.kill(),
            RunHandle::Detached(run) => {
                debug!(pid = run.pid, "kill ignored for detached run");
            }
        }
    }

    /// Wait for an attached run; returns `None` immediately for a detached one.
    pub fn communicate(self) -> Result<Option<RunReport>> {
        match self {
            RunHandle::Attached(run) => run.communicate().map(Some),
            RunHandle::Detached(_) => Ok(None),
        }
    }
}

/// Prepare, start, and wait for a task in one call.
pub fn run_task(
    task: TaskDescriptor,
    options: RunOptions,
    env: RunEnvironment,
    registry: &SettingsRegistry,
) -> Result<RunHandle> {
    TaskRun::prepare(task, options, env, registry)?.start()
}
