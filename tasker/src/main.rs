//! Run, persist, and rerun solver tasks.
//!
//! Every run gets its own directory holding the task file, runfiles, settings,
//! and `run.log`, so any past run can be inspected or started again by its
//! identifier.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};

use tasker::core::types::{RepeatPolicy, RunStatus};
use tasker::environment::RunEnvironment;
use tasker::exit_codes;
use tasker::io::config::{CONFIG_FILE_NAME, TaskerConfig, load_config};
use tasker::io::discover::discover_tasks;
use tasker::io::dispatch::TcpDispatcher;
use tasker::io::notify::CommandNotifier;
use tasker::io::persist::{load_task, resolve_task_path};
use tasker::io::run_log::{read_log, read_log_tail, run_status};
use tasker::logging;
use tasker::settings::{CommandSettings, SettingsRegistry};
use tasker::submit::{SubmitOutcome, Target, submit};
use tasker::supervisor::{DetachSpec, OutputTarget, RunOptions};
use tasker::task::{Runfile, TaskDescriptor};

#[derive(Parser)]
#[command(name = "tasker", version, about = "Run, persist, and rerun solver tasks")]
struct Cli {
    /// Config file (defaults to ./tasker.toml when present).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More supervisor diagnostics on stderr; repeat for more detail.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a persisted task again, by task file, run directory, or identifier.
    Run {
        task: String,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Build a task from a command line and run it.
    Exec(ExecArgs),
    /// Print a task's summary; `*` shows every task below the working directory.
    Show { task: String },
    /// List tasks under a directory, oldest first.
    List {
        root: Option<PathBuf>,
        /// Search the whole subtree instead of direct children only.
        #[arg(short, long)]
        recursive: bool,
    },
    /// Report whether a run has completed.
    Status { task: String },
    /// Print a run's log.
    Log {
        task: String,
        /// Only the last N lines.
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
    /// Send a persisted task to a task server.
    Enqueue {
        task: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Args, Debug, Default)]
struct LaunchArgs {
    /// Base directory for the new run directory.
    #[arg(long, value_name = "DIR")]
    output_base: Option<PathBuf>,
    /// Run inside this existing directory without persisting the task.
    #[arg(long, value_name = "DIR", conflicts_with = "output_base")]
    output_dir: Option<PathBuf>,
    /// Copy solver output to the console as well as run.log.
    #[arg(long)]
    tee: bool,
    /// Return immediately and leave the run to a background supervisor.
    #[arg(long)]
    detach: bool,
    /// Extra attempts after the first.
    #[arg(long, value_name = "N")]
    repeats: Option<u32>,
    /// Keep repeating after a failed attempt.
    #[arg(long)]
    continue_on_failure: bool,
}

#[derive(Args, Debug)]
struct ExecArgs {
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Fixed run directory name instead of a timestamp.
    #[arg(long)]
    task_name: Option<String>,
    /// Script or config that produced this task, stored verbatim as the runscript.
    #[arg(long, value_name = "FILE")]
    generator: Option<PathBuf>,
    /// Auxiliary input stored as runfiles/<NAME>.dat.
    #[arg(long = "runfile", value_name = "NAME=FILE")]
    runfiles: Vec<String>,
    /// Solver processes; above one the launcher is used.
    #[arg(long, default_value_t = 1)]
    processes: u32,
    /// Parallel launcher, e.g. mpirun.
    #[arg(long)]
    launcher: Option<String>,
    /// Send the task to the configured task server instead of running it.
    #[arg(long)]
    enqueue: bool,
    #[command(flatten)]
    launch: LaunchArgs,
    /// Solver executable and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

struct App {
    cfg: TaskerConfig,
    config_path: Option<PathBuf>,
    registry: SettingsRegistry,
    env: RunEnvironment,
    cwd: PathBuf,
}

impl App {
    fn load(config: Option<PathBuf>) -> Result<Self> {
        let cwd = std::env::current_dir().context("read working directory")?;
        let path = config
            .clone()
            .unwrap_or_else(|| cwd.join(CONFIG_FILE_NAME));
        let cfg = load_config(&path)?;
        let mut env = RunEnvironment::from_process();
        if let Some(notifier) = CommandNotifier::from_config(&cfg.notify) {
            env = env.with_notifier(notifier);
        }
        Ok(Self {
            cfg,
            config_path: config,
            registry: SettingsRegistry::with_defaults(),
            env,
            cwd,
        })
    }

    fn search_base(&self) -> PathBuf {
        self.cfg
            .output_directory_base
            .clone()
            .unwrap_or_else(|| self.cwd.clone())
    }

    fn load_task(&self, spec: &str) -> Result<TaskDescriptor> {
        let path = resolve_task_path(spec, &self.search_base());
        Ok(load_task(&path, &self.registry)?)
    }

    fn run_directory(&self, spec: &str) -> Result<PathBuf> {
        let path = resolve_task_path(spec, &self.search_base());
        let dir = path
            .parent()
            .with_context(|| format!("task path has no directory: {}", path.display()))?;
        if !dir.is_dir() {
            bail!("no run directory at {}", dir.display());
        }
        Ok(dir.to_path_buf())
    }

    fn run_options(&self, launch: &LaunchArgs, fallback_base: Option<&Path>) -> Result<RunOptions> {
        let output = match &launch.output_dir {
            Some(dir) => OutputTarget::Existing(dir.clone()),
            None => OutputTarget::Allocate {
                base: launch
                    .output_base
                    .clone()
                    .or_else(|| self.cfg.output_directory_base.clone())
                    .or_else(|| fallback_base.map(Path::to_path_buf))
                    .unwrap_or_else(|| self.cwd.clone()),
            },
        };
        let mut options = RunOptions::from_config(&self.cfg, output);
        options.tee |= launch.tee;
        options.num_repeats = launch.repeats;
        if launch.continue_on_failure {
            options.repeat_policy = RepeatPolicy::Continue;
        }
        if launch.detach {
            let mut detach = DetachSpec::current_exe()?;
            if let Some(config) = &self.config_path {
                let config = self.cwd.join(config);
                detach.leading_args = vec!["--config".to_string(), config.display().to_string()];
            }
            options.detach = Some(detach);
        }
        Ok(options)
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let ctx = App::load(cli.config)?;
    match cli.command {
        Command::Run { task, launch } => cmd_run(&ctx, &task, &launch),
        Command::Exec(args) => cmd_exec(&ctx, args),
        Command::Show { task } => cmd_show(&ctx, &task),
        Command::List { root, recursive } => cmd_list(&ctx, root, recursive),
        Command::Status { task } => cmd_status(&ctx, &task),
        Command::Log { task, tail } => cmd_log(&ctx, &task, tail),
        Command::Enqueue { task, host, port } => cmd_enqueue(&ctx, &task, host, port),
    }
}

fn cmd_run(ctx: &App, spec: &str, launch: &LaunchArgs) -> Result<i32> {
    let task = ctx.load_task(spec)?;
    let options = ctx.run_options(launch, task.output_directory_base.as_deref())?;
    let outcome = submit(task, Target::Local(options), ctx.env.clone(), &ctx.registry)?;
    Ok(report_outcome(&outcome))
}

fn cmd_exec(ctx: &App, args: ExecArgs) -> Result<i32> {
    let (program, program_args) = args
        .command
        .split_first()
        .context("missing solver command")?;
    let mut settings =
        CommandSettings::new(program.clone()).with_args(program_args.iter().cloned());
    settings.num_processes = args.processes;
    settings.parallel_launcher = args.launcher.clone();

    let mut builder =
        TaskDescriptor::builder(settings).num_repeats(args.launch.repeats.unwrap_or(0));
    if let Some(owner) = &args.owner {
        builder = builder.owner(owner.clone());
    }
    if let Some(description) = &args.description {
        builder = builder.description(description.clone());
    }
    if let Some(name) = &args.task_name {
        builder = builder.task_name(name.clone());
    }
    if let Some(path) = &args.generator {
        let text =
            fs::read_to_string(path).with_context(|| format!("read generator {}", path.display()))?;
        builder = builder.generator(text);
    }
    for entry in &args.runfiles {
        builder = builder.runfile(parse_runfile(entry)?);
    }
    let task = builder.build(&ctx.env)?;

    if args.enqueue {
        let dispatcher = TcpDispatcher::from_config(&ctx.cfg.dispatch);
        let outcome = submit(task, Target::Remote(&dispatcher), ctx.env.clone(), &ctx.registry)?;
        return Ok(report_outcome(&outcome));
    }
    let options = ctx.run_options(&args.launch, None)?;
    let outcome = submit(task, Target::Local(options), ctx.env.clone(), &ctx.registry)?;
    Ok(report_outcome(&outcome))
}

/// Parse `NAME=FILE` into a runfile holding the file's text.
fn parse_runfile(entry: &str) -> Result<Runfile> {
    let Some((name, path)) = entry.split_once('=') else {
        bail!("runfile must be NAME=FILE, got {entry}");
    };
    let content =
        fs::read_to_string(path).with_context(|| format!("read runfile {path}"))?;
    Ok(Runfile::new(name, content, path))
}

fn report_outcome(outcome: &SubmitOutcome) -> i32 {
    match outcome {
        SubmitOutcome::Finished(report) => {
            for line in &report.log_tail {
                println!("{line}");
            }
            println!("{}", report.output_directory.display());
            if report.succeeded() {
                exit_codes::OK
            } else {
                eprintln!(
                    "run {} in {}",
                    if report.killed { "killed" } else { "failed" },
                    report.output_directory.display()
                );
                exit_codes::RUN_FAILED
            }
        }
        SubmitOutcome::InProcess { output_directory } => {
            println!("{}", output_directory.display());
            exit_codes::OK
        }
        SubmitOutcome::Detached(run) => {
            eprintln!("detached supervisor pid {}", run.pid);
            println!("{}", run.output_directory.display());
            exit_codes::OK
        }
        SubmitOutcome::Enqueued { endpoint, bytes } => {
            println!("sent {bytes} bytes to {endpoint}");
            exit_codes::OK
        }
    }
}

fn cmd_show(ctx: &App, spec: &str) -> Result<i32> {
    if spec == "*" {
        let discovery = discover_tasks(&ctx.cwd, true, &ctx.registry)?;
        for task in &discovery.tasks {
            println!("{}", task.summary());
        }
        return Ok(exit_codes::OK);
    }
    let task = ctx.load_task(spec)?;
    println!("{}", task.summary());
    Ok(exit_codes::OK)
}

fn cmd_list(ctx: &App, root: Option<PathBuf>, recursive: bool) -> Result<i32> {
    let root = root.unwrap_or_else(|| ctx.search_base());
    let discovery = discover_tasks(&root, recursive, &ctx.registry)?;
    for task in &discovery.tasks {
        let dir = task.output_directory.as_deref().unwrap_or(Path::new("?"));
        let status = match run_status(dir)? {
            RunStatus::NotStarted => "not started".to_string(),
            RunStatus::Incomplete => "incomplete".to_string(),
            RunStatus::Complete { duration_secs } => format!("complete ({duration_secs} s)"),
        };
        println!(
            "{}\t{}\t{}",
            dir.display(),
            status,
            task.description.as_deref().unwrap_or("")
        );
    }
    eprintln!("loaded {} of {} tasks", discovery.loaded(), discovery.attempted);
    Ok(exit_codes::OK)
}

fn cmd_status(ctx: &App, spec: &str) -> Result<i32> {
    let dir = ctx.run_directory(spec)?;
    Ok(match run_status(&dir)? {
        RunStatus::NotStarted => {
            println!("not started");
            exit_codes::NOT_STARTED
        }
        RunStatus::Incomplete => {
            println!("incomplete");
            exit_codes::INCOMPLETE
        }
        RunStatus::Complete { duration_secs } => {
            println!("complete in {duration_secs} s");
            exit_codes::OK
        }
    })
}

fn cmd_log(ctx: &App, spec: &str, tail: Option<usize>) -> Result<i32> {
    let dir = ctx.run_directory(spec)?;
    match tail {
        Some(count) => {
            for line in read_log_tail(&dir, count)? {
                println!("{line}");
            }
        }
        None => match read_log(&dir)? {
            Some(log) => print!("{log}"),
            None => {
                eprintln!("no log in {}", dir.display());
                return Ok(exit_codes::NOT_STARTED);
            }
        },
    }
    Ok(exit_codes::OK)
}

fn cmd_enqueue(ctx: &App, spec: &str, host: Option<String>, port: Option<u16>) -> Result<i32> {
    let task = ctx.load_task(spec)?;
    let mut dispatcher = TcpDispatcher::from_config(&ctx.cfg.dispatch);
    if let Some(host) = host {
        dispatcher.host = host;
    }
    if let Some(port) = port {
        dispatcher.port = port;
    }
    let outcome = submit(task, Target::Remote(&dispatcher), ctx.env.clone(), &ctx.registry)?;
    Ok(report_outcome(&outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_launch_flags() {
        let cli = Cli::parse_from([
            "tasker",
            "run",
            "20110516_091754",
            "--tee",
            "--repeats",
            "2",
            "--continue-on-failure",
        ]);
        let Command::Run { task, launch } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(task, "20110516_091754");
        assert!(launch.tee);
        assert!(!launch.detach);
        assert_eq!(launch.repeats, Some(2));
        assert!(launch.continue_on_failure);
    }

    #[test]
    fn parse_global_config_before_subcommand() {
        let cli = Cli::parse_from(["tasker", "--config", "/tmp/t.toml", "status", "x"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(matches!(cli.command, Command::Status { .. }));
    }

    #[test]
    fn output_dir_conflicts_with_output_base() {
        let parsed = Cli::try_parse_from([
            "tasker",
            "run",
            "x",
            "--output-dir",
            "a",
            "--output-base",
            "b",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_exec_keeps_solver_flags() {
        let cli = Cli::parse_from([
            "tasker",
            "exec",
            "--runfile",
            "grid=grid.txt",
            "--",
            "solver",
            "--steps",
            "10",
        ]);
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, vec!["solver", "--steps", "10"]);
        assert_eq!(args.runfiles, vec!["grid=grid.txt"]);
        assert_eq!(args.processes, 1);
    }

    #[test]
    fn verbose_flag_counts_anywhere() {
        let cli = Cli::parse_from(["tasker", "-vv", "status", "x"]);
        assert_eq!(cli.verbose, 2);
        let cli = Cli::parse_from(["tasker", "list", "-v"]);
        assert_eq!(cli.verbose, 1);
        let cli = Cli::parse_from(["tasker", "status", "x"]);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_list_recursive() {
        let cli = Cli::parse_from(["tasker", "list", "runs", "-r"]);
        assert!(matches!(
            cli.command,
            Command::List { recursive: true, root: Some(_) }
        ));
    }

    #[test]
    fn runfile_entry_requires_name_and_path() {
        assert!(parse_runfile("no-separator").is_err());
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("grid.txt");
        fs::write(&path, "1 2 3\n").expect("write");
        let runfile = parse_runfile(&format!("grid={}", path.display())).expect("parse");
        assert_eq!(runfile.name, "grid");
        assert_eq!(runfile.content, "1 2 3\n");
    }
}
