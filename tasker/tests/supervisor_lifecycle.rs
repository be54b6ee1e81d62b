//! End-to-end supervisor runs against real shell children.

#![cfg(unix)]

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use tasker::core::types::{AttemptExit, RunStatus};
use tasker::environment::RunEnvironment;
use tasker::io::persist::{GENERATOR_FILE_NAME, RUNFILES_DIR_NAME, TASK_FILE_NAME, load_task};
use tasker::io::run_log::{read_log, run_status};
use tasker::settings::SettingsRegistry;
use tasker::supervisor::{RunHandle, TaskRun, run_task};
use tasker::task::{Runfile, TaskDescriptor};
use tasker::test_support::{fast_options, shell_settings, shell_task};

fn communicate(handle: RunHandle) -> tasker::supervisor::RunReport {
    handle
        .communicate()
        .expect("communicate")
        .expect("attached run")
}

#[test]
fn repeats_share_one_log_in_attempt_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = "n=$(cat count 2>/dev/null || echo 0); echo \"run $n\"; echo $((n + 1)) > count";
    let mut task = shell_task(script);
    task.num_repeats = 3;

    let report = communicate(
        run_task(
            task,
            fast_options(temp.path()),
            RunEnvironment::from_process(),
            &SettingsRegistry::with_defaults(),
        )
        .expect("run"),
    );

    assert_eq!(report.attempts.len(), 4);
    assert!(report.attempts.iter().all(|a| a.exit == AttemptExit::Success));
    let log = read_log(&report.output_directory).expect("read").expect("log");
    assert_eq!(log, "run 0\nrun 1\nrun 2\nrun 3\n");
}

#[test]
fn completed_run_is_persisted_and_rerunnable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = SettingsRegistry::with_defaults();
    let env = RunEnvironment::from_process().with_user("alice");
    let task = TaskDescriptor::builder(shell_settings(
        "cat runfiles/mesh.dat; echo 'Total time: 4.5 s'",
    ))
    .description("mesh check")
    .generator("#!/bin/sh\necho generated\n")
    .runfile(Runfile::new("mesh", "0 0 1 1\n", "unit square"))
    .build(&env)
    .expect("build");

    let first = communicate(
        run_task(task, fast_options(temp.path()), env.clone(), &registry).expect("run"),
    );
    let dir = first.output_directory.clone();
    assert!(first.succeeded());
    assert_eq!(
        run_status(&dir).expect("status"),
        RunStatus::Complete { duration_secs: 4.5 }
    );
    assert_eq!(
        fs::read_to_string(dir.join(RUNFILES_DIR_NAME).join("mesh.dat")).expect("runfile"),
        "0 0 1 1\n"
    );
    assert_eq!(
        fs::read_to_string(dir.join(GENERATOR_FILE_NAME)).expect("runscript"),
        "#!/bin/sh\necho generated\n"
    );

    let reloaded = load_task(&dir.join(TASK_FILE_NAME), &registry).expect("load");
    assert_eq!(reloaded.owner, "alice");
    assert_eq!(reloaded.description.as_deref(), Some("mesh check"));
    assert_eq!(reloaded.output_directory.as_deref(), Some(dir.as_path()));

    let second = communicate(
        run_task(reloaded, fast_options(temp.path()), env, &registry).expect("rerun"),
    );
    assert_ne!(second.output_directory, dir);
    assert_eq!(
        read_log(&second.output_directory).expect("read"),
        read_log(&dir).expect("read")
    );
}

#[test]
fn kill_mid_run_closes_log_and_returns_promptly() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut options = fast_options(temp.path());
    options.tee = true;
    let run = TaskRun::prepare(
        shell_task("echo start; exec sleep 30"),
        options,
        RunEnvironment::from_process(),
        &SettingsRegistry::with_defaults(),
    )
    .expect("prepare");
    let dir = run.output_directory().to_path_buf();
    let switch = run.kill_switch();
    let handle = run.start().expect("start");
    assert!(handle.pid().is_some());

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        switch.kill();
    });
    let started = Instant::now();
    let report = communicate(handle);
    killer.join().expect("join");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.killed);
    assert!(!report.succeeded());
    assert_eq!(run_status(&dir).expect("status"), RunStatus::Incomplete);
    let log = read_log(&dir).expect("read").expect("log");
    assert!(log.starts_with("start\n"));
}
