//! CLI tests: spawn the tasker binary and check exit codes and run directories.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use tasker::core::types::RunStatus;
use tasker::exit_codes;
use tasker::io::persist::TASK_FILE_NAME;
use tasker::io::run_log::{read_log, run_status};

fn tasker(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tasker"))
        .current_dir(cwd)
        .args(args)
        .output()
        .expect("run tasker")
}

fn stdout_dir(output: &Output) -> PathBuf {
    let text = String::from_utf8_lossy(&output.stdout);
    PathBuf::from(text.lines().last().expect("output directory line").trim())
}

#[test]
fn exec_then_status_and_rerun() {
    let temp = tempfile::tempdir().expect("tempdir");
    let exec = tasker(
        temp.path(),
        &[
            "exec",
            "--description",
            "smoke",
            "--",
            "sh",
            "-c",
            "echo 'Total time: 1.5 s'",
        ],
    );
    assert_eq!(exec.status.code(), Some(exit_codes::OK), "{exec:?}");
    let dir = stdout_dir(&exec);
    assert!(dir.join(TASK_FILE_NAME).is_file());

    let status = tasker(temp.path(), &["status", &dir.display().to_string()]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));

    let identifier = dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("task_"))
        .expect("timestamped directory")
        .to_string();
    let rerun = tasker(temp.path(), &["run", &identifier]);
    assert_eq!(rerun.status.code(), Some(exit_codes::OK), "{rerun:?}");
    assert_ne!(stdout_dir(&rerun), dir);
}

#[test]
fn failing_solver_maps_to_run_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = tasker(temp.path(), &["exec", "--", "sh", "-c", "exit 7"]);
    assert_eq!(output.status.code(), Some(exit_codes::RUN_FAILED));
}

#[test]
fn missing_task_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = tasker(temp.path(), &["run", "20110516_091754"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("couldn't find the task"), "{stderr}");
}

#[test]
fn detached_run_returns_before_solver_finishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let started = Instant::now();
    let output = tasker(
        temp.path(),
        &[
            "exec",
            "--detach",
            "--",
            "sh",
            "-c",
            "sleep 2; echo 'Total time: 2 s'",
        ],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    let dir = stdout_dir(&output);

    let deadline = Instant::now() + Duration::from_secs(20);
    while !run_status(&dir).expect("status").is_complete() {
        assert!(Instant::now() < deadline, "detached run never completed");
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(
        run_status(&dir).expect("status"),
        RunStatus::Complete { duration_secs: 2.0 }
    );
    assert!(read_log(&dir).expect("read").is_some());
}
