//! Child process control: spawning, cancellable waiting, and detached launches.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

use crate::error::SpawnError;
use crate::settings::CommandSpec;

/// Build the command for one attempt, running inside `workdir`.
///
/// On Unix the attempt leads its own process group so a kill reaches every
/// process it starts. Stdout and stderr are left for the caller to wire.
pub fn build_command(spec: &CommandSpec, workdir: &Path) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(workdir)
        .stdin(Stdio::null());
    own_process_group(&mut cmd);
    cmd
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// Spawn `cmd`, mapping failures to [`SpawnError`].
pub fn spawn_child(mut cmd: Command, program: &str, workdir: &Path) -> Result<Child> {
    debug!(program, workdir = %workdir.display(), "spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(source) => {
            error!(program, err = %source, "failed to spawn command");
            Err(SpawnError {
                program: program.to_string(),
                workdir: workdir.to_path_buf(),
                source,
            }
            .into())
        }
    }
}

/// How a waited-on child ended.
#[derive(Debug, Clone, Copy)]
pub struct WaitOutcome {
    pub status: ExitStatus,
    /// A kill was requested before the child exited.
    pub killed: bool,
}

#[derive(Default)]
struct KillState {
    requested: AtomicBool,
    /// Pid of the installed child, 0 when none.
    pid: AtomicU32,
    child: Mutex<Option<Child>>,
}

/// Shared handle to the live child of a supervised run.
///
/// Clones can be moved to other threads; `kill()` terminates whichever attempt
/// is currently running and stops further repeats.
#[derive(Clone, Default)]
pub struct KillSwitch {
    state: Arc<KillState>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and send a terminate signal to the live child's
    /// process group.
    ///
    /// Never blocks on the waiting thread.
    pub fn kill(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid() {
            debug!(pid, "terminating child process group");
            terminate_group(pid);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Pid of the live child, if one is installed.
    pub fn pid(&self) -> Option<u32> {
        match self.state.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Hand a freshly spawned child to the switch.
    ///
    /// A kill requested before installation is applied immediately.
    pub fn install(&self, child: Child) -> Result<()> {
        let pid = child.id();
        {
            let mut guard = self.lock_child()?;
            if guard.is_some() {
                return Err(anyhow!("a child process is already installed"));
            }
            *guard = Some(child);
        }
        self.state.pid.store(pid, Ordering::SeqCst);
        if self.is_requested() {
            terminate_group(pid);
        }
        Ok(())
    }

    /// Block until the installed child exits.
    ///
    /// After a kill request the child gets `grace` to exit before its whole
    /// process group is hard-killed.
    pub fn wait(&self, poll: Duration, grace: Duration) -> Result<WaitOutcome> {
        let mut kill_seen_at: Option<Instant> = None;
        let mut escalated = false;
        let mut guard = self.lock_child()?;
        let child = guard
            .as_mut()
            .ok_or_else(|| anyhow!("no child process to wait on"))?;
        let pid = child.id();
        loop {
            let requested_before = self.is_requested();
            if let Some(status) = child.wait_timeout(poll).context("wait for child")? {
                let killed = kill_attributed(requested_before, self.is_requested(), status);
                if killed {
                    // Stragglers that ignored the terminate still hold the output pipes.
                    force_kill_group(pid);
                }
                self.state.pid.store(0, Ordering::SeqCst);
                guard.take();
                return Ok(WaitOutcome { status, killed });
            }
            if !requested_before {
                continue;
            }
            let seen = *kill_seen_at.get_or_insert_with(Instant::now);
            if escalated || (cfg!(unix) && seen.elapsed() < grace) {
                continue;
            }
            warn!(pid, "child still running after terminate, killing process group");
            force_kill_group(pid);
            if let Err(err) = child.kill() {
                warn!(err = %err, "hard kill failed");
            }
            escalated = true;
        }
    }

    fn lock_child(&self) -> Result<MutexGuard<'_, Option<Child>>> {
        self.state
            .child
            .lock()
            .map_err(|_| anyhow!("child process lock poisoned"))
    }
}

/// Whether an exit counts as killed.
///
/// A request seen before the wait that observed the exit always counts. A
/// request that raced the exit counts only when a signal ended the child, so
/// a natural exit followed by a late kill stays a natural exit.
fn kill_attributed(requested_before: bool, requested_after: bool, status: ExitStatus) -> bool {
    requested_before || (requested_after && ended_by_signal(status))
}

#[cfg(unix)]
fn ended_by_signal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn ended_by_signal(_status: ExitStatus) -> bool {
    false
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
}

/// Elsewhere the waiting thread hard-kills instead.
#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(unix)]
fn force_kill_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn force_kill_group(_pid: u32) {}

/// Signal the process group led by `pid`, falling back to the leader alone.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, not signalling");
        return;
    };
    let target = Pid::from_raw(raw);
    match killpg(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!(pid, ?signal, err = %err, "killpg failed, signalling leader only");
            match kill(target, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!(pid, ?signal, err = %err, "failed to signal child"),
            }
        }
    }
}

/// Start `program` as an independent process and return its pid without waiting.
///
/// Stdio is detached. On Unix the child gets its own process group so terminal
/// signals aimed at the caller do not reach it. A background thread reaps it.
pub fn spawn_detached(program: &Path, args: &[String], workdir: &Path) -> Result<u32> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    own_process_group(&mut cmd);

    let program_name = program.display().to_string();
    let mut child = spawn_child(cmd, &program_name, workdir)?;
    let pid = child.id();
    thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || {
            if let Err(err) = child.wait() {
                warn!(pid, err = %err, "failed to reap detached child");
            }
        })
        .context("spawn reaper thread")?;
    Ok(pid)
}
