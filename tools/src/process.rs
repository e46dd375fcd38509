//! Process-group signalling for spawned shell commands.

use std::time::Duration;

/// Time a process group gets between `SIGTERM` and `SIGKILL` on abort.
pub const KILL_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Signalled,
}

/// RAII guard that kills a process group on drop.
///
/// Created right after spawn so the group is cleaned up if the owning worker
/// is dropped mid-flight. Call `disarm()` once the process has been reaped.
pub struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    #[must_use]
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = force_kill(pid);
        }
    }
}

/// Ask the process group to terminate.
///
/// Unix sends `SIGTERM` to the group (the child is a session leader, so
/// pid == pgid). Windows runs `taskkill /f /t`, which is already forceful.
pub fn terminate(pid: u32) -> std::io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM)
    }
    #[cfg(windows)]
    {
        taskkill_tree(pid)
    }
}

/// Kill the process group outright.
pub fn force_kill(pid: u32) -> std::io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGKILL)
    }
    #[cfg(windows)]
    {
        taskkill_tree(pid)
    }
}

/// Send `SIGHUP` to a single process, the way a closing terminal would.
#[cfg(unix)]
pub fn hang_up(pid: u32) -> std::io::Result<KillOutcome> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Ok(KillOutcome::NotRunning);
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGHUP) } == -1 {
        return not_running_or_err(std::io::Error::last_os_error());
    }
    Ok(KillOutcome::Signalled)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<KillOutcome> {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return Ok(KillOutcome::NotRunning);
    };
    // SAFETY: killpg(2) has no memory-safety preconditions.
    if unsafe { libc::killpg(pgid, signal) } == -1 {
        return not_running_or_err(std::io::Error::last_os_error());
    }
    Ok(KillOutcome::Signalled)
}

#[cfg(unix)]
fn not_running_or_err(err: std::io::Error) -> std::io::Result<KillOutcome> {
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(KillOutcome::NotRunning)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn taskkill_tree(pid: u32) -> std::io::Result<KillOutcome> {
    let status = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/f", "/t"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(KillOutcome::Signalled)
    } else {
        Ok(KillOutcome::NotRunning)
    }
}

/// Put the child process in its own session (Unix only) so the entire process
/// group can be signalled via `killpg`.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut tokio::process::Command) {
    // SAFETY: the pre_exec closure only calls async-signal-safe functions.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Linux-only: the child dies with Keel instead of running on orphaned.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}
