//! Controller-side view of an OS process identified by pid.

#[cfg(target_os = "linux")]
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::LOG_TARGET;
use crate::error::{DaemonError, DaemonResult};
use crate::sys::unix::{self, Pid};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a process that existed when it was resolved.
///
/// On Linux the process start time is captured as well, so a handle never
/// reports a later, unrelated process that reused the pid as running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    started: Option<u64>,
}

impl ProcessHandle {
    /// Resolves `pid`; `None` when no such process exists.
    pub fn resolve(pid: Pid) -> Option<Self> {
        if pid <= 0 || !pid_exists(pid) {
            return None;
        }
        Some(Self {
            pid,
            started: start_time(pid),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process still exists, is not a zombie, and is the same
    /// process this handle was resolved for.
    pub fn is_running(&self) -> bool {
        if !pid_exists(self.pid) || is_zombie(self.pid) {
            return false;
        }
        match self.started {
            Some(started) => start_time(self.pid) == Some(started),
            None => true,
        }
    }

    /// Asks the process to terminate with SIGTERM.
    ///
    /// A process that already disappeared counts as terminated.
    pub fn terminate(&self) -> DaemonResult<()> {
        match unix::kill(self.pid, Some(libc::SIGTERM)) {
            Ok(()) => {
                info!(target: LOG_TARGET, pid = self.pid, "sent SIGTERM");
                Ok(())
            }
            Err(error) if error.raw_os_error() == Some(libc::ESRCH) => {
                debug!(target: LOG_TARGET, pid = self.pid, "process already gone");
                Ok(())
            }
            Err(source) => Err(DaemonError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }

    /// Blocks until the process is gone, or `timeout` elapses.
    ///
    /// The process is generally not our child, so this polls liveness rather
    /// than calling `waitpid`.
    pub fn wait(&self, timeout: Option<Duration>) -> DaemonResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.is_running() {
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(DaemonError::TerminateTimeout {
                        pid: self.pid,
                        timeout: timeout.unwrap_or_default(),
                    });
                }
                thread::sleep(POLL_INTERVAL.min(deadline - now));
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }
        Ok(())
    }
}

/// Whether any process currently owns `pid`.
///
/// `EPERM` means the process exists but belongs to someone else.
pub(crate) fn pid_exists(pid: Pid) -> bool {
    match unix::kill(pid, None) {
        Ok(()) => true,
        Err(error) => error.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(target_os = "linux")]
fn read_stat(pid: Pid) -> io::Result<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'.
    let rest = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))?;
    Ok(rest.split_whitespace().map(str::to_owned).collect())
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    read_stat(pid)
        .ok()
        .and_then(|fields| fields.first().map(|state| state == "Z" || state == "X"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

/// Start time in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
#[cfg(target_os = "linux")]
fn start_time(pid: Pid) -> Option<u64> {
    // Field 22 overall is index 19 once pid and comm are stripped.
    read_stat(pid).ok()?.get(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn start_time(_pid: Pid) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};

    fn sleeper() -> (Child, Pid) {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = Pid::try_from(child.id()).expect("pid fits");
        (child, pid)
    }

    #[test]
    fn absent_process_does_not_resolve() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = Pid::try_from(child.id()).expect("pid fits");
        child.wait().expect("reap true");
        assert_eq!(ProcessHandle::resolve(pid), None);
    }

    #[test]
    fn non_positive_pids_do_not_resolve() {
        assert_eq!(ProcessHandle::resolve(0), None);
        assert_eq!(ProcessHandle::resolve(-1), None);
    }

    #[test]
    fn own_process_is_running() {
        let handle = ProcessHandle::resolve(unix::getpid()).expect("resolve self");
        assert!(handle.is_running());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminate_then_wait_observes_exit() {
        let (mut child, pid) = sleeper();
        let handle = ProcessHandle::resolve(pid).expect("resolve sleeper");
        assert!(handle.is_running());
        handle.terminate().expect("terminate");
        // Our own child lingers as a zombie until reaped; zombies are not running.
        handle
            .wait(Some(Duration::from_secs(5)))
            .expect("sleeper exits");
        child.wait().expect("reap sleeper");
        assert!(!handle.is_running());
    }

    #[test]
    fn wait_times_out_on_live_process() {
        let (mut child, pid) = sleeper();
        let handle = ProcessHandle::resolve(pid).expect("resolve sleeper");
        let result = handle.wait(Some(Duration::from_millis(100)));
        child.kill().expect("kill sleeper");
        child.wait().expect("reap sleeper");
        let Err(DaemonError::TerminateTimeout { pid: seen, .. }) = result else {
            panic!("expected TerminateTimeout, got {result:?}");
        };
        assert_eq!(seen, pid);
    }
}
