//! Controller side of daemonization: the double-fork protocol and lifecycle control.
//!
//! ```text
//! controller ──fork──► first child ──setsid, session setup──fork──► grandchild
//!     ▲                     │                                          │
//!     │                   _exit(0)                                 write pid
//!     └──────────────────────── handshake pipe ◄───────────────────────┘
//! ```
//!
//! The grandchild is the only process that knows the daemon pid, so it
//! reports it over a pipe the controller created before the first fork.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::LOG_TARGET;
use crate::daemon::DaemonSpec;
use crate::error::{DaemonError, DaemonResult, PidFileError};
use crate::pidfile::PidFile;
use crate::process::ProcessHandle;
use crate::runtime::{Daemon, EXIT_STARTUP_FAILED, EXIT_TARGET_FAILED};
use crate::session;
use crate::sys::unix::{self, Fork, Pid};

/// How long `start` waits for the daemon to report its pid.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest handshake payload read; a decimal pid is far shorter.
const HANDSHAKE_CAPACITY: usize = 32;

/// How long a killed intermediate child gets to become reapable.
const REAP_GRACE: Duration = Duration::from_millis(200);

/// What the controller learned from the handshake pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    /// The daemon reported this pid.
    Reported(Pid),
    /// The pipe answered (data or hang-up) without a usable pid.
    Closed,
    /// Nothing arrived before the deadline.
    TimedOut,
}

impl Handshake {
    pub(crate) fn pid(self) -> Option<Pid> {
        match self {
            Handshake::Reported(pid) => Some(pid),
            Handshake::Closed | Handshake::TimedOut => None,
        }
    }
}

/// Starts, stops and observes one daemon identified by its pid file.
#[derive(Debug)]
pub struct Launcher {
    pidfile: PidFile,
    spawned_pid: Option<Pid>,
    cache: Option<(Pid, Option<ProcessHandle>)>,
    handshake_timeout: Duration,
}

impl Launcher {
    pub fn new(pidfile: PidFile) -> Self {
        Self {
            pidfile,
            spawned_pid: None,
            cache: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Overrides how long `start` waits for the pid handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn pidfile(&self) -> &PidFile {
        &self.pidfile
    }

    /// Pid reported by this launcher's most recent spawn.
    pub fn spawned_pid(&self) -> Option<Pid> {
        self.spawned_pid
    }

    /// Daemonizes `spec`, returning the daemon pid.
    ///
    /// `Ok(None)` means the handshake produced no pid within the timeout;
    /// treat it as a failed spawn. An orphaned process tree may still exist.
    pub fn start(&mut self, spec: &DaemonSpec) -> DaemonResult<Option<Pid>> {
        if let Some(pid) = self.live_pid()? {
            return Err(DaemonError::AlreadyRunning { pid });
        }
        info!(
            target: LOG_TARGET,
            name = spec.get_name(),
            pidfile = %self.pidfile.path().display(),
            "launching daemon"
        );
        let pid = self.spawn(spec)?;
        self.spawned_pid = pid;
        match pid {
            Some(pid) => info!(target: LOG_TARGET, pid, "daemon launched"),
            None => warn!(target: LOG_TARGET, "daemon launch reported no pid"),
        }
        Ok(pid)
    }

    /// Sends SIGTERM to the daemon; with `block`, waits for it to exit
    /// (`timeout` of `None` waits indefinitely).
    pub fn terminate(&mut self, block: bool, timeout: Option<Duration>) -> DaemonResult<()> {
        let handle = match self.process()? {
            Some(handle) if handle.is_running() => handle.clone(),
            _ => return Err(DaemonError::NotRunning),
        };
        handle.terminate()?;
        if block {
            handle.wait(timeout)?;
            info!(target: LOG_TARGET, pid = handle.pid(), "daemon stopped");
        }
        Ok(())
    }

    /// Stops the daemon if it runs, then starts it again.
    pub fn restart(&mut self, spec: &DaemonSpec) -> DaemonResult<Option<Pid>> {
        if self.running()? {
            self.terminate(true, None)?;
        }
        self.start(spec)
    }

    /// Whether the tracked process exists and is alive.
    pub fn running(&mut self) -> DaemonResult<bool> {
        Ok(self.live_pid()?.is_some())
    }

    /// The daemon pid this launcher believes in.
    ///
    /// A pid from this launcher's own spawn wins over the pid file, which is
    /// only consulted for a consistency warning in that case.
    pub fn pid(&self) -> DaemonResult<Option<Pid>> {
        let Some(spawned) = self.spawned_pid else {
            return Ok(self.pidfile.read_pid()?);
        };
        match self.pidfile.read_pid() {
            Ok(Some(recorded)) if recorded != spawned => warn!(
                target: LOG_TARGET,
                spawned,
                recorded,
                pidfile = %self.pidfile.path().display(),
                "pid file disagrees with spawned daemon pid"
            ),
            Ok(_) => {}
            Err(error @ PidFileError::Parse { .. }) => debug!(
                target: LOG_TARGET,
                error = %error,
                "pid file unreadable; using spawned pid"
            ),
            Err(error) => return Err(error.into()),
        }
        Ok(Some(spawned))
    }

    /// Handle for the current pid, re-resolved whenever the pid changes.
    pub fn process(&mut self) -> DaemonResult<Option<&ProcessHandle>> {
        let pid = self.pid()?;
        let stale = match &self.cache {
            Some((cached, _)) => Some(*cached) != pid,
            None => true,
        };
        if stale {
            self.cache = pid.map(|pid| (pid, ProcessHandle::resolve(pid)));
        }
        Ok(self.cache.as_ref().and_then(|(_, handle)| handle.as_ref()))
    }

    fn live_pid(&mut self) -> DaemonResult<Option<Pid>> {
        Ok(self
            .process()?
            .filter(|handle| handle.is_running())
            .map(ProcessHandle::pid))
    }

    fn spawn(&self, spec: &DaemonSpec) -> DaemonResult<Option<Pid>> {
        let (read_end, write_end) = unix::pipe().map_err(|source| DaemonError::Detach {
            stage: "handshake pipe",
            source,
        })?;
        let fork = unix::fork().map_err(|source| DaemonError::Detach {
            stage: "first fork",
            source,
        })?;
        match fork {
            Fork::Parent(child) => {
                drop(write_end);
                let handshake = read_handshake(read_end, self.handshake_timeout);
                match handshake {
                    Handshake::TimedOut => abandon(child),
                    Handshake::Reported(_) | Handshake::Closed => {
                        if let Err(error) = unix::reap(child) {
                            warn!(target: LOG_TARGET, child, error = %error, "failed to reap intermediate child");
                        }
                    }
                }
                Ok(handshake.pid())
            }
            Fork::Child => {
                drop(read_end);
                let path = self.pidfile.path();
                // Nothing in the child may unwind back into the caller's stack.
                let _ = panic::catch_unwind(AssertUnwindSafe(|| detach(spec, write_end, path)));
                unix::exit_now(EXIT_STARTUP_FAILED)
            }
        }
    }
}

/// Kills an intermediate child that never answered and reaps it if it dies in time.
///
/// The first child has no work left once the handshake deadline has passed, and
/// the controller must not wait on it past that deadline.
fn abandon(child: Pid) {
    if let Err(error) = unix::kill(child, Some(libc::SIGKILL)) {
        warn!(target: LOG_TARGET, child, error = %error, "failed to kill intermediate child");
    }
    let deadline = Instant::now() + REAP_GRACE;
    loop {
        match unix::try_reap(child) {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => break,
            Err(error) => {
                warn!(target: LOG_TARGET, child, error = %error, "failed to reap intermediate child");
                return;
            }
        }
    }
    warn!(target: LOG_TARGET, child, "intermediate child still running after SIGKILL; left unreaped");
}

/// First-child half of the protocol: new session, session setup, second fork.
fn detach(spec: &DaemonSpec, handshake: OwnedFd, pidfile: &Path) -> ! {
    if let Err(source) = unix::setsid() {
        let error = DaemonError::Detach {
            stage: "setsid",
            source,
        };
        error!(target: LOG_TARGET, error = %error, "daemon detach failed");
        unix::exit_now(EXIT_STARTUP_FAILED);
    }
    if let Err(error) = session::apply(spec, &[handshake.as_raw_fd()]) {
        error!(target: LOG_TARGET, error = %error, "daemon session setup failed");
        unix::exit_now(EXIT_STARTUP_FAILED);
    }
    match unix::fork() {
        Ok(Fork::Parent(_)) => unix::exit_now(0),
        Ok(Fork::Child) => {
            report_pid(handshake);
            let mut pidfile = PidFile::new(pidfile);
            let _ = panic::catch_unwind(AssertUnwindSafe(|| Daemon::new(spec).run(&mut pidfile)));
            unix::exit_now(EXIT_TARGET_FAILED)
        }
        Err(source) => {
            let error = DaemonError::Detach {
                stage: "second fork",
                source,
            };
            error!(target: LOG_TARGET, error = %error, "daemon detach failed");
            unix::exit_now(EXIT_STARTUP_FAILED)
        }
    }
}

/// Grandchild half of the handshake: one write of the decimal pid, then close.
fn report_pid(handshake: OwnedFd) {
    let pid = unix::getpid();
    let mut pipe = File::from(handshake);
    if let Err(error) = pipe.write_all(pid.to_string().as_bytes()) {
        warn!(target: LOG_TARGET, pid, error = %error, "failed to report daemon pid");
    }
}

/// Controller half of the handshake: one bounded wait, one read, one parse.
pub(crate) fn read_handshake(read_end: OwnedFd, timeout: Duration) -> Handshake {
    match unix::poll_readable(read_end.as_fd(), timeout) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                target: LOG_TARGET,
                timeout_ms = timeout.as_millis(),
                "daemon handshake timed out"
            );
            return Handshake::TimedOut;
        }
        Err(error) => {
            warn!(target: LOG_TARGET, error = %error, "daemon handshake wait failed");
            return Handshake::TimedOut;
        }
    }
    let mut buf = [0u8; HANDSHAKE_CAPACITY];
    let len = match File::from(read_end).read(&mut buf) {
        Ok(len) => len,
        Err(error) => {
            warn!(target: LOG_TARGET, error = %error, "daemon handshake read failed");
            return Handshake::Closed;
        }
    };
    let payload = String::from_utf8_lossy(buf.get(..len).unwrap_or_default());
    match payload.trim().parse::<Pid>() {
        Ok(pid) if pid > 0 => {
            debug!(target: LOG_TARGET, pid, "daemon handshake received");
            Handshake::Reported(pid)
        }
        _ => {
            warn!(target: LOG_TARGET, payload = %payload, "unusable daemon handshake");
            Handshake::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn launcher(dir: &TempDir) -> Launcher {
        Launcher::new(PidFile::new(dir.path().join("launcher.pid")))
    }

    #[rstest]
    #[case::plain("4242", Handshake::Reported(4242))]
    #[case::trailing_newline("4242\n", Handshake::Reported(4242))]
    #[case::garbage("pid?", Handshake::Closed)]
    #[case::zero("0", Handshake::Closed)]
    fn handshake_parses_payload(#[case] payload: &str, #[case] expected: Handshake) {
        let (read_end, write_end) = unix::pipe().expect("pipe");
        File::from(write_end)
            .write_all(payload.as_bytes())
            .expect("write payload");
        assert_eq!(read_handshake(read_end, Duration::from_secs(1)), expected);
    }

    #[test]
    fn handshake_closed_without_data_is_no_pid() {
        let (read_end, write_end) = unix::pipe().expect("pipe");
        drop(write_end);
        assert_eq!(read_handshake(read_end, Duration::from_secs(1)), Handshake::Closed);
    }

    #[test]
    fn handshake_times_out_when_writer_stays_silent() {
        let (read_end, _write_end) = unix::pipe().expect("pipe");
        let started = Instant::now();
        let handshake = read_handshake(read_end, Duration::from_millis(150));
        assert_eq!(handshake, Handshake::TimedOut);
        assert_eq!(handshake.pid(), None);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let child = match unix::fork().expect("fork") {
            Fork::Child => {
                std::thread::sleep(Duration::from_secs(30));
                unix::exit_now(0)
            }
            Fork::Parent(pid) => pid,
        };
        let started = Instant::now();
        abandon(child);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(unix::kill(child, None).is_err(), "child survived");
    }

    #[test]
    fn terminate_before_start_is_not_running() {
        let dir = TempDir::new().expect("temp dir");
        let result = launcher(&dir).terminate(true, None);
        assert!(matches!(result, Err(DaemonError::NotRunning)));
    }

    #[test]
    fn nothing_tracked_is_not_running() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        assert_eq!(launcher.pid().expect("pid"), None);
        assert!(!launcher.running().expect("running"));
        assert!(launcher.process().expect("process").is_none());
    }

    #[test]
    fn spawned_pid_wins_over_pid_file() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        fs::write(launcher.pidfile().path(), "1").expect("seed pid file");
        launcher.spawned_pid = Some(unix::getpid());
        assert_eq!(launcher.pid().expect("pid"), Some(unix::getpid()));
    }

    #[test]
    fn spawned_pid_tolerates_half_written_pid_file() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        fs::write(launcher.pidfile().path(), "").expect("seed empty pid file");
        launcher.spawned_pid = Some(unix::getpid());
        assert_eq!(launcher.pid().expect("pid"), Some(unix::getpid()));
    }

    #[test]
    fn unparseable_pid_file_is_an_error_without_spawn() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        fs::write(launcher.pidfile().path(), "garbage").expect("seed pid file");
        assert!(matches!(
            launcher.running(),
            Err(DaemonError::PidFile(PidFileError::Parse { .. }))
        ));
    }

    #[test]
    fn process_cache_follows_pid_changes() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        let path = launcher.pidfile().path().to_path_buf();

        fs::write(&path, unix::getpid().to_string()).expect("seed own pid");
        let first = launcher.process().expect("process").map(ProcessHandle::pid);
        assert_eq!(first, Some(unix::getpid()));
        assert!(launcher.running().expect("running"));

        let mut sleeper = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let other = Pid::try_from(sleeper.id()).expect("pid fits");
        fs::write(&path, other.to_string()).expect("seed sleeper pid");
        let second = launcher.process().expect("process").map(ProcessHandle::pid);
        sleeper.kill().expect("kill sleep");
        sleeper.wait().expect("reap sleep");
        assert_eq!(second, Some(other));
    }

    #[test]
    fn start_refuses_when_pid_file_names_live_process() {
        let dir = TempDir::new().expect("temp dir");
        let mut launcher = launcher(&dir);
        fs::write(launcher.pidfile().path(), unix::getpid().to_string()).expect("seed own pid");
        let spec = DaemonSpec::new("launcher-test", || Ok(()));
        let result = launcher.start(&spec);
        let Err(DaemonError::AlreadyRunning { pid }) = result else {
            panic!("expected AlreadyRunning, got {result:?}");
        };
        assert_eq!(pid, unix::getpid());
    }
}
