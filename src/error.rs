use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionStep;
use crate::sys::unix::Pid;

/// Error type for daemon launch and lifecycle control.
/// Provides specific details about which stage of daemonization failed.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A process session setup step failed inside the new daemon process.
    #[error("unable to {step}: {source}")]
    Environment {
        /// The failing setup step.
        step: SessionStep,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Detaching from the caller failed (pipe creation, fork, setsid).
    #[error("failed to detach daemon process ({stage}): {source}")]
    Detach {
        /// The detach stage that failed.
        stage: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// `start` was called while a daemon instance is alive.
    #[error("daemon is already running with pid {pid}")]
    AlreadyRunning {
        /// Pid of the running instance.
        pid: Pid,
    },
    /// `terminate` was called while no daemon instance is alive.
    #[error("daemon is not running")]
    NotRunning,
    /// The fork protocol completed but the handshake yielded no pid.
    #[error("daemon did not report its pid during startup")]
    StartFailed,
    /// Pid file failure.
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Sending a signal to the daemon failed.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: Pid,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The daemon did not exit within the requested time.
    #[error("process {pid} still running after {timeout:?}")]
    TerminateTimeout {
        /// Pid that outlived the wait.
        pid: Pid,
        /// The wait budget that elapsed.
        timeout: Duration,
    },
    /// Installing signal handlers in the daemon failed.
    #[error("failed to install signal handlers: {source}")]
    SignalInstall {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// An unknown controller verb was requested.
    #[error("invalid action '{action}', expected one of start, stop, status, restart")]
    InvalidAction {
        /// The rejected verb.
        action: String,
    },
}

/// Errors specific to pid files.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Another live process holds the pid file.
    #[error("pid file '{}' is locked by {}", path.display(), describe_holder(*pid))]
    AlreadyLocked {
        /// Pid file path.
        path: PathBuf,
        /// Pid recorded in the file, when readable.
        pid: Option<Pid>,
    },
    /// The pid file contents are not a decimal pid.
    #[error("failed to parse pid file '{}': {contents:?}", path.display())]
    Parse {
        /// Pid file path.
        path: PathBuf,
        /// The raw contents that failed to parse.
        contents: String,
    },
    /// The pid file directory does not exist.
    #[error("pid file '{}' is not located in an existing directory", path.display())]
    MissingParent {
        /// Pid file path.
        path: PathBuf,
    },
    /// Reading, writing, locking or removing the pid file failed.
    #[error("pid file '{}' i/o failure: {source}", path.display())]
    Io {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

fn describe_holder(pid: Option<Pid>) -> String {
    match pid {
        Some(pid) => format!("process {pid}"),
        None => "another process".to_owned(),
    }
}

/// A specialized Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_error_names_the_failing_step() {
        let error = DaemonError::Environment {
            step: SessionStep::WorkingDirectory,
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(error.to_string().starts_with("unable to change working directory"));
    }

    #[test]
    fn already_locked_without_pid_reads_naturally() {
        let error = PidFileError::AlreadyLocked {
            path: PathBuf::from("/run/demo.pid"),
            pid: None,
        };
        assert_eq!(
            error.to_string(),
            "pid file '/run/demo.pid' is locked by another process"
        );
    }
}
