//! Verb dispatch for command-line front ends.
//!
//! A [`Controller`] pairs a [`Launcher`] with the [`DaemonSpec`] it launches
//! and maps `start`, `stop`, `status` and `restart` onto the launcher's core
//! operations. Being in the requested state already is not an error; it is
//! reported as [`Outcome::Unchanged`] so scripts can tell the cases apart.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use crate::LOG_TARGET;
use crate::daemon::DaemonSpec;
use crate::error::{DaemonError, DaemonResult};
use crate::launcher::Launcher;
use crate::pidfile::PidFile;

/// A lifecycle verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Status,
    Restart,
}

impl FromStr for Action {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "status" => Ok(Action::Status),
            "restart" => Ok(Action::Restart),
            other => Err(DaemonError::InvalidAction {
                action: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Status => "status",
            Action::Restart => "restart",
        })
    }
}

/// What an action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The daemon changed state (started, stopped or restarted).
    Changed,
    /// The daemon was already in the requested state; nothing was done.
    Unchanged,
    /// Status query: the daemon is running.
    Running,
    /// Status query: the daemon is stopped.
    Stopped,
}

impl Outcome {
    /// Process exit code for a command-line front end.
    ///
    /// `0` when the daemon changed state or is running, `1` when nothing
    /// needed doing or it is stopped.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Changed | Outcome::Running => 0,
            Outcome::Unchanged | Outcome::Stopped => 1,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Changed => "done",
            Outcome::Unchanged => "nothing to do",
            Outcome::Running => "running",
            Outcome::Stopped => "stopped",
        })
    }
}

/// A launcher bound to the daemon it controls.
#[derive(Debug)]
pub struct Controller {
    launcher: Launcher,
    spec: DaemonSpec,
}

impl Controller {
    pub fn new(launcher: Launcher, spec: DaemonSpec) -> Self {
        Self { launcher, spec }
    }

    /// Validates the pid file location and the spec, then binds them.
    pub fn bind<P: AsRef<Path>>(pidfile: P, spec: DaemonSpec) -> DaemonResult<Self> {
        let pidfile = PidFile::checked(pidfile)?;
        Ok(Self::new(Launcher::new(pidfile), spec.build()?))
    }

    pub fn launcher(&mut self) -> &mut Launcher {
        &mut self.launcher
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    /// Performs `action` and reports what happened.
    pub fn act(&mut self, action: Action) -> DaemonResult<Outcome> {
        let running = self.launcher.running()?;
        let outcome = match action {
            Action::Start if running => Outcome::Unchanged,
            Action::Start => {
                self.launcher
                    .start(&self.spec)?
                    .ok_or(DaemonError::StartFailed)?;
                Outcome::Changed
            }
            Action::Stop if running => {
                self.launcher.terminate(true, None)?;
                Outcome::Changed
            }
            Action::Stop => Outcome::Unchanged,
            Action::Status if running => Outcome::Running,
            Action::Status => Outcome::Stopped,
            Action::Restart => {
                self.launcher
                    .restart(&self.spec)?
                    .ok_or(DaemonError::StartFailed)?;
                Outcome::Changed
            }
        };
        info!(target: LOG_TARGET, %action, %outcome, "controller action");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case::start("start", Action::Start)]
    #[case::stop("stop", Action::Stop)]
    #[case::status("status", Action::Status)]
    #[case::restart("restart", Action::Restart)]
    fn parses_verbs(#[case] verb: &str, #[case] expected: Action) {
        let action: Action = verb.parse().expect("known verb");
        assert_eq!(action, expected);
        assert_eq!(action.to_string(), verb);
    }

    #[test]
    fn rejects_unknown_verb() {
        let result = "reload".parse::<Action>();
        let Err(DaemonError::InvalidAction { action }) = result else {
            panic!("expected InvalidAction, got {result:?}");
        };
        assert_eq!(action, "reload");
    }

    #[rstest]
    #[case::changed(Outcome::Changed, 0)]
    #[case::running(Outcome::Running, 0)]
    #[case::unchanged(Outcome::Unchanged, 1)]
    #[case::stopped(Outcome::Stopped, 1)]
    fn outcome_exit_codes(#[case] outcome: Outcome, #[case] code: i32) {
        assert_eq!(outcome.exit_code(), code);
    }

    #[rstest]
    #[case::status(Action::Status, Outcome::Stopped)]
    #[case::stop(Action::Stop, Outcome::Unchanged)]
    fn stopped_daemon_needs_no_work(#[case] action: Action, #[case] expected: Outcome) {
        let dir = TempDir::new().expect("temp dir");
        let spec = DaemonSpec::new("control-test", || Ok(()));
        let mut controller =
            Controller::bind(dir.path().join("control.pid"), spec).expect("bind controller");
        assert_eq!(controller.act(action).expect("act"), expected);
    }

    #[test]
    fn bind_rejects_pid_file_outside_existing_directory() {
        let spec = DaemonSpec::new("control-test", || Ok(()));
        let result = Controller::bind("/definitely/not/here/control.pid", spec);
        assert!(matches!(result, Err(DaemonError::PidFile(_))));
    }
}
