//! The daemon side of the protocol: runs inside the detached grandchild.
//!
//! [`Daemon::run`] never returns. It configures signals and the process
//! name, takes the pid file, runs the target on a worker thread and waits on
//! a channel for either the target's outcome or a termination request. Every
//! path releases the pid file once and leaves through `_exit`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::LOG_TARGET;
use crate::daemon::DaemonSpec;
use crate::error::DaemonResult;
use crate::pidfile::PidFile;
use crate::signals;
use crate::sys::unix;

/// Exit code when the target returns an error or panics.
pub const EXIT_TARGET_FAILED: i32 = 255;
/// Exit code when the daemon cannot start the target at all.
pub const EXIT_STARTUP_FAILED: i32 = 254;

/// Lifecycle of a single daemon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Configuring,
    Running,
    Terminating,
    Exited,
}

enum Event {
    TargetFinished(thread::Result<anyhow::Result<()>>),
    TerminateRequested,
}

/// The runtime driving one daemon instance.
pub struct Daemon<'a> {
    spec: &'a DaemonSpec,
    state: RuntimeState,
    events: Sender<Event>,
    inbox: Receiver<Event>,
}

impl<'a> Daemon<'a> {
    pub fn new(spec: &'a DaemonSpec) -> Self {
        let (events, inbox) = mpsc::channel();
        Self {
            spec,
            state: RuntimeState::Configuring,
            events,
            inbox,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Installs the signal map and sets the process name.
    ///
    /// On Linux the name goes into the kernel's 15-byte `comm` field, so
    /// `ps -o comm` and `top` show it truncated while `ps aux` still shows the
    /// original command line. Elsewhere the name is only validated.
    pub fn configure(&mut self) -> DaemonResult<()> {
        let events = self.events.clone();
        signals::install(
            &self.spec.signal_map,
            self.spec.termination_flag(),
            move || {
                let _ = events.send(Event::TerminateRequested);
            },
        )?;
        if let Err(error) = unix::set_process_name(&self.spec.name) {
            warn!(target: LOG_TARGET, error = %error, "failed to set process name");
        }
        Ok(())
    }

    /// Runs the daemon to completion and exits the process.
    pub fn run(mut self, pidfile: &mut PidFile) -> ! {
        let code = self.execute(pidfile);
        self.transition(RuntimeState::Exited);
        unix::exit_now(code)
    }

    fn execute(&mut self, pidfile: &mut PidFile) -> i32 {
        if let Err(error) = self.configure() {
            error!(target: LOG_TARGET, error = %error, "daemon configuration failed");
            return EXIT_STARTUP_FAILED;
        }
        if let Err(error) = pidfile.acquire(None) {
            error!(target: LOG_TARGET, error = %error, "daemon could not take the pid file");
            return EXIT_STARTUP_FAILED;
        }
        let code = self.supervise();
        if let Err(error) = pidfile.release() {
            warn!(target: LOG_TARGET, error = %error, "failed to release pid file");
        }
        code
    }

    fn supervise(&mut self) -> i32 {
        self.transition(RuntimeState::Running);
        notify_ready();

        if let Some(hook) = &self.spec.logging {
            if let Err(error) = hook() {
                error!(target: LOG_TARGET, error = %format!("{error:#}"), "logging setup failed");
                return EXIT_STARTUP_FAILED;
            }
        }

        let target = Arc::clone(&self.spec.target);
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name("daemon-target".to_owned())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| target()));
                let _ = events.send(Event::TargetFinished(outcome));
            });
        if let Err(error) = spawned {
            error!(target: LOG_TARGET, error = %error, "failed to start target thread");
            return EXIT_STARTUP_FAILED;
        }

        match self.inbox.recv() {
            Ok(Event::TargetFinished(Ok(Ok(())))) => {
                info!(target: LOG_TARGET, "daemon target completed");
                0
            }
            Ok(Event::TargetFinished(Ok(Err(error)))) => {
                error!(target: LOG_TARGET, error = %format!("{error:#}"), "daemon target failed");
                EXIT_TARGET_FAILED
            }
            Ok(Event::TargetFinished(Err(_))) => {
                error!(target: LOG_TARGET, "daemon target panicked");
                EXIT_TARGET_FAILED
            }
            Ok(Event::TerminateRequested) => {
                self.transition(RuntimeState::Terminating);
                info!(target: LOG_TARGET, "daemon terminating on request");
                0
            }
            // Unreachable while `self.events` is alive.
            Err(_) => EXIT_TARGET_FAILED,
        }
    }

    fn transition(&mut self, next: RuntimeState) {
        debug!(target: LOG_TARGET, from = ?self.state, to = ?next, "runtime state");
        self.state = next;
    }
}

/// Tells a supervising service manager we are up, when one is listening.
#[cfg(target_os = "linux")]
fn notify_ready() {
    if std::env::var_os("NOTIFY_SOCKET").is_none() {
        return;
    }
    // 'true' unsets NOTIFY_SOCKET so it does not leak into the target's children.
    if let Err(error) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(target: LOG_TARGET, error = %error, "service manager notification failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}
