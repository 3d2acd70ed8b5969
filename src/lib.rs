//! # daemon_launcher
//!
//! Turns a function into a well-behaved Unix daemon and controls it from the
//! outside.
//!
//! A [`Launcher`] detaches a [`DaemonSpec`] through the classic double fork,
//! learns the daemon pid over a pipe handshake, and later stops, restarts or
//! queries it through the pid file the daemon holds. Inside the daemon the
//! [`Daemon`] runtime installs signal handling, takes the [`PidFile`], runs the
//! target and always releases the pid file on the way out.
//!
//! ```no_run
//! use daemon_launcher::{DaemonSpec, Launcher, PidFile};
//!
//! let spec = DaemonSpec::new("worker", || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     Ok(())
//! });
//! let mut launcher = Launcher::new(PidFile::new("/tmp/worker.pid"));
//! let pid = launcher.start(&spec)?;
//! assert!(launcher.running()?);
//! launcher.terminate(true, None)?;
//! # let _ = pid;
//! # Ok::<(), daemon_launcher::DaemonError>(())
//! ```
//!
//! The library logs through `tracing` under the `daemon_launcher` target and
//! never installs a subscriber itself.

#![cfg(unix)]

mod control;
mod daemon;
mod error;
mod launcher;
mod pidfile;
mod process;
mod runtime;
pub mod session;
mod signals;
mod stdio;
mod sys;

pub(crate) const LOG_TARGET: &str = env!("CARGO_PKG_NAME");

pub use control::{Action, Controller, Outcome};
pub use daemon::{DEFAULT_WORKING_DIRECTORY, DaemonSpec, Target};
pub use error::{DaemonError, DaemonResult, PidFileError};
pub use launcher::{HANDSHAKE_TIMEOUT, Launcher};
pub use pidfile::PidFile;
pub use process::ProcessHandle;
pub use runtime::{Daemon, EXIT_STARTUP_FAILED, EXIT_TARGET_FAILED, RuntimeState};
pub use session::SessionStep;
pub use signals::{Signal, SignalAction, SignalMap, UnknownSignal};
pub use stdio::Stdio;
pub use sys::unix::Pid;
