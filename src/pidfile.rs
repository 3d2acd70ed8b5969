//! Pid files guarded by an advisory `flock`.
//!
//! The lock lives on the open descriptor, so it disappears with the holder.
//! A file whose lock is free is reclaimable unless it names another live
//! process, which covers pid files left behind by crashed daemons.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::LOG_TARGET;
use crate::error::PidFileError;
use crate::process;
use crate::sys::unix::{self, Pid};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A pid file at a fixed path, optionally held by this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    held: Option<File>,
}

enum Attempt {
    Acquired(File),
    Busy(Option<Pid>),
    Vanished,
}

impl PidFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            held: None,
        }
    }

    /// Builds a pid file for `path`, made absolute, whose directory must exist.
    pub fn checked<P: AsRef<Path>>(path: P) -> Result<Self, PidFileError> {
        let path = std::path::absolute(path.as_ref()).map_err(|source| PidFileError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        if path.parent().map(|p| !p.is_dir()).unwrap_or(true) {
            return Err(PidFileError::MissingParent { path });
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this value currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Reads the stored pid; `None` when the file does not exist.
    pub fn read_pid(&self) -> Result<Option<Pid>, PidFileError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => parse_pid(&contents).map(Some).ok_or(PidFileError::Parse {
                path: self.path.clone(),
                contents,
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Takes the lock and records this process's pid.
    ///
    /// With `timeout` of `None` a single attempt is made; otherwise a held lock
    /// is retried until the timeout elapses. Fails with
    /// [`PidFileError::AlreadyLocked`] while another live process holds it.
    pub fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), PidFileError> {
        if self.held.is_some() {
            return Ok(());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.try_acquire()? {
                Attempt::Acquired(file) => {
                    self.held = Some(file);
                    info!(
                        target: LOG_TARGET,
                        pid = unix::getpid(),
                        file = %self.path.display(),
                        "pid file acquired"
                    );
                    return Ok(());
                }
                Attempt::Vanished => continue,
                Attempt::Busy(pid) => {
                    let now = Instant::now();
                    match deadline {
                        Some(deadline) if now < deadline => {
                            thread::sleep(RETRY_INTERVAL.min(deadline - now));
                        }
                        _ => {
                            return Err(PidFileError::AlreadyLocked {
                                path: self.path.clone(),
                                pid,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Removes the file and drops the lock. Safe to call when not held.
    pub fn release(&mut self) -> Result<(), PidFileError> {
        let Some(file) = self.held.take() else {
            return Ok(());
        };
        // Remove while still locked so no one can lock the doomed inode.
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        };
        drop(file);
        info!(target: LOG_TARGET, file = %self.path.display(), "pid file released");
        removed
    }

    fn try_acquire(&self) -> Result<Attempt, PidFileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;

        // SAFETY: the descriptor is owned by `file` for the duration of the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::WouldBlock {
                return Ok(Attempt::Busy(self.read_pid().ok().flatten()));
            }
            return Err(self.io_error(error));
        }

        // A releasing holder may have unlinked the path after we opened it.
        let ours = file.metadata().map_err(|source| self.io_error(source))?.ino();
        match fs::metadata(&self.path) {
            Ok(current) if current.ino() == ours => {}
            Ok(_) => return Ok(Attempt::Vanished),
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Vanished),
            Err(source) => return Err(self.io_error(source)),
        }

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|source| self.io_error(source))?;
        let own = unix::getpid();
        match parse_pid(&contents) {
            Some(previous) if previous != own && process::pid_exists(previous) => {
                debug!(
                    target: LOG_TARGET,
                    pid = previous,
                    file = %self.path.display(),
                    "unlocked pid file names a live process"
                );
                return Ok(Attempt::Busy(Some(previous)));
            }
            Some(previous) if previous != own => warn!(
                target: LOG_TARGET,
                pid = previous,
                file = %self.path.display(),
                "reclaiming stale pid file"
            ),
            None if !contents.trim().is_empty() => warn!(
                target: LOG_TARGET,
                file = %self.path.display(),
                "reclaiming unparseable pid file"
            ),
            _ => {}
        }

        file.set_len(0).map_err(|source| self.io_error(source))?;
        file.rewind().map_err(|source| self.io_error(source))?;
        write!(file, "{own}").map_err(|source| self.io_error(source))?;
        file.sync_all().map_err(|source| self.io_error(source))?;
        Ok(Attempt::Acquired(file))
    }

    fn io_error(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(target: LOG_TARGET, error = %error, "failed to release pid file");
        }
    }
}

fn parse_pid(contents: &str) -> Option<Pid> {
    contents.trim().parse::<Pid>().ok().filter(|pid| *pid > 0)
}
