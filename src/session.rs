//! Process session setup.
//!
//! The OS-level changes a new daemon applies to itself, as an ordered
//! pipeline of [`SessionStep`]s run exactly once. Each step is also exposed as
//! a standalone helper.

use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use tracing::debug;

use crate::LOG_TARGET;
use crate::daemon::DaemonSpec;
use crate::error::{DaemonError, DaemonResult};
use crate::stdio::Stdio;
use crate::sys::unix;

/// The null device standard streams fall back to.
pub const NULL_DEVICE: &str = "/dev/null";

/// One stage of process session setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    ChangeRoot,
    PreventCoreDump,
    FileCreationMask,
    WorkingDirectory,
    ProcessOwner,
    CloseFiles,
    RedirectStreams,
}

impl SessionStep {
    /// Steps in the order they are applied.
    ///
    /// The group must change before the user, and the chroot before any path
    /// is resolved.
    pub const ORDER: [SessionStep; 7] = [
        SessionStep::ChangeRoot,
        SessionStep::PreventCoreDump,
        SessionStep::FileCreationMask,
        SessionStep::WorkingDirectory,
        SessionStep::ProcessOwner,
        SessionStep::CloseFiles,
        SessionStep::RedirectStreams,
    ];
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStep::ChangeRoot => "change root directory",
            SessionStep::PreventCoreDump => "prevent core dump",
            SessionStep::FileCreationMask => "change file creation mask",
            SessionStep::WorkingDirectory => "change working directory",
            SessionStep::ProcessOwner => "change process owner",
            SessionStep::CloseFiles => "close inherited files",
            SessionStep::RedirectStreams => "redirect standard streams",
        })
    }
}

/// Applies every step of `spec` to this process.
///
/// `keep` lists extra descriptors that must survive the close-files step.
pub(crate) fn apply(spec: &DaemonSpec, keep: &[RawFd]) -> DaemonResult<()> {
    for step in SessionStep::ORDER {
        debug!(target: LOG_TARGET, %step, "session setup");
        run_step(step, spec, keep).map_err(|source| DaemonError::Environment { step, source })?;
    }
    Ok(())
}

fn run_step(step: SessionStep, spec: &DaemonSpec, keep: &[RawFd]) -> io::Result<()> {
    match step {
        SessionStep::ChangeRoot => match &spec.chroot_directory {
            Some(root) => change_root_directory(root),
            None => Ok(()),
        },
        SessionStep::PreventCoreDump if spec.prevent_core_dump => prevent_core_dump(),
        SessionStep::PreventCoreDump => Ok(()),
        SessionStep::FileCreationMask => {
            change_file_creation_mask(spec.umask);
            Ok(())
        }
        SessionStep::WorkingDirectory => change_working_directory(&spec.working_directory),
        SessionStep::ProcessOwner => change_process_owner(spec.uid, spec.gid),
        SessionStep::CloseFiles if spec.close_open_files => {
            close_all_open_files(&spec.preserved_fds(keep))
        }
        SessionStep::CloseFiles => Ok(()),
        SessionStep::RedirectStreams => {
            redirect_stream(libc::STDIN_FILENO, &spec.stdin)?;
            redirect_stream(libc::STDOUT_FILENO, &spec.stdout)?;
            redirect_stream(libc::STDERR_FILENO, &spec.stderr)
        }
    }
}

/// Enters `directory` and makes it the process root. Requires privileges.
pub fn change_root_directory(directory: &Path) -> io::Result<()> {
    env::set_current_dir(directory)?;
    std::os::unix::fs::chroot(".")
}

/// Sets the soft and hard core-dump size limits to zero.
pub fn prevent_core_dump() -> io::Result<()> {
    unix::disable_core_dumps()
}

/// Sets the file creation mask, returning the previous mask.
pub fn change_file_creation_mask(mask: u32) -> u32 {
    unix::umask(mask)
}

pub fn change_working_directory(directory: &Path) -> io::Result<()> {
    env::set_current_dir(directory)
}

/// Switches to `gid` then `uid`, skipping ids that already match.
pub fn change_process_owner(uid: u32, gid: u32) -> io::Result<()> {
    if unix::real_gid() != gid {
        unix::set_gid(gid)?;
    }
    if unix::real_uid() != uid {
        unix::set_uid(uid)?;
    }
    Ok(())
}

/// Closes every descriptor from 3 upwards that is not in `exclude`.
///
/// The standard streams are left to [`redirect_stream`].
pub fn close_all_open_files(exclude: &BTreeSet<RawFd>) -> io::Result<()> {
    let max = unix::max_open_files();
    for fd in (3..max).filter(|fd| !exclude.contains(fd)) {
        unix::close_if_open(fd)?;
    }
    Ok(())
}

/// Points standard descriptor `target` at `stdio`.
pub fn redirect_stream(target: RawFd, stdio: &Stdio) -> io::Result<()> {
    match stdio {
        Stdio::Fd(fd) => unix::dup2(fd.as_raw_fd(), target),
        Stdio::Null => {
            let null: OwnedFd = OpenOptions::new()
                .read(true)
                .write(true)
                .open(NULL_DEVICE)?
                .into();
            if null.as_raw_fd() == target {
                // The slot was free and open() already filled it.
                let _ = null.into_raw_fd();
                return Ok(());
            }
            unix::dup2(null.as_raw_fd(), target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::unix::Fork;
    use std::fs::{self, File};
    use std::panic::{self, AssertUnwindSafe};

    /// Runs `check` in a forked child and reports whether it returned true.
    fn in_child<F: FnOnce() -> bool>(check: F) -> bool {
        match unix::fork().expect("fork") {
            Fork::Child => {
                let ok = panic::catch_unwind(AssertUnwindSafe(check)).unwrap_or(false);
                unix::exit_now(if ok { 0 } else { 1 })
            }
            Fork::Parent(pid) => {
                let status = unix::reap(pid).expect("reap").expect("wait status");
                libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
            }
        }
    }

    #[test]
    fn default_spec_detaches_environment() {
        let spec = DaemonSpec::new("session-test", || Ok(()));
        assert!(in_child(|| {
            apply(&spec, &[]).is_ok()
                && env::current_dir().ok().as_deref() == Some(Path::new("/"))
                && change_file_creation_mask(0o22) == 0
                && unix::core_dump_limits().ok() == Some((0, 0))
        }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn null_stdio_points_at_null_device() {
        assert!(in_child(|| {
            redirect_stream(libc::STDOUT_FILENO, &Stdio::Null).is_ok()
                && fs::read_link("/proc/self/fd/1").ok().as_deref() == Some(Path::new(NULL_DEVICE))
        }));
    }

    #[test]
    fn descriptor_stdio_receives_output() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("out.log");
        let file = File::create(&path).expect("create log");
        let stdio = Stdio::from(file);
        assert!(in_child(|| {
            redirect_stream(libc::STDOUT_FILENO, &stdio).is_ok() && {
                let msg = b"hello daemon";
                // SAFETY: writing a valid buffer to fd 1.
                let written = unsafe { libc::write(1, msg.as_ptr().cast(), msg.len()) };
                written == msg.len() as isize
            }
        }));
        assert_eq!(fs::read_to_string(&path).expect("read log"), "hello daemon");
    }

    #[test]
    fn close_all_open_files_spares_excluded() {
        let spared = tempfile::tempfile().expect("spared file");
        let doomed = tempfile::tempfile().expect("doomed file");
        let spared_fd = spared.as_raw_fd();
        let doomed_fd = doomed.as_raw_fd();
        assert!(in_child(|| {
            let is_open = |fd: RawFd| {
                // SAFETY: F_GETFD only inspects the descriptor table.
                unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
            };
            close_all_open_files(&BTreeSet::from([spared_fd])).is_ok()
                && is_open(spared_fd)
                && !is_open(doomed_fd)
        }));
    }

    #[test]
    fn same_owner_is_a_no_op() {
        change_process_owner(unix::real_uid(), unix::real_gid()).expect("no-op owner change");
    }

    #[test]
    fn missing_chroot_directory_fails_before_chroot() {
        let result = change_root_directory(Path::new("/definitely/not/here"));
        assert_eq!(result.map_err(|e| e.kind()), Err(io::ErrorKind::NotFound));
    }

    #[test]
    fn failing_step_is_reported_with_context() {
        let spec = DaemonSpec::new("session-test", || Ok(()))
            .prevent_core_dump(false)
            .working_directory("/definitely/not/here");
        assert!(in_child(|| matches!(
            apply(&spec, &[]),
            Err(DaemonError::Environment {
                step: SessionStep::WorkingDirectory,
                ..
            })
        )));
    }
}
