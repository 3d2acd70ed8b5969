//! Thin wrappers over the libc calls used by the fork protocol and session setup.
//!
//! Every wrapper converts the C return convention into `io::Result`; callers
//! attach the context that turns these into [`DaemonError`](crate::DaemonError)s.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Operating-system process identifier.
pub type Pid = libc::pid_t;

/// Fallback descriptor ceiling when `RLIMIT_NOFILE` is unlimited.
const MAXFD: RawFd = 2048;

/// Which side of a `fork` the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fork {
    Parent(Pid),
    Child,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn fork() -> io::Result<Fork> {
    // SAFETY: the child only runs code owned by this crate before `_exit`.
    let pid = check(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(Fork::Child)
    } else {
        Ok(Fork::Parent(pid))
    }
}

pub(crate) fn setsid() -> io::Result<Pid> {
    // SAFETY: setsid has no memory-safety preconditions.
    check(unsafe { libc::setsid() })
}

/// Creates an unnamed close-on-exec pipe, returning `(read, write)`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    // SAFETY: `fds` has room for the two descriptors pipe2(2) writes.
    check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2(2) succeeded, so both descriptors are open and owned by us.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok(pair)
}

/// Creates an unnamed close-on-exec pipe, returning `(read, write)`.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&pair.0, &pair.1] {
        // SAFETY: F_SETFD on a descriptor we own.
        check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok(pair)
}

/// Waits until `fd` is readable (or hung up) or `timeout` elapses.
///
/// Returns `false` on timeout. Interrupted waits resume with the remaining budget.
pub(crate) fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid pollfd array of length one.
        match check(unsafe { libc::poll(&mut pfd, 1, millis) }) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
}

/// Leaves the process immediately, skipping atexit handlers and buffered output.
pub(crate) fn exit_now(code: i32) -> ! {
    // SAFETY: _exit never returns and has no preconditions.
    unsafe { libc::_exit(code) }
}

/// Reaps a direct child, blocking until it exits, and returns its raw wait status.
///
/// `Ok(None)` when the child was already reaped elsewhere (or SIGCHLD is ignored).
pub(crate) fn reap(pid: Pid) -> io::Result<Option<libc::c_int>> {
    wait_child(pid, 0)
}

/// Reaps a direct child only if it has already exited.
///
/// `Ok(None)` while the child is still running, and when there is nothing to reap.
pub(crate) fn try_reap(pid: Pid) -> io::Result<Option<libc::c_int>> {
    wait_child(pid, libc::WNOHANG)
}

fn wait_child(pid: Pid, options: libc::c_int) -> io::Result<Option<libc::c_int>> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        match check(unsafe { libc::waitpid(pid, &mut status, options) }) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(status)),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) if error.raw_os_error() == Some(libc::ECHILD) => return Ok(None),
            Err(error) => return Err(error),
        }
    }
}

pub(crate) fn getpid() -> Pid {
    // SAFETY: getpid always succeeds.
    unsafe { libc::getpid() }
}

pub(crate) fn real_uid() -> u32 {
    // SAFETY: getuid always succeeds.
    unsafe { libc::getuid() }
}

pub(crate) fn real_gid() -> u32 {
    // SAFETY: getgid always succeeds.
    unsafe { libc::getgid() }
}

pub(crate) fn set_gid(gid: u32) -> io::Result<()> {
    // SAFETY: setgid has no memory-safety preconditions.
    check(unsafe { libc::setgid(gid) }).map(drop)
}

pub(crate) fn set_uid(uid: u32) -> io::Result<()> {
    // SAFETY: setuid has no memory-safety preconditions.
    check(unsafe { libc::setuid(uid) }).map(drop)
}

/// Sets the file creation mask, returning the previous one.
pub(crate) fn umask(mask: u32) -> u32 {
    // SAFETY: umask always succeeds.
    let previous = unsafe { libc::umask(mask as libc::mode_t) };
    u32::from(previous)
}

/// Sets both soft and hard `RLIMIT_CORE` to zero.
///
/// Probes the current limit first so a platform without the resource reports
/// an error instead of silently succeeding.
pub(crate) fn disable_core_dumps() -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid out-pointer.
    check(unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut current) })?;
    let none = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `none` is a valid rlimit value.
    check(unsafe { libc::setrlimit(libc::RLIMIT_CORE, &none) }).map(drop)
}

/// Reads the soft and hard core-dump limits.
#[cfg(test)]
pub(crate) fn core_dump_limits() -> io::Result<(u64, u64)> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid out-pointer.
    check(unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut current) })?;
    Ok((current.rlim_cur as u64, current.rlim_max as u64))
}

/// Highest descriptor number worth scanning when closing inherited files.
pub(crate) fn max_open_files() -> RawFd {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid out-pointer.
    if check(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }).is_err()
        || limit.rlim_max == libc::RLIM_INFINITY
    {
        return MAXFD;
    }
    RawFd::try_from(limit.rlim_max).unwrap_or(MAXFD)
}

/// Closes a raw descriptor we do not own through Rust; `EBADF` means it was not open.
pub(crate) fn close_if_open(fd: RawFd) -> io::Result<()> {
    // SAFETY: the caller guarantees no live Rust owner refers to `fd`.
    match check(unsafe { libc::close(fd) }) {
        Ok(_) => Ok(()),
        Err(error) if error.raw_os_error() == Some(libc::EBADF) => Ok(()),
        Err(error) => Err(error),
    }
}

pub(crate) fn dup2(source: RawFd, target: RawFd) -> io::Result<()> {
    if source == target {
        return Ok(());
    }
    // SAFETY: dup2 only manipulates the descriptor table.
    check(unsafe { libc::dup2(source, target) }).map(drop)
}

/// Sends `signal` to `pid`; `None` probes for existence without delivering anything.
pub(crate) fn kill(pid: Pid, signal: Option<libc::c_int>) -> io::Result<()> {
    // SAFETY: kill(2) is memory-safe for any pid; the kernel rejects invalid ones.
    check(unsafe { libc::kill(pid, signal.unwrap_or(0)) }).map(drop)
}

/// Ignores `signal` in this process.
pub(crate) fn ignore_signal(signal: libc::c_int) -> io::Result<()> {
    set_disposition(signal, libc::SIG_IGN)
}

/// Restores the default disposition of `signal`.
pub(crate) fn default_signal(signal: libc::c_int) -> io::Result<()> {
    set_disposition(signal, libc::SIG_DFL)
}

fn set_disposition(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: SIG_IGN and SIG_DFL are valid dispositions for any catchable signal.
    if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets the kernel-visible process name (what `ps -o comm` shows).
///
/// Only the 15-byte `comm` field changes; the argv title in `ps aux` stays as launched.
#[cfg(target_os = "linux")]
pub(crate) fn set_process_name(name: &str) -> io::Result<()> {
    // The kernel truncates to 15 bytes plus the terminator.
    let truncated: Vec<u8> = name.bytes().take(15).collect();
    let cname = CString::new(truncated)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process name contains NUL"))?;
    // SAFETY: PR_SET_NAME reads a NUL-terminated string of at most 16 bytes.
    check(unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0) })
        .map(drop)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_process_name(name: &str) -> io::Result<()> {
    CString::new(name)
        .map(drop)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process name contains NUL"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_cloexec(fd: &OwnedFd) -> bool {
        // SAFETY: F_GETFD only inspects the descriptor table.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        flags != -1 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn pipe_ends_close_on_exec() {
        let (read_end, write_end) = pipe().expect("pipe");
        assert!(is_cloexec(&read_end));
        assert!(is_cloexec(&write_end));
    }

    #[test]
    fn try_reap_does_not_wait_for_a_live_child() {
        let child = match fork().expect("fork") {
            Fork::Child => {
                std::thread::sleep(Duration::from_secs(30));
                exit_now(0)
            }
            Fork::Parent(pid) => pid,
        };
        assert_eq!(try_reap(child).expect("try_reap"), None);

        kill(child, Some(libc::SIGKILL)).expect("kill child");
        let status = reap(child).expect("reap").expect("wait status");
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_name_is_cut_to_the_comm_field() {
        let child = match fork().expect("fork") {
            Fork::Child => {
                let named = set_process_name("a-very-long-daemon-name").is_ok()
                    && std::fs::read_to_string("/proc/thread-self/comm").ok().as_deref()
                        == Some("a-very-long-dae\n");
                exit_now(if named { 0 } else { 1 })
            }
            Fork::Parent(pid) => pid,
        };
        let status = reap(child).expect("reap").expect("wait status");
        assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
    }
}
