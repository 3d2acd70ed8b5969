use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::{DaemonError, DaemonResult};
use crate::session::SessionStep;
use crate::signals::{Signal, SignalAction, SignalMap};
use crate::stdio::Stdio;
use crate::sys::unix;

/// The work a daemon performs. Shared so one spec can be started repeatedly.
pub type Target = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Default working directory, so the daemon never pins a mount point.
pub const DEFAULT_WORKING_DIRECTORY: &str = "/";

/// Everything needed to turn a process into a daemon running `target`.
///
/// Built once by the controller and then only read: the launcher borrows it
/// for the fork protocol, and the runtime inside the daemon borrows its
/// (forked) copy.
pub struct DaemonSpec {
    pub(crate) name: String,
    pub(crate) target: Target,
    pub(crate) chroot_directory: Option<PathBuf>,
    pub(crate) working_directory: PathBuf,
    pub(crate) umask: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) prevent_core_dump: bool,
    pub(crate) files_preserve: BTreeSet<RawFd>,
    pub(crate) close_open_files: bool,
    pub(crate) stdin: Stdio,
    pub(crate) stdout: Stdio,
    pub(crate) stderr: Stdio,
    pub(crate) signal_map: SignalMap,
    pub(crate) logging: Option<Target>,
    pub(crate) termination: Arc<AtomicBool>,
}

// Manual Debug: the closures are opaque.
impl fmt::Debug for DaemonSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonSpec")
            .field("name", &self.name)
            .field("chroot_directory", &self.chroot_directory)
            .field("working_directory", &self.working_directory)
            .field("umask", &format_args!("{:#o}", self.umask))
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("prevent_core_dump", &self.prevent_core_dump)
            .field("files_preserve", &self.files_preserve)
            .field("close_open_files", &self.close_open_files)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("signal_map", &self.signal_map)
            .field("logging", &self.logging.as_ref().map(|_| "Fn"))
            .field("target", &"Fn")
            .finish()
    }
}

impl DaemonSpec {
    /// Creates a spec with the default process environment.
    ///
    /// # Defaults
    /// - Working directory: `/`
    /// - Umask: `0`
    /// - Uid/gid: the caller's real ids
    /// - Core dumps: disabled
    /// - Stdio: the null device
    pub fn new<F>(name: &str, target: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        DaemonSpec {
            name: name.to_owned(),
            target: Arc::new(target),
            chroot_directory: None,
            working_directory: PathBuf::from(DEFAULT_WORKING_DIRECTORY),
            umask: 0,
            uid: unix::real_uid(),
            gid: unix::real_gid(),
            prevent_core_dump: true,
            files_preserve: BTreeSet::new(),
            close_open_files: false,
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
            signal_map: SignalMap::new(),
            logging: None,
            termination: Arc::new(AtomicBool::new(false)),
        }
    }

    // --- Public Getters ---

    /// Returns the daemon name (kernel process name).
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Returns the configured working directory.
    pub fn working_directory_path(&self) -> &Path {
        &self.working_directory
    }

    /// Returns the configured chroot directory, if any.
    pub fn chroot_directory_path(&self) -> Option<&Path> {
        self.chroot_directory.as_deref()
    }

    /// The flag raised inside the daemon once termination is requested.
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.termination)
    }

    // --- Builder Methods ---

    /// Sets a chroot directory for the daemon.
    pub fn chroot<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.chroot_directory = Some(path.into());
        self
    }

    /// Sets the working directory (inside the chroot, when one is set).
    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.working_directory = path.into();
        self
    }

    /// Sets the file creation mask for the daemon process.
    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = mask;
        self
    }

    /// Sets the user id to run the daemon as.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Sets the group id to run the daemon as.
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Whether to set the core-dump size limit to zero.
    pub fn prevent_core_dump(mut self, prevent: bool) -> Self {
        self.prevent_core_dump = prevent;
        self
    }

    /// Keeps `fd` open when inherited descriptors are closed.
    pub fn preserve_fd(mut self, fd: RawFd) -> Self {
        self.files_preserve.insert(fd);
        self
    }

    /// If `true`, closes every inherited descriptor except the preserved ones.
    pub fn close_open_files(mut self, close: bool) -> Self {
        self.close_open_files = close;
        self
    }

    /// Configures the standard input stream.
    pub fn stdin<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdin = stdio.into();
        self
    }

    /// Configures the standard output stream.
    pub fn stdout<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdout = stdio.into();
        self
    }

    /// Configures the standard error stream.
    pub fn stderr<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stderr = stdio.into();
        self
    }

    /// Maps one signal to an action.
    pub fn signal(mut self, signal: Signal, action: SignalAction) -> Self {
        self.signal_map.set(signal, action);
        self
    }

    /// Replaces the whole signal map.
    pub fn signal_map(mut self, map: SignalMap) -> Self {
        self.signal_map = map;
        self
    }

    /// Runs `hook` inside the daemon after the pid file is held and before the target.
    ///
    /// This is where a daemon installs its own log subscriber, since the
    /// controller's stderr is usually gone by then.
    pub fn setup_logging<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.logging = Some(Arc::new(hook));
        self
    }

    /// Shares `flag` with the runtime; it is set when SIGTERM arrives, so the
    /// target can poll it and wind down.
    pub fn termination_flag_from(mut self, flag: Arc<AtomicBool>) -> Self {
        self.termination = flag;
        self
    }

    /// Validates configuration without starting the daemon.
    /// Checks that the chroot (or, without one, the working directory) exists.
    pub fn build(self) -> DaemonResult<Self> {
        let (step, dir) = match &self.chroot_directory {
            Some(root) => (SessionStep::ChangeRoot, root),
            None => (SessionStep::WorkingDirectory, &self.working_directory),
        };
        if !dir.is_dir() {
            return Err(DaemonError::Environment {
                step,
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} is not a directory", dir.display()),
                ),
            });
        }
        Ok(self)
    }

    /// Descriptors that must survive the close-files step: the preserved set,
    /// the stdio sources, and whatever the launcher passes along.
    pub(crate) fn preserved_fds(&self, extra: &[RawFd]) -> BTreeSet<RawFd> {
        let mut out = self.files_preserve.clone();
        out.extend(
            [&self.stdin, &self.stdout, &self.stderr]
                .into_iter()
                .filter_map(Stdio::raw_fd),
        );
        out.extend(extra.iter().copied());
        out
    }
}
