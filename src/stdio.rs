use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

/// Defines where a daemon's standard stream (stdin, stdout, stderr) points.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Redirects the stream to the null device. Default option.
    #[default]
    Null,
    /// Duplicates the given descriptor onto the standard stream slot.
    Fd(OwnedFd),
}

impl Stdio {
    /// Creates a configuration that discards all output.
    pub fn null() -> Self {
        Stdio::Null
    }

    /// Redirects to a duplicate of any descriptor-backed stream.
    ///
    /// The duplicate keeps the descriptor valid even if `stream` is dropped
    /// before the daemon starts. Useful for sharing the controller's own
    /// terminal: `Stdio::from_fd(&std::io::stderr())`.
    pub fn from_fd<S: AsFd>(stream: &S) -> io::Result<Self> {
        stream.as_fd().try_clone_to_owned().map(Stdio::Fd)
    }

    /// The descriptor to preserve while closing inherited files, if any.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Stdio::Null => None,
            Stdio::Fd(fd) => Some(fd.as_raw_fd()),
        }
    }
}

impl From<File> for Stdio {
    fn from(f: File) -> Self {
        Stdio::Fd(f.into())
    }
}

impl From<OwnedFd> for Stdio {
    fn from(fd: OwnedFd) -> Self {
        Stdio::Fd(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_has_no_descriptor() {
        assert_eq!(Stdio::null().raw_fd(), None);
        assert!(matches!(Stdio::default(), Stdio::Null));
    }

    #[test]
    fn from_fd_duplicates_the_descriptor() {
        let file = tempfile::tempfile().expect("create temp file");
        let stdio = Stdio::from_fd(&file).expect("duplicate descriptor");
        let raw = stdio.raw_fd().expect("descriptor-backed stdio");
        assert_ne!(raw, file.as_raw_fd());
    }
}
