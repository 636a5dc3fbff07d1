//! Network namespace handles.
//!
//! `setns(2)` only switches the calling thread, so a namespace is entered for
//! the duration of a guard and the previous namespace is restored when the
//! guard drops, on every exit path.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use thiserror::Error;
use tracing::{debug, error};

/// Namespace of the calling thread.
pub const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

#[derive(Debug, Error)]
pub enum NsError {
    #[error("failed to open network namespace {path}: {error}")]
    Open {
        path: PathBuf,
        error: Errno,
    },

    #[error("failed to enter network namespace {path}: {error}")]
    Enter {
        path: PathBuf,
        error: Errno,
    },
}

impl NsError {
    /// True when the namespace path no longer exists (e.g. the container is gone).
    pub fn is_not_found(&self) -> bool {
        matches!(self, NsError::Open { error: Errno::ENOENT, .. })
    }
}

/// A network namespace reference usable by the VF managers.
pub trait NetNamespace: Sized {
    /// Restores the previously active namespace when dropped.
    type Guard;

    /// Opens the namespace the calling thread is currently in.
    fn current() -> Result<Self, NsError>;

    /// Descriptor suitable for a namespace-move device call.
    fn fd(&self) -> RawFd;

    fn path(&self) -> &Path;

    /// Switches the calling thread into this namespace.
    fn enter(&self) -> Result<Self::Guard, NsError>;

    /// Runs `f` inside this namespace.
    fn exec<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<NsError>,
    {
        let _guard = self.enter()?;
        f()
    }
}

/// An open network namespace file.
#[derive(Debug)]
pub struct NetNs {
    fd: RawFd,
    path: PathBuf,
}

impl NetNs {
    /// Opens the namespace at `path` (e.g. `/var/run/netns/foo` or `/proc/<pid>/ns/net`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NsError> {
        let path = path.as_ref().to_path_buf();
        let fd = open(
            path.as_path(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|error| NsError::Open {
            path: path.clone(),
            error,
        })?;
        Ok(Self { fd, path })
    }
}

impl NetNamespace for NetNs {
    type Guard = NsGuard;

    fn current() -> Result<Self, NsError> {
        Self::open(THREAD_NETNS_PATH)
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> Result<NsGuard, NsError> {
        let origin = NetNs::current()?;
        setns(self.fd, CloneFlags::CLONE_NEWNET).map_err(|error| NsError::Enter {
            path: self.path.clone(),
            error,
        })?;
        debug!(netns = %self.path.display(), "Entered network namespace");
        Ok(NsGuard { origin })
    }
}

impl Drop for NetNs {
    fn drop(&mut self) {
        if let Err(e) = close(self.fd) {
            debug!(netns = %self.path.display(), error = %e, "Failed to close namespace fd");
        }
    }
}

/// Holds the namespace that was active before [`NetNamespace::enter`].
#[derive(Debug)]
pub struct NsGuard {
    origin: NetNs,
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        // The thread is stuck in the wrong namespace if this fails; there is no
        // caller to hand the error to.
        if let Err(e) = setns(self.origin.fd, CloneFlags::CLONE_NEWNET) {
            error!(
                netns = %self.origin.path.display(),
                error = %e,
                "Failed to restore network namespace"
            );
        }
    }
}
