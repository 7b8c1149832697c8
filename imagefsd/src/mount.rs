//! Bind-mount plumbing.
//!
//! The orchestrator only ever needs three operations — bind, read-only
//! remount, unmount — plus a mount-point probe for idempotency checks and
//! reconcile.  They sit behind the [`Mounter`] trait so the rest of the
//! driver is testable without privileges; [`LinuxMounter`] is the real
//! implementation.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

/// Mount-layer failures.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },
}

/// The mount operations the driver performs, in trait form.
pub trait Mounter: Send + Sync {
    /// Bind `source` onto `target`, read-only when requested.
    ///
    /// Read-only binds are remounted with `MS_RDONLY` after the initial
    /// bind; some kernels ignore the flag on the first call.  A failed
    /// remount tears the bind down before returning the error.
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError>;

    /// Unmount `target`.  An already-unmounted target is not an error.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Whether `path` is currently a mount point.
    fn is_mount_point(&self, path: &Path) -> bool;
}

/// [`Mounter`] backed by the kernel mount syscalls.
#[derive(Default)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }
}

impl Mounter for LinuxMounter {
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError> {
        std::fs::create_dir_all(target).map_err(|e| MountError::MountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut flags = nix::mount::MsFlags::MS_BIND;
        if read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }

        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(
            |e| MountError::MountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            },
        )?;

        if read_only {
            let remount = nix::mount::MsFlags::MS_BIND
                | nix::mount::MsFlags::MS_REMOUNT
                | nix::mount::MsFlags::MS_RDONLY;
            if let Err(e) =
                nix::mount::mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
            {
                // A half-writable read-only mount must not stay visible.
                if let Err(undo) = nix::mount::umount(target) {
                    warn!(target = %target.display(), error = %undo, "failed to undo bind after remount failure");
                }
                return Err(MountError::MountFailed {
                    path: target.display().to_string(),
                    reason: format!("remount read-only: {e}"),
                });
            }
        }

        debug!(source = %source.display(), target = %target.display(), read_only, "bind mount established");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !target.exists() {
            debug!(target = %target.display(), "target gone, nothing to unmount");
            return Ok(());
        }
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) => {
                // Not a mount point: already unmounted.
                debug!(target = %target.display(), "target not mounted");
                Ok(())
            }
            Err(e) => Err(MountError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let Some(parent) = path.parent() else {
            return false;
        };
        let Ok(parent_meta) = std::fs::metadata(parent) else {
            return false;
        };
        use std::os::unix::fs::MetadataExt;
        meta.dev() != parent_meta.dev()
    }
}
