//! Mount namespace primitives for isolated command launch.
//!
//! Namespaces belong to a process, so these are only called from the
//! `launch` role, a short-lived child that sets up isolation and then execs
//! the staged command. The long-running worker never changes its own mounts.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare as nix_unshare};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("unshare mount namespace: {0}")]
    Unshare(#[source] nix::Error),

    #[error("make mounts private: {0}")]
    Propagation(#[source] nix::Error),

    #[error("bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("unmount {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// Move this process into a fresh mount namespace.
pub fn unshare() -> Result<(), NamespaceError> {
    nix_unshare(CloneFlags::CLONE_NEWNS).map_err(NamespaceError::Unshare)
}

/// Turn `path` into a private mount point.
///
/// Propagation from `/` is cut first so nothing mounted here leaks back to
/// the host, then `path` is bind-mounted onto itself.
pub fn private_mount(path: &Path) -> Result<(), NamespaceError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(NamespaceError::Propagation)?;

    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| NamespaceError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Lazily detach the mount at `path`.
pub fn unmount(path: &Path) -> Result<(), NamespaceError> {
    umount2(path, MntFlags::MNT_DETACH).map_err(|source| NamespaceError::Unmount {
        path: path.to_path_buf(),
        source,
    })
}

/// Enter a new namespace and privatize `path` in it.
pub fn isolate(path: &Path) -> Result<(), NamespaceError> {
    unshare()?;
    private_mount(path)?;
    tracing::debug!("isolated {} in a private mount namespace", path.display());
    Ok(())
}
