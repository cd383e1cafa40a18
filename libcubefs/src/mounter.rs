//! Mount-state probing and mount primitives.
//!
//! [`Mounter`] abstracts the handful of host operations the node service
//! needs, so the stage/publish logic can be exercised against an in-memory
//! fake.  [`probe`] reconciles the answers into a single [`PathState`], the
//! only view of a path the node service ever dispatches on.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::error::CsiError;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Observed state of a mount path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    /// Nothing exists at the path.
    Absent,
    /// The path exists and nothing is mounted on it.
    Unmounted,
    /// A healthy mount is present.
    Mounted,
    /// A mount is present but its backing filesystem is unreachable.
    Corrupted(String),
}

/// Host operations used by the node service.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// `Ok(false)` when nothing exists at `path`.  A stat failure other than
    /// "not found" is returned as-is; see [`is_corrupted_mount`].
    async fn path_exists(&self, path: &Path) -> io::Result<bool>;

    /// Whether `path` is listed in the mount table.
    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError>;

    /// Cheap check comparing the device of `path` with its parent's.  A `true`
    /// answer can be wrong for bind mounts within one filesystem.
    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool>;

    async fn make_dir(&self, path: &Path) -> Result<(), CsiError>;

    /// Remove an empty directory; a missing one is not an error.
    async fn remove_dir(&self, path: &Path) -> Result<(), CsiError>;

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), CsiError>;

    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;
}

/// Whether a stat error means "mounted, but the filesystem behind it is gone".
pub fn is_corrupted_mount(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EACCES | Errno::EHOSTDOWN)
    )
}

/// Derive the state of `path` in one pass.
pub async fn probe(mounter: &dyn Mounter, path: &Path) -> Result<PathState, CsiError> {
    let classify = |e: io::Error| {
        if is_corrupted_mount(&e) {
            Ok(PathState::Corrupted(e.to_string()))
        } else {
            Err(CsiError::Internal(format!("stat {}: {e}", path.display())))
        }
    };

    match mounter.path_exists(path).await {
        Ok(false) => return Ok(PathState::Absent),
        Ok(true) => {}
        Err(e) => return classify(e),
    }

    let likely_not = match mounter.is_likely_not_mount_point(path).await {
        Ok(v) => v,
        Err(e) => return classify(e),
    };
    if !likely_not || mounter.is_mount_point(path).await? {
        Ok(PathState::Mounted)
    } else {
        Ok(PathState::Unmounted)
    }
}

/// Unmount `path` if anything is mounted there, then remove it.
///
/// Absent paths are left alone, so the call is idempotent.
pub async fn cleanup_mount_point(mounter: &dyn Mounter, path: &Path) -> Result<(), CsiError> {
    match probe(mounter, path).await? {
        PathState::Absent => {
            debug!(path = %path.display(), "mount point gone, nothing to clean up");
            return Ok(());
        }
        PathState::Corrupted(reason) => {
            warn!(path = %path.display(), %reason, "unmounting corrupted mount point");
            mounter.unmount(path).await?;
        }
        PathState::Mounted => mounter.unmount(path).await?,
        PathState::Unmounted => {}
    }

    mounter.remove_dir(path).await?;
    info!(path = %path.display(), "mount point cleaned up");
    Ok(())
}

/// Parse the mount points out of a `/proc/self/mounts` style table.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`, with
/// whitespace and backslashes in paths written as octal escapes (`\040`).
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// [`Mounter`] acting on the host mount namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

#[async_trait]
impl Mounter for HostMounter {
    async fn path_exists(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        let table = tokio::fs::read_to_string(MOUNT_TABLE)
            .await
            .map_err(|e| CsiError::Internal(format!("read {MOUNT_TABLE}: {e}")))?;
        Ok(parse_mount_points(&table).iter().any(|p| p == path))
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let stat = tokio::fs::metadata(path).await?;
        let parent = path.parent().unwrap_or(Path::new("/"));
        let parent_stat = tokio::fs::metadata(parent).await?;
        Ok(stat.dev() == parent_stat.dev())
    }

    async fn make_dir(&self, path: &Path) -> Result<(), CsiError> {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(path)
            .await
            .map_err(|e| CsiError::Internal(format!("create dir {}: {e}", path.display())))
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), CsiError> {
        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::Internal(format!(
                "remove dir {}: {e}",
                path.display()
            ))),
        }
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: target.display().to_string(),
            reason,
        };

        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| mount_failed(format!("bind {}: {e}", source.display())))?;

        // MS_RDONLY is ignored on the initial bind; it only sticks on a remount.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_failed(format!("remount read-only: {e}")))?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })
    }
}
