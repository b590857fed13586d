//! Mount executor for the Node service.
//!
//! The node service drives mounts through the [`Mounter`] trait so the state
//! machine can be exercised without touching the host. [`LinuxMounter`]
//! shells out to the file system's mount helper and the bind mount
//! primitives.

mod linux;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tonic::Status;

pub use linux::{LinuxMounter, mount_points, statvfs_usage};

use crate::supervisor::{CommandError, ExitStatus};

/// File system type handled by the mount helper.
pub const FS_TYPE: &str = "efs";

/// A mount helper invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// `fsid:/path` as understood by the helper
    pub source: String,
    pub target: PathBuf,
    pub options: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("{operation} failed with {status}: {diagnostic}")]
    Failed {
        operation: &'static str,
        status: ExitStatus,
        diagnostic: String,
    },

    #[error("{operation}: {source}")]
    Command {
        operation: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("failed to prepare mount point: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MountError> for Status {
    fn from(err: MountError) -> Self {
        Status::internal(err.to_string())
    }
}

/// Volume usage as reported by the file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsUsage {
    pub total_bytes: i64,
    pub available_bytes: i64,
    pub used_bytes: i64,
    pub total_inodes: i64,
    pub free_inodes: i64,
    pub used_inodes: i64,
}

/// Mount primitives used by the node service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount through the file system's helper.
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError>;

    /// Expose an already mounted `source` at `target`.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), MountError>;

    /// Unmount `target` and remove the mount point. Not mounted is success.
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_error_to_status() {
        let err = MountError::Failed {
            operation: "mount",
            status: ExitStatus::Code(32),
            diagnostic: "mount.efs: connection refused".into(),
        };
        let status = Status::from(err);
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(
            status.message(),
            "mount failed with exit code 32: mount.efs: connection refused"
        );
    }
}
