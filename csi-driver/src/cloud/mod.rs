//! Elastic file service control plane.
//!
//! The services only see the [`Cloud`] trait. Two implementations exist:
//! [`AgentCloud`] talks gRPC to the control-plane agent that holds the cloud
//! credentials, and [`InMemoryCloud`] keeps everything in process for tests
//! and sanity runs (`memory://`).

mod agent;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

pub use agent::{AgentCloud, TlsConfig};
pub use memory::InMemoryCloud;

use crate::types::DirectoryPerms;

/// Endpoint scheme selecting the in-process control plane.
pub const MEMORY_ENDPOINT: &str = "memory://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystem {
    pub file_system_id: String,
    pub life_cycle_state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub access_point_id: String,
    pub file_system_id: String,
    pub root_directory: String,
    pub posix_user: Option<PosixUser>,
    pub permissions: Option<DirectoryPerms>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub mount_target_id: String,
    pub ip_address: String,
    pub availability_zone: String,
}

/// Everything needed to create an access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccessPointInput {
    /// Idempotency token; retries with the same token return the same access point
    pub client_token: String,
    pub file_system_id: String,
    pub root_directory: String,
    pub posix_user: PosixUser,
    pub permissions: DirectoryPerms,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CloudError {
    #[error("file system {0} not found")]
    FileSystemNotFound(String),

    #[error("access point {0} not found")]
    AccessPointNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CloudError::FileSystemNotFound(_) | CloudError::AccessPointNotFound(_)
        )
    }
}

impl From<CloudError> for Status {
    fn from(err: CloudError) -> Self {
        let message = err.to_string();
        match err {
            CloudError::FileSystemNotFound(_) | CloudError::AccessPointNotFound(_) => {
                Status::not_found(message)
            }
            CloudError::AccessDenied(_) => Status::permission_denied(message),
            CloudError::Unavailable(_) => Status::unavailable(message),
            CloudError::Api { .. } => Status::internal(message),
        }
    }
}

/// Control-plane operations the driver consumes.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, CloudError>;

    async fn create_access_point(
        &self,
        input: CreateAccessPointInput,
    ) -> Result<AccessPoint, CloudError>;

    async fn describe_access_point(&self, access_point_id: &str)
    -> Result<AccessPoint, CloudError>;

    async fn list_access_points(&self, file_system_id: &str)
    -> Result<Vec<AccessPoint>, CloudError>;

    async fn delete_access_point(&self, access_point_id: &str) -> Result<(), CloudError>;

    /// Mount targets of a file system, optionally restricted to one availability zone.
    async fn describe_mount_targets(
        &self,
        file_system_id: &str,
        availability_zone: Option<&str>,
    ) -> Result<Vec<MountTarget>, CloudError>;
}

/// Build the control plane client for an endpoint.
///
/// `memory://` selects the in-process implementation; anything else is
/// treated as the agent's gRPC address and connected lazily.
pub fn from_endpoint(endpoint: &str, tls: Option<TlsConfig>) -> Arc<dyn Cloud> {
    if endpoint == MEMORY_ENDPOINT {
        Arc::new(InMemoryCloud::sanity())
    } else {
        Arc::new(AgentCloud::with_tls(endpoint.to_string(), tls))
    }
}
