//! Control-plane agent client.
//!
//! Wraps the `FileSystemAgent` gRPC client. The connection is established
//! lazily and dropped again on transport failures; throttled or unavailable
//! calls are retried with exponential backoff.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, error, info, warn};

use super::{AccessPoint, Cloud, CloudError, CreateAccessPointInput, FileSystem, MountTarget, PosixUser};
use crate::agent::{self, file_system_agent_client::FileSystemAgentClient};
use crate::metrics;

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

/// Check if a gRPC status code indicates a retryable error.
///
/// Retryable errors are transient failures that may succeed on retry:
/// - Unavailable: agent or control plane temporarily unavailable
/// - ResourceExhausted: throttled, may succeed after backoff
/// - Aborted: conflicting concurrent modification
/// - Unknown: might be transient
fn is_retryable(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Unknown
    )
}

/// Check if error indicates a transport failure that should drop the cached channel.
fn is_transport_error(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable | tonic::Code::Unknown | tonic::Code::Internal
    ) && (status.message().contains("transport")
        || status.message().contains("connection")
        || status.message().contains("broken pipe")
        || status.message().contains("reset by peer"))
}

/// Execute an async operation with exponential backoff retry.
async fn with_retry<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T, tonic::Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, tonic::Status>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(status) => {
                attempt += 1;

                if !is_retryable(&status) || attempt > MAX_RETRIES {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            code = ?status.code(),
                            "Operation failed after retries"
                        );
                    }
                    return Err(status);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    code = ?status.code(),
                    backoff_ms = backoff_ms,
                    "Retryable error, backing off"
                );

                metrics::record_retry(operation_name);

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Map an agent status to the control-plane error for `operation`.
///
/// `resource` names the object the call addressed so that NotFound can be
/// attributed to a file system or an access point.
fn to_cloud_error(operation: &'static str, resource: Resource<'_>, status: tonic::Status) -> CloudError {
    match status.code() {
        tonic::Code::NotFound => match resource {
            Resource::FileSystem(id) => CloudError::FileSystemNotFound(id.to_string()),
            Resource::AccessPoint(id) => CloudError::AccessPointNotFound(id.to_string()),
        },
        tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
            CloudError::AccessDenied(status.message().to_string())
        }
        tonic::Code::Unavailable | tonic::Code::ResourceExhausted => {
            CloudError::Unavailable(status.message().to_string())
        }
        _ => CloudError::Api {
            operation,
            message: status.message().to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum Resource<'a> {
    FileSystem(&'a str),
    AccessPoint(&'a str),
}

fn access_point_from_proto(ap: agent::AccessPoint) -> AccessPoint {
    AccessPoint {
        access_point_id: ap.access_point_id,
        file_system_id: ap.file_system_id,
        root_directory: ap.root_directory,
        posix_user: ap.posix_user.and_then(|user| {
            Some(PosixUser {
                uid: u32::try_from(user.uid).ok()?,
                gid: u32::try_from(user.gid).ok()?,
            })
        }),
        permissions: ap.permissions.parse().ok(),
        tags: ap.tags,
    }
}

/// mTLS material for the agent connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub domain: String,
}

impl TlsConfig {
    async fn load(&self) -> std::io::Result<ClientTlsConfig> {
        let cert = tokio::fs::read(&self.cert_path).await?;
        let key = tokio::fs::read(&self.key_path).await?;
        let ca = tokio::fs::read(&self.ca_path).await?;

        Ok(ClientTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .ca_certificate(Certificate::from_pem(ca))
            .domain_name(&self.domain))
    }
}

/// [`Cloud`] backed by the control-plane agent.
pub struct AgentCloud {
    endpoint: String,
    tls: Option<TlsConfig>,
    /// Lazily initialized agent connection
    client: RwLock<Option<FileSystemAgentClient<Channel>>>,
}

impl AgentCloud {
    pub fn new(endpoint: String) -> Self {
        Self::with_tls(endpoint, None)
    }

    pub fn with_tls(endpoint: String, tls: Option<TlsConfig>) -> Self {
        Self {
            endpoint,
            tls,
            client: RwLock::new(None),
        }
    }

    /// Get or create the agent client connection.
    ///
    /// Uses a read lock first to check for an existing client (fast path),
    /// then upgrades to a write lock only if connection is needed.
    async fn get_client(&self) -> Result<FileSystemAgentClient<Channel>, CloudError> {
        {
            let guard = self.client.read().await;
            if let Some(ref client) = *guard {
                return Ok(client.clone());
            }
        }

        let mut guard = self.client.write().await;
        // Another task may have connected while we waited
        if let Some(ref client) = *guard {
            return Ok(client.clone());
        }

        info!(endpoint = %self.endpoint, tls = self.tls.is_some(), "Connecting to control-plane agent");
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| CloudError::Unavailable(format!("invalid agent endpoint: {}", e)))?
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);

        if let Some(tls) = &self.tls {
            let tls_config = tls.load().await.map_err(|e| {
                error!(error = %e, "Failed to read agent TLS material");
                CloudError::Unavailable(format!("failed to read agent TLS material: {}", e))
            })?;
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| CloudError::Unavailable(format!("invalid agent TLS config: {}", e)))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to control-plane agent");
                metrics::record_connection_attempt(false);
                metrics::set_agent_connected(false);
                CloudError::Unavailable("agent connection failed".to_string())
            })?;

        metrics::record_connection_attempt(true);
        metrics::set_agent_connected(true);
        let client = FileSystemAgentClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Clear the cached connection (call on transport errors).
    async fn clear_client(&self) {
        let mut guard = self.client.write().await;
        if guard.is_some() {
            warn!("Clearing stale agent connection");
            metrics::set_agent_connected(false);
            *guard = None;
        }
    }

    /// Run one agent call with retry, dropping the connection on transport errors.
    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        resource: Resource<'_>,
        f: F,
    ) -> Result<T, CloudError>
    where
        F: Fn(FileSystemAgentClient<Channel>) -> Fut,
        Fut: Future<Output = Result<T, tonic::Status>>,
    {
        let client = self.get_client().await?;
        match with_retry(operation, || f(client.clone())).await {
            Ok(value) => Ok(value),
            Err(status) => {
                if is_transport_error(&status) {
                    self.clear_client().await;
                }
                Err(to_cloud_error(operation, resource, status))
            }
        }
    }
}

#[async_trait]
impl Cloud for AgentCloud {
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, CloudError> {
        debug!(file_system_id, "Describing file system");
        let request = agent::DescribeFileSystemRequest {
            file_system_id: file_system_id.to_string(),
        };

        let fs = self
            .call(
                "describe_file_system",
                Resource::FileSystem(file_system_id),
                |mut c| {
                    let req = request.clone();
                    async move { Ok(c.describe_file_system(req).await?.into_inner().file_system) }
                },
            )
            .await?
            .ok_or_else(|| CloudError::FileSystemNotFound(file_system_id.to_string()))?;

        Ok(FileSystem {
            file_system_id: fs.file_system_id,
            life_cycle_state: fs.life_cycle_state,
        })
    }

    async fn create_access_point(
        &self,
        input: CreateAccessPointInput,
    ) -> Result<AccessPoint, CloudError> {
        debug!(
            file_system_id = %input.file_system_id,
            client_token = %input.client_token,
            "Creating access point"
        );
        let request = agent::CreateAccessPointRequest {
            client_token: input.client_token,
            file_system_id: input.file_system_id.clone(),
            root_directory: input.root_directory,
            posix_user: Some(agent::PosixUser {
                uid: i64::from(input.posix_user.uid),
                gid: i64::from(input.posix_user.gid),
            }),
            permissions: input.permissions.to_string(),
            tags: input.tags,
        };

        let ap = self
            .call(
                "create_access_point",
                Resource::FileSystem(&input.file_system_id),
                |mut c| {
                    let req = request.clone();
                    async move { Ok(c.create_access_point(req).await?.into_inner().access_point) }
                },
            )
            .await?
            .ok_or_else(|| CloudError::Api {
                operation: "create_access_point",
                message: "agent returned empty access point".to_string(),
            })?;

        Ok(access_point_from_proto(ap))
    }

    async fn describe_access_point(
        &self,
        access_point_id: &str,
    ) -> Result<AccessPoint, CloudError> {
        let request = agent::DescribeAccessPointRequest {
            access_point_id: access_point_id.to_string(),
        };

        let ap = self
            .call(
                "describe_access_point",
                Resource::AccessPoint(access_point_id),
                |mut c| {
                    let req = request.clone();
                    async move { Ok(c.describe_access_point(req).await?.into_inner().access_point) }
                },
            )
            .await?
            .ok_or_else(|| CloudError::AccessPointNotFound(access_point_id.to_string()))?;

        Ok(access_point_from_proto(ap))
    }

    async fn list_access_points(
        &self,
        file_system_id: &str,
    ) -> Result<Vec<AccessPoint>, CloudError> {
        let request = agent::ListAccessPointsRequest {
            file_system_id: file_system_id.to_string(),
        };

        let aps = self
            .call(
                "list_access_points",
                Resource::FileSystem(file_system_id),
                |mut c| {
                    let req = request.clone();
                    async move { Ok(c.list_access_points(req).await?.into_inner().access_points) }
                },
            )
            .await?;

        Ok(aps.into_iter().map(access_point_from_proto).collect())
    }

    async fn delete_access_point(&self, access_point_id: &str) -> Result<(), CloudError> {
        let request = agent::DeleteAccessPointRequest {
            access_point_id: access_point_id.to_string(),
        };

        self.call(
            "delete_access_point",
            Resource::AccessPoint(access_point_id),
            |mut c| {
                let req = request.clone();
                async move {
                    c.delete_access_point(req).await?;
                    Ok(())
                }
            },
        )
        .await
    }

    async fn describe_mount_targets(
        &self,
        file_system_id: &str,
        availability_zone: Option<&str>,
    ) -> Result<Vec<MountTarget>, CloudError> {
        let request = agent::DescribeMountTargetsRequest {
            file_system_id: file_system_id.to_string(),
            availability_zone: availability_zone.unwrap_or_default().to_string(),
        };

        let targets = self
            .call(
                "describe_mount_targets",
                Resource::FileSystem(file_system_id),
                |mut c| {
                    let req = request.clone();
                    async move { Ok(c.describe_mount_targets(req).await?.into_inner().mount_targets) }
                },
            )
            .await?;

        Ok(targets
            .into_iter()
            .map(|mt| MountTarget {
                mount_target_id: mt.mount_target_id,
                ip_address: mt.ip_address,
                availability_zone: mt.availability_zone,
            })
            .collect())
    }
}
