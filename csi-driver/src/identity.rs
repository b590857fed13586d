//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use serde::Serialize;
use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::csi;
use crate::supervisor::WatchdogStatus;

pub const DRIVER_NAME: &str = "efs.csi.aws.com";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information printed by `--version`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub driver_version: String,
    pub git_commit: String,
    pub build_date: String,
    pub platform: String,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            driver_version: DRIVER_VERSION.to_string(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            build_date: option_env!("BUILD_DATE").unwrap_or("unknown").to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    /// Mount helper health; absent when the node service is not served
    watchdog: Option<watch::Receiver<WatchdogStatus>>,
}

impl IdentityService {
    pub fn new(watchdog: Option<watch::Receiver<WatchdogStatus>>) -> Self {
        Self { watchdog }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(None)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        // Report capabilities: controller service and online volume expansion
        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            },
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                    csi::plugin_capability::VolumeExpansion {
                        r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Probes the plugin to check if it is ready.
    ///
    /// Not ready while the mount helper keeps failing to restart.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = match &self.watchdog {
            Some(rx) => {
                let status = *rx.borrow();
                if status.is_failing() {
                    warn!(
                        state = ?status.state,
                        consecutive_failures = status.consecutive_failures,
                        "Probe: mount helper is failing"
                    );
                }
                !status.is_failing()
            }
            None => true,
        };

        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}
