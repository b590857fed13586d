//! Process assembly: builds the services for the configured mode and serves
//! them on the CSI endpoint until shutdown.
//!
//! Startup order matters: the reaper must run before anything spawns a
//! child, and the mount helper must be up before the node service accepts
//! its first publish.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::cloud;
use crate::config::{ConfigError, DriverConfig, Endpoint, init_config_dir};
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::gid::GidAllocator;
use crate::identity::{DRIVER_NAME, DRIVER_VERSION};
use crate::platform::{LinuxMounter, Mounter};
use crate::supervisor::{CommandRunner, Reaper, Watchdog, WatchdogConfig, WatchdogError};
use crate::taint::{self, KubeTaintRemover};
use crate::{ControllerService, IdentityService, NodeService};

/// Path the mount helper reads its configuration from; symlinked to the
/// chosen config directory.
pub const EFS_UTILS_LINK: &str = "/etc/amazon/efs";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start mount helper: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Run the driver until `shutdown` resolves.
pub async fn run<F>(config: DriverConfig, shutdown: F) -> Result<(), DriverError>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        driver = DRIVER_NAME,
        version = DRIVER_VERSION,
        mode = %config.mode,
        endpoint = %config.endpoint,
        node_id = %config.node_id,
        cloud_endpoint = %config.cloud_endpoint,
        "Starting EFS CSI driver"
    );

    let endpoint = config.endpoint.to_string();
    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper = Reaper::new();
    let reaper_task = reaper.start(stop_rx).map_err(|source| DriverError::Io {
        endpoint: endpoint.clone(),
        source,
    })?;

    let watchdog = if config.mode.serves_node() {
        let config_dir = init_config_dir(
            &config.efs_utils_config_legacy_dir,
            &config.efs_utils_config_dir,
            Path::new(EFS_UTILS_LINK),
        )?;
        let watchdog_config =
            WatchdogConfig::new(config_dir, config.efs_utils_static_files_dir.clone());
        Some(Watchdog::start(watchdog_config, reaper.clone()).await?)
    } else {
        None
    };
    let watchdog_status = watchdog.as_ref().map(Watchdog::subscribe);

    let cloud = cloud::from_endpoint(&config.cloud_endpoint, config.cloud_tls.clone());
    let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter::new(CommandRunner::new(reaper.clone())));

    let identity = IdentityService::new(watchdog_status.clone());
    // One allocator for both services, so a GID handed out by one is never
    // handed out again by the other.
    let gids = Arc::new(GidAllocator::new(cloud.clone()));

    let controller = config.mode.serves_controller().then(|| {
        ControllerServer::new(ControllerService::new(
            &config,
            cloud.clone(),
            gids.clone(),
            mounter.clone(),
        ))
    });

    let node = config.mode.serves_node().then(|| {
        NodeServer::new(NodeService::new(
            config.node_id.clone(),
            mounter.clone(),
            gids.clone(),
            &config.volume_metrics,
            watchdog_status.clone(),
        ))
    });

    if config.mode.serves_node() {
        tokio::spawn(async {
            match KubeTaintRemover::from_env().await {
                Ok(remover) => {
                    taint::remove_taint_until_success(&remover, taint::RETRY_INTERVAL).await;
                }
                Err(e) => warn!(error = %e, "Skipping readiness taint removal"),
            }
        });
    }

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller)
        .add_optional_service(node);

    let served = match &config.endpoint {
        Endpoint::Unix(path) => {
            let listener = bind_unix(path).map_err(|source| DriverError::Io {
                endpoint: endpoint.clone(),
                source,
            })?;
            info!(endpoint = %endpoint, "CSI server listening");
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await
        }
        Endpoint::Tcp(addr) => {
            info!(endpoint = %endpoint, "CSI server listening");
            router.serve_with_shutdown(*addr, shutdown).await
        }
    };

    info!("Shutting down");
    if let Some(watchdog) = watchdog {
        watchdog.stop().await;
    }
    let _ = stop_tx.send(true);
    if let Err(e) = reaper_task.await {
        error!(error = %e, "Reaper task failed");
    }

    served?;
    info!("EFS CSI driver shutdown complete");
    Ok(())
}

/// Bind the CSI socket, replacing a stale one left by a previous run.
fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    UnixListener::bind(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_unix_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plugin").join("csi.sock");

        let first = bind_unix(&path).unwrap();
        drop(first);
        assert!(path.exists());

        // The leftover socket file must not prevent a new bind
        let _second = bind_unix(&path).unwrap();
    }
}
