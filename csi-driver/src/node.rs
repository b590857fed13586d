//! CSI Node Service Implementation
//!
//! Publishes access points at pod target paths. The first publish of a
//! target mounts it through the mount helper (or bind-mounts it from another
//! target of the same volume on this node); further publishes of the same
//! volume at the same target only add a reference. The last unpublish
//! unmounts.
//!
//! Publish and unpublish run as their own tasks: if the caller goes away the
//! mount helper still finishes and its result still lands in the mount table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::capability;
use crate::config::VolumeMetricsConfig;
use crate::csi;
use crate::gid::GidAllocator;
use crate::locks::KeyedLocks;
use crate::metrics::OperationTimer;
use crate::mount_table::{GidRef, MountEntry, MountState, MountTable, Release};
use crate::platform::{self, MountRequest, Mounter};
use crate::stats::VolumeStatsCache;
use crate::supervisor::WatchdogStatus;
use crate::types::VolumeId;

/// Volume context keys understood by the node.
pub mod context {
    pub const GID: &str = "gid";
    pub const MOUNT_TARGET_IP: &str = "mounttargetip";
    pub const ENCRYPT_IN_TRANSIT: &str = "encryptInTransit";
    pub const PATH: &str = "path";
}

/// Everything needed to mount one target, validated up front.
#[derive(Debug, Clone)]
struct PublishPlan {
    volume_key: String,
    volume: VolumeId,
    target: PathBuf,
    read_only: bool,
    /// `fsid:/path` for the mount helper
    source: String,
    /// Helper options without the GID
    options: Vec<String>,
    context_gid: Option<u32>,
}

impl PublishPlan {
    fn from_request(req: &csi::NodePublishVolumeRequest) -> Result<Self, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        NodeService::validate_path(&req.target_path)?;

        let volume: VolumeId = req
            .volume_id
            .parse()
            .map_err(|e| Status::invalid_argument(format!("{}", e)))?;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;
        if let Some(reason) = capability::unsupported_reason(capability) {
            return Err(Status::invalid_argument(reason));
        }
        let read_only = req.readonly || capability::is_read_only(capability);

        let ctx = parse_context(&req.volume_context)?;
        let path = ctx
            .path
            .or_else(|| volume.subpath.clone())
            .unwrap_or_else(|| "/".to_string());

        let mut options = capability::mount_flags(capability);
        let mut push = |option: String| {
            if !options.contains(&option) {
                options.push(option);
            }
        };
        if read_only {
            push("ro".to_string());
        }
        if ctx.encrypt_in_transit {
            push("tls".to_string());
        }
        if let Some(ap) = &volume.access_point_id {
            push(format!("accesspoint={}", ap));
        }
        if let Some(ip) = ctx.mount_target_ip {
            push(format!("mounttargetip={}", ip));
        }

        Ok(Self {
            volume_key: req.volume_id.clone(),
            source: format!("{}:{}", volume.file_system_id, path),
            volume,
            target: PathBuf::from(&req.target_path),
            read_only,
            options,
            context_gid: ctx.gid,
        })
    }
}

#[derive(Debug, Default)]
struct VolumeContext {
    gid: Option<u32>,
    mount_target_ip: Option<IpAddr>,
    encrypt_in_transit: bool,
    path: Option<String>,
}

fn parse_context(volume_context: &HashMap<String, String>) -> Result<VolumeContext, Status> {
    let invalid = |key: &str, value: &str| {
        Status::invalid_argument(format!("Invalid volume context {}: '{}'", key, value))
    };

    let mut ctx = VolumeContext {
        encrypt_in_transit: true,
        ..Default::default()
    };

    for (key, value) in volume_context {
        match key.as_str() {
            context::GID => {
                ctx.gid = Some(value.parse().map_err(|_| invalid(key, value))?);
            }
            context::MOUNT_TARGET_IP => {
                ctx.mount_target_ip = Some(value.parse().map_err(|_| invalid(key, value))?);
            }
            context::ENCRYPT_IN_TRANSIT => {
                ctx.encrypt_in_transit = value
                    .to_ascii_lowercase()
                    .parse()
                    .map_err(|_| invalid(key, value))?;
            }
            context::PATH => {
                if !value.starts_with('/') || value.split('/').any(|s| s == "..") {
                    return Err(invalid(key, value));
                }
                ctx.path = Some(value.clone());
            }
            other => debug!(key = %other, "Ignoring volume context key"),
        }
    }

    Ok(ctx)
}

/// State shared by the request handlers and the tasks they spawn.
struct NodeState {
    mounter: Arc<dyn Mounter>,
    gids: Arc<GidAllocator>,
    table: MountTable,
    locks: KeyedLocks<PathBuf>,
    watchdog: Option<watch::Receiver<WatchdogStatus>>,
    stats: Option<Arc<VolumeStatsCache>>,
}

impl NodeState {
    fn watchdog_failing(&self) -> bool {
        self.watchdog
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_failing())
    }

    /// GID for the mount and, when this node must give it back later, the
    /// allocation to release.
    ///
    /// Without a `gid` in the volume context the access point's own GID is
    /// used; a GID is only handed out here for access points that have none.
    async fn resolve_gid(&self, plan: &PublishPlan) -> Result<(Option<u32>, Option<GidRef>), Status> {
        if let Some(gid) = plan.context_gid {
            return Ok((Some(gid), None));
        }
        let Some(access_point_id) = &plan.volume.access_point_id else {
            return Ok((None, None));
        };

        let fs = &plan.volume.file_system_id;
        let allocation = self.gids.access_point_gid(fs, access_point_id).await?;
        let gid_ref = GidRef {
            file_system_id: fs.clone(),
            gid: allocation.gid,
        };
        let track = allocation.fresh || self.table.gid_in_use(&gid_ref);
        Ok((Some(allocation.gid), track.then_some(gid_ref)))
    }

    fn release_gid(&self, gid_ref: Option<GidRef>) {
        let Some(gid_ref) = gid_ref else { return };
        if self.table.gid_in_use(&gid_ref) {
            return;
        }
        match self.gids.release_local(&gid_ref.file_system_id, gid_ref.gid) {
            Ok(true) => debug!(gid = gid_ref.gid, "Released node-local GID"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "GID already released"),
        }
    }

    async fn publish(&self, plan: PublishPlan) -> Result<(), Status> {
        let _guard = self.locks.lock(&plan.target).await;

        if let Some(count) = self.table.acquire(&plan.target, &plan.volume_key, plan.read_only)? {
            info!(
                volume_id = %plan.volume_key,
                target_path = %plan.target.display(),
                count,
                "Volume already published at target"
            );
            return Ok(());
        }

        if self.mounter.is_mounted(&plan.target).await? {
            info!(
                volume_id = %plan.volume_key,
                target_path = %plan.target.display(),
                "Adopting existing mount"
            );
            self.table.adopt(&plan.target, &plan.volume_key, plan.read_only);
            return Ok(());
        }

        if self.watchdog_failing() {
            error!(volume_id = %plan.volume_key, "Refusing to mount: tunnel helper keeps failing");
            return Err(Status::internal(
                "mount tunnel helper is not running; mounts are unavailable",
            ));
        }

        let (gid, gid_ref) = self.resolve_gid(&plan).await?;
        if let Err(e) =
            self.table
                .begin_mount(&plan.target, &plan.volume_key, plan.read_only, gid_ref.clone())
        {
            self.release_gid(gid_ref);
            return Err(e.into());
        }

        match self.mount(&plan, gid).await {
            Ok(()) => {
                self.table.finish_mount(&plan.target);
                info!(
                    volume_id = %plan.volume_key,
                    target_path = %plan.target.display(),
                    gid = ?gid,
                    "Volume published successfully"
                );
                Ok(())
            }
            Err(e) => {
                let entry = self.table.abort_mount(&plan.target);
                self.release_gid(entry.and_then(|entry| entry.gid));
                Err(e)
            }
        }
    }

    async fn mount(&self, plan: &PublishPlan, gid: Option<u32>) -> Result<(), Status> {
        if let Some(source) = self
            .table
            .mounted_source_for(&plan.volume_key, plan.read_only, &plan.target)
        {
            match self
                .mounter
                .bind_mount(&source, &plan.target, plan.read_only)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Bind mount failed, mounting through the helper instead");
                }
            }
        }

        let mut options = plan.options.clone();
        if let Some(gid) = gid {
            options.push(format!("gid={}", gid));
        }
        let request = MountRequest {
            source: plan.source.clone(),
            target: plan.target.clone(),
            options,
        };
        self.mounter.mount(&request).await?;
        Ok(())
    }

    async fn unpublish(&self, volume_id: String, target: PathBuf) -> Result<(), Status> {
        let _guard = self.locks.lock(&target).await;

        match self.table.release(&target)? {
            Release::Remaining(count) => {
                info!(
                    volume_id = %volume_id,
                    target_path = %target.display(),
                    count,
                    "Volume still referenced at target"
                );
                Ok(())
            }
            Release::Last(entry) => match self.mounter.unmount(&target).await {
                Ok(()) => {
                    self.table.finish_unmount(&target);
                    if let Some(stats) = &self.stats {
                        stats.forget(&target);
                    }
                    self.release_gid(entry.gid);
                    info!(
                        volume_id = %volume_id,
                        target_path = %target.display(),
                        "Volume unpublished successfully"
                    );
                    Ok(())
                }
                Err(e) => {
                    self.table.abort_unmount(&target);
                    Err(e.into())
                }
            },
            Release::Untracked => {
                if self.mounter.is_mounted(&target).await? {
                    info!(target_path = %target.display(), "Unmounting untracked target");
                    self.mounter.unmount(&target).await?;
                } else {
                    debug!(target_path = %target.display(), "Target not mounted, nothing to do");
                }
                Ok(())
            }
        }
    }
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume publishing (mount or bind mount at the target path)
/// - Volume unpublishing (drop a reference, unmount on the last one)
/// - Volume usage reporting
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    state: Arc<NodeState>,
}

impl NodeService {
    /// `watchdog` is the tunnel helper's status; mounts are refused while
    /// it reports repeated failures.
    pub fn new(
        node_id: String,
        mounter: Arc<dyn Mounter>,
        gids: Arc<GidAllocator>,
        volume_metrics: &VolumeMetricsConfig,
        watchdog: Option<watch::Receiver<WatchdogStatus>>,
    ) -> Self {
        let stats = volume_metrics
            .opt_in
            .then(|| Arc::new(VolumeStatsCache::new(volume_metrics)));

        Self {
            node_id,
            state: Arc::new(NodeState {
                mounter,
                gids,
                table: MountTable::new(),
                locks: KeyedLocks::new(),
                watchdog,
                stats,
            }),
        }
    }

    /// Mount table entry for a target path.
    pub fn mount_entry(&self, target: &Path) -> Option<MountEntry> {
        self.state.table.get(target)
    }

    /// Validate that a path is safe to hand to mount commands.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow characters that could confuse the mount helper's shell-outs
        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.split('/').any(|segment| segment == "..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    async fn volume_stats(
        &self,
        req: csi::NodeGetVolumeStatsRequest,
    ) -> Result<csi::NodeGetVolumeStatsResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        let path = PathBuf::from(&req.volume_path);
        let tracked = self
            .state
            .table
            .get(&path)
            .is_some_and(|entry| entry.state == MountState::Mounted);
        if !tracked && !self.state.mounter.is_mounted(&path).await? {
            return Err(Status::not_found(format!(
                "Volume {} is not mounted at the requested path",
                req.volume_id
            )));
        }

        let stat_path = path.clone();
        let fs = tokio::task::spawn_blocking(move || platform::statvfs_usage(&stat_path))
            .await
            .map_err(|e| Status::internal(format!("statvfs task failed: {}", e)))?
            .map_err(|e| {
                error!(error = %e, "statvfs failed");
                Status::internal(format!("Failed to read volume usage: {}", e))
            })?;

        let dir = self.state.stats.as_ref().and_then(|stats| {
            let file_system_id = req
                .volume_id
                .parse::<VolumeId>()
                .map(|v| v.file_system_id)
                .unwrap_or_else(|_| req.volume_id.clone());
            stats.usage(&file_system_id, &path)
        });
        let (used_bytes, used_inodes) = match dir {
            Some(dir) => (dir.used_bytes, dir.used_inodes),
            None => (fs.used_bytes, fs.used_inodes),
        };

        use csi::volume_usage::Unit;
        Ok(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: fs.available_bytes,
                    total: fs.total_bytes,
                    used: used_bytes,
                    unit: Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: fs.free_inodes,
                    total: fs.total_inodes,
                    used: used_inodes,
                    unit: Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> Status {
    error!(error = %e, "Node operation task failed");
    Status::internal(format!("Node operation task failed: {}", e))
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    /// Publish a volume at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        let result = match PublishPlan::from_request(&req) {
            Ok(plan) => {
                let state = Arc::clone(&self.state);
                tokio::spawn(async move { state.publish(plan).await })
                    .await
                    .map_err(join_error)
                    .and_then(|r| r)
            }
            Err(e) => Err(e),
        };

        timer.finish(&result);
        result.map(|()| Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("InvalidArgument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            timer.failure("InvalidArgument");
            return Err(Status::invalid_argument("Target path is required"));
        }
        if let Err(e) = Self::validate_path(&req.target_path) {
            timer.failure("InvalidArgument");
            return Err(e);
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let state = Arc::clone(&self.state);
        let target = PathBuf::from(&req.target_path);
        let result = tokio::spawn(async move { state.unpublish(req.volume_id, target).await })
            .await
            .map_err(join_error)
            .and_then(|r| r);

        timer.finish(&result);
        result.map(|()| Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Report usage of a published volume.
    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        debug!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeGetVolumeStats request"
        );
        self.volume_stats(req).await.map(Response::new)
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeExpandVolume is not supported"))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let mut capabilities = Vec::new();
        if self.state.stats.is_some() {
            capabilities.push(csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::GetVolumeStats as i32,
                    },
                )),
            });
        }

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }
}
