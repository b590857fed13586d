//! CSI Controller Service Implementation
//!
//! Provisions volumes as access points on an existing file system. The
//! volume name is stored as a tag on the access point and doubles as the
//! creation token, so a retried CreateVolume finds or re-returns the access
//! point it created the first time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::capability;
use crate::cloud::{AccessPoint, Cloud, CloudError, CreateAccessPointInput, PosixUser};
use crate::config::DriverConfig;
use crate::csi;
use crate::gid::{GidAllocator, GidError};
use crate::locks::KeyedLocks;
use crate::metrics::OperationTimer;
use crate::node::context;
use crate::platform::{MountRequest, Mounter};
use crate::types::{AccessPointParams, Ownership, VolumeId};

/// Tag holding the CSI volume name on every access point the driver creates.
pub const VOLUME_NAME_TAG: &str = "efs.csi.aws.com/volume-name";

/// Capacity reported for volumes. The file system grows on demand, so there
/// is no meaningful upper bound.
pub const UNBOUNDED_CAPACITY_BYTES: i64 = i64::MAX;

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation and deletion (access points)
/// - Volume expansion (validation only)
/// - Capability validation and reporting
pub struct ControllerService {
    cloud: Arc<dyn Cloud>,
    gids: Arc<GidAllocator>,
    /// Used to mount file systems when deleting access point root directories
    mounter: Arc<dyn Mounter>,
    /// Serializes CreateVolume per name and DeleteVolume per volume ID
    locks: KeyedLocks<String>,
    tags: HashMap<String, String>,
    delete_access_point_root_dir: bool,
    root_dir_mount_base: PathBuf,
}

impl ControllerService {
    pub fn new(
        config: &DriverConfig,
        cloud: Arc<dyn Cloud>,
        gids: Arc<GidAllocator>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            cloud,
            gids,
            mounter,
            locks: KeyedLocks::new(),
            tags: config.tags.clone(),
            delete_access_point_root_dir: config.delete_access_point_root_dir,
            root_dir_mount_base: config.root_dir_mount_base.clone(),
        }
    }

    fn parse_volume_id(volume_id: &str) -> Result<VolumeId, Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        volume_id
            .parse()
            .map_err(|e| Status::not_found(format!("{}", e)))
    }

    /// NotFound unless the volume's access point (or file system) exists.
    async fn ensure_exists(&self, volume: &VolumeId) -> Result<(), Status> {
        match &volume.access_point_id {
            Some(ap) => self.cloud.describe_access_point(ap).await.map(|_| ()),
            None => self
                .cloud
                .describe_file_system(&volume.file_system_id)
                .await
                .map(|_| ()),
        }
        .map_err(Status::from)
    }

    /// Access point previously created for `name`, if any.
    async fn find_access_point(
        &self,
        file_system_id: &str,
        name: &str,
    ) -> Result<Option<AccessPoint>, Status> {
        let access_points = self.cloud.list_access_points(file_system_id).await?;
        Ok(access_points
            .into_iter()
            .find(|ap| ap.tags.get(VOLUME_NAME_TAG).map(String::as_str) == Some(name)))
    }

    /// Why an existing access point does not match the request, if it does not.
    fn mismatch(params: &AccessPointParams, root_directory: &str, ap: &AccessPoint) -> Option<String> {
        if ap.root_directory != root_directory {
            return Some(format!(
                "root directory {} differs from requested {}",
                ap.root_directory, root_directory
            ));
        }
        if ap.permissions != Some(params.directory_perms) {
            return Some("directory permissions differ".to_string());
        }
        match (params.ownership, ap.posix_user) {
            (Ownership::Fixed { uid, gid }, Some(user)) if user == PosixUser { uid, gid } => None,
            (Ownership::Allocated(range), Some(user)) if range.contains(user.gid) => None,
            _ => Some("owner differs".to_string()),
        }
    }

    async fn create(&self, req: csi::CreateVolumeRequest) -> Result<csi::Volume, Status> {
        let name = &req.name;
        if name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }
        if let Some(reason) = req
            .volume_capabilities
            .iter()
            .find_map(capability::unsupported_reason)
        {
            return Err(Status::invalid_argument(reason));
        }

        let params = AccessPointParams::parse(&req.parameters)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let fs = &params.file_system_id;
        let root_directory = params.root_directory(name);

        let _guard = self.locks.lock(name).await;

        self.cloud
            .describe_file_system(fs)
            .await
            .map_err(|e| match e {
                CloudError::FileSystemNotFound(_) => Status::invalid_argument(e.to_string()),
                other => Status::from(other),
            })?;

        let access_point = match self.find_access_point(fs, name).await? {
            Some(ap) => {
                if let Some(reason) = Self::mismatch(&params, &root_directory, &ap) {
                    warn!(name = %name, access_point_id = %ap.access_point_id, reason = %reason, "Volume exists with different parameters");
                    return Err(Status::already_exists(format!(
                        "Volume {} already exists with different parameters: {}",
                        name, reason
                    )));
                }
                info!(name = %name, access_point_id = %ap.access_point_id, "Access point already exists");
                ap
            }
            None => self.create_access_point(name, &params, root_directory).await?,
        };

        let gid = access_point
            .posix_user
            .map(|user| user.gid)
            .ok_or_else(|| Status::internal("access point has no POSIX user"))?;

        let mut volume_context = HashMap::from([(context::GID.to_string(), gid.to_string())]);
        if let Some(az) = &params.availability_zone {
            let targets = self.cloud.describe_mount_targets(fs, Some(az)).await?;
            match targets.first() {
                Some(target) => {
                    volume_context.insert(
                        context::MOUNT_TARGET_IP.to_string(),
                        target.ip_address.clone(),
                    );
                }
                None => warn!(file_system_id = %fs, az = %az, "No mount target in availability zone"),
            }
        }

        Ok(csi::Volume {
            capacity_bytes: req
                .capacity_range
                .map(|range| range.required_bytes)
                .unwrap_or_default(),
            volume_id: VolumeId::for_access_point(fs.clone(), access_point.access_point_id).to_string(),
            volume_context,
            ..Default::default()
        })
    }

    async fn create_access_point(
        &self,
        name: &str,
        params: &AccessPointParams,
        root_directory: String,
    ) -> Result<AccessPoint, Status> {
        let fs = &params.file_system_id;
        let (posix_user, allocation) = match params.ownership {
            Ownership::Fixed { uid, gid } => (PosixUser { uid, gid }, None),
            Ownership::Allocated(range) => {
                let allocation = self.gids.allocate(fs, Some(range), name).await?;
                let user = PosixUser {
                    uid: allocation.gid,
                    gid: allocation.gid,
                };
                (user, Some(allocation))
            }
        };

        let mut tags = self.tags.clone();
        tags.insert(VOLUME_NAME_TAG.to_string(), name.to_string());

        debug!(
            name = %name,
            file_system_id = %fs,
            root_directory = %root_directory,
            gid = posix_user.gid,
            "Creating access point"
        );

        let input = CreateAccessPointInput {
            client_token: name.to_string(),
            file_system_id: fs.clone(),
            root_directory,
            posix_user,
            permissions: params.directory_perms,
            tags,
        };

        match self.cloud.create_access_point(input).await {
            Ok(ap) => {
                if let Some(allocation) = allocation
                    && let Err(e) = self.gids.transfer(fs, allocation.gid, &ap.access_point_id)
                {
                    warn!(error = %e, "Failed to record GID owner");
                }
                info!(
                    name = %name,
                    access_point_id = %ap.access_point_id,
                    gid = posix_user.gid,
                    "Access point created"
                );
                Ok(ap)
            }
            Err(e) => {
                error!(name = %name, error = %e, "Failed to create access point");
                if let Some(allocation) = allocation.filter(|a| a.fresh)
                    && let Err(release) = self.gids.release(fs, allocation.gid)
                {
                    warn!(error = %release, "Failed to release GID after failed create");
                }
                Err(e.into())
            }
        }
    }

    async fn delete(&self, volume_id: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let volume: VolumeId = match volume_id.parse() {
            Ok(volume) => volume,
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "Malformed volume ID, nothing to delete");
                return Ok(());
            }
        };
        let Some(access_point_id) = &volume.access_point_id else {
            info!(volume_id = %volume_id, "Volume has no access point, nothing to delete");
            return Ok(());
        };

        let _guard = self.locks.lock(&volume_id.to_string()).await;

        let access_point = match self.cloud.describe_access_point(access_point_id).await {
            Ok(ap) => ap,
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %volume_id, "Access point not found, treating as already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if self.delete_access_point_root_dir {
            self.delete_root_dir(&access_point).await?;
        }

        match self.cloud.delete_access_point(access_point_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %volume_id, "Access point vanished during delete");
            }
            Err(e) => {
                error!(volume_id = %volume_id, error = %e, "Failed to delete access point");
                return Err(e.into());
            }
        }

        if let Some(user) = access_point.posix_user {
            match self.gids.release(&volume.file_system_id, user.gid) {
                Ok(()) => {}
                Err(GidError::NotAllocated { .. }) => {
                    debug!(gid = user.gid, "GID was not tracked by this controller");
                }
                Err(e) => warn!(error = %e, "Failed to release GID"),
            }
        }

        info!(volume_id = %volume_id, "Volume deleted successfully");
        Ok(())
    }

    /// Remove the access point's root directory through a temporary mount of
    /// the whole file system.
    async fn delete_root_dir(&self, ap: &AccessPoint) -> Result<(), Status> {
        let relative = ap.root_directory.trim_matches('/');
        if relative.is_empty() || relative.split('/').any(|s| s == "..") {
            warn!(
                access_point_id = %ap.access_point_id,
                root_directory = %ap.root_directory,
                "Refusing to delete access point root directory"
            );
            return Ok(());
        }

        let target = self.root_dir_mount_base.join(&ap.access_point_id);
        let request = MountRequest {
            source: format!("{}:/", ap.file_system_id),
            target: target.clone(),
            options: vec!["tls".to_string(), "iam".to_string()],
        };
        self.mounter.mount(&request).await?;

        let dir = target.join(relative);
        let removed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(access_point_id = %ap.access_point_id, error = %e, "Failed to delete root directory");
                Err(Status::internal(format!(
                    "Failed to delete root directory of access point {}: {}",
                    ap.access_point_id, e
                )))
            }
        };

        self.mounter.unmount(&target).await?;
        removed?;

        info!(
            access_point_id = %ap.access_point_id,
            root_directory = %ap.root_directory,
            "Deleted access point root directory"
        );
        Ok(())
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a volume backed by an access point.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();

        info!(name = %req.name, "CreateVolume request");

        let result = self.create(req).await;
        timer.finish(&result);

        let volume = result?;
        info!(volume_id = %volume.volume_id, "Volume created successfully");
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume),
        }))
    }

    /// Delete a volume's access point.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();

        info!(volume_id = %req.volume_id, "DeleteVolume request");

        let result = self.delete(&req.volume_id).await;
        timer.finish(&result);
        result.map(|()| Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Expand a volume. The file system is elastic, so this only checks
    /// that the volume exists.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let req = request.into_inner();

        info!(volume_id = %req.volume_id, "ControllerExpandVolume request");

        let result = match Self::parse_volume_id(&req.volume_id) {
            Ok(volume) => self.ensure_exists(&volume).await,
            Err(e) => Err(e),
        };
        timer.finish(&result);
        result?;

        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: UNBOUNDED_CAPACITY_BYTES,
            node_expansion_required: false,
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [Type::CreateDeleteVolume, Type::ExpandVolume]
            .into_iter()
            .map(|t| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    /// Validate volume capabilities.
    ///
    /// Returns "confirmed" only if ALL requested capabilities are supported:
    /// mount access in any single-node or multi-node mode except
    /// SINGLE_NODE_SINGLE_WRITER / SINGLE_NODE_MULTI_WRITER.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume = Self::parse_volume_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        self.ensure_exists(&volume).await?;

        let unsupported_reasons: Vec<String> = req
            .volume_capabilities
            .iter()
            .filter_map(capability::unsupported_reason)
            .collect();

        if !unsupported_reasons.is_empty() {
            let message = unsupported_reasons.join("; ");
            warn!(volume_id = %req.volume_id, message = %message, "Volume capabilities not supported");
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerGetVolume is not supported",
        ))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}
