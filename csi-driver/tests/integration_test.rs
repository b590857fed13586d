//! Integration tests for efs-csi-driver
//!
//! These tests drive the Controller and Node services through their gRPC
//! traits against the in-memory control plane and a recording mounter, so
//! no real file system or mount helper is required.
//! Tests focus on:
//! - Volume lifecycle from CreateVolume to DeleteVolume
//! - Idempotency of retried requests
//! - Mount reference counting on a node
//! - GID allocation across controller and node
//! - Concurrent operations

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tonic::Request;

use efs_csi_driver::cloud::{AccessPoint, InMemoryCloud, PosixUser};
use efs_csi_driver::config::{DriverConfig, Mode, VolumeMetricsConfig};
use efs_csi_driver::csi;
use efs_csi_driver::csi::controller_server::Controller;
use efs_csi_driver::csi::identity_server::Identity;
use efs_csi_driver::csi::node_server::Node;
use efs_csi_driver::gid::GidAllocator;
use efs_csi_driver::identity::DRIVER_NAME;
use efs_csi_driver::platform::{MountError, MountRequest, Mounter};
use efs_csi_driver::types::VolumeId;
use efs_csi_driver::{ControllerService, IdentityService, NodeService};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Mount(MountRequest),
    Bind { source: PathBuf, target: PathBuf, read_only: bool },
    Unmount(PathBuf),
}

/// Mounter that records calls and tracks what is "mounted".
#[derive(Debug, Default)]
struct RecordingMounter {
    calls: Mutex<Vec<Call>>,
    mounted: Mutex<HashSet<PathBuf>>,
}

impl RecordingMounter {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn helper_mounts(&self) -> Vec<MountRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Mount(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    fn unmounts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Unmount(_)))
            .count()
    }

    fn is_mounted_now(&self, target: &Path) -> bool {
        self.mounted.lock().unwrap().contains(target)
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(Call::Mount(request.clone()));
        self.mounted.lock().unwrap().insert(request.target.clone());
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(Call::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        });
        self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(Call::Unmount(target.to_path_buf()));
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(self.is_mounted_now(target))
    }
}

struct Cluster {
    cloud: Arc<InMemoryCloud>,
    controller_gids: Arc<GidAllocator>,
    mounter: Arc<RecordingMounter>,
    controller: ControllerService,
    node: NodeService,
}

/// Controller and node in one process sharing an allocator, as in `all` mode.
fn cluster() -> Cluster {
    build_cluster(true)
}

/// Controller and node in separate processes, each with its own allocator.
fn split_cluster() -> Cluster {
    build_cluster(false)
}

fn build_cluster(shared_gids: bool) -> Cluster {
    let cloud = Arc::new(InMemoryCloud::new());
    cloud.add_file_system("fs-0123abcd");
    cloud.add_mount_target("fs-0123abcd", "us-east-1a", "10.0.0.5");

    let mounter = Arc::new(RecordingMounter::default());
    let controller_gids = Arc::new(GidAllocator::new(cloud.clone()));
    let node_gids = if shared_gids {
        controller_gids.clone()
    } else {
        Arc::new(GidAllocator::new(cloud.clone()))
    };

    let mut config = DriverConfig::new(Mode::All, "node-1");
    config.tags = HashMap::from([("cluster".to_string(), "test".to_string())]);

    let controller = ControllerService::new(&config, cloud.clone(), controller_gids.clone(), mounter.clone());
    let node = NodeService::new(
        "node-1".to_string(),
        mounter.clone(),
        node_gids,
        &VolumeMetricsConfig::default(),
        None,
    );

    Cluster {
        cloud,
        controller_gids,
        mounter,
        controller,
        node,
    }
}

// ============================================================================
// Request builders
// ============================================================================

fn capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn rw() -> csi::VolumeCapability {
    capability(csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter)
}

fn create_request(name: &str, extra: &[(&str, &str)]) -> csi::CreateVolumeRequest {
    let mut parameters = HashMap::from([
        ("provisioningMode".to_string(), "efs-ap".to_string()),
        ("fileSystemId".to_string(), "fs-0123abcd".to_string()),
        ("directoryPerms".to_string(), "700".to_string()),
        ("gidRangeStart".to_string(), "1000".to_string()),
        ("gidRangeEnd".to_string(), "2000".to_string()),
    ]);
    for (k, v) in extra {
        parameters.insert(k.to_string(), v.to_string());
    }
    csi::CreateVolumeRequest {
        name: name.to_string(),
        volume_capabilities: vec![rw()],
        parameters,
        ..Default::default()
    }
}

fn publish_request(volume: &csi::Volume, target: &str) -> csi::NodePublishVolumeRequest {
    csi::NodePublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        target_path: target.to_string(),
        volume_capability: Some(rw()),
        volume_context: volume.volume_context.clone(),
        ..Default::default()
    }
}

fn unpublish_request(volume_id: &str, target: &str) -> csi::NodeUnpublishVolumeRequest {
    csi::NodeUnpublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target.to_string(),
    }
}

async fn create(cluster: &Cluster, req: csi::CreateVolumeRequest) -> csi::Volume {
    cluster
        .controller
        .create_volume(Request::new(req))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap()
}

async fn delete(cluster: &Cluster, volume_id: &str) {
    cluster
        .controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_volume_lifecycle() {
    let cluster = cluster();
    let volume = create(&cluster, create_request("pvc-lifecycle", &[("az", "us-east-1a")])).await;

    assert_eq!(volume.volume_context.get("gid").map(String::as_str), Some("1000"));
    assert_eq!(
        volume.volume_context.get("mounttargetip").map(String::as_str),
        Some("10.0.0.5")
    );
    let ap = &cluster.cloud.access_points()[0];
    assert_eq!(ap.tags.get("cluster").map(String::as_str), Some("test"));

    let target = "/var/lib/kubelet/pods/a/volumes/pvc-lifecycle/mount";
    cluster
        .node
        .node_publish_volume(Request::new(publish_request(&volume, target)))
        .await
        .unwrap();

    let mounts = cluster.mounter.helper_mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].source, "fs-0123abcd:/");
    assert!(mounts[0].options.contains(&"tls".to_string()));
    assert!(mounts[0].options.contains(&format!("accesspoint={}", ap.access_point_id)));
    assert!(mounts[0].options.contains(&"mounttargetip=10.0.0.5".to_string()));
    assert!(mounts[0].options.contains(&"gid=1000".to_string()));

    cluster
        .node
        .node_unpublish_volume(Request::new(unpublish_request(&volume.volume_id, target)))
        .await
        .unwrap();
    assert!(!cluster.mounter.is_mounted_now(Path::new(target)));

    delete(&cluster, &volume.volume_id).await;
    assert!(cluster.cloud.access_points().is_empty());
    assert_eq!(cluster.controller_gids.allocated("fs-0123abcd"), 0);
}

#[tokio::test]
async fn test_create_volume_retry_returns_same_volume() {
    let cluster = cluster();
    let first = create(&cluster, create_request("pvc-retry", &[])).await;
    let second = create(&cluster, create_request("pvc-retry", &[])).await;

    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(first.volume_context, second.volume_context);
    assert_eq!(cluster.cloud.create_calls(), 1);
}

#[tokio::test]
async fn test_delete_missing_volume_succeeds() {
    let cluster = cluster();
    delete(&cluster, "fs-0123abcd::fsap-0badc0ffee0000000").await;
    delete(&cluster, "fs-0123abcd").await;
    delete(&cluster, "fs-0123abcd:/static/path").await;
}

#[tokio::test]
async fn test_identity() {
    let identity = IdentityService::default();
    let info = identity
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, DRIVER_NAME);

    let probe = identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(probe.ready, Some(true));
}

// ============================================================================
// Node reference counting
// ============================================================================

#[tokio::test]
async fn test_publish_twice_unpublish_twice() {
    let cluster = cluster();
    let volume = create(&cluster, create_request("pvc-shared", &[])).await;
    let target = "/var/lib/kubelet/pods/b/volumes/pvc-shared/mount";

    for _ in 0..2 {
        cluster
            .node
            .node_publish_volume(Request::new(publish_request(&volume, target)))
            .await
            .unwrap();
    }
    assert_eq!(cluster.mounter.helper_mounts().len(), 1);
    assert_eq!(cluster.node.mount_entry(Path::new(target)).unwrap().count, 2);

    cluster
        .node
        .node_unpublish_volume(Request::new(unpublish_request(&volume.volume_id, target)))
        .await
        .unwrap();
    assert_eq!(cluster.mounter.unmounts(), 0);
    assert!(cluster.mounter.is_mounted_now(Path::new(target)));

    cluster
        .node
        .node_unpublish_volume(Request::new(unpublish_request(&volume.volume_id, target)))
        .await
        .unwrap();
    assert_eq!(cluster.mounter.unmounts(), 1);
    assert!(cluster.node.mount_entry(Path::new(target)).is_none());

    // A further unpublish of the now unmounted target is a no-op
    cluster
        .node
        .node_unpublish_volume(Request::new(unpublish_request(&volume.volume_id, target)))
        .await
        .unwrap();
    assert_eq!(cluster.mounter.unmounts(), 1);
}

#[tokio::test]
async fn test_read_only_republish_of_writable_target_is_rejected() {
    let cluster = cluster();
    let volume = create(&cluster, create_request("pvc-ro", &[])).await;
    let target = "/var/lib/kubelet/pods/k/volumes/pvc-ro/mount";

    cluster
        .node
        .node_publish_volume(Request::new(publish_request(&volume, target)))
        .await
        .unwrap();

    let mut req = publish_request(&volume, target);
    req.readonly = true;
    let err = cluster
        .node
        .node_publish_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::AlreadyExists);
    assert_eq!(cluster.node.mount_entry(Path::new(target)).unwrap().count, 1);
}

#[tokio::test]
async fn test_second_target_binds_from_first() {
    let cluster = cluster();
    let volume = create(&cluster, create_request("pvc-bind", &[])).await;
    let first = "/var/lib/kubelet/pods/c/volumes/pvc-bind/mount";
    let second = "/var/lib/kubelet/pods/d/volumes/pvc-bind/mount";

    for target in [first, second] {
        cluster
            .node
            .node_publish_volume(Request::new(publish_request(&volume, target)))
            .await
            .unwrap();
    }

    assert_eq!(cluster.mounter.helper_mounts().len(), 1);
    assert!(cluster.mounter.calls().contains(&Call::Bind {
        source: PathBuf::from(first),
        target: PathBuf::from(second),
        read_only: false,
    }));
}

#[tokio::test]
async fn test_concurrent_publish_same_target() {
    let cluster = Arc::new(cluster());
    let volume = create(&cluster, create_request("pvc-concurrent", &[])).await;
    let target = "/var/lib/kubelet/pods/e/volumes/pvc-concurrent/mount";

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cluster = Arc::clone(&cluster);
        let req = publish_request(&volume, target);
        handles.push(tokio::spawn(async move {
            cluster.node.node_publish_volume(Request::new(req)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(cluster.mounter.helper_mounts().len(), 1);
    assert_eq!(cluster.node.mount_entry(Path::new(target)).unwrap().count, 10);
}

// ============================================================================
// GID allocation
// ============================================================================

#[tokio::test]
async fn test_gids_are_distinct_and_reused_after_delete() {
    let cluster = cluster();
    let a = create(&cluster, create_request("pvc-a", &[])).await;
    let b = create(&cluster, create_request("pvc-b", &[])).await;
    assert_eq!(a.volume_context["gid"], "1000");
    assert_eq!(b.volume_context["gid"], "1001");

    delete(&cluster, &a.volume_id).await;
    let c = create(&cluster, create_request("pvc-c", &[])).await;
    assert_eq!(c.volume_context["gid"], "1000");
}

#[tokio::test]
async fn test_controller_restart_skips_gids_in_use() {
    let cluster = cluster();
    cluster.cloud.insert_access_point(AccessPoint {
        access_point_id: "fsap-0000000000000beef".to_string(),
        file_system_id: "fs-0123abcd".to_string(),
        root_directory: "/pvc-old".to_string(),
        posix_user: Some(PosixUser { uid: 1000, gid: 1000 }),
        permissions: None,
        tags: HashMap::new(),
    });

    let volume = create(&cluster, create_request("pvc-new", &[])).await;
    assert_eq!(volume.volume_context["gid"], "1001");
}

/// Publish with the volume context stripped, as for a statically bound volume.
async fn publish_without_context(cluster: &Cluster, volume: &csi::Volume, target: &str) -> MountRequest {
    let mut req = publish_request(volume, target);
    req.volume_context.clear();
    cluster
        .node
        .node_publish_volume(Request::new(req))
        .await
        .unwrap();
    cluster
        .mounter
        .helper_mounts()
        .into_iter()
        .find(|m| m.target == Path::new(target))
        .expect("helper mount for target")
}

#[tokio::test]
async fn test_node_resolves_gid_without_context() {
    let cluster = cluster();
    let volume = create(&cluster, create_request("pvc-nogid", &[])).await;
    assert_eq!(volume.volume_context["gid"], "1000");

    // The node learns the access point's GID from the control plane
    let mount = publish_without_context(&cluster, &volume, "/var/lib/kubelet/pods/f/volumes/pvc-nogid/mount").await;
    assert!(mount.options.contains(&"gid=1000".to_string()));
}

#[tokio::test]
async fn test_node_uses_gid_of_access_point_created_after_first_publish() {
    let cluster = split_cluster();
    let mut default_range = create_request("pvc-a", &[]);
    default_range.parameters.remove("gidRangeStart");
    default_range.parameters.remove("gidRangeEnd");

    let a = create(&cluster, default_range.clone()).await;
    publish_without_context(&cluster, &a, "/var/lib/kubelet/pods/h/volumes/pvc-a/mount").await;

    // Created once the node has already looked at the file system
    let mut req = default_range.clone();
    req.name = "pvc-b".to_string();
    let b = create(&cluster, req).await;
    let mut req = default_range;
    req.name = "pvc-c".to_string();
    let c = create(&cluster, req).await;
    assert_ne!(b.volume_context["gid"], c.volume_context["gid"]);

    let mount = publish_without_context(&cluster, &c, "/var/lib/kubelet/pods/i/volumes/pvc-c/mount").await;
    let expected = format!("gid={}", c.volume_context["gid"]);
    assert!(mount.options.contains(&expected), "{:?}", mount.options);
}

#[tokio::test]
async fn test_node_uses_fixed_gid_outside_default_range() {
    let cluster = split_cluster();
    let mut req = create_request("pvc-fixed", &[("gid", "4242")]);
    req.parameters.remove("gidRangeStart");
    req.parameters.remove("gidRangeEnd");
    let volume = create(&cluster, req).await;
    assert_eq!(volume.volume_context["gid"], "4242");

    let mount = publish_without_context(&cluster, &volume, "/var/lib/kubelet/pods/j/volumes/pvc-fixed/mount").await;
    assert!(mount.options.contains(&"gid=4242".to_string()), "{:?}", mount.options);
    assert!(!mount.options.iter().any(|o| o.starts_with("gid=5")));
}

#[tokio::test]
async fn test_static_volume_publish() {
    let cluster = cluster();
    let target = "/var/lib/kubelet/pods/g/volumes/static/mount";
    let volume = csi::Volume {
        volume_id: "fs-0123abcd:/exports/data".to_string(),
        ..Default::default()
    };

    cluster
        .node
        .node_publish_volume(Request::new(publish_request(&volume, target)))
        .await
        .unwrap();

    let mounts = cluster.mounter.helper_mounts();
    assert_eq!(mounts[0].source, "fs-0123abcd:/exports/data");
    assert!(!mounts[0].options.iter().any(|o| o.starts_with("gid=")));
    assert!(!mounts[0].options.iter().any(|o| o.starts_with("accesspoint=")));

    let id: VolumeId = volume.volume_id.parse().unwrap();
    assert_eq!(id.subpath.as_deref(), Some("/exports/data"));
}
