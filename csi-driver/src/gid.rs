//! POSIX GID allocation per file system.
//!
//! Every access point gets a private GID so that tenants sharing one remote
//! file system cannot read each other's files. Allocations live only in
//! memory: the first request for a file system scans its existing access
//! points and marks their GIDs as taken before anything is handed out.
//!
//! Each file system has its own pool behind its own lock, so allocations for
//! different file systems never contend. The remote scan runs outside the
//! pool lock; concurrent first requests wait on the same scan.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::cloud::{AccessPoint, Cloud, CloudError};
use crate::metrics;
use crate::types::GidRange;

#[derive(Debug, thiserror::Error)]
pub enum GidError {
    #[error("no free GID left in range {range} for file system {file_system_id}")]
    Exhausted {
        file_system_id: String,
        range: GidRange,
    },

    #[error("GID {gid} is not allocated on file system {file_system_id}")]
    NotAllocated { file_system_id: String, gid: u32 },

    #[error(
        "file system {file_system_id} already uses GID range {existing}, cannot switch to {requested}"
    )]
    RangeMismatch {
        file_system_id: String,
        existing: GidRange,
        requested: GidRange,
    },

    #[error("failed to scan existing access points: {0}")]
    Reconcile(#[source] CloudError),

    #[error("failed to look up access point {access_point_id}: {source}")]
    Lookup {
        access_point_id: String,
        #[source]
        source: CloudError,
    },

    #[error("access point {access_point_id} does not belong to file system {file_system_id}")]
    ForeignAccessPoint {
        access_point_id: String,
        file_system_id: String,
    },
}

impl From<GidError> for Status {
    fn from(err: GidError) -> Self {
        let message = err.to_string();
        match err {
            GidError::Exhausted { .. } => Status::resource_exhausted(message),
            GidError::NotAllocated { .. } => Status::failed_precondition(message),
            GidError::RangeMismatch { .. } | GidError::ForeignAccessPoint { .. } => {
                Status::invalid_argument(message)
            }
            GidError::Reconcile(e) | GidError::Lookup { source: e, .. } => {
                let status = Status::from(e);
                Status::new(status.code(), message)
            }
        }
    }
}

/// Result of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub gid: u32,
    /// False when the owner already held this GID before the call
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Found on an access point during the startup scan
    Remote,
    /// Handed out by this process
    Local,
}

#[derive(Debug)]
struct Holder {
    owner: String,
    origin: Origin,
}

#[derive(Debug, Default)]
struct Allocations {
    by_gid: BTreeMap<u32, Holder>,
    by_owner: HashMap<String, u32>,
}

impl Allocations {
    fn insert(&mut self, gid: u32, owner: String, origin: Origin) {
        self.by_owner.insert(owner.clone(), gid);
        self.by_gid.insert(gid, Holder { owner, origin });
    }

    fn remove(&mut self, gid: u32) -> Option<Holder> {
        let holder = self.by_gid.remove(&gid)?;
        if self.by_owner.get(&holder.owner) == Some(&gid) {
            self.by_owner.remove(&holder.owner);
        }
        Some(holder)
    }

    /// Record the GID an existing access point uses. GIDs outside `range`
    /// can never be handed out, so they are not tracked.
    fn record_remote(
        &mut self,
        file_system_id: &str,
        range: GidRange,
        access_point_id: String,
        gid: u32,
    ) -> bool {
        if !range.contains(gid) {
            return false;
        }
        if let Some(holder) = self.by_gid.get(&gid) {
            if holder.owner != access_point_id {
                warn!(
                    file_system_id,
                    gid,
                    access_point_id = %access_point_id,
                    other = %holder.owner,
                    "GID shared by several access points"
                );
            }
            return false;
        }
        self.insert(gid, access_point_id, Origin::Remote);
        true
    }

    /// Lowest GID in `range` not currently allocated.
    fn lowest_free(&self, range: GidRange) -> Option<u32> {
        let mut candidate = range.start();
        for &gid in self.by_gid.range(range.start()..=range.end()).map(|(gid, _)| gid) {
            if gid != candidate {
                break;
            }
            if candidate == range.end() {
                return None;
            }
            candidate += 1;
        }
        Some(candidate)
    }
}

#[derive(Debug)]
struct Pool {
    range: GidRange,
    scanned: OnceCell<()>,
    allocations: Mutex<Allocations>,
}

impl Pool {
    fn allocations(&self) -> MutexGuard<'_, Allocations> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Allocator of per-file-system GIDs.
pub struct GidAllocator {
    cloud: Arc<dyn Cloud>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl GidAllocator {
    pub fn new(cloud: Arc<dyn Cloud>) -> Self {
        Self {
            cloud,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Arc<Pool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool for a file system, created with `range` (or the default) on first use.
    fn pool(&self, file_system_id: &str, range: Option<GidRange>) -> Result<Arc<Pool>, GidError> {
        let mut pools = self.pools();
        if let Some(pool) = pools.get(file_system_id) {
            return match range {
                Some(requested) if requested != pool.range => Err(GidError::RangeMismatch {
                    file_system_id: file_system_id.to_string(),
                    existing: pool.range,
                    requested,
                }),
                _ => Ok(pool.clone()),
            };
        }

        let range = range.unwrap_or_default();
        info!(file_system_id, %range, "Creating GID pool");
        let pool = Arc::new(Pool {
            range,
            scanned: OnceCell::new(),
            allocations: Mutex::new(Allocations::default()),
        });
        pools.insert(file_system_id.to_string(), pool.clone());
        Ok(pool)
    }

    /// Mark every GID already used by an access point of the file system.
    async fn reconcile(&self, file_system_id: &str, pool: &Pool) -> Result<(), GidError> {
        pool.scanned
            .get_or_try_init(|| async {
                let access_points = self
                    .cloud
                    .list_access_points(file_system_id)
                    .await
                    .map_err(GidError::Reconcile)?;

                let recovered = Self::record_scan(file_system_id, pool, access_points);
                info!(file_system_id, recovered, "Reconciled GID allocations");
                Ok::<(), GidError>(())
            })
            .await
            .map(|_| ())
    }

    fn record_scan(file_system_id: &str, pool: &Pool, access_points: Vec<AccessPoint>) -> usize {
        let mut allocations = pool.allocations();
        let mut recovered = 0usize;
        for ap in access_points {
            let Some(user) = ap.posix_user else { continue };
            if allocations.record_remote(file_system_id, pool.range, ap.access_point_id, user.gid) {
                recovered += 1;
            }
        }
        metrics::set_allocated_gids(file_system_id, allocations.by_gid.len());
        recovered
    }

    /// GID an existing access point runs with.
    ///
    /// The GID recorded for the access point wins, then the one the control
    /// plane reports for it. Looking up a GID does not create a pool, so it
    /// never fixes a file system's range. Only an access point without a
    /// POSIX user gets a GID handed out, and only after a fresh scan of the
    /// file system so that access points created since the last scan count.
    pub async fn access_point_gid(
        &self,
        file_system_id: &str,
        access_point_id: &str,
    ) -> Result<Allocation, GidError> {
        let existing = self.pools().get(file_system_id).cloned();
        if let Some(pool) = &existing {
            let known = pool.allocations().by_owner.get(access_point_id).copied();
            if let Some(gid) = known {
                return Ok(Allocation { gid, fresh: false });
            }
        }

        let ap = self
            .cloud
            .describe_access_point(access_point_id)
            .await
            .map_err(|source| GidError::Lookup {
                access_point_id: access_point_id.to_string(),
                source,
            })?;
        if ap.file_system_id != file_system_id {
            return Err(GidError::ForeignAccessPoint {
                access_point_id: access_point_id.to_string(),
                file_system_id: file_system_id.to_string(),
            });
        }

        if let Some(user) = ap.posix_user {
            if let Some(pool) = &existing {
                let mut allocations = pool.allocations();
                if allocations.record_remote(file_system_id, pool.range, ap.access_point_id, user.gid) {
                    metrics::set_allocated_gids(file_system_id, allocations.by_gid.len());
                }
            }
            debug!(file_system_id, access_point_id, gid = user.gid, "Using access point GID");
            return Ok(Allocation {
                gid: user.gid,
                fresh: false,
            });
        }

        let pool = self.pool(file_system_id, None)?;
        let scanned_before = pool.scanned.initialized();
        self.reconcile(file_system_id, &pool).await?;
        if scanned_before {
            let access_points = self
                .cloud
                .list_access_points(file_system_id)
                .await
                .map_err(GidError::Reconcile)?;
            let recovered = Self::record_scan(file_system_id, &pool, access_points);
            debug!(file_system_id, recovered, "Rescanned access points");
        }
        self.allocate(file_system_id, None, access_point_id).await
    }

    /// Allocate a GID on `file_system_id` for `owner`.
    ///
    /// Returns the owner's existing GID when it already holds one, otherwise
    /// the lowest free GID in the pool's range. `range` fixes the pool's range
    /// on first use; `None` accepts whatever range the pool already has.
    pub async fn allocate(
        &self,
        file_system_id: &str,
        range: Option<GidRange>,
        owner: &str,
    ) -> Result<Allocation, GidError> {
        let pool = self.pool(file_system_id, range)?;
        self.reconcile(file_system_id, &pool).await?;

        let mut allocations = pool.allocations();
        if let Some(&gid) = allocations.by_owner.get(owner) {
            debug!(file_system_id, owner, gid, "Owner already holds a GID");
            return Ok(Allocation { gid, fresh: false });
        }

        let gid = allocations
            .lowest_free(pool.range)
            .ok_or_else(|| GidError::Exhausted {
                file_system_id: file_system_id.to_string(),
                range: pool.range,
            })?;
        allocations.insert(gid, owner.to_string(), Origin::Local);
        metrics::set_allocated_gids(file_system_id, allocations.by_gid.len());

        debug!(file_system_id, owner, gid, "Allocated GID");
        Ok(Allocation { gid, fresh: true })
    }

    /// Return `gid` to the free set of `file_system_id`.
    pub fn release(&self, file_system_id: &str, gid: u32) -> Result<(), GidError> {
        let not_allocated = || GidError::NotAllocated {
            file_system_id: file_system_id.to_string(),
            gid,
        };

        let pool = self.pools().get(file_system_id).cloned().ok_or_else(not_allocated)?;
        let mut allocations = pool.allocations();
        let holder = allocations.remove(gid).ok_or_else(not_allocated)?;
        metrics::set_allocated_gids(file_system_id, allocations.by_gid.len());

        debug!(file_system_id, gid, owner = %holder.owner, "Released GID");
        Ok(())
    }

    /// Release `gid` only if this process handed it out.
    ///
    /// GIDs learned from existing access points stay taken: the access point
    /// still exists remotely even when no local mount uses it.
    pub fn release_local(&self, file_system_id: &str, gid: u32) -> Result<bool, GidError> {
        let pool = self
            .pools()
            .get(file_system_id)
            .cloned()
            .ok_or_else(|| GidError::NotAllocated {
                file_system_id: file_system_id.to_string(),
                gid,
            })?;

        let mut allocations = pool.allocations();
        match allocations.by_gid.get(&gid).map(|holder| holder.origin) {
            Some(Origin::Local) => {
                allocations.remove(gid);
                metrics::set_allocated_gids(file_system_id, allocations.by_gid.len());
                Ok(true)
            }
            Some(Origin::Remote) => Ok(false),
            None => Err(GidError::NotAllocated {
                file_system_id: file_system_id.to_string(),
                gid,
            }),
        }
    }

    /// Move an allocation to a new owner, e.g. from a volume name to the
    /// access point created for it.
    pub fn transfer(&self, file_system_id: &str, gid: u32, new_owner: &str) -> Result<(), GidError> {
        let not_allocated = || GidError::NotAllocated {
            file_system_id: file_system_id.to_string(),
            gid,
        };

        let pool = self.pools().get(file_system_id).cloned().ok_or_else(not_allocated)?;
        let mut allocations = pool.allocations();
        let holder = allocations.remove(gid).ok_or_else(not_allocated)?;
        allocations.insert(gid, new_owner.to_string(), holder.origin);
        Ok(())
    }

    /// Number of GIDs currently allocated on a file system.
    pub fn allocated(&self, file_system_id: &str) -> usize {
        self.pools()
            .get(file_system_id)
            .map(|pool| pool.allocations().by_gid.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{AccessPoint, InMemoryCloud, PosixUser};
    use std::collections::HashSet;

    fn allocator() -> (Arc<InMemoryCloud>, GidAllocator) {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_file_system("fs-1");
        cloud.add_file_system("fs-2");
        let allocator = GidAllocator::new(cloud.clone());
        (cloud, allocator)
    }

    fn existing_ap(id: &str, fs: &str, gid: u32) -> AccessPoint {
        AccessPoint {
            access_point_id: id.to_string(),
            file_system_id: fs.to_string(),
            root_directory: format!("/{}", id),
            posix_user: Some(PosixUser { uid: gid, gid }),
            permissions: None,
            tags: HashMap::new(),
        }
    }

    fn range(start: u32, end: u32) -> Option<GidRange> {
        Some(GidRange::new(start, end).unwrap())
    }

    #[tokio::test]
    async fn test_sequential_allocation_and_reuse() {
        let (_cloud, gids) = allocator();
        let r = range(1000, 1010);

        let a = gids.allocate("fs-1", r, "ap-a").await.unwrap();
        let b = gids.allocate("fs-1", r, "ap-b").await.unwrap();
        let c = gids.allocate("fs-1", r, "ap-c").await.unwrap();
        assert_eq!((a.gid, b.gid, c.gid), (1000, 1001, 1002));
        assert!(a.fresh && b.fresh && c.fresh);

        gids.release("fs-1", a.gid).unwrap();
        let d = gids.allocate("fs-1", r, "ap-d").await.unwrap();
        assert_eq!(d.gid, 1000);
    }

    #[tokio::test]
    async fn test_same_owner_gets_same_gid() {
        let (_cloud, gids) = allocator();

        let first = gids.allocate("fs-1", None, "ap-a").await.unwrap();
        let second = gids.allocate("fs-1", None, "ap-a").await.unwrap();

        assert_eq!(first.gid, second.gid);
        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(gids.allocated("fs-1"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let (_cloud, gids) = allocator();
        let r = range(5, 6);

        gids.allocate("fs-1", r, "a").await.unwrap();
        gids.allocate("fs-1", r, "b").await.unwrap();
        let err = gids.allocate("fs-1", r, "c").await.unwrap_err();

        assert!(matches!(err, GidError::Exhausted { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_release_not_allocated() {
        let (_cloud, gids) = allocator();

        assert!(matches!(
            gids.release("fs-unknown", 1),
            Err(GidError::NotAllocated { .. })
        ));

        let a = gids.allocate("fs-1", None, "a").await.unwrap();
        gids.release("fs-1", a.gid).unwrap();
        assert!(matches!(
            gids.release("fs-1", a.gid),
            Err(GidError::NotAllocated { .. })
        ));
    }

    #[tokio::test]
    async fn test_range_is_fixed_by_first_allocation() {
        let (_cloud, gids) = allocator();

        gids.allocate("fs-1", range(100, 200), "a").await.unwrap();
        let err = gids.allocate("fs-1", range(300, 400), "b").await.unwrap_err();
        assert!(matches!(err, GidError::RangeMismatch { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);

        // Unspecified range follows the pool
        let b = gids.allocate("fs-1", None, "b").await.unwrap();
        assert_eq!(b.gid, 101);

        // Other file systems are independent, even with the same bounds
        let other = gids.allocate("fs-2", range(100, 200), "a").await.unwrap();
        assert_eq!(other.gid, 100);
    }

    #[tokio::test]
    async fn test_reconcile_skips_gids_in_use() {
        let (cloud, gids) = allocator();
        cloud.insert_access_point(existing_ap("fsap-1", "fs-1", 1000));
        cloud.insert_access_point(existing_ap("fsap-2", "fs-1", 1002));
        cloud.insert_access_point(existing_ap("fsap-3", "fs-1", 9999));
        cloud.insert_access_point(existing_ap("fsap-4", "fs-2", 1001));

        let r = range(1000, 1010);
        let a = gids.allocate("fs-1", r, "new-a").await.unwrap();
        let b = gids.allocate("fs-1", r, "new-b").await.unwrap();
        assert_eq!((a.gid, b.gid), (1001, 1003));

        // The scanned access point keeps its GID
        let existing = gids.allocate("fs-1", r, "fsap-2").await.unwrap();
        assert_eq!(existing, Allocation { gid: 1002, fresh: false });
    }

    #[tokio::test]
    async fn test_reconcile_failure_is_retried() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gids = GidAllocator::new(cloud.clone());

        let err = gids.allocate("fs-late", None, "a").await.unwrap_err();
        assert!(matches!(err, GidError::Reconcile(CloudError::FileSystemNotFound(_))));
        assert_eq!(Status::from(err).code(), tonic::Code::NotFound);

        cloud.add_file_system("fs-late");
        assert!(gids.allocate("fs-late", None, "a").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_local_keeps_remote_allocations() {
        let (cloud, gids) = allocator();
        cloud.insert_access_point(existing_ap("fsap-1", "fs-1", 50000));

        let remote = gids.allocate("fs-1", None, "fsap-1").await.unwrap();
        assert_eq!(remote.gid, 50000);
        assert!(!gids.release_local("fs-1", remote.gid).unwrap());
        assert_eq!(gids.allocated("fs-1"), 1);

        let local = gids.allocate("fs-1", None, "fsap-2").await.unwrap();
        assert!(gids.release_local("fs-1", local.gid).unwrap());
        assert_eq!(gids.allocated("fs-1"), 1);
    }

    #[tokio::test]
    async fn test_transfer_changes_owner() {
        let (_cloud, gids) = allocator();

        let a = gids.allocate("fs-1", None, "pvc-a").await.unwrap();
        gids.transfer("fs-1", a.gid, "fsap-a").unwrap();

        let again = gids.allocate("fs-1", None, "fsap-a").await.unwrap();
        assert_eq!(again, Allocation { gid: a.gid, fresh: false });
        let fresh = gids.allocate("fs-1", None, "pvc-a").await.unwrap();
        assert_ne!(fresh.gid, a.gid);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let (_cloud, gids) = allocator();
        let gids = Arc::new(gids);
        let r = range(2000, 2063);

        let mut handles = Vec::new();
        for i in 0..64 {
            let gids = gids.clone();
            handles.push(tokio::spawn(async move {
                gids.allocate("fs-1", r, &format!("ap-{}", i)).await.unwrap().gid
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let gid = handle.await.unwrap();
            assert!((2000..=2063).contains(&gid));
            assert!(seen.insert(gid), "GID {} handed out twice", gid);
        }

        assert!(matches!(
            gids.allocate("fs-1", r, "one-too-many").await,
            Err(GidError::Exhausted { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocate_and_release_stay_unique() {
        let (_cloud, gids) = allocator();
        let gids = Arc::new(gids);
        let r = range(3000, 3015);
        let holders = Arc::new(Mutex::new(HashMap::<u32, String>::new()));

        let mut handles = Vec::new();
        for task in 0..16 {
            let gids = gids.clone();
            let holders = holders.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..50 {
                    let owner = format!("ap-{}-{}", task, round);
                    let gid = gids.allocate("fs-1", r, &owner).await.unwrap().gid;
                    assert!((3000..=3015).contains(&gid));
                    {
                        let mut holders = holders.lock().unwrap();
                        if let Some(other) = holders.insert(gid, owner.clone()) {
                            panic!("GID {} handed to {} while {} holds it", gid, owner, other);
                        }
                    }
                    tokio::task::yield_now().await;
                    holders.lock().unwrap().remove(&gid);
                    gids.release("fs-1", gid).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(gids.allocated("fs-1"), 0);
    }

    // ========================================================================
    // Access point lookup
    // ========================================================================

    #[tokio::test]
    async fn test_access_point_gid_created_after_scan() {
        let (cloud, gids) = allocator();
        let first = gids.allocate("fs-1", None, "fsap-first").await.unwrap();
        assert_eq!(first.gid, 50000);

        // Created elsewhere once the pool has already been scanned
        cloud.insert_access_point(existing_ap("fsap-late", "fs-1", 50001));
        let late = gids.access_point_gid("fs-1", "fsap-late").await.unwrap();
        assert_eq!(late, Allocation { gid: 50001, fresh: false });

        // And it is no longer free for anyone else
        let next = gids.allocate("fs-1", None, "fsap-next").await.unwrap();
        assert_eq!(next.gid, 50002);
    }

    #[tokio::test]
    async fn test_access_point_gid_outside_pool_range() {
        let (cloud, gids) = allocator();
        cloud.insert_access_point(existing_ap("fsap-fixed", "fs-1", 1000));

        let fixed = gids.access_point_gid("fs-1", "fsap-fixed").await.unwrap();
        assert_eq!(fixed, Allocation { gid: 1000, fresh: false });
        assert_eq!(gids.allocated("fs-1"), 0);
    }

    #[tokio::test]
    async fn test_access_point_without_owner_rescans_before_allocating() {
        let (cloud, gids) = allocator();
        gids.allocate("fs-1", None, "fsap-first").await.unwrap();

        cloud.insert_access_point(existing_ap("fsap-late", "fs-1", 50001));
        let mut anonymous = existing_ap("fsap-anon", "fs-1", 0);
        anonymous.posix_user = None;
        cloud.insert_access_point(anonymous);

        let anon = gids.access_point_gid("fs-1", "fsap-anon").await.unwrap();
        assert_eq!(anon, Allocation { gid: 50002, fresh: true });
        let again = gids.access_point_gid("fs-1", "fsap-anon").await.unwrap();
        assert_eq!(again, Allocation { gid: 50002, fresh: false });
    }

    #[tokio::test]
    async fn test_access_point_gid_errors() {
        let (cloud, gids) = allocator();
        cloud.insert_access_point(existing_ap("fsap-other", "fs-2", 50000));

        let err = gids.access_point_gid("fs-1", "fsap-other").await.unwrap_err();
        assert!(matches!(err, GidError::ForeignAccessPoint { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);

        let err = gids.access_point_gid("fs-1", "fsap-missing").await.unwrap_err();
        assert!(matches!(err, GidError::Lookup { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_lowest_free() {
        let r = GidRange::new(10, 13).unwrap();
        let mut allocations = Allocations::default();
        assert_eq!(allocations.lowest_free(r), Some(10));

        allocations.insert(10, "a".into(), Origin::Local);
        allocations.insert(12, "c".into(), Origin::Local);
        assert_eq!(allocations.lowest_free(r), Some(11));

        allocations.insert(11, "b".into(), Origin::Local);
        assert_eq!(allocations.lowest_free(r), Some(13));

        allocations.insert(13, "d".into(), Origin::Local);
        assert_eq!(allocations.lowest_free(r), None);
    }
}
