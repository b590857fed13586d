//! In-process control plane.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{AccessPoint, Cloud, CloudError, CreateAccessPointInput, FileSystem, MountTarget};

#[derive(Debug, Default)]
struct State {
    file_systems: HashMap<String, FileSystem>,
    access_points: BTreeMap<String, AccessPoint>,
    mount_targets: HashMap<String, Vec<MountTarget>>,
    client_tokens: HashMap<String, String>,
    next_id: u64,
    create_calls: usize,
    injected_create_failures: VecDeque<CloudError>,
}

/// Control plane kept entirely in memory.
///
/// Behaves like the real service for the operations the driver uses,
/// including client-token idempotency on access point creation.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<State>,
    /// Describing an unknown file system creates it (sanity runs)
    auto_create_file_systems: bool,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variant used for `memory://`: any file system ID resolves.
    pub fn sanity() -> Self {
        Self {
            state: Mutex::default(),
            auto_create_file_systems: true,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_file_system(&self, file_system_id: &str) {
        self.state().file_systems.insert(
            file_system_id.to_string(),
            FileSystem {
                file_system_id: file_system_id.to_string(),
                life_cycle_state: "available".to_string(),
            },
        );
    }

    pub fn add_mount_target(&self, file_system_id: &str, availability_zone: &str, ip_address: &str) {
        let mut state = self.state();
        state.next_id += 1;
        let mount_target_id = format!("fsmt-{:08x}", state.next_id);
        state
            .mount_targets
            .entry(file_system_id.to_string())
            .or_default()
            .push(MountTarget {
                mount_target_id,
                ip_address: ip_address.to_string(),
                availability_zone: availability_zone.to_string(),
            });
    }

    /// Insert an access point that was created outside the driver.
    pub fn insert_access_point(&self, access_point: AccessPoint) {
        self.state()
            .access_points
            .insert(access_point.access_point_id.clone(), access_point);
    }

    /// Make the next `create_access_point` call fail with `err`.
    pub fn fail_next_create(&self, err: CloudError) {
        self.state().injected_create_failures.push_back(err);
    }

    /// Number of `create_access_point` calls that reached the control plane.
    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn access_points(&self) -> Vec<AccessPoint> {
        self.state().access_points.values().cloned().collect()
    }
}

#[async_trait]
impl Cloud for InMemoryCloud {
    async fn describe_file_system(&self, file_system_id: &str) -> Result<FileSystem, CloudError> {
        if self.auto_create_file_systems && !self.state().file_systems.contains_key(file_system_id) {
            self.add_file_system(file_system_id);
        }

        self.state()
            .file_systems
            .get(file_system_id)
            .cloned()
            .ok_or_else(|| CloudError::FileSystemNotFound(file_system_id.to_string()))
    }

    async fn create_access_point(
        &self,
        input: CreateAccessPointInput,
    ) -> Result<AccessPoint, CloudError> {
        let mut state = self.state();
        state.create_calls += 1;

        if let Some(err) = state.injected_create_failures.pop_front() {
            return Err(err);
        }

        if !state.file_systems.contains_key(&input.file_system_id) {
            return Err(CloudError::FileSystemNotFound(input.file_system_id));
        }

        if let Some(existing) = state
            .client_tokens
            .get(&input.client_token)
            .and_then(|id| state.access_points.get(id))
        {
            debug!(client_token = %input.client_token, "Returning access point for known client token");
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let access_point = AccessPoint {
            access_point_id: format!("fsap-{:017x}", state.next_id),
            file_system_id: input.file_system_id,
            root_directory: input.root_directory,
            posix_user: Some(input.posix_user),
            permissions: Some(input.permissions),
            tags: input.tags,
        };

        state
            .client_tokens
            .insert(input.client_token, access_point.access_point_id.clone());
        state
            .access_points
            .insert(access_point.access_point_id.clone(), access_point.clone());

        Ok(access_point)
    }

    async fn describe_access_point(
        &self,
        access_point_id: &str,
    ) -> Result<AccessPoint, CloudError> {
        self.state()
            .access_points
            .get(access_point_id)
            .cloned()
            .ok_or_else(|| CloudError::AccessPointNotFound(access_point_id.to_string()))
    }

    async fn list_access_points(
        &self,
        file_system_id: &str,
    ) -> Result<Vec<AccessPoint>, CloudError> {
        let state = self.state();
        if !state.file_systems.contains_key(file_system_id) {
            return Err(CloudError::FileSystemNotFound(file_system_id.to_string()));
        }

        Ok(state
            .access_points
            .values()
            .filter(|ap| ap.file_system_id == file_system_id)
            .cloned()
            .collect())
    }

    async fn delete_access_point(&self, access_point_id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state
            .access_points
            .remove(access_point_id)
            .ok_or_else(|| CloudError::AccessPointNotFound(access_point_id.to_string()))?;
        state.client_tokens.retain(|_, id| id != access_point_id);
        Ok(())
    }

    async fn describe_mount_targets(
        &self,
        file_system_id: &str,
        availability_zone: Option<&str>,
    ) -> Result<Vec<MountTarget>, CloudError> {
        let state = self.state();
        if !state.file_systems.contains_key(file_system_id) {
            return Err(CloudError::FileSystemNotFound(file_system_id.to_string()));
        }

        Ok(state
            .mount_targets
            .get(file_system_id)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|mt| availability_zone.is_none_or(|az| mt.availability_zone == az))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
