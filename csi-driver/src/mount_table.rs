//! Refcounted table of node-local mount targets.
//!
//! One entry per target path. An entry moves through
//! `Mounting -> Mounted -> Unmounting` and is removed once unmounted; the
//! underlying mount exists exactly while an entry is `Mounted` with a
//! positive count. Callers serialize operations on the same target (see
//! [`crate::locks::KeyedLocks`]); the table itself only guards its map and
//! never holds its lock across I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tonic::Status;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Mounting,
    Mounted,
    Unmounting,
}

/// GID this node allocated for the mount and must give back afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GidRef {
    pub file_system_id: String,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub volume_id: String,
    pub read_only: bool,
    pub count: u32,
    pub state: MountState,
    pub gid: Option<GidRef>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MountTableError {
    #[error("target {target} already holds volume {existing}, not {requested}")]
    VolumeMismatch {
        target: String,
        existing: String,
        requested: String,
    },

    #[error("target {target} is already published {existing}, not {requested}")]
    AccessModeMismatch {
        target: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("an operation is already in progress on target {target}")]
    Busy { target: String },
}

impl From<MountTableError> for Status {
    fn from(err: MountTableError) -> Self {
        match err {
            MountTableError::VolumeMismatch { .. } => Status::failed_precondition(err.to_string()),
            MountTableError::AccessModeMismatch { .. } => Status::already_exists(err.to_string()),
            MountTableError::Busy { .. } => Status::aborted(err.to_string()),
        }
    }
}

/// Outcome of [`MountTable::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Nothing tracked at the target
    Untracked,
    /// Other publishers still reference the mount
    Remaining(u32),
    /// Last reference dropped; the caller must unmount, then call
    /// [`MountTable::finish_unmount`] or [`MountTable::abort_unmount`]
    Last(MountEntry),
}

#[derive(Debug, Default)]
pub struct MountTable {
    entries: Mutex<HashMap<PathBuf, MountEntry>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, MountEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(entries: &HashMap<PathBuf, MountEntry>) {
        let mounted = entries
            .values()
            .filter(|e| e.state == MountState::Mounted)
            .count();
        metrics::set_published_mounts(mounted);
    }

    pub fn get(&self, target: &Path) -> Option<MountEntry> {
        self.entries().get(target).cloned()
    }

    /// Add a reference to an existing mount of `volume_id` at `target`.
    ///
    /// Returns the new count, or `None` if nothing is tracked there. The
    /// existing mount must have been published with the same access.
    pub fn acquire(
        &self,
        target: &Path,
        volume_id: &str,
        read_only: bool,
    ) -> Result<Option<u32>, MountTableError> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(target) else {
            return Ok(None);
        };

        if entry.volume_id != volume_id {
            return Err(MountTableError::VolumeMismatch {
                target: target.display().to_string(),
                existing: entry.volume_id.clone(),
                requested: volume_id.to_string(),
            });
        }
        if entry.state != MountState::Mounted {
            return Err(MountTableError::Busy {
                target: target.display().to_string(),
            });
        }
        if entry.read_only != read_only {
            let access = |ro: bool| if ro { "read-only" } else { "read-write" };
            return Err(MountTableError::AccessModeMismatch {
                target: target.display().to_string(),
                existing: access(entry.read_only),
                requested: access(read_only),
            });
        }

        entry.count += 1;
        Ok(Some(entry.count))
    }

    /// Record that a mount of `volume_id` at `target` is starting.
    pub fn begin_mount(
        &self,
        target: &Path,
        volume_id: &str,
        read_only: bool,
        gid: Option<GidRef>,
    ) -> Result<(), MountTableError> {
        let mut entries = self.entries();
        if entries.contains_key(target) {
            return Err(MountTableError::Busy {
                target: target.display().to_string(),
            });
        }
        entries.insert(
            target.to_path_buf(),
            MountEntry {
                volume_id: volume_id.to_string(),
                read_only,
                count: 0,
                state: MountState::Mounting,
                gid,
            },
        );
        Ok(())
    }

    /// The mount succeeded: the entry becomes `Mounted` with one reference.
    pub fn finish_mount(&self, target: &Path) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(target) {
            entry.state = MountState::Mounted;
            entry.count = 1;
        }
        Self::report(&entries);
    }

    /// The mount failed: forget the entry and hand it back for cleanup.
    pub fn abort_mount(&self, target: &Path) -> Option<MountEntry> {
        let mut entries = self.entries();
        match entries.get(target) {
            Some(entry) if entry.state == MountState::Mounting => entries.remove(target),
            _ => None,
        }
    }

    /// Track a target the OS already has mounted (e.g. after a restart).
    pub fn adopt(&self, target: &Path, volume_id: &str, read_only: bool) {
        let mut entries = self.entries();
        entries.insert(
            target.to_path_buf(),
            MountEntry {
                volume_id: volume_id.to_string(),
                read_only,
                count: 1,
                state: MountState::Mounted,
                gid: None,
            },
        );
        Self::report(&entries);
    }

    /// Drop one reference to the mount at `target`.
    pub fn release(&self, target: &Path) -> Result<Release, MountTableError> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(target) else {
            return Ok(Release::Untracked);
        };
        if entry.state != MountState::Mounted {
            return Err(MountTableError::Busy {
                target: target.display().to_string(),
            });
        }

        if entry.count > 1 {
            entry.count -= 1;
            return Ok(Release::Remaining(entry.count));
        }

        entry.count = 0;
        entry.state = MountState::Unmounting;
        Ok(Release::Last(entry.clone()))
    }

    /// The unmount succeeded: remove the entry.
    pub fn finish_unmount(&self, target: &Path) -> Option<MountEntry> {
        let mut entries = self.entries();
        let removed = entries.remove(target);
        Self::report(&entries);
        removed
    }

    /// The unmount failed: the mount is still there with its last reference.
    pub fn abort_unmount(&self, target: &Path) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(target)
            && entry.state == MountState::Unmounting
        {
            entry.state = MountState::Mounted;
            entry.count = 1;
        }
    }

    /// Another target on this node with `volume_id` mounted, to bind from.
    ///
    /// A read-only mount only serves read-only requests.
    pub fn mounted_source_for(
        &self,
        volume_id: &str,
        read_only: bool,
        exclude: &Path,
    ) -> Option<PathBuf> {
        self.entries()
            .iter()
            .filter(|(path, entry)| {
                path.as_path() != exclude
                    && entry.volume_id == volume_id
                    && entry.state == MountState::Mounted
                    && (read_only || !entry.read_only)
            })
            .map(|(path, _)| path.clone())
            .min()
    }

    /// True while any entry still holds `gid`.
    pub fn gid_in_use(&self, gid: &GidRef) -> bool {
        self.entries()
            .values()
            .any(|entry| entry.gid.as_ref() == Some(gid))
    }

    /// Number of tracked targets, in any state.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOL: &str = "fs-1::fsap-1";

    fn gid(gid: u32) -> GidRef {
        GidRef {
            file_system_id: "fs-1".into(),
            gid,
        }
    }

    #[test]
    fn test_mount_lifecycle() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");

        assert_eq!(table.acquire(target, VOL, false).unwrap(), None);
        table.begin_mount(target, VOL, false, Some(gid(50000))).unwrap();
        assert_eq!(table.get(target).unwrap().state, MountState::Mounting);

        table.finish_mount(target);
        let entry = table.get(target).unwrap();
        assert_eq!(entry.state, MountState::Mounted);
        assert_eq!(entry.count, 1);

        assert_eq!(table.acquire(target, VOL, false).unwrap(), Some(2));
        assert_eq!(table.release(target).unwrap(), Release::Remaining(1));

        match table.release(target).unwrap() {
            Release::Last(entry) => {
                assert_eq!(entry.state, MountState::Unmounting);
                assert_eq!(entry.gid, Some(gid(50000)));
            }
            other => panic!("expected last release, got {:?}", other),
        }
        assert!(table.finish_unmount(target).is_some());
        assert!(table.is_empty());
        assert_eq!(table.release(target).unwrap(), Release::Untracked);
    }

    #[test]
    fn test_volume_mismatch() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");
        table.adopt(target, VOL, false);

        let err = table.acquire(target, "fs-2", false).unwrap_err();
        assert!(matches!(err, MountTableError::VolumeMismatch { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::FailedPrecondition);
        // The existing mount is untouched
        assert_eq!(table.get(target).unwrap().count, 1);
    }

    #[test]
    fn test_access_mode_mismatch() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");
        table.adopt(target, VOL, false);

        let err = table.acquire(target, VOL, true).unwrap_err();
        assert!(matches!(err, MountTableError::AccessModeMismatch { .. }));
        assert_eq!(Status::from(err).code(), tonic::Code::AlreadyExists);
        assert_eq!(table.get(target).unwrap().count, 1);

        assert_eq!(table.acquire(target, VOL, false).unwrap(), Some(2));
    }

    #[test]
    fn test_abort_mount_rolls_back() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");
        table.begin_mount(target, VOL, false, Some(gid(50001))).unwrap();

        assert!(table.gid_in_use(&gid(50001)));
        let entry = table.abort_mount(target).unwrap();
        assert_eq!(entry.gid, Some(gid(50001)));
        assert!(table.get(target).is_none());
        assert!(!table.gid_in_use(&gid(50001)));
    }

    #[test]
    fn test_abort_unmount_restores_reference() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");
        table.adopt(target, VOL, false);

        assert!(matches!(table.release(target).unwrap(), Release::Last(_)));
        // Busy while unmounting
        assert!(matches!(
            table.acquire(target, VOL, false),
            Err(MountTableError::Busy { .. })
        ));

        table.abort_unmount(target);
        let entry = table.get(target).unwrap();
        assert_eq!(entry.state, MountState::Mounted);
        assert_eq!(entry.count, 1);
    }

    #[test]
    fn test_mounted_source_for() {
        let table = MountTable::new();
        table.adopt(Path::new("/mnt/b"), VOL, false);
        table.adopt(Path::new("/mnt/a"), VOL, true);
        table
            .begin_mount(Path::new("/mnt/c"), VOL, false, None)
            .unwrap();

        assert_eq!(
            table.mounted_source_for(VOL, true, Path::new("/mnt/c")),
            Some(PathBuf::from("/mnt/a"))
        );
        // The read-only mount cannot back a writable one
        assert_eq!(
            table.mounted_source_for(VOL, false, Path::new("/mnt/c")),
            Some(PathBuf::from("/mnt/b"))
        );
        assert_eq!(table.mounted_source_for(VOL, false, Path::new("/mnt/b")), None);
        assert_eq!(table.mounted_source_for("fs-9", true, Path::new("/mnt/c")), None);
    }

    #[test]
    fn test_begin_mount_twice_is_busy() {
        let table = MountTable::new();
        let target = Path::new("/mnt/a");
        table.begin_mount(target, VOL, false, None).unwrap();
        assert_eq!(
            table.begin_mount(target, VOL, false, None),
            Err(MountTableError::Busy {
                target: "/mnt/a".into()
            })
        );
    }
}
