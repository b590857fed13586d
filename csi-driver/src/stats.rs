//! Volume usage cache for NodeGetVolumeStats.
//!
//! A shared file system reports the same capacity for every access point, so
//! per-volume usage has to be measured by walking the published directory.
//! Walks are expensive on network storage: each directory is walked at most
//! once per refresh period, in the background, with a bounded number of
//! concurrent walks per file system. Callers get the last known value.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::VolumeMetricsConfig;

/// Space and inodes consumed below a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirUsage {
    pub used_bytes: i64,
    pub used_inodes: i64,
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    usage: DirUsage,
    refreshed_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    cached: HashMap<PathBuf, Cached>,
    in_flight: HashSet<PathBuf>,
    limits: HashMap<String, Arc<Semaphore>>,
}

#[derive(Debug)]
pub struct VolumeStatsCache {
    refresh_period: Duration,
    fs_rate_limit: usize,
    state: Mutex<State>,
}

impl VolumeStatsCache {
    pub fn new(config: &VolumeMetricsConfig) -> Self {
        Self {
            refresh_period: config.refresh_period,
            fs_rate_limit: config.fs_rate_limit.max(1),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last measured usage of `path`, if any.
    ///
    /// Starts a background walk when the value is missing or older than the
    /// refresh period and no walk of `path` is running.
    pub fn usage(self: &Arc<Self>, file_system_id: &str, path: &Path) -> Option<DirUsage> {
        let (cached, limit) = {
            let mut state = self.state();
            let cached = state.cached.get(path).copied();
            let stale = cached.is_none_or(|c| c.refreshed_at.elapsed() >= self.refresh_period);
            if !stale || !state.in_flight.insert(path.to_path_buf()) {
                return cached.map(|c| c.usage);
            }
            let limit = state
                .limits
                .entry(file_system_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.fs_rate_limit)))
                .clone();
            (cached, limit)
        };

        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            cache.refresh(limit, path).await;
        });

        cached.map(|c| c.usage)
    }

    async fn refresh(&self, limit: Arc<Semaphore>, path: PathBuf) {
        let result = match limit.acquire_owned().await {
            Ok(_permit) => {
                let walk_path = path.clone();
                tokio::task::spawn_blocking(move || dir_usage(&walk_path))
                    .await
                    .unwrap_or_else(|e| Err(io::Error::other(e)))
            }
            Err(e) => Err(io::Error::other(e)),
        };

        let mut state = self.state();
        state.in_flight.remove(&path);
        match result {
            Ok(usage) => {
                debug!(
                    path = %path.display(),
                    used_bytes = usage.used_bytes,
                    used_inodes = usage.used_inodes,
                    "Refreshed volume usage"
                );
                state.cached.insert(
                    path,
                    Cached {
                        usage,
                        refreshed_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to measure volume usage");
            }
        }
    }

    /// Drop the cached value of an unpublished target.
    pub fn forget(&self, path: &Path) {
        self.state().cached.remove(path);
    }

    /// True while a walk of `path` is pending or running.
    pub fn is_refreshing(&self, path: &Path) -> bool {
        self.state().in_flight.contains(path)
    }
}

/// Walk `root` without following symlinks, summing file sizes and counting
/// every entry (the root included) as one inode.
///
/// Entries that vanish mid-walk and directories this process may not read
/// are skipped; only a failure to read `root` itself is an error.
pub fn dir_usage(root: &Path) -> io::Result<DirUsage> {
    walk(root, list_dir)
}

type Listing = Vec<(PathBuf, io::Result<Metadata>)>;

fn skippable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

fn list_dir(dir: &Path) -> io::Result<Listing> {
    let mut listing = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        match entry {
            Ok(entry) => listing.push((entry.path(), entry.metadata())),
            Err(e) if skippable(&e) => {
                debug!(path = %dir.display(), error = %e, "Skipping unreadable entry");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(listing)
}

fn walk<F>(root: &Path, mut list: F) -> io::Result<DirUsage>
where
    F: FnMut(&Path) -> io::Result<Listing>,
{
    let mut usage = DirUsage {
        used_bytes: 0,
        used_inodes: 1,
    };
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let listing = match list(&dir) {
            Ok(listing) => listing,
            Err(e) if dir != root && skippable(&e) => {
                debug!(path = %dir.display(), error = %e, "Skipping directory");
                continue;
            }
            Err(e) => return Err(e),
        };

        for (path, metadata) in listing {
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(e) if skippable(&e) => {
                    debug!(path = %path.display(), error = %e, "Skipping entry");
                    continue;
                }
                Err(e) => return Err(e),
            };
            usage.used_inodes += 1;
            if metadata.is_dir() {
                pending.push(path);
            } else {
                usage.used_bytes += metadata.len() as i64;
            }
        }
    }

    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        std::fs::write(root.join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("b"), vec![0u8; 28]).unwrap();
    }

    #[test]
    fn test_dir_usage() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());

        let usage = dir_usage(tmp.path()).unwrap();
        assert_eq!(usage.used_bytes, 128);
        // root, a, sub, sub/b
        assert_eq!(usage.used_inodes, 4);
    }

    #[test]
    fn test_dir_usage_missing() {
        assert!(dir_usage(Path::new("/nonexistent/volume/path")).is_err());
    }

    #[test]
    fn test_dir_usage_skips_vanished_and_unreadable_entries() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let private = tmp.path().join("private");
        std::fs::create_dir(&private).unwrap();
        std::fs::write(private.join("secret"), vec![0u8; 500]).unwrap();
        let vanished = tmp.path().join("a");

        let usage = walk(tmp.path(), |dir| {
            // Another tenant's directory behind restrictive permissions
            if dir == private {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let mut listing = list_dir(dir)?;
            // Deleted between listing and stat
            for (path, metadata) in &mut listing {
                if *path == vanished {
                    *metadata = Err(io::Error::from(io::ErrorKind::NotFound));
                }
            }
            Ok(listing)
        })
        .unwrap();

        // root, sub, sub/b, private
        assert_eq!(usage.used_inodes, 4);
        assert_eq!(usage.used_bytes, 28);
    }

    #[test]
    fn test_dir_usage_other_errors_abort() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let sub = tmp.path().join("sub");

        let err = walk(tmp.path(), |dir| {
            if dir == sub {
                return Err(io::Error::other("stale file handle"));
            }
            list_dir(dir)
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_usage_refreshes_in_background() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let cache = Arc::new(VolumeStatsCache::new(&VolumeMetricsConfig {
            opt_in: true,
            refresh_period: Duration::from_secs(3600),
            fs_rate_limit: 1,
        }));

        // First call only schedules the walk
        assert_eq!(cache.usage("fs-1", tmp.path()), None);

        let mut usage = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !cache.is_refreshing(tmp.path()) {
                usage = cache.usage("fs-1", tmp.path());
                break;
            }
        }
        let usage = usage.expect("walk finished");
        assert_eq!(usage.used_bytes, 128);

        // Fresh values are served without another walk
        std::fs::write(tmp.path().join("c"), vec![0u8; 1000]).unwrap();
        assert_eq!(cache.usage("fs-1", tmp.path()), Some(usage));
        assert!(!cache.is_refreshing(tmp.path()));

        cache.forget(tmp.path());
        assert_eq!(cache.usage("fs-1", tmp.path()), None);
    }
}
