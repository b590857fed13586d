//! Linux mount operations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{FS_TYPE, FsUsage, MountError, MountRequest, Mounter};
use crate::supervisor::{CommandOutput, CommandRunner};

/// Upper bound for a single mount or unmount command.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// [`Mounter`] backed by `mount(8)` and `umount(8)`.
#[derive(Debug, Clone)]
pub struct LinuxMounter {
    runner: CommandRunner,
    timeout: Duration,
    mountinfo: PathBuf,
}

impl LinuxMounter {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            mountinfo: PathBuf::from(MOUNTINFO),
        }
    }

    async fn run(
        &self,
        operation: &'static str,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, MountError> {
        self.runner
            .run(program, args, self.timeout)
            .await
            .map_err(|source| {
                error!(operation, error = %source, "Command did not complete");
                MountError::Command { operation, source }
            })
    }
}

fn check(operation: &'static str, output: CommandOutput) -> Result<(), MountError> {
    if output.status.success() {
        return Ok(());
    }
    let diagnostic = output.diagnostic().to_string();
    error!(operation, status = %output.status, diagnostic = %diagnostic, "Command failed");
    Err(MountError::Failed {
        operation,
        status: output.status,
        diagnostic,
    })
}

fn path_arg(path: &Path) -> &str {
    // Targets come from validated UTF-8 request strings
    path.to_str().unwrap_or_default()
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        info!(
            source = %request.source,
            target = %request.target.display(),
            options = %request.options.join(","),
            "Mounting"
        );
        tokio::fs::create_dir_all(&request.target).await?;

        let options = request.options.join(",");
        let mut args = vec!["-t", FS_TYPE];
        if !options.is_empty() {
            args.extend(["-o", options.as_str()]);
        }
        args.extend([request.source.as_str(), path_arg(&request.target)]);

        let output = self.run("mount", "mount", &args).await?;
        check("mount", output)
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError> {
        info!(source = %source.display(), target = %target.display(), read_only, "Creating bind mount");
        tokio::fs::create_dir_all(target).await?;

        let output = self
            .run("bind mount", "mount", &["--bind", path_arg(source), path_arg(target)])
            .await?;
        check("bind mount", output)?;

        if read_only {
            let remount = self
                .run(
                    "read-only remount",
                    "mount",
                    &["-o", "remount,bind,ro", path_arg(target)],
                )
                .await
                .and_then(|output| check("read-only remount", output));

            // Never leave a writable bind behind a read-only request
            if let Err(e) = remount {
                if let Err(undo) = self.unmount(target).await {
                    warn!(error = %undo, "Failed to undo bind mount");
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        info!(target = %target.display(), "Unmounting");

        let output = self.run("unmount", "umount", &[path_arg(target)]).await?;
        if !output.status.success() {
            let diagnostic = output.diagnostic();
            if diagnostic.contains("not mounted") || diagnostic.contains("no mount point") {
                debug!(target = %target.display(), "Path was not mounted");
            } else if diagnostic.contains("No such file or directory") {
                debug!(target = %target.display(), "Mount point already gone");
                return Ok(());
            } else {
                check("unmount", output)?;
            }
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Only warn, the directory might not be empty
                warn!(error = %e, target = %target.display(), "Could not remove mount point");
            }
        }

        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let content = tokio::fs::read_to_string(&self.mountinfo).await?;
        Ok(mount_points(&content).iter().any(|point| point == target))
    }
}

/// Mount points listed in a `/proc/<pid>/mountinfo` table.
pub fn mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        let value = escaped.then(|| {
            bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'))
        });

        if let Some(byte) = value.and_then(|v| u8::try_from(v).ok()) {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Capacity and inode counts of the file system mounted at `path`.
pub fn statvfs_usage(path: &Path) -> Result<FsUsage, nix::Error> {
    let stats = nix::sys::statvfs::statvfs(path)?;

    let block_size = stats.fragment_size() as i64;
    let total_bytes = stats.blocks() as i64 * block_size;
    let available_bytes = stats.blocks_available() as i64 * block_size;
    let free_bytes = stats.blocks_free() as i64 * block_size;

    let total_inodes = stats.files() as i64;
    let free_inodes = stats.files_free() as i64;

    Ok(FsUsage {
        total_bytes,
        available_bytes,
        used_bytes: total_bytes - free_bytes,
        total_inodes,
        free_inodes,
        used_inodes: total_inodes - free_inodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 259:1 / / rw,relatime shared:1 - ext4 /dev/root rw
98 22 0:50 / /var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pv-1/mount rw,relatime shared:50 - nfs4 127.0.0.1:/ rw,vers=4.1
99 22 0:50 /dir /mnt/with\\040space rw,relatime shared:51 - nfs4 127.0.0.1:/dir rw
";

    #[test]
    fn test_mount_points() {
        let points = mount_points(SAMPLE);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], PathBuf::from("/"));
        assert_eq!(
            points[1],
            PathBuf::from("/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pv-1/mount")
        );
        assert_eq!(points[2], PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("/plain"), "/plain");
        assert_eq!(unescape("/a\\040b"), "/a b");
        assert_eq!(unescape("/tab\\011"), "/tab\t");
        assert_eq!(unescape("/back\\134slash"), "/back\\slash");
        // Incomplete escapes are kept verbatim
        assert_eq!(unescape("/end\\04"), "/end\\04");
    }

    #[tokio::test]
    async fn test_is_mounted_reads_mountinfo() {
        let dir = tempfile::TempDir::new().unwrap();
        let table = dir.path().join("mountinfo");
        std::fs::write(&table, SAMPLE).unwrap();

        let mut mounter = LinuxMounter::new(CommandRunner::new(crate::supervisor::Reaper::new()));
        mounter.mountinfo = table;

        assert!(mounter.is_mounted(Path::new("/mnt/with space")).await.unwrap());
        assert!(!mounter.is_mounted(Path::new("/mnt/other")).await.unwrap());
    }

    #[test]
    fn test_statvfs_usage() {
        let dir = tempfile::TempDir::new().unwrap();
        let usage = statvfs_usage(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.available_bytes <= usage.total_bytes);
        assert!(usage.used_bytes >= 0);
    }
}
