//! Driver configuration.
//!
//! Everything the services need is collected once at startup into a
//! [`DriverConfig`] and handed to each constructor by reference. Parsing
//! helpers for the operating mode, the endpoint URL and the resource tag
//! string live here as well.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cloud::TlsConfig;

/// Name of the efs-utils configuration file inside a config directory.
pub const EFS_UTILS_CONFIG_FILE: &str = "efs-utils.conf";

/// Default GID range handed out when a StorageClass does not specify one.
pub const DEFAULT_GID_RANGE_START: u32 = 50_000;
pub const DEFAULT_GID_RANGE_END: u32 = 7_000_000;

// ============================================================================
// Mode
// ============================================================================

/// Which CSI services this process registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Controller service only
    Controller,
    /// Node service only
    Node,
    /// Both controller and node services
    #[default]
    All,
}

impl Mode {
    pub const fn serves_controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    pub const fn serves_node(self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Controller => write!(f, "controller"),
            Mode::Node => write!(f, "node"),
            Mode::All => write!(f, "all"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Mode::Controller),
            "node" => Ok(Mode::Node),
            "all" => Ok(Mode::All),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown driver mode '{0}': expected controller, node or all")]
    UnknownMode(String),

    #[error("invalid endpoint '{0}': expected unix://<path> or tcp://<host:port>")]
    InvalidEndpoint(String),

    #[error("I/O error while preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error returned for a single malformed `key:value` tag entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagParseError {
    #[error("tag '{0}' is missing the ':' separator")]
    MissingSeparator(String),

    #[error("tag '{0}' has an empty key")]
    EmptyKey(String),
}

// ============================================================================
// Tags
// ============================================================================

/// Parse one `key:value` pair.
///
/// Splits on the first colon only, so values such as timestamps or ARNs may
/// themselves contain colons.
pub fn parse_tag(pair: &str) -> Result<(String, String), TagParseError> {
    let (key, value) = pair
        .split_once(':')
        .ok_or_else(|| TagParseError::MissingSeparator(pair.to_string()))?;

    if key.is_empty() {
        return Err(TagParseError::EmptyKey(pair.to_string()));
    }

    Ok((key.to_string(), value.to_string()))
}

/// Parse a space separated list of `key:value` tags.
///
/// Malformed entries are logged and dropped; the remaining tags are kept.
pub fn parse_tags(input: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    let input = input.trim();

    if input.is_empty() {
        info!("No resource tags configured");
        return tags;
    }

    for pair in input.split_whitespace() {
        match parse_tag(pair) {
            Ok((key, value)) => {
                tags.insert(key, value);
            }
            Err(e) => {
                error!(error = %e, "Dropping malformed resource tag");
            }
        }
    }

    tags
}

// ============================================================================
// Endpoint
// ============================================================================

/// Listen address for the CSI gRPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Accepts `unix:///abs/path`, `unix://rel/path` (treated as `/rel/path`),
    /// `unix:/abs/path` and `tcp://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(invalid());
            }
            let path = if rest.starts_with('/') {
                PathBuf::from(rest)
            } else {
                Path::new("/").join(rest)
            };
            return Ok(Endpoint::Unix(path));
        }

        if let Some(rest) = s.strip_prefix("unix:") {
            if !rest.starts_with('/') {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(PathBuf::from(rest)));
        }

        if let Some(rest) = s.strip_prefix("tcp://") {
            return rest.parse().map(Endpoint::Tcp).map_err(|_| invalid());
        }

        Err(invalid())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

// ============================================================================
// DriverConfig
// ============================================================================

/// Volume usage metrics options.
#[derive(Debug, Clone)]
pub struct VolumeMetricsConfig {
    /// Advertise GET_VOLUME_STATS and walk published directories for usage
    pub opt_in: bool,
    /// Minimum interval between two walks of the same directory
    pub refresh_period: Duration,
    /// Concurrent directory walks allowed per file system
    pub fs_rate_limit: usize,
}

impl Default for VolumeMetricsConfig {
    fn default() -> Self {
        Self {
            opt_in: false,
            refresh_period: Duration::from_secs(240 * 60),
            fs_rate_limit: 5,
        }
    }
}

/// Configuration shared by every service, built once at startup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub mode: Mode,
    pub endpoint: Endpoint,
    pub node_id: String,
    /// Control-plane agent endpoint, or `memory://` for the in-process cloud
    pub cloud_endpoint: String,
    /// Client certificate material for the agent connection
    pub cloud_tls: Option<TlsConfig>,
    /// efs-utils configuration directory the mount helper reads
    pub efs_utils_config_dir: PathBuf,
    /// Config directory used by older releases; kept when it holds a config file
    pub efs_utils_config_legacy_dir: PathBuf,
    /// Directory holding the pristine efs-utils static files
    pub efs_utils_static_files_dir: PathBuf,
    /// Delete an access point's root directory before deleting the access point
    pub delete_access_point_root_dir: bool,
    /// Where DeleteVolume temporarily mounts file systems to remove root directories
    pub root_dir_mount_base: PathBuf,
    /// Tags attached to every created access point
    pub tags: HashMap<String, String>,
    pub volume_metrics: VolumeMetricsConfig,
}

impl DriverConfig {
    /// Minimal configuration for the given mode; callers override fields as needed.
    pub fn new(mode: Mode, node_id: impl Into<String>) -> Self {
        Self {
            mode,
            endpoint: Endpoint::Unix(PathBuf::from("/tmp/csi.sock")),
            node_id: node_id.into(),
            cloud_endpoint: "memory://".to_string(),
            cloud_tls: None,
            efs_utils_config_dir: PathBuf::from("/var/amazon/efs"),
            efs_utils_config_legacy_dir: PathBuf::from("/etc/amazon/efs-legacy"),
            efs_utils_static_files_dir: PathBuf::from("/etc/amazon/efs-static-files"),
            delete_access_point_root_dir: false,
            root_dir_mount_base: PathBuf::from("/var/lib/csi/pv"),
            tags: HashMap::new(),
            volume_metrics: VolumeMetricsConfig::default(),
        }
    }
}

// ============================================================================
// Config directory
// ============================================================================

/// Choose the efs-utils config directory and point `link` at it.
///
/// The legacy directory wins when it already holds an `efs-utils.conf`
/// (existing nodes keep their state); otherwise the preferred directory is
/// created. Returns the chosen directory.
pub fn init_config_dir(legacy: &Path, preferred: &Path, link: &Path) -> Result<PathBuf, ConfigError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };

    let chosen = if legacy.join(EFS_UTILS_CONFIG_FILE).exists() {
        info!(dir = %legacy.display(), "Using legacy efs-utils config directory");
        legacy.to_path_buf()
    } else {
        std::fs::create_dir_all(preferred).map_err(io_err(preferred))?;
        info!(dir = %preferred.display(), "Using efs-utils config directory");
        preferred.to_path_buf()
    };

    match std::fs::read_link(link) {
        Ok(current) if current == chosen => return Ok(chosen),
        Ok(current) => {
            warn!(
                link = %link.display(),
                current = %current.display(),
                "Replacing efs-utils config symlink"
            );
            std::fs::remove_file(link).map_err(io_err(link))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(_) => {
            // Exists but is not a symlink (e.g. a directory from an older image)
            if link.is_dir() {
                std::fs::remove_dir_all(link).map_err(io_err(link))?;
            } else {
                std::fs::remove_file(link).map_err(io_err(link))?;
            }
        }
    }

    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::os::unix::fs::symlink(&chosen, link).map_err(io_err(link))?;

    Ok(chosen)
}
