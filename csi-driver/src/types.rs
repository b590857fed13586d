//! Type-safe wrappers for CSI parameters.
//!
//! These types provide compile-time safety for values parsed from
//! StorageClass parameters, volume contexts and volume IDs. Each type
//! implements `FromStr` (or a `parse` constructor) for parsing at the API
//! boundary so handlers work with validated values only.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::config::{DEFAULT_GID_RANGE_END, DEFAULT_GID_RANGE_START};

// ============================================================================
// VolumeId
// ============================================================================

/// Identifier of a provisioned or static volume.
///
/// Grammar: `fsid`, `fsid:subpath`, `fsid:subpath:apid` or `fsid::apid`.
/// Dynamically provisioned volumes always use `fsid::apid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    pub file_system_id: String,
    pub subpath: Option<String>,
    pub access_point_id: Option<String>,
}

impl VolumeId {
    /// Volume ID handed out by CreateVolume.
    pub fn for_access_point(file_system_id: impl Into<String>, access_point_id: impl Into<String>) -> Self {
        Self {
            file_system_id: file_system_id.into(),
            subpath: None,
            access_point_id: Some(access_point_id.into()),
        }
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_system_id)?;
        match (&self.subpath, &self.access_point_id) {
            (None, None) => Ok(()),
            (Some(sub), None) => write!(f, ":{}", sub),
            (sub, Some(ap)) => write!(f, ":{}:{}", sub.as_deref().unwrap_or(""), ap),
        }
    }
}

impl FromStr for VolumeId {
    type Err = VolumeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(VolumeIdParseError(s.to_string()));
        }

        let file_system_id = parts[0];
        if file_system_id.is_empty() || !is_resource_id(file_system_id) {
            return Err(VolumeIdParseError(s.to_string()));
        }

        let subpath = parts
            .get(1)
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string());

        let access_point_id = match parts.get(2) {
            Some(ap) if ap.is_empty() || !is_resource_id(ap) => {
                return Err(VolumeIdParseError(s.to_string()));
            }
            Some(ap) => Some(ap.to_string()),
            None => None,
        };

        if let Some(sub) = &subpath
            && (!sub.starts_with('/') || sub.contains(".."))
        {
            return Err(VolumeIdParseError(s.to_string()));
        }

        Ok(Self {
            file_system_id: file_system_id.to_string(),
            subpath,
            access_point_id,
        })
    }
}

/// Resource IDs are short ASCII tokens such as `fs-0123abcd` or `fsap-0abc`.
fn is_resource_id(id: &str) -> bool {
    id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Error returned when parsing a malformed volume ID.
#[derive(Debug, Clone)]
pub struct VolumeIdParseError(String);

impl Display for VolumeIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid volume ID '{}': expected fsid[:subpath[:apid]]",
            self.0
        )
    }
}

impl std::error::Error for VolumeIdParseError {}

// ============================================================================
// GidRange
// ============================================================================

/// Inclusive interval of POSIX GIDs reserved for one file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidRange {
    start: u32,
    end: u32,
}

impl GidRange {
    pub fn new(start: u32, end: u32) -> Result<Self, GidRangeError> {
        if start == 0 {
            return Err(GidRangeError::ZeroStart);
        }
        if start > end {
            return Err(GidRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn end(&self) -> u32 {
        self.end
    }

    pub const fn contains(&self, gid: u32) -> bool {
        gid >= self.start && gid <= self.end
    }
}

impl Default for GidRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_GID_RANGE_START,
            end: DEFAULT_GID_RANGE_END,
        }
    }
}

impl Display for GidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Error returned for an unusable GID range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GidRangeError {
    #[error("GID range must not start at 0")]
    ZeroStart,

    #[error("GID range start {start} is greater than end {end}")]
    Inverted { start: u32, end: u32 },
}

// ============================================================================
// Permissions
// ============================================================================

/// Octal directory permissions for an access point root, e.g. `700`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryPerms(u32);

impl DirectoryPerms {
    pub const fn mode(self) -> u32 {
        self.0
    }
}

impl Display for DirectoryPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl FromStr for DirectoryPerms {
    type Err = DirectoryPermsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('0').filter(|d| !d.is_empty()).unwrap_or(s);
        if digits.is_empty() || digits.len() > 4 {
            return Err(DirectoryPermsParseError(s.to_string()));
        }
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .map(DirectoryPerms)
            .ok_or_else(|| DirectoryPermsParseError(s.to_string()))
    }
}

/// Error returned when `directoryPerms` is not an octal mode.
#[derive(Debug, Clone)]
pub struct DirectoryPermsParseError(String);

impl Display for DirectoryPermsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid directoryPerms '{}': expected octal mode such as 700", self.0)
    }
}

impl std::error::Error for DirectoryPermsParseError {}

// ============================================================================
// CreateVolume parameters
// ============================================================================

/// Parameter keys accepted by CreateVolume.
pub mod params {
    pub const PROVISIONING_MODE: &str = "provisioningMode";
    pub const FILE_SYSTEM_ID: &str = "fileSystemId";
    pub const DIRECTORY_PERMS: &str = "directoryPerms";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const GID_RANGE_START: &str = "gidRangeStart";
    pub const GID_RANGE_END: &str = "gidRangeEnd";
    pub const BASE_PATH: &str = "basePath";
    pub const AZ: &str = "az";

    /// The only supported provisioning mode
    pub const ACCESS_POINT_MODE: &str = "efs-ap";
}

/// Who owns the access point root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Fixed uid/gid from the StorageClass; no allocation
    Fixed { uid: u32, gid: u32 },
    /// A GID allocated from the file system's range (uid follows gid)
    Allocated(GidRange),
}

/// Validated CreateVolume parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointParams {
    pub file_system_id: String,
    pub directory_perms: DirectoryPerms,
    pub ownership: Ownership,
    pub base_path: Option<String>,
    pub availability_zone: Option<String>,
}

impl AccessPointParams {
    /// Validate the StorageClass parameters of a CreateVolume request.
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self, ParamsError> {
        let mode = parameters
            .get(params::PROVISIONING_MODE)
            .ok_or(ParamsError::Missing(params::PROVISIONING_MODE))?;
        if mode != params::ACCESS_POINT_MODE {
            return Err(ParamsError::UnsupportedMode(mode.clone()));
        }

        let file_system_id = parameters
            .get(params::FILE_SYSTEM_ID)
            .filter(|id| !id.is_empty())
            .ok_or(ParamsError::Missing(params::FILE_SYSTEM_ID))?;
        if !is_resource_id(file_system_id) {
            return Err(ParamsError::Invalid {
                key: params::FILE_SYSTEM_ID,
                value: file_system_id.clone(),
            });
        }

        let directory_perms = parameters
            .get(params::DIRECTORY_PERMS)
            .ok_or(ParamsError::Missing(params::DIRECTORY_PERMS))?
            .parse::<DirectoryPerms>()
            .map_err(|e| ParamsError::Invalid {
                key: params::DIRECTORY_PERMS,
                value: e.0,
            })?;

        let gid = parse_u32(parameters, params::GID)?;
        let uid = parse_u32(parameters, params::UID)?;
        let range_start = parse_u32(parameters, params::GID_RANGE_START)?;
        let range_end = parse_u32(parameters, params::GID_RANGE_END)?;

        let ownership = match (gid, uid) {
            (Some(gid), uid) => {
                if range_start.is_some() || range_end.is_some() {
                    return Err(ParamsError::Conflict(
                        "gid cannot be combined with gidRangeStart/gidRangeEnd",
                    ));
                }
                Ownership::Fixed {
                    uid: uid.unwrap_or(gid),
                    gid,
                }
            }
            (None, Some(_)) => {
                return Err(ParamsError::Conflict("uid requires gid"));
            }
            (None, None) => {
                let range = GidRange::new(
                    range_start.unwrap_or(DEFAULT_GID_RANGE_START),
                    range_end.unwrap_or(DEFAULT_GID_RANGE_END),
                )
                .map_err(ParamsError::Range)?;
                Ownership::Allocated(range)
            }
        };

        let base_path = parameters
            .get(params::BASE_PATH)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        if let Some(base) = &base_path
            && base.split('/').any(|segment| segment == "..")
        {
            return Err(ParamsError::Invalid {
                key: params::BASE_PATH,
                value: base.clone(),
            });
        }

        let availability_zone = parameters
            .get(params::AZ)
            .filter(|az| !az.is_empty())
            .cloned();

        Ok(Self {
            file_system_id: file_system_id.clone(),
            directory_perms,
            ownership,
            base_path,
            availability_zone,
        })
    }

    /// Access point root directory for a volume name.
    pub fn root_directory(&self, volume_name: &str) -> String {
        match &self.base_path {
            Some(base) => format!("/{}/{}", base, volume_name),
            None => format!("/{}", volume_name),
        }
    }
}

fn parse_u32(parameters: &HashMap<String, String>, key: &'static str) -> Result<Option<u32>, ParamsError> {
    parameters
        .get(key)
        .map(|v| {
            v.parse::<u32>().map_err(|_| ParamsError::Invalid {
                key,
                value: v.clone(),
            })
        })
        .transpose()
}

/// Error returned for unusable CreateVolume parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("missing parameter {0}")]
    Missing(&'static str),

    #[error("unsupported provisioningMode '{0}': expected efs-ap")]
    UnsupportedMode(String),

    #[error("invalid value '{value}' for parameter {key}")]
    Invalid { key: &'static str, value: String },

    #[error("conflicting parameters: {0}")]
    Conflict(&'static str),

    #[error(transparent)]
    Range(GidRangeError),
}

// ============================================================================
// Tests
// ============================================================================
