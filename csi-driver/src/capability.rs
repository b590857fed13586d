//! Volume capability checks shared by the Controller and Node services.

use crate::csi;
use crate::csi::volume_capability::AccessType;
use crate::csi::volume_capability::access_mode::Mode;

/// Access modes the driver serves. A shared file system can be mounted on
/// any number of nodes, read-write or read-only.
pub const SUPPORTED_ACCESS_MODES: [Mode; 5] = [
    Mode::SingleNodeWriter,
    Mode::SingleNodeReaderOnly,
    Mode::MultiNodeReaderOnly,
    Mode::MultiNodeSingleWriter,
    Mode::MultiNodeMultiWriter,
];

/// Why a capability is not served.
pub fn unsupported_reason(cap: &csi::VolumeCapability) -> Option<String> {
    match &cap.access_type {
        Some(AccessType::Mount(_)) => {}
        Some(AccessType::Block(_)) => return Some("block volumes are not supported".to_string()),
        None => return Some("volume capability must specify access type".to_string()),
    }

    let Some(access_mode) = &cap.access_mode else {
        return Some("volume capability must specify access mode".to_string());
    };
    match Mode::try_from(access_mode.mode) {
        Ok(mode) if SUPPORTED_ACCESS_MODES.contains(&mode) => None,
        Ok(mode) => Some(format!("access mode {} is not supported", mode.as_str_name())),
        Err(_) => Some(format!("unknown access mode: {}", access_mode.mode)),
    }
}

/// True for access modes that never allow writes.
pub fn is_read_only(cap: &csi::VolumeCapability) -> bool {
    cap.access_mode
        .as_ref()
        .and_then(|m| Mode::try_from(m.mode).ok())
        .is_some_and(|mode| matches!(mode, Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly))
}

/// Mount flags requested through the capability, duplicates removed.
pub fn mount_flags(cap: &csi::VolumeCapability) -> Vec<String> {
    let mut flags: Vec<String> = Vec::new();
    if let Some(AccessType::Mount(mount)) = &cap.access_type {
        for flag in &mount.mount_flags {
            let flag = flag.trim();
            if !flag.is_empty() && !flags.iter().any(|f| f == flag) {
                flags.push(flag.to_string());
            }
        }
    }
    flags
}

#[cfg(test)]
pub(crate) fn mount_capability(mode: Mode, flags: &[&str]) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(AccessType::Mount(csi::volume_capability::MountVolume {
            fs_type: String::new(),
            mount_flags: flags.iter().map(|f| f.to_string()).collect(),
            volume_mount_group: String::new(),
        })),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}
