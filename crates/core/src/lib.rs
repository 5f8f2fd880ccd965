use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

pub const SNAPSHOT_SCHEMA_VERSION: &str = "1.0.0";

/// Per-device btrfs error counters. Field-wise equality is what the diff
/// engine relies on; any differing counter marks the device as changed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub write_errors: u64,
    pub read_errors: u64,
    pub flush_errors: u64,
    pub corruption_errors: u64,
    pub generation_errors: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: String,
    // Stable identity across snapshots. `path` is display data only.
    pub uuid: String,
    pub stats: DeviceStats,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub mount_point: String,
    pub devices: Vec<Device>,
}

/// Complete observed state at one instant: every btrfs mount point on the
/// host with its devices and counters. Mount point keys are unique within a
/// snapshot; device uuids are unique within a mount point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub mounts: Vec<MountPoint>,
}

impl Snapshot {
    pub fn new(mounts: Vec<MountPoint>) -> Self {
        Self { mounts }
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn find_mount(&self, mount_point: &str) -> Option<&MountPoint> {
        self.mounts
            .iter()
            .find(|mount| mount.mount_point == mount_point)
    }

    /// Mount point hosting the device with the given device-node path
    /// (e.g. "/dev/sdb1").
    pub fn find_mount_for_device(&self, device_path: &str) -> Option<&str> {
        for mount in &self.mounts {
            if mount.devices.iter().any(|device| device.path == device_path) {
                return Some(mount.mount_point.as_str());
            }
        }
        None
    }

    pub fn contains_uuid(&self, uuid: &str) -> bool {
        self.mounts
            .iter()
            .flat_map(|mount| mount.devices.iter())
            .any(|device| device.uuid == uuid)
    }
}

/// A device that appeared under or vanished from a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub mount_point: String,
    pub device: Device,
}

/// A device whose counters moved between two snapshots of the same mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsChange {
    pub mount_point: String,
    pub current: Device,
    pub previous: Device,
}

/// Structured diff between two snapshots. Computed once per run, consumed
/// for alerting, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub added_mounts: Vec<MountPoint>,
    pub removed_mounts: Vec<MountPoint>,
    pub added_devices: Vec<DeviceChange>,
    pub removed_devices: Vec<DeviceChange>,
    pub changed_devices: Vec<StatsChange>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.added_mounts.is_empty()
            && self.removed_mounts.is_empty()
            && self.added_devices.is_empty()
            && self.removed_devices.is_empty()
            && self.changed_devices.is_empty()
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
