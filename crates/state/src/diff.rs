use std::collections::BTreeSet;

use bulwark_core::{ChangeReport, DeviceChange, Snapshot, StatsChange};

/// Compares two snapshots. Pure and total: empty snapshots are valid and
/// produce all-additions or all-removals reports.
///
/// Join keys: mount points match by `mount_point`; devices match by uuid.
/// For added/removed devices the uuid search is global across the whole
/// other snapshot, so a device that moved between mount points shows up as
/// removed from one and added to the other. Change detection, in contrast,
/// only pairs devices under the same mount point key.
pub fn diff(old: &Snapshot, new: &Snapshot) -> ChangeReport {
    let old_keys: BTreeSet<&str> = old
        .mounts
        .iter()
        .map(|mount| mount.mount_point.as_str())
        .collect();
    let new_keys: BTreeSet<&str> = new
        .mounts
        .iter()
        .map(|mount| mount.mount_point.as_str())
        .collect();

    let added_mounts = new
        .mounts
        .iter()
        .filter(|mount| !old_keys.contains(mount.mount_point.as_str()))
        .cloned()
        .collect();
    let removed_mounts = old
        .mounts
        .iter()
        .filter(|mount| !new_keys.contains(mount.mount_point.as_str()))
        .cloned()
        .collect();

    let mut added_devices = Vec::new();
    for mount in &new.mounts {
        if !old_keys.contains(mount.mount_point.as_str()) {
            continue;
        }
        for device in &mount.devices {
            if !old.contains_uuid(&device.uuid) {
                added_devices.push(DeviceChange {
                    mount_point: mount.mount_point.clone(),
                    device: device.clone(),
                });
            }
        }
    }

    let mut removed_devices = Vec::new();
    for mount in &old.mounts {
        if !new_keys.contains(mount.mount_point.as_str()) {
            continue;
        }
        for device in &mount.devices {
            if !new.contains_uuid(&device.uuid) {
                removed_devices.push(DeviceChange {
                    mount_point: mount.mount_point.clone(),
                    device: device.clone(),
                });
            }
        }
    }

    let mut changed_devices = Vec::new();
    for new_mount in &new.mounts {
        let Some(old_mount) = old.find_mount(&new_mount.mount_point) else {
            continue;
        };
        for new_device in &new_mount.devices {
            let Some(old_device) = old_mount
                .devices
                .iter()
                .find(|device| device.uuid == new_device.uuid)
            else {
                continue;
            };
            if new_device.stats != old_device.stats {
                changed_devices.push(StatsChange {
                    mount_point: new_mount.mount_point.clone(),
                    current: new_device.clone(),
                    previous: old_device.clone(),
                });
            }
        }
    }

    ChangeReport {
        added_mounts,
        removed_mounts,
        added_devices,
        removed_devices,
        changed_devices,
    }
}
