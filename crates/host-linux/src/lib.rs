use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bulwark_core::{Device, DeviceStats, MountPoint, Snapshot};
use bulwark_exec::run_with_timeout;
use tracing::warn;

/// Queries every btrfs mount point on the host. A mount whose tools fail
/// is skipped with a warning; one unreadable filesystem must not hide the
/// others from the snapshot.
pub fn collect_snapshot(timeout: Duration) -> Snapshot {
    let mut mounts = Vec::new();
    for mount_point in find_btrfs_mount_points() {
        match get_device_stats(&mount_point, timeout) {
            Ok(devices) => mounts.push(MountPoint {
                mount_point,
                devices,
            }),
            Err(err) => warn!("skipping mount {}: {:#}", mount_point, err),
        }
    }
    Snapshot::new(mounts)
}

pub fn find_btrfs_mount_points() -> Vec<String> {
    let data = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    parse_mount_table(&data)
}

/// Device list with uuids and error counters for one mount point, built
/// from `btrfs filesystem show`, `blkid` and `btrfs device stats`.
pub fn get_device_stats(mount_point: &str, timeout: Duration) -> Result<Vec<Device>> {
    let mut show = Command::new("btrfs");
    show.args(["filesystem", "show", mount_point]);
    let show = run_with_timeout(show, timeout)
        .with_context(|| format!("btrfs filesystem show {mount_point}"))?;
    if !show.status.success() {
        bail!(
            "btrfs filesystem show {} failed: {}",
            mount_point,
            show.stderr_text().trim()
        );
    }
    let paths = parse_filesystem_show(&show.stdout_text());
    if paths.is_empty() {
        bail!("no devices reported for {}", mount_point);
    }

    let mut stats = Command::new("btrfs");
    stats.args(["device", "stats", mount_point]);
    let stats = run_with_timeout(stats, timeout)
        .with_context(|| format!("btrfs device stats {mount_point}"))?;
    if !stats.status.success() {
        bail!(
            "btrfs device stats {} failed: {}",
            mount_point,
            stats.stderr_text().trim()
        );
    }
    let counters = parse_device_stats(&stats.stdout_text());

    let mut devices = Vec::new();
    for path in paths {
        let stats = counters
            .get(&path)
            .copied()
            .ok_or_else(|| anyhow!("no error counters reported for {}", path))?;
        let uuid = device_uuid(&path, timeout)?;
        devices.push(Device { path, uuid, stats });
    }
    Ok(devices)
}

/// Mount points with fstype btrfs from a /proc/self/mounts table,
/// first-seen order, deduplicated.
fn parse_mount_table(data: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut points = Vec::new();
    for line in data.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount_point), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fs_type != "btrfs" {
            continue;
        }
        let mount_point = unescape_mount_field(mount_point);
        if seen.insert(mount_point.clone()) {
            points.push(mount_point);
        }
    }
    points
}

// The kernel escapes space, tab, newline and backslash in mount fields as
// three octal digits.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let is_escape = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit)
            && bytes[i + 1..i + 4].iter().all(|b| *b <= b'7');
        if is_escape {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Device-node paths from `btrfs filesystem show` output lines of the form
/// `devid 1 size 1.82TiB used 1.71TiB path /dev/sdb1`.
fn parse_filesystem_show(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"devid") {
            continue;
        }
        let Some(position) = tokens.iter().position(|token| *token == "path") else {
            continue;
        };
        if let Some(path) = tokens.get(position + 1) {
            paths.push(path.to_string());
        }
    }
    paths
}

/// Counters from `btrfs device stats` output lines of the form
/// `[/dev/sdb1].write_io_errs   0`.
fn parse_device_stats(output: &str) -> BTreeMap<String, DeviceStats> {
    let mut stats: BTreeMap<String, DeviceStats> = BTreeMap::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix('[') else {
            continue;
        };
        let Some((path, counter_part)) = rest.split_once("].") else {
            continue;
        };
        let mut fields = counter_part.split_whitespace();
        let (Some(counter), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let entry = stats.entry(path.to_string()).or_default();
        match counter {
            "write_io_errs" => entry.write_errors = value,
            "read_io_errs" => entry.read_errors = value,
            "flush_io_errs" => entry.flush_errors = value,
            "corruption_errs" => entry.corruption_errors = value,
            "generation_errs" => entry.generation_errors = value,
            _ => {}
        }
    }
    stats
}

/// Stable identity for a member device. Multi-device filesystems expose a
/// per-device UUID_SUB; single-device filesystems only carry the
/// filesystem UUID, which is just as stable for our join key.
fn device_uuid(device_path: &str, timeout: Duration) -> Result<String> {
    for tag in ["UUID_SUB", "UUID"] {
        let mut command = Command::new("blkid");
        command.args(["-o", "value", "-s", tag, device_path]);
        let output = run_with_timeout(command, timeout)
            .with_context(|| format!("blkid -s {tag} {device_path}"))?;
        let value = output.stdout_text().trim().to_string();
        if output.status.success() && !value.is_empty() {
            return Ok(value);
        }
    }
    bail!("no uuid reported for {}", device_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_table_filters_btrfs_and_dedupes() {
        let table = "\
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sdb1 /data btrfs rw,relatime,space_cache=v2 0 0
/dev/sdb1 /data btrfs rw,relatime,space_cache=v2 0 0
/dev/sdc1 /mnt/back\\040up btrfs rw 0 0
tmpfs /tmp tmpfs rw 0 0
";
        let points = parse_mount_table(table);
        assert_eq!(points, vec!["/data".to_string(), "/mnt/back up".to_string()]);
    }

    #[test]
    fn short_mount_lines_are_ignored() {
        assert!(parse_mount_table("garbage\n\n").is_empty());
    }

    #[test]
    fn filesystem_show_yields_device_paths() {
        let output = "\
Label: 'tank'  uuid: 5e3f0a5c-86b1-4f7a-9d9a-27e6cfc3ab11
\tTotal devices 2 FS bytes used 1.35TiB
\tdevid    1 size 1.82TiB used 1.40TiB path /dev/sdb1
\tdevid    2 size 1.82TiB used 1.40TiB path /dev/sdc1
";
        assert_eq!(
            parse_filesystem_show(output),
            vec!["/dev/sdb1".to_string(), "/dev/sdc1".to_string()]
        );
    }

    #[test]
    fn device_stats_are_grouped_per_device() {
        let output = "\
[/dev/sdb1].write_io_errs   0
[/dev/sdb1].read_io_errs    2
[/dev/sdb1].flush_io_errs   0
[/dev/sdb1].corruption_errs 7
[/dev/sdb1].generation_errs 0
[/dev/sdc1].write_io_errs   1
";
        let stats = parse_device_stats(output);
        let sdb = stats.get("/dev/sdb1").unwrap();
        assert_eq!(sdb.read_errors, 2);
        assert_eq!(sdb.corruption_errors, 7);
        assert_eq!(stats.get("/dev/sdc1").unwrap().write_errors, 1);
    }

    #[test]
    fn malformed_stats_lines_are_skipped() {
        let stats = parse_device_stats("nonsense\n[/dev/sdb1].write_io_errs many\n");
        assert!(stats.is_empty());
    }
}
