use std::fs;
use std::io;
use std::path::Path;

use bulwark_core::{now_utc_rfc3339, MountPoint, Snapshot, SNAPSHOT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("read snapshot cache: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot cache is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot cache schema {found} does not match expected {expected}")]
    Version { found: String, expected: String },
}

/// On-disk form of a snapshot: the mount list plus an explicit schema
/// version stamp so shape drift fails loudly instead of deserializing into
/// partial data.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    schema_version: String,
    generated_at_utc: String,
    mounts: Vec<MountPoint>,
}

/// Missing cache file is a valid first-run state, not an error.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Option<Snapshot>, DecodeError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let file: SnapshotFile = serde_json::from_str(&data)?;
    if file.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(DecodeError::Version {
            found: file.schema_version,
            expected: SNAPSHOT_SCHEMA_VERSION.to_string(),
        });
    }
    Ok(Some(Snapshot::new(file.mounts)))
}

pub fn save_snapshot(path: impl AsRef<Path>, snapshot: &Snapshot) -> anyhow::Result<()> {
    let file = SnapshotFile {
        schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
        generated_at_utc: now_utc_rfc3339(),
        mounts: snapshot.mounts.clone(),
    };
    let data = serde_json::to_string_pretty(&file)?;
    fs::write(path.as_ref(), data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{Device, DeviceStats};

    fn sample_snapshot() -> Snapshot {
        Snapshot::new(vec![MountPoint {
            mount_point: "/data".to_string(),
            devices: vec![Device {
                path: "/dev/sdb1".to_string(),
                uuid: "0d6e1c9a-0000-4000-8000-000000000001".to_string(),
                stats: DeviceStats {
                    write_errors: 3,
                    ..DeviceStats::default()
                },
            }],
        }])
    }

    #[test]
    fn round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let snapshot = sample_snapshot();
        save_snapshot(&path, &snapshot).unwrap();
        let loaded = load_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(dir.path().join("devices.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_snapshot(&path),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn shape_mismatch_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, r#"{"schema_version": "1.0.0", "mounts": 7}"#).unwrap();
        assert!(matches!(
            load_snapshot(&path),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(
            &path,
            r#"{"schema_version": "9.9.9", "generated_at_utc": "", "mounts": []}"#,
        )
        .unwrap();
        match load_snapshot(&path) {
            Err(DecodeError::Version { found, expected }) => {
                assert_eq!(found, "9.9.9");
                assert_eq!(expected, SNAPSHOT_SCHEMA_VERSION);
            }
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
