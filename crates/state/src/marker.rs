use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// Reads the epoch-seconds marker left by the previous corruption scan.
/// Missing or unparsable markers fall back to None; the scan window then
/// starts from the caller's default.
pub fn load_last_checked(path: impl AsRef<Path>) -> Option<i64> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).ok()?;
    match data.trim().parse::<i64>() {
        Ok(epoch) => Some(epoch),
        Err(err) => {
            warn!(
                "ignoring malformed last-check marker {}: {}",
                path.display(),
                err
            );
            None
        }
    }
}

pub fn store_last_checked(path: impl AsRef<Path>, epoch: i64) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, epoch.to_string())
        .with_context(|| format!("write last-check marker {}", path.display()))
}
