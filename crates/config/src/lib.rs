use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_DATA_DIR: &str = "/var/lib/bulwark";
const DEFAULT_CONFIG_DIR: &str = "/etc/bulwark";
const DEFAULT_CACHE_NAME: &str = "devices.json";
const DEFAULT_NOTIFIER_FILE: &str = "notifier.conf";
const DEFAULT_LAST_CHECK_NAME: &str = "last-check";
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;

/// Everything the watchdog reads from the environment, resolved once at
/// startup. Unset sync roots mean restoration is opted out, not an error.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub cache_file: PathBuf,
    pub notifier_config: PathBuf,
    pub last_check_file: PathBuf,
    pub lock_path: PathBuf,
    pub sync_src_dir: Option<PathBuf>,
    pub sync_backup_dir: Option<PathBuf>,
    pub exec_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("BULWARK_DATA_DIR", DEFAULT_DATA_DIR));
        let config_dir = PathBuf::from(env_or("BULWARK_CONFIG_DIR", DEFAULT_CONFIG_DIR));
        let cache_file = data_dir.join(env_or("BULWARK_CACHE_NAME", DEFAULT_CACHE_NAME));
        let notifier_config =
            config_dir.join(env_or("BULWARK_NOTIFIER_FILE", DEFAULT_NOTIFIER_FILE));
        let last_check_file =
            data_dir.join(env_or("BULWARK_LAST_CHECK_NAME", DEFAULT_LAST_CHECK_NAME));
        let lock_path = env::var("BULWARK_LOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("run.lock"));
        let exec_timeout = Duration::from_secs(
            env::var("BULWARK_EXEC_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS),
        );
        Self {
            data_dir,
            config_dir,
            cache_file,
            notifier_config,
            last_check_file,
            lock_path,
            sync_src_dir: env_path("BULWARK_SYNC_SRC_DIR"),
            sync_backup_dir: env_path("BULWARK_SYNC_BACKUP_DIR"),
            exec_timeout,
        }
    }

    /// Fatal-setup gate: both working directories must exist and be
    /// writable before any other work is attempted.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.config_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
            check_writable(dir)?;
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn check_writable(dir: &Path) -> Result<()> {
    let probe = dir.join("write.probe");
    fs::write(&probe, b"write.probe")
        .with_context(|| format!("directory {} is not writable", dir.display()))?;
    fs::remove_file(&probe)
        .with_context(|| format!("remove probe file {}", probe.display()))?;
    Ok(())
}
