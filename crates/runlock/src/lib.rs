use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance holds the lock at {0}")]
    AlreadyLocked(PathBuf),

    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive per-host run guard. The marker file is created with
/// create-new semantics, so two concurrent invocations race on the
/// filesystem and exactly one wins. A marker this process did not create
/// is never removed.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match result {
            Ok(mut file) => {
                // Owning pid, for operators inspecting a stale marker.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(source) if source.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::AlreadyLocked(path))
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the marker and reports the outcome. Dropping the guard
    /// removes it too, silently; this is for callers that want the error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {}", self.path.display(), err);
        }
    }
}
