use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bulwark_exec::run_with_timeout;
use bulwark_notify::{alert, Notifier, Severity};
use tracing::info;

/// Where restoration reads from and writes to. Unset roots mean the
/// operator opted out; every file is then skipped rather than failed.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub source_root: Option<PathBuf>,
    pub backup_root: Option<PathBuf>,
    /// Refuse to sync unless the backup root is its own mount. Disabled
    /// only by tests that cannot fabricate a second filesystem.
    pub require_distinct_backup: bool,
}

impl RestorePlan {
    pub fn new(source_root: Option<PathBuf>, backup_root: Option<PathBuf>) -> Self {
        Self {
            source_root,
            backup_root,
            require_distinct_backup: true,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreResult {
    pub synced: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl RestoreResult {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Copies one file into the backup tree. Implementations must preserve
/// hard links and permission bits.
pub trait FileSyncer {
    fn sync(&self, dest: &Path, src: &Path) -> Result<()>;
}

pub struct RsyncSyncer {
    timeout: Duration,
}

impl RsyncSyncer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl FileSyncer for RsyncSyncer {
    fn sync(&self, dest: &Path, src: &Path) -> Result<()> {
        let mut command = Command::new("rsync");
        command.arg("-aHI");
        command.arg(src);
        command.arg(dest);
        let output = run_with_timeout(command, self.timeout)
            .with_context(|| format!("rsync {}", src.display()))?;
        if !output.status.success() {
            bail!(
                "rsync {} failed: {}",
                src.display(),
                output.stderr_text().trim()
            );
        }
        Ok(())
    }
}

/// A directory sits on its own mount when its device id differs from its
/// parent's.
pub fn is_distinct_mount(dir: &Path) -> io::Result<bool> {
    let own = fs::metadata(dir)?.dev();
    let parent = dir.parent().unwrap_or(dir);
    let parent = fs::metadata(parent)?.dev();
    Ok(own != parent)
}

/// Walks the broken-file list and reconciles each entry against the source
/// and backup trees. Every file is processed regardless of earlier
/// failures; the caller decides what a non-empty `failed` set means for
/// the process exit.
pub fn restore(
    broken_files: &[String],
    plan: &RestorePlan,
    syncer: &dyn FileSyncer,
    notifier: &dyn Notifier,
) -> RestoreResult {
    let mut result = RestoreResult::default();

    let roots = match (&plan.source_root, &plan.backup_root) {
        (Some(source), Some(backup)) => Some((source.clone(), backup.clone())),
        _ => {
            alert(
                notifier,
                Severity::Warning,
                "skipping restoration: source or backup directory is not configured",
            );
            None
        }
    };

    let roots = match roots {
        Some((source, backup)) if plan.require_distinct_backup => {
            match is_distinct_mount(&backup) {
                Ok(true) => Some((source, backup)),
                Ok(false) => {
                    alert(
                        notifier,
                        Severity::Warning,
                        &format!(
                            "restoration disabled: backup directory {} is not a mount point",
                            backup.display()
                        ),
                    );
                    None
                }
                Err(err) => {
                    alert(
                        notifier,
                        Severity::Warning,
                        &format!(
                            "restoration disabled: cannot inspect backup directory {}: {}",
                            backup.display(),
                            err
                        ),
                    );
                    None
                }
            }
        }
        other => other,
    };

    for broken_file in broken_files {
        info!("reconciling {}", broken_file);
        let Some((source_root, backup_root)) = &roots else {
            result.skipped.insert(broken_file.clone());
            continue;
        };

        let relative = broken_file.trim_start_matches('/');
        let src = source_root.join(relative);
        let dest = backup_root.join(relative);

        if !src.exists() {
            let reason = if dest.exists() {
                "missing from the source but present in the backup"
            } else {
                "not found in the source or the backup"
            };
            alert(
                notifier,
                Severity::Warning,
                &format!("skipping {broken_file}: {reason}"),
            );
            result.skipped.insert(broken_file.clone());
            continue;
        }

        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                alert(
                    notifier,
                    Severity::Error,
                    &format!("failed to prepare {}: {}", parent.display(), err),
                );
                result.failed.insert(broken_file.clone());
                continue;
            }
        }

        match syncer.sync(&dest, &src) {
            Ok(()) => {
                result.synced.insert(broken_file.clone());
            }
            Err(err) => {
                alert(
                    notifier,
                    Severity::Error,
                    &format!("failed to synchronize {broken_file}: {err:#}"),
                );
                result.failed.insert(broken_file.clone());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_notify::MemoryNotifier;

    struct CopySyncer;

    impl FileSyncer for CopySyncer {
        fn sync(&self, dest: &Path, src: &Path) -> Result<()> {
            fs::copy(src, dest)?;
            Ok(())
        }
    }

    struct FailingSyncer;

    impl FileSyncer for FailingSyncer {
        fn sync(&self, _dest: &Path, _src: &Path) -> Result<()> {
            bail!("disk on fire")
        }
    }

    fn plan_without_mount_check(source: &Path, backup: &Path) -> RestorePlan {
        RestorePlan {
            source_root: Some(source.to_path_buf()),
            backup_root: Some(backup.to_path_buf()),
            require_distinct_backup: false,
        }
    }

    fn broken(files: &[&str]) -> Vec<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn unconfigured_roots_skip_everything() {
        let notifier = MemoryNotifier::new();
        let result = restore(
            &broken(&["/a", "/b"]),
            &RestorePlan::new(None, None),
            &CopySyncer,
            &notifier,
        );
        assert_eq!(result.skipped.len(), 2);
        assert!(result.synced.is_empty());
        assert!(!result.has_failures());
        assert!(notifier.events()[0].1.contains("not configured"));
    }

    #[test]
    fn non_mount_backup_disables_restoration() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let notifier = MemoryNotifier::new();
        let plan = RestorePlan::new(
            Some(source.path().to_path_buf()),
            Some(backup.path().to_path_buf()),
        );
        let result = restore(&broken(&["/a"]), &plan, &CopySyncer, &notifier);
        assert_eq!(result.skipped.len(), 1);
        assert!(notifier
            .events()
            .iter()
            .any(|(_, message)| message.contains("not a mount point")));
    }

    #[test]
    fn syncs_file_present_in_source() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("docs")).unwrap();
        fs::write(source.path().join("docs/report.txt"), b"payload").unwrap();

        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let result = restore(&broken(&["/docs/report.txt"]), &plan, &CopySyncer, &notifier);

        assert_eq!(result.synced.len(), 1);
        assert!(!result.has_failures());
        let copied = fs::read(backup.path().join("docs/report.txt")).unwrap();
        assert_eq!(copied, b"payload");
    }

    #[test]
    fn restore_is_idempotent() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"one").unwrap();

        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let files = broken(&["/a.txt"]);
        let first = restore(&files, &plan, &CopySyncer, &notifier);
        let second = restore(&files, &plan, &CopySyncer, &notifier);
        assert_eq!(first.synced.len(), 1);
        assert_eq!(second.synced.len(), 1);
        assert_eq!(fs::read(backup.path().join("a.txt")).unwrap(), b"one");
    }

    #[test]
    fn missing_source_with_backup_copy_is_skipped() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(backup.path().join("only-here.txt"), b"backup").unwrap();

        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let result = restore(&broken(&["/only-here.txt"]), &plan, &CopySyncer, &notifier);

        assert_eq!(result.skipped.len(), 1);
        assert!(notifier
            .events()
            .iter()
            .any(|(_, message)| message.contains("present in the backup")));
        // The backup copy must survive untouched.
        assert_eq!(fs::read(backup.path().join("only-here.txt")).unwrap(), b"backup");
    }

    #[test]
    fn missing_everywhere_is_skipped() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let result = restore(&broken(&["/ghost.txt"]), &plan, &CopySyncer, &notifier);
        assert_eq!(result.skipped.len(), 1);
        assert!(notifier
            .events()
            .iter()
            .any(|(_, message)| message.contains("source or the backup")));
    }

    #[test]
    fn one_failure_does_not_stop_the_batch() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"a").unwrap();
        fs::write(source.path().join("b.txt"), b"b").unwrap();

        struct FailOn<'a>(&'a str);
        impl FileSyncer for FailOn<'_> {
            fn sync(&self, dest: &Path, src: &Path) -> Result<()> {
                if src.ends_with(self.0) {
                    bail!("injected failure");
                }
                fs::copy(src, dest)?;
                Ok(())
            }
        }

        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let result = restore(
            &broken(&["/a.txt", "/b.txt"]),
            &plan,
            &FailOn("a.txt"),
            &notifier,
        );
        assert!(result.failed.contains("/a.txt"));
        assert!(result.synced.contains("/b.txt"));
        assert!(result.has_failures());
    }

    #[test]
    fn all_failures_are_recorded() {
        let source = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(source.path().join("a.txt"), b"a").unwrap();
        let notifier = MemoryNotifier::new();
        let plan = plan_without_mount_check(source.path(), backup.path());
        let result = restore(&broken(&["/a.txt"]), &plan, &FailingSyncer, &notifier);
        assert_eq!(result.failed.len(), 1);
        assert!(notifier
            .events()
            .iter()
            .any(|(severity, _)| *severity == Severity::Error));
    }

    #[test]
    fn tempdir_is_not_a_distinct_mount() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        assert!(!is_distinct_mount(&nested).unwrap());
    }
}
