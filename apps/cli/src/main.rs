use anyhow::{bail, Context, Result};
use bulwark_config::Config;
use bulwark_core::{ChangeReport, Snapshot};
use bulwark_corruption::{mine, read_log_window, resolve_broken_files, BtrfsResolver};
use bulwark_host_linux::collect_snapshot;
use bulwark_notify::{alert, CommandNotifier, Notifier, NoopNotifier, Severity};
use bulwark_restore::{restore, RestorePlan, RsyncSyncer};
use bulwark_runlock::RunLock;
use bulwark_state::marker::{load_last_checked, store_last_checked};
use bulwark_state::{diff, load_snapshot, save_snapshot};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// Scan window start when no marker exists yet.
const DEFAULT_WINDOW_SECS: i64 = 600;

#[derive(Parser)]
#[command(name = "bulwark", about = "btrfs health watchdog", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full monitoring run: snapshot, diff, corruption scan, restore.
    Run {
        /// Print the collected snapshot as JSON.
        #[arg(long)]
        debug_dump: bool,
    },
    /// Corruption scan and restore only, without touching the snapshot cache.
    Restore,
    /// Send a test alert through the configured notifier.
    TestNotify,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    config.ensure_directories()?;
    let notifier = build_notifier(&config);

    match cli.command {
        Commands::Run { debug_dump } => run_monitor(&config, notifier.as_ref(), debug_dump),
        Commands::Restore => run_restore_only(&config, notifier.as_ref()),
        Commands::TestNotify => {
            notifier.notify("This is a test notification", Severity::Info);
            info!("test notification sent");
            Ok(())
        }
    }
}

fn build_notifier(config: &Config) -> Box<dyn Notifier> {
    match CommandNotifier::from_config_file(&config.notifier_config, config.exec_timeout) {
        Ok(notifier) => {
            info!(
                "notifier config: {} ({} endpoints)",
                config.notifier_config.display(),
                notifier.endpoint_count()
            );
            Box::new(notifier)
        }
        Err(err) => {
            tracing::error!(
                "could not load notifier config {}: {:#}; notifications will not be sent",
                config.notifier_config.display(),
                err
            );
            Box::new(NoopNotifier)
        }
    }
}

fn run_monitor(config: &Config, notifier: &dyn Notifier, debug_dump: bool) -> Result<()> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    info!("starting monitoring run {run_id}");

    let snapshot = collect_snapshot(config.exec_timeout);
    if debug_dump {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    if snapshot.is_empty() {
        alert(notifier, Severity::Warning, "no btrfs mounts found");
        return Ok(());
    }

    let previous = load_snapshot(&config.cache_file).with_context(|| {
        format!(
            "snapshot cache {} is unreadable; remove it to reset the baseline",
            config.cache_file.display()
        )
    })?;
    save_snapshot(&config.cache_file, &snapshot)?;

    match previous {
        None => {
            alert(
                notifier,
                Severity::Warning,
                "no previous snapshot found; baseline recorded",
            );
        }
        Some(previous) => {
            let report = diff(&previous, &snapshot);
            report_changes(notifier, &report);
            if report.is_empty() {
                info!("done, nothing to report");
            } else {
                info!("done, reported changes");
            }
        }
    }

    scan_and_restore(config, &snapshot, notifier)
}

fn run_restore_only(config: &Config, notifier: &dyn Notifier) -> Result<()> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    info!("starting restore run {run_id}");

    let snapshot = collect_snapshot(config.exec_timeout);
    if snapshot.is_empty() {
        alert(notifier, Severity::Warning, "no btrfs mounts found");
        return Ok(());
    }
    scan_and_restore(config, &snapshot, notifier)
}

fn acquire_lock(config: &Config) -> Result<RunLock> {
    RunLock::acquire(&config.lock_path).context("refusing to start")
}

fn report_changes(notifier: &dyn Notifier, report: &ChangeReport) {
    for mount in &report.added_mounts {
        alert(
            notifier,
            Severity::Info,
            &format!("added mount: {}", mount.mount_point),
        );
    }
    for mount in &report.removed_mounts {
        alert(
            notifier,
            Severity::Warning,
            &format!("removed mount: {}", mount.mount_point),
        );
    }
    for change in &report.added_devices {
        alert(
            notifier,
            Severity::Info,
            &format!("added device: {} to {}", change.device.path, change.mount_point),
        );
    }
    for change in &report.removed_devices {
        alert(
            notifier,
            Severity::Warning,
            &format!(
                "removed device: {} from {}",
                change.device.path, change.mount_point
            ),
        );
    }
    for change in &report.changed_devices {
        let old = &change.previous.stats;
        let new = &change.current.stats;
        alert(
            notifier,
            Severity::Error,
            &format!(
                "changed stats of device {} in {}\n\
                 write errors: {} -> {}\n\
                 read errors: {} -> {}\n\
                 flush errors: {} -> {}\n\
                 corruption errors: {} -> {}\n\
                 generation errors: {} -> {}",
                change.current.path,
                change.mount_point,
                old.write_errors,
                new.write_errors,
                old.read_errors,
                new.read_errors,
                old.flush_errors,
                new.flush_errors,
                old.corruption_errors,
                new.corruption_errors,
                old.generation_errors,
                new.generation_errors,
            ),
        );
    }
}

/// Mines the journal window since the last successful scan, resolves the
/// events to file paths and hands them to the restore pipeline. The marker
/// only advances when nothing failed, so failed files are re-mined on the
/// next run.
fn scan_and_restore(config: &Config, snapshot: &Snapshot, notifier: &dyn Notifier) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let since = load_last_checked(&config.last_check_file).unwrap_or(now - DEFAULT_WINDOW_SECS);

    let log_text = read_log_window(since, now, config.exec_timeout);
    let events = mine(&log_text);
    let resolver = BtrfsResolver::new(config.exec_timeout);
    let broken_files = resolve_broken_files(&events, snapshot, &resolver, notifier);

    if broken_files.is_empty() {
        info!("no broken files detected");
        store_last_checked(&config.last_check_file, now)?;
        return Ok(());
    }

    alert(
        notifier,
        Severity::Error,
        &format!(
            "{} broken file(s) detected:\n{}",
            broken_files.len(),
            broken_files.join("\n")
        ),
    );

    let plan = RestorePlan::new(config.sync_src_dir.clone(), config.sync_backup_dir.clone());
    let syncer = RsyncSyncer::new(config.exec_timeout);
    let result = restore(&broken_files, &plan, &syncer, notifier);

    info!(
        "restore outcome: {} synced, {} skipped, {} failed",
        result.synced.len(),
        result.skipped.len(),
        result.failed.len()
    );

    if result.has_failures() {
        alert(
            notifier,
            Severity::Error,
            "some broken files could not be restored",
        );
        bail!("{} file(s) could not be restored", result.failed.len());
    }

    if !result.synced.is_empty() {
        alert(
            notifier,
            Severity::Info,
            "all broken files have been restored successfully",
        );
    }
    store_last_checked(&config.last_check_file, now)?;
    Ok(())
}
