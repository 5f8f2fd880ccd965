use std::collections::BTreeSet;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bulwark_core::Snapshot;
use bulwark_exec::run_with_timeout;
use bulwark_notify::{alert, Notifier, Severity};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

const WARNING_MARKER: &str = "BTRFS warning";

/// One corruption sighting mined from the journal: which device complained
/// and the raw address the kernel reported.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CorruptionEvent {
    pub device: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Inode(u64),
    LogicalAddress(u64),
}

/// Extracts deduplicated corruption events from raw journal text. Only
/// btrfs warning lines are considered; a line without a device token is
/// discarded; one line may carry an inode, a logical address, both or
/// neither. Malformed text yields an empty set, never an error.
pub fn mine(log_text: &str) -> BTreeSet<CorruptionEvent> {
    let mut events = BTreeSet::new();
    for line in log_text.lines() {
        if !line.contains(WARNING_MARKER) {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(device) = word_after(&tokens, "device") else {
            continue;
        };
        if let Some(ino) = number_after(&tokens, "ino") {
            events.insert(CorruptionEvent {
                device: device.to_string(),
                kind: EventKind::Inode(ino),
            });
        }
        if let Some(logical) = number_after(&tokens, "logical") {
            events.insert(CorruptionEvent {
                device: device.to_string(),
                kind: EventKind::LogicalAddress(logical),
            });
        }
    }
    events
}

// Kernel lines wrap tokens in punctuation, e.g. "(device sdb1):".
fn strip_punctuation(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '/' && c != '-' && c != '_')
}

fn word_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    let position = tokens
        .iter()
        .position(|token| strip_punctuation(token) == key)?;
    let word = strip_punctuation(tokens.get(position + 1)?);
    (!word.is_empty()).then_some(word)
}

fn number_after(tokens: &[&str], key: &str) -> Option<u64> {
    word_after(tokens, key)?.parse().ok()
}

/// Raw journal text for [since, until], both epoch seconds. The reader is
/// best-effort: any failure is reported and degrades to empty text so the
/// monitoring run continues.
pub fn read_log_window(since: i64, until: i64, timeout: Duration) -> String {
    let mut command = Command::new("journalctl");
    command.args([
        "--output",
        "cat",
        "--since",
        &format_timestamp(since),
        "--until",
        &format_timestamp(until),
    ]);
    match run_with_timeout(command, timeout) {
        Ok(output) if output.status.success() => output.stdout_text(),
        Ok(output) => {
            warn!("journalctl failed: {}", output.stderr_text().trim());
            String::new()
        }
        Err(err) => {
            warn!("journalctl failed: {}", err);
            String::new()
        }
    }
}

// journalctl interprets bare timestamps in local time.
fn format_timestamp(epoch: i64) -> String {
    const FORMAT: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetDateTime::from_unix_timestamp(epoch)
        .map(|moment| moment.to_offset(offset))
        .ok()
        .and_then(|moment| moment.format(FORMAT).ok())
        .unwrap_or_else(|| "1970-01-01 00:00:00".to_string())
}

/// Maps one mined event to the file paths it implicates.
pub trait AddressResolver {
    fn resolve(&self, mount_point: &str, event: &CorruptionEvent) -> Result<Vec<String>>;
}

/// Production resolver backed by `btrfs inspect-internal`.
pub struct BtrfsResolver {
    timeout: Duration,
}

impl BtrfsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AddressResolver for BtrfsResolver {
    fn resolve(&self, mount_point: &str, event: &CorruptionEvent) -> Result<Vec<String>> {
        let mut command = Command::new("btrfs");
        command.arg("inspect-internal");
        match event.kind {
            EventKind::Inode(ino) => {
                command.args(["inode-resolve", &ino.to_string(), mount_point]);
            }
            EventKind::LogicalAddress(logical) => {
                command.args(["logical-resolve", &logical.to_string(), mount_point]);
            }
        }
        let output = run_with_timeout(command, self.timeout)
            .with_context(|| format!("btrfs inspect-internal on {mount_point}"))?;
        if !output.status.success() {
            bail!(
                "btrfs inspect-internal on {} failed: {}",
                mount_point,
                output.stderr_text().trim()
            );
        }
        Ok(output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Resolves mined events to a deduplicated, lexicographically sorted list
/// of broken file paths. Per-event failures are skipped; one unreadable
/// address never suppresses the rest of the report.
pub fn resolve_broken_files(
    events: &BTreeSet<CorruptionEvent>,
    snapshot: &Snapshot,
    resolver: &dyn AddressResolver,
    notifier: &dyn Notifier,
) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for event in events {
        let device_path = format!("/dev/{}", event.device);
        let Some(mount_point) = snapshot.find_mount_for_device(&device_path) else {
            alert(
                notifier,
                Severity::Warning,
                &format!(
                    "no mount point found for device {} reported in the journal",
                    event.device
                ),
            );
            continue;
        };
        match resolver.resolve(mount_point, event) {
            Ok(resolved) => paths.extend(resolved),
            Err(err) => warn!(
                "failed to resolve {:?} on {}: {:#}",
                event.kind, mount_point, err
            ),
        }
    }
    paths.into_iter().collect()
}
