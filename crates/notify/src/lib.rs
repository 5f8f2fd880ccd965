use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_exec::run_with_timeout;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(label)
    }
}

/// Fire-and-forget alert sink. Delivery problems stay inside the
/// implementation; callers never see them.
pub trait Notifier {
    fn notify(&self, message: &str, severity: Severity);
}

/// Logs the message at the matching level and forwards it to the notifier.
pub fn alert(notifier: &dyn Notifier, severity: Severity, message: &str) {
    match severity {
        Severity::Info => tracing::info!("{message}"),
        Severity::Warning => tracing::warn!("{message}"),
        Severity::Error => tracing::error!("{message}"),
    }
    notifier.notify(message, severity);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _message: &str, _severity: Severity) {}
}

/// Spawns one configured command per alert, with severity and message
/// appended as the final two arguments. Endpoints come from a config file:
/// one command line each, `#` comments and blank lines ignored.
pub struct CommandNotifier {
    endpoints: Vec<Vec<String>>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn from_config_file(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("read notifier config {}", path.display()))?;
        let mut endpoints = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            endpoints.push(argv);
        }
        Ok(Self { endpoints, timeout })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        for argv in &self.endpoints {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let mut command = Command::new(program);
            command.args(args);
            command.arg(severity.to_string());
            command.arg(message);
            match run_with_timeout(command, self.timeout) {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    warn!(
                        "notifier endpoint {} exited with {}: {}",
                        program,
                        output.status,
                        output.stderr_text().trim()
                    );
                }
                Err(err) => {
                    warn!("notifier endpoint {} failed: {}", program, err);
                }
            }
        }
    }
}

/// Records alerts for assertions in tests.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<(Severity, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Severity, String)> {
        self.events.lock().expect("notifier poisoned").clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        self.events
            .lock()
            .expect("notifier poisoned")
            .push((severity, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_endpoints_skipping_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# alerting endpoints").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "logger -t watchdog").unwrap();
        writeln!(file, "true").unwrap();
        let notifier =
            CommandNotifier::from_config_file(file.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(notifier.endpoint_count(), 2);
    }

    #[test]
    fn missing_config_is_an_error() {
        let err = CommandNotifier::from_config_file("/nonexistent/notifier.conf", Duration::from_secs(1));
        assert!(err.is_err());
    }

    #[test]
    fn failing_endpoint_does_not_propagate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "false").unwrap();
        writeln!(file, "definitely-not-a-real-program").unwrap();
        let notifier =
            CommandNotifier::from_config_file(file.path(), Duration::from_secs(5)).unwrap();
        // Both endpoints fail; notify must still return normally.
        notifier.notify("test message", Severity::Error);
    }

    #[test]
    fn memory_notifier_records_in_order() {
        let notifier = MemoryNotifier::new();
        alert(&notifier, Severity::Info, "one");
        alert(&notifier, Severity::Error, "two");
        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (Severity::Info, "one".to_string()));
        assert_eq!(events[1], (Severity::Error, "two".to_string()));
    }
}
