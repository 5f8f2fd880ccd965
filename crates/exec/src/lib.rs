use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{command}: timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs a command to completion, killing it once `timeout` elapses.
/// stdout/stderr are drained on separate threads so a chatty child cannot
/// deadlock against a full pipe while we poll for exit.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ExecOutput, ExecError> {
    let label = command_label(&command);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| ExecError::Io {
        command: label.clone(),
        source,
    })?;
    let stdout = drain_pipe(child.stdout.take());
    let stderr = drain_pipe(child.stderr.take());

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(ExecOutput {
                    status,
                    stdout: stdout.join().unwrap_or_default(),
                    stderr: stderr.join().unwrap_or_default(),
                });
            }
            Ok(None) => {}
            Err(source) => {
                kill_quietly(&mut child);
                return Err(ExecError::Io {
                    command: label,
                    source,
                });
            }
        }
        if Instant::now() >= deadline {
            kill_quietly(&mut child);
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(ExecError::Timeout {
                command: label,
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn command_label(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}
