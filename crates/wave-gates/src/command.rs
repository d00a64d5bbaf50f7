use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::GateError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
}

impl ShellCommandOutput {
    /// Last `lines` lines of combined output, for failure summaries.
    pub fn tail(&self, lines: usize) -> String {
        let combined = format!("{}{}", self.stdout, self.stderr);
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Runs `command_line` through `shell_bin -c`, killing it once `timeout`
/// elapses. A killed command reports `timed_out` and `success == false`.
pub fn run_shell_command(
    cwd: &Path,
    shell_bin: &str,
    command_line: &str,
    timeout: Option<Duration>,
) -> Result<ShellCommandOutput, GateError> {
    let rendered = format!("{shell_bin} -c {command_line}");
    let mut child = Command::new(shell_bin)
        .arg("-c")
        .arg(command_line)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| GateError::Io {
            command: rendered.clone(),
            source,
        })?;

    let stdout_reader = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                    let _ = child.kill();
                    let _ = child.wait();
                    timed_out = true;
                    break None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                let _ = child.kill();
                return Err(GateError::Io {
                    command: rendered,
                    source,
                });
            }
        }
    };

    // Grandchildren may still hold the pipes after a kill; only join when
    // the command exited on its own.
    let (stdout, stderr) = if timed_out {
        (String::new(), String::new())
    } else {
        let out = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let err = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        (
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        )
    };

    Ok(ShellCommandOutput {
        exit_code: status.and_then(|s| s.code()),
        success: status.is_some_and(|s| s.success()),
        stdout,
        stderr,
        timed_out,
    })
}
