use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::GitError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Thin wrapper over the `git` binary. Every call is bounded by `timeout`
/// when one is set; a call that exceeds it is killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
    pub timeout: Option<Duration>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            timeout: None,
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        command
            .current_dir(cwd)
            .args(&owned_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let rendered = render_command(&self.binary, &owned_args);
        let mut child = command.spawn().map_err(|source| GitError::Io {
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
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(limit) = self.timeout {
                        if started.elapsed() >= limit {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(GitError::Timeout {
                                command: rendered,
                                timeout_secs: limit.as_secs_f64(),
                            });
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(GitError::Io {
                        command: rendered,
                        source,
                    });
                }
            }
        };

        let stdout_bytes = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr_bytes = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let stdout = String::from_utf8(stdout_bytes).map_err(|source| GitError::NonUtf8Output {
            command: rendered.clone(),
            stream: "stdout",
            source,
        })?;
        let stderr = String::from_utf8(stderr_bytes).map_err(|source| GitError::NonUtf8Output {
            command: rendered.clone(),
            stream: "stderr",
            source,
        })?;

        if !status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(GitOutput { stdout, stderr })
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
