//! PTY-backed session host: one pseudo-terminal per worker.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, warn};

use crate::error::HostError;
use crate::host::SessionHost;
use crate::types::{OutputBuffer, SessionHandle, SessionStatus, SpawnSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for HostPtySize {
    fn default() -> Self {
        Self {
            rows: 40,
            cols: 120,
        }
    }
}

/// Decodes a byte stream read in chunks, holding back a multi-byte
/// character split across a chunk boundary until the rest arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    consumed += valid_up_to;
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += len;
                        }
                        // Incomplete sequence at the end; wait for more bytes.
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        out
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    output: Arc<Mutex<OutputBuffer>>,
    // Dropping the master closes the terminal; keep it for the session's life.
    _master: Box<dyn MasterPty + Send>,
}

pub struct PtySessionHost {
    pty_size: HostPtySize,
    buffer_lines: usize,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionHandle, PtySession>>,
}

impl Default for PtySessionHost {
    fn default() -> Self {
        Self::new(HostPtySize::default(), 2_000)
    }
}

impl PtySessionHost {
    pub fn new(pty_size: HostPtySize, buffer_lines: usize) -> Self {
        Self {
            pty_size,
            buffer_lines,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionHandle, PtySession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionHost for PtySessionHost {
    fn spawn(&self, spec: &SpawnSpec) -> Result<SessionHandle, HostError> {
        if spec.program.trim().is_empty() {
            return Err(HostError::InvalidRequest {
                message: "program must not be empty".to_string(),
            });
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.pty_size.rows,
                cols: self.pty_size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| HostError::PtySetup {
                message: err.to_string(),
            })?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(&spec.args);
        command.cwd(&spec.workdir);
        for (key, value) in &spec.env {
            if !key.trim().is_empty() {
                command.env(key, value);
            }
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|err| HostError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| HostError::PtySetup {
                message: err.to_string(),
            })?;
        let writer = pair.master.take_writer().map_err(|err| HostError::PtySetup {
            message: err.to_string(),
        })?;

        let handle = SessionHandle(format!(
            "pty-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let output = Arc::new(Mutex::new(OutputBuffer::new(self.buffer_lines)));
        let sink = Arc::clone(&output);
        let reader_handle = handle.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let mut decoder = Utf8Carry::default();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push_str(&text);
                    }
                    Err(_) => break,
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_str(&tail);
            }
            debug!(session = %reader_handle, "pty reader finished");
        });

        debug!(session = %handle, command = %spec.display(), workdir = %spec.workdir.display(), "spawned pty session");
        self.sessions().insert(
            handle.clone(),
            PtySession {
                child,
                writer,
                output,
                _master: pair.master,
            },
        );
        Ok(handle)
    }

    /// Writes `text` followed by a carriage return, submitting it as a line.
    fn send_input(&self, handle: &SessionHandle, text: &str) -> Result<(), HostError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(handle)
            .ok_or_else(|| HostError::UnknownSession {
                handle: handle.clone(),
            })?;
        let io_err = |source| HostError::Io {
            handle: handle.clone(),
            source,
        };
        session.writer.write_all(text.as_bytes()).map_err(io_err)?;
        session.writer.write_all(b"\r").map_err(io_err)?;
        session.writer.flush().map_err(io_err)
    }

    fn capture_output(&self, handle: &SessionHandle, lines: usize) -> Result<String, HostError> {
        let sessions = self.sessions();
        let session = sessions
            .get(handle)
            .ok_or_else(|| HostError::UnknownSession {
                handle: handle.clone(),
            })?;
        let output = session
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail(lines);
        Ok(output)
    }

    fn kill(&self, handle: &SessionHandle) -> Result<(), HostError> {
        let Some(mut session) = self.sessions().remove(handle) else {
            return Ok(());
        };
        if let Ok(None) = session.child.try_wait() {
            if let Err(err) = session.child.kill() {
                warn!(session = %handle, error = %err, "failed to kill pty session");
                return Err(HostError::Io {
                    handle: handle.clone(),
                    source: err,
                });
            }
            let _ = session.child.try_wait();
        }
        debug!(session = %handle, "pty session killed");
        Ok(())
    }

    fn status(&self, handle: &SessionHandle) -> SessionStatus {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(handle) else {
            return SessionStatus::Unknown;
        };
        match session.child.try_wait() {
            Ok(Some(status)) => SessionStatus::Exited(i32::try_from(status.exit_code()).ok()),
            Ok(None) => SessionStatus::Running,
            Err(_) => SessionStatus::Unknown,
        }
    }
}
