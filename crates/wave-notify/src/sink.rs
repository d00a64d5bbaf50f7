//! Push channel transports.
//!
//! Delivery is best effort: a message that cannot be decoded is logged and
//! dropped, and the controller's poll fallback covers anything lost.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::types::PushMessage;

static FILE_NONCE: AtomicU64 = AtomicU64::new(1);

/// Sending half, used by workers and the `notify` command.
pub trait PushSink: Send + Sync {
    fn deliver(&self, message: &PushMessage) -> Result<(), NotifyError>;
}

/// Receiving half, drained by the controller once per tick.
pub trait PushSource: Send + Sync {
    fn drain(&self) -> Vec<PushMessage>;
}

/// One JSON file per message in a shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInbox {
    dir: PathBuf,
}

impl DirectoryInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the message atomically and returns its final path.
    pub fn write(&self, message: &PushMessage) -> Result<PathBuf, NotifyError> {
        fs::create_dir_all(&self.dir).map_err(|source| NotifyError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let body = serde_json::to_vec(message).map_err(|source| NotifyError::Encode { source })?;

        let name = format!(
            "{}-{}-{}-{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            std::process::id(),
            FILE_NONCE.fetch_add(1, Ordering::Relaxed),
            message.issue_id().slug()
        );
        let tmp = self.dir.join(format!(".tmp-{name}"));
        let path = self.dir.join(&name);
        fs::write(&tmp, body).map_err(|source| NotifyError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| NotifyError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl PushSink for DirectoryInbox {
    fn deliver(&self, message: &PushMessage) -> Result<(), NotifyError> {
        self.write(message).map(|_| ())
    }
}

impl PushSource for DirectoryInbox {
    fn drain(&self) -> Vec<PushMessage> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(inbox = %self.dir.display(), error = %err, "failed to read inbox");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                !name.starts_with(".tmp-") && name.ends_with(".json")
            })
            .collect();
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<PushMessage>(&bytes).map_err(|err| err.to_string())
                });
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove drained notification");
            }
            match parsed {
                Ok(message) => {
                    debug!(issue_id = %message.issue_id(), "received push notification");
                    messages.push(message);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "dropping unreadable notification");
                }
            }
        }
        messages
    }
}

/// In-process push channel.
pub fn channel() -> (ChannelSender, ChannelInbox) {
    let (tx, rx) = mpsc::channel();
    (
        ChannelSender { tx: Mutex::new(tx) },
        ChannelInbox { rx: Mutex::new(rx) },
    )
}

#[derive(Debug)]
pub struct ChannelSender {
    tx: Mutex<mpsc::Sender<PushMessage>>,
}

impl Clone for ChannelSender {
    fn clone(&self) -> Self {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Self { tx: Mutex::new(tx) }
    }
}

impl PushSink for ChannelSender {
    fn deliver(&self, message: &PushMessage) -> Result<(), NotifyError> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message.clone())
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

#[derive(Debug)]
pub struct ChannelInbox {
    rx: Mutex<mpsc::Receiver<PushMessage>>,
}

impl PushSource for ChannelInbox {
    fn drain(&self) -> Vec<PushMessage> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        rx.try_iter().collect()
    }
}
