use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use wave_core::{Event, EventKind, IssueId};

use crate::store::BacklogStore;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only audit log: `global.jsonl` plus one file per issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub issue_dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let issue_dir = root.join("issues");
        Self {
            root,
            global_file,
            issue_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        for dir in [&self.root, &self.issue_dir] {
            fs::create_dir_all(dir).map_err(|source| EventLogError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn append(&self, event: &Event) -> Result<(), EventLogError> {
        self.ensure_layout()?;
        let line =
            serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
        append_line(&self.global_file, &line)?;
        if let Some(issue_id) = &event.issue_id {
            append_line(&self.issue_log_path(issue_id), &line)?;
        }
        Ok(())
    }

    pub fn issue_log_path(&self, issue_id: &IssueId) -> PathBuf {
        self.issue_dir.join(format!("{}.jsonl", issue_id.slug()))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), EventLogError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{line}").map_err(|source| EventLogError::Append {
        path: path.to_path_buf(),
        source,
    })
}

/// Records lifecycle events into the store's `events` table and, when
/// configured, the JSONL log. Failures are logged and swallowed so a
/// broken audit trail never stalls the controller.
#[derive(Debug, Clone)]
pub struct Journal {
    store: Arc<BacklogStore>,
    log: Option<JsonlEventLog>,
}

impl Journal {
    pub fn new(store: Arc<BacklogStore>, log: Option<JsonlEventLog>) -> Self {
        Self { store, log }
    }

    pub fn record(&self, issue_id: &IssueId, at: DateTime<Utc>, kind: EventKind) -> Event {
        let event = Event::for_issue(issue_id, at, kind);
        if let Err(err) = self.store.append_event(&event) {
            warn!(issue_id = %issue_id, event = event.kind.tag(), error = %err, "failed to persist event");
        }
        if let Some(log) = &self.log {
            if let Err(err) = log.append(&event) {
                warn!(issue_id = %issue_id, event = event.kind.tag(), error = %err, "failed to append event log");
            }
        }
        event
    }
}
