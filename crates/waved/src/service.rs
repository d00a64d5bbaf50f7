//! Backlog service: intake and manual issue operations shared by the CLI
//! and the controller.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use wave_core::{
    Event, EventKind, GateKind, GateResult, Issue, IssueId, IssueStatus, NewIssue, WaveConfig,
};
use wave_notify::{DirectoryInbox, NotifyError, PushMessage};

use crate::dependency_graph::{closed_ids, ready_set, unresolved_blockers};
use crate::event_log::{EventLogError, Journal, JsonlEventLog};
use crate::store::{BacklogStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("issue not found: {id}")]
    IssueNotFound { id: IssueId },
    #[error("issue {issue_id} requires gate '{gate}' but no [gates.commands.{gate}] is configured")]
    GateNotConfigured { issue_id: IssueId, gate: GateKind },
    #[error("issue {id} is {status}; expected {expected}")]
    UnexpectedStatus {
        id: IssueId,
        status: IssueStatus,
        expected: &'static str,
    },
}

/// Everything `wave show` prints for one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueDetail {
    pub issue: Issue,
    pub waiting_on: Vec<IssueId>,
    pub gate_results: Vec<GateResult>,
    pub events: Vec<Event>,
}

pub struct WaveService {
    pub config: WaveConfig,
    pub store: Arc<BacklogStore>,
    pub journal: Journal,
}

impl WaveService {
    pub fn new(config: WaveConfig, store: Arc<BacklogStore>, event_log: Option<JsonlEventLog>) -> Self {
        let journal = Journal::new(Arc::clone(&store), event_log);
        Self {
            config,
            store,
            journal,
        }
    }

    /// Opens the configured store and event log, creating both if needed.
    pub fn open(config: WaveConfig) -> Result<Self, ServiceError> {
        let store = BacklogStore::open(config.sqlite_path())?;
        store.migrate()?;
        let event_log = JsonlEventLog::new(config.event_log_root());
        event_log.ensure_layout()?;
        Ok(Self::new(config, Arc::new(store), Some(event_log)))
    }

    pub fn add_issue(&self, new: NewIssue, now: DateTime<Utc>) -> Result<Issue, ServiceError> {
        if let Some(gate) = new
            .required_gates
            .iter()
            .copied()
            .find(|gate| self.config.gate_command(*gate).is_none())
        {
            return Err(ServiceError::GateNotConfigured {
                issue_id: new.id.clone(),
                gate,
            });
        }
        let issue = self.store.create_issue(new, now)?;
        self.journal.record(&issue.id, now, EventKind::IssueCreated);
        info!(issue_id = %issue.id, priority = issue.priority, "issue added");
        Ok(issue)
    }

    pub fn list(&self) -> Result<Vec<Issue>, ServiceError> {
        Ok(self.store.list()?)
    }

    /// The current ready-set, in scheduling order.
    pub fn ready(&self) -> Result<Vec<Issue>, ServiceError> {
        let issues = self.store.list()?;
        let order = ready_set(&issues);
        let mut ready = Vec::with_capacity(order.len());
        for id in order {
            if let Some(issue) = issues.iter().find(|issue| issue.id == id) {
                ready.push(issue.clone());
            }
        }
        Ok(ready)
    }

    pub fn show(&self, id: &IssueId) -> Result<IssueDetail, ServiceError> {
        let issues = self.store.list()?;
        let closed: HashSet<IssueId> = closed_ids(&issues);
        let issue = issues
            .into_iter()
            .find(|issue| &issue.id == id)
            .ok_or_else(|| ServiceError::IssueNotFound { id: id.clone() })?;
        Ok(IssueDetail {
            waiting_on: unresolved_blockers(&issue, &closed),
            gate_results: self.store.gate_results_for(id)?,
            events: self.store.events_for(id)?,
            issue,
        })
    }

    /// Worker-side completion: in_progress -> closed.
    pub fn close(&self, id: &IssueId, summary: &str, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if self.store.close(id, summary, now)? {
            self.journal.record(
                id,
                now,
                EventKind::IssueClosed {
                    summary: summary.to_string(),
                },
            );
            return Ok(());
        }
        let issue = self.store.require(id)?;
        if issue.status == IssueStatus::Closed {
            // Repeated close from the same worker.
            return Ok(());
        }
        Err(ServiceError::UnexpectedStatus {
            id: id.clone(),
            status: issue.status,
            expected: "in_progress",
        })
    }

    /// Drops a `worker-complete` message into the controller's inbox.
    pub fn notify(&self, id: &IssueId, summary: &str) -> Result<PathBuf, ServiceError> {
        let inbox = DirectoryInbox::new(self.config.inbox_dir());
        let path = inbox.write(&PushMessage::worker_complete(id.0.clone(), summary))?;
        Ok(path)
    }

    /// Manual reopen. A blocked issue is unblocked, which also resets its
    /// reopen budget.
    pub fn reopen(&self, id: &IssueId, reason: &str, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let issue = self.store.require(id)?;
        match issue.status {
            IssueStatus::Blocked => {
                self.store.unblock(id, now)?;
                if !reason.trim().is_empty() {
                    self.store.add_note(id, reason, now)?;
                }
                self.journal.record(id, now, EventKind::IssueUnblocked);
                Ok(())
            }
            IssueStatus::Closed if !issue.is_archived() => {
                if self.store.reopen(id, reason, now)? {
                    self.journal.record(
                        id,
                        now,
                        EventKind::IssueReopened {
                            reason: reason.to_string(),
                        },
                    );
                }
                Ok(())
            }
            status => Err(ServiceError::UnexpectedStatus {
                id: id.clone(),
                status,
                expected: "closed (unarchived) or blocked",
            }),
        }
    }

    pub fn depend(&self, id: &IssueId, on: &IssueId, now: DateTime<Utc>) -> Result<bool, ServiceError> {
        let added = self.store.add_dependency(id, on, now)?;
        if added {
            self.journal
                .record(id, now, EventKind::DependencyAdded { on: on.clone() });
        }
        Ok(added)
    }
}
