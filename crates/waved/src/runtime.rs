use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use wave_agents::{SessionHost, TemplateVars};
use wave_core::{has_errors, EventKind, Issue, IssueId, Validate, ValidationIssue, WaveConfig};
use wave_git::{discover_repo, GitCli, GitError, WorkspaceIsolator};

use crate::event_log::Journal;
use crate::service::{ServiceError, WaveService};
use crate::store::{BacklogStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("invalid configuration: {}", render_issues(.issues))]
    InvalidConfig { issues: Vec<ValidationIssue> },
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Role a spawned session plays, exported as `WAVE_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Worker,
    Gate,
}

impl SessionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionRole::Worker => "worker",
            SessionRole::Gate => "gate",
        }
    }
}

/// What a gate or build failure did to the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Reopened,
    Blocked,
    /// The issue was no longer closed; nothing changed.
    Skipped,
}

/// Shared handles every stage of the controller works through.
pub struct WaveRuntime {
    pub config: WaveConfig,
    pub store: Arc<BacklogStore>,
    pub journal: Journal,
    pub host: Arc<dyn SessionHost>,
    pub isolator: Arc<WorkspaceIsolator>,
}

impl WaveRuntime {
    /// Validates the config and attaches a git-backed isolator to the
    /// service's store and journal.
    pub fn from_service(
        service: &WaveService,
        host: Arc<dyn SessionHost>,
    ) -> Result<Self, RuntimeError> {
        let config = service.config.clone();
        let issues = config.validate();
        if has_errors(&issues) {
            return Err(RuntimeError::InvalidConfig { issues });
        }
        for issue in &issues {
            warn!(code = issue.code, "{}", issue.message);
        }

        let git = GitCli::default().with_timeout(config.git_timeout());
        let repo = discover_repo(&config.repo.root, &git)?;
        info!(repo = %repo.root.display(), trunk = %config.repo.trunk, "repository discovered");
        let isolator = WorkspaceIsolator::new(
            repo,
            git,
            config.repo.workspace_root.clone(),
            config.repo.branch_prefix.clone(),
            config.repo.trunk.clone(),
        );
        Ok(Self {
            config,
            store: Arc::clone(&service.store),
            journal: service.journal.clone(),
            host,
            isolator: Arc::new(isolator),
        })
    }

    pub fn record(&self, issue_id: &IssueId, at: DateTime<Utc>, kind: EventKind) {
        self.journal.record(issue_id, at, kind);
    }

    pub fn template_vars(&self, issue: &Issue, workspace: &Path) -> TemplateVars {
        TemplateVars::new()
            .set("issue_id", issue.id.0.clone())
            .set("title", issue.title.clone())
            .set("workspace", workspace.display().to_string())
            .set("notify_dir", self.config.inbox_dir().display().to_string())
            .set("store", self.config.sqlite_path().display().to_string())
            .set("trunk", self.config.repo.trunk.clone())
    }

    pub fn session_env(&self, issue_id: &IssueId, role: SessionRole) -> Vec<(&'static str, String)> {
        vec![
            ("WAVE_ISSUE_ID", issue_id.0.clone()),
            ("WAVE_ROLE", role.as_str().to_string()),
            ("WAVE_NOTIFY_DIR", self.config.inbox_dir().display().to_string()),
            ("WAVE_STORE", self.config.sqlite_path().display().to_string()),
        ]
    }

    /// Sends a failed issue back to `open`, or parks it as `blocked` once
    /// it has been reopened `max_reopens` times.
    pub fn reopen_or_block(
        &self,
        issue_id: &IssueId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, RuntimeError> {
        let issue = self.store.require(issue_id)?;
        if issue.reopen_count >= self.config.gates.max_reopens {
            if self.store.block(issue_id, reason, now)? {
                warn!(issue_id = %issue_id, reopens = issue.reopen_count, "reopen budget spent, issue blocked");
                self.record(
                    issue_id,
                    now,
                    EventKind::IssueBlocked {
                        reason: reason.to_string(),
                    },
                );
                return Ok(FailureOutcome::Blocked);
            }
            return Ok(FailureOutcome::Skipped);
        }
        if self.store.reopen(issue_id, reason, now)? {
            info!(issue_id = %issue_id, "issue reopened");
            self.record(
                issue_id,
                now,
                EventKind::IssueReopened {
                    reason: reason.to_string(),
                },
            );
            return Ok(FailureOutcome::Reopened);
        }
        Ok(FailureOutcome::Skipped)
    }
}
