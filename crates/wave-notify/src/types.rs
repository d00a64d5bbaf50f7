use serde::{Deserialize, Serialize};
use wave_core::IssueId;

/// Best-effort message from a worker to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushMessage {
    WorkerComplete {
        issue_id: IssueId,
        #[serde(default)]
        summary: String,
    },
}

impl PushMessage {
    pub fn worker_complete(issue_id: impl Into<String>, summary: impl Into<String>) -> Self {
        PushMessage::WorkerComplete {
            issue_id: IssueId::new(issue_id),
            summary: summary.into(),
        }
    }

    pub fn issue_id(&self) -> &IssueId {
        match self {
            PushMessage::WorkerComplete { issue_id, .. } => issue_id,
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            PushMessage::WorkerComplete { summary, .. } => summary,
        }
    }
}
