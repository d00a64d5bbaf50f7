use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::CompletionSignal;
use crate::types::{EventId, GateKind, IssueId, WorkerId};

/// One problem reported by a verification worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFinding {
    pub file: String,
    #[serde(default)]
    pub line: Option<u64>,
    pub detail: String,
}

/// Outcome of one gate for one issue. Persisted as an audit record and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateKind,
    pub issue_id: IssueId,
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<GateFinding>,
    pub recorded_at: DateTime<Utc>,
}

impl GateResult {
    pub fn failed(
        gate: GateKind,
        issue_id: IssueId,
        summary: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            gate,
            issue_id,
            passed: false,
            summary: summary.into(),
            issues: Vec::new(),
            recorded_at: at,
        }
    }

    /// Summary followed by up to `limit` findings, for reopen notes.
    pub fn reason(&self, limit: usize) -> String {
        let mut out = format!("{} gate failed: {}", self.gate, self.summary);
        for finding in self.issues.iter().take(limit) {
            match finding.line {
                Some(line) => {
                    out.push_str(&format!("\n- {}:{} {}", finding.file, line, finding.detail))
                }
                None => out.push_str(&format!("\n- {} {}", finding.file, finding.detail)),
            }
        }
        if self.issues.len() > limit {
            out.push_str(&format!("\n- ... {} more", self.issues.len() - limit));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IssueCreated,
    DependencyAdded {
        on: IssueId,
    },
    IssueClaimed {
        worker_id: WorkerId,
    },
    ClaimReverted {
        reason: String,
    },
    WorkspaceCreated {
        path: PathBuf,
        branch: String,
    },
    WorkspaceSetupFailed {
        message: String,
    },
    SpawnFailed {
        message: String,
    },
    WorkerSpawned {
        worker_id: WorkerId,
    },
    WorkerAwaitingInput {
        worker_id: WorkerId,
    },
    WorkerStale {
        worker_id: WorkerId,
        idle_secs: i64,
    },
    WorkerKilled {
        worker_id: WorkerId,
        reason: String,
    },
    WorkerCompleted {
        worker_id: WorkerId,
        via: CompletionSignal,
    },
    WorkerFailed {
        worker_id: WorkerId,
        reason: String,
    },
    OrphanAdopted,
    IssueClosed {
        summary: String,
    },
    GateStarted {
        gate: GateKind,
    },
    GateCompleted {
        gate: GateKind,
        passed: bool,
        summary: String,
    },
    IssueReopened {
        reason: String,
    },
    IssueBlocked {
        reason: String,
    },
    IssueUnblocked,
    MergeStarted,
    MergeConflict {
        files: Vec<String>,
    },
    BuildFailed {
        message: String,
    },
    MergeReverted,
    IssueArchived,
}

impl EventKind {
    /// Short tag used in event ids and log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::IssueCreated => "created",
            EventKind::DependencyAdded { .. } => "depend",
            EventKind::IssueClaimed { .. } => "claim",
            EventKind::ClaimReverted { .. } => "revert",
            EventKind::WorkspaceCreated { .. } => "workspace",
            EventKind::WorkspaceSetupFailed { .. } => "workspace-failed",
            EventKind::SpawnFailed { .. } => "spawn-failed",
            EventKind::WorkerSpawned { .. } => "spawn",
            EventKind::WorkerAwaitingInput { .. } => "awaiting-input",
            EventKind::WorkerStale { .. } => "stale",
            EventKind::WorkerKilled { .. } => "kill",
            EventKind::WorkerCompleted { .. } => "complete",
            EventKind::WorkerFailed { .. } => "worker-failed",
            EventKind::OrphanAdopted => "orphan",
            EventKind::IssueClosed { .. } => "close",
            EventKind::GateStarted { .. } => "gate-start",
            EventKind::GateCompleted { .. } => "gate",
            EventKind::IssueReopened { .. } => "reopen",
            EventKind::IssueBlocked { .. } => "block",
            EventKind::IssueUnblocked => "unblock",
            EventKind::MergeStarted => "merge-start",
            EventKind::MergeConflict { .. } => "conflict",
            EventKind::BuildFailed { .. } => "build-failed",
            EventKind::MergeReverted => "merge-revert",
            EventKind::IssueArchived => "archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub issue_id: Option<IssueId>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn for_issue(issue_id: &IssueId, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            id: EventId::generate(kind.tag(), at),
            issue_id: Some(issue_id.clone()),
            at,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_kind_serializes_with_snake_case_variant_names() {
        let kind = EventKind::MergeConflict {
            files: vec!["src/lib.rs".to_string()],
        };
        let json = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"merge_conflict": {"files": ["src/lib.rs"]}})
        );
        let unit = serde_json::to_value(EventKind::IssueArchived).expect("serialize");
        assert_eq!(unit, serde_json::json!("issue_archived"));
    }

    #[test]
    fn event_round_trips_with_completion_signal() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let event = Event::for_issue(
            &IssueId::new("A"),
            at,
            EventKind::WorkerCompleted {
                worker_id: WorkerId("w-A-1".to_string()),
                via: CompletionSignal::Poll,
            },
        );
        assert!(event.id.0.starts_with("E-complete-"));
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn gate_result_reason_truncates_findings() {
        let mut result = GateResult::failed(
            GateKind::TestRunner,
            IssueId::new("E"),
            "2 tests failed",
            Utc::now(),
        );
        result.issues = vec![
            GateFinding {
                file: "src/a.rs".to_string(),
                line: Some(10),
                detail: "assertion failed".to_string(),
            },
            GateFinding {
                file: "src/b.rs".to_string(),
                line: None,
                detail: "panicked".to_string(),
            },
        ];
        let reason = result.reason(1);
        assert!(reason.starts_with("test-runner gate failed: 2 tests failed"));
        assert!(reason.contains("src/a.rs:10 assertion failed"));
        assert!(!reason.contains("src/b.rs"));
        assert!(reason.contains("1 more"));
    }
}
