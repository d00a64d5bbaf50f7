//! Core backlog types: issues, identifiers and gate kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::IssueStatus;

/// Priority assigned to issues created without an explicit one.
pub const DEFAULT_PRIORITY: i64 = 2;

static EVENT_NONCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueId(pub String);

impl IssueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Path- and branch-safe rendering of the id.
    ///
    /// Ids that are already safe are used as-is. Anything rewritten gets a
    /// hash of the raw id appended, so `a/b` and `a_b` never share a
    /// workspace or branch.
    pub fn slug(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 9);
        let mut rewritten = false;
        for ch in self.0.chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                out.push(ch);
            } else {
                out.push('_');
                rewritten = true;
            }
        }
        if out.is_empty() || out.starts_with('.') {
            out.insert_str(0, "issue");
            rewritten = true;
        }
        if rewritten {
            out.push_str(&format!("-{:08x}", fnv1a(self.0.as_bytes())));
        }
        out
    }
}

/// 32-bit FNV-1a. Slugs end up in branch names, so the hash must not
/// change between builds.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IssueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Worker ids embed the issue id and the claim time so a reclaimed
    /// issue never reuses the id of its previous worker.
    pub fn for_issue(issue_id: &IssueId, at: DateTime<Utc>) -> Self {
        Self(format!(
            "w-{}-{}",
            issue_id.slug(),
            at.timestamp_nanos_opt().unwrap_or_default()
        ))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate(tag: &str, at: DateTime<Utc>) -> Self {
        let nonce = EVENT_NONCE.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "E-{tag}-{}-{nonce}",
            at.timestamp_nanos_opt().unwrap_or_default()
        ))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quality checkpoints an issue may require before merge.
///
/// The set is closed: every variant maps to exactly one verification
/// command template in configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum GateKind {
    Lint,
    TestRunner,
    CodexReview,
    SecurityReview,
    Build,
}

impl GateKind {
    pub const ALL: [GateKind; 5] = [
        GateKind::Lint,
        GateKind::TestRunner,
        GateKind::CodexReview,
        GateKind::SecurityReview,
        GateKind::Build,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Lint => "lint",
            GateKind::TestRunner => "test-runner",
            GateKind::CodexReview => "codex-review",
            GateKind::SecurityReview => "security-review",
            GateKind::Build => "build",
        }
    }
}

impl std::str::FromStr for GateKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('_', "-");
        GateKind::ALL
            .into_iter()
            .find(|gate| gate.as_str() == normalized)
            .ok_or_else(|| {
                let valid = GateKind::ALL
                    .iter()
                    .map(|gate| gate.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("unknown gate type '{}'. valid values: {valid}", value.trim())
            })
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A note attached to an issue (completion summaries, reopen reasons).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Intake request for a new issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub id: IssueId,
    pub title: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub blocking_ids: Vec<IssueId>,
    #[serde(default)]
    pub required_gates: Vec<GateKind>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl NewIssue {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: IssueId::new(id),
            title: title.into(),
            priority: DEFAULT_PRIORITY,
            blocking_ids: Vec::new(),
            required_gates: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by(mut self, dep: impl Into<String>) -> Self {
        self.blocking_ids.push(IssueId::new(dep));
        self
    }

    pub fn with_gate(mut self, gate: GateKind) -> Self {
        if !self.required_gates.contains(&gate) {
            self.required_gates.push(gate);
        }
        self
    }
}

/// A unit of backlog work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub status: IssueStatus,
    /// Lower is more urgent.
    pub priority: i64,
    /// Insertion order assigned by the store.
    pub seq: i64,
    #[serde(default)]
    pub blocking_ids: Vec<IssueId>,
    #[serde(default)]
    pub required_gates: Vec<GateKind>,
    pub assigned_worker: Option<WorkerId>,
    pub workspace_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Vec<IssueNote>,
    #[serde(default)]
    pub reopen_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn from_new(new: NewIssue, seq: i64, at: DateTime<Utc>) -> Self {
        let mut required_gates = Vec::with_capacity(new.required_gates.len());
        for gate in new.required_gates {
            if !required_gates.contains(&gate) {
                required_gates.push(gate);
            }
        }
        Self {
            id: new.id,
            title: new.title,
            status: IssueStatus::Open,
            priority: new.priority,
            seq,
            blocking_ids: new.blocking_ids,
            required_gates,
            assigned_worker: None,
            workspace_path: None,
            notes: Vec::new(),
            reopen_count: 0,
            created_at: at,
            updated_at: at,
            closed_at: None,
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// True when every blocking id is in `closed`.
    pub fn dependencies_resolved(&self, closed: &HashSet<IssueId>) -> bool {
        self.blocking_ids.iter().all(|dep| closed.contains(dep))
    }

    pub fn last_note(&self) -> Option<&str> {
        self.notes.last().map(|note| note.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_kind_parses_kebab_and_snake_case() {
        assert_eq!("test-runner".parse::<GateKind>(), Ok(GateKind::TestRunner));
        assert_eq!("codex_review".parse::<GateKind>(), Ok(GateKind::CodexReview));
        assert_eq!(" LINT ".parse::<GateKind>(), Ok(GateKind::Lint));
    }

    #[test]
    fn unknown_gate_kind_lists_valid_values() {
        let err = "fuzz".parse::<GateKind>().expect_err("unknown gate");
        assert!(err.contains("unknown gate type 'fuzz'"));
        assert!(err.contains("test-runner"));
    }

    #[test]
    fn gate_kind_serializes_as_kebab_case() {
        let json = serde_json::to_string(&GateKind::SecurityReview).unwrap();
        assert_eq!(json, "\"security-review\"");
        let err = serde_json::from_str::<GateKind>("\"unit-tests\"");
        assert!(err.is_err());
    }

    #[test]
    fn slug_replaces_path_separators() {
        assert_eq!(IssueId::new("bd-12").slug(), "bd-12");
        assert!(IssueId::new("a/b c").slug().starts_with("a_b_c-"));
        assert!(IssueId::new("..").slug().starts_with("issue..-"));
    }

    #[test]
    fn rewritten_slugs_do_not_collide_with_safe_ids() {
        let slash = IssueId::new("a/b").slug();
        let space = IssueId::new("a b").slug();
        assert_ne!(slash, "a_b");
        assert_ne!(slash, space);
        assert_eq!(slash, IssueId::new("a/b").slug());
        assert_eq!(slash.len(), "a_b-".len() + 8);
    }

    #[test]
    fn from_new_dedupes_gates_and_starts_open() {
        let new = NewIssue {
            id: IssueId::new("A"),
            title: "A".to_string(),
            priority: 1,
            blocking_ids: Vec::new(),
            required_gates: vec![GateKind::Lint, GateKind::Lint, GateKind::TestRunner],
        };
        let issue = Issue::from_new(new, 7, Utc::now());
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.seq, 7);
        assert_eq!(
            issue.required_gates,
            vec![GateKind::Lint, GateKind::TestRunner]
        );
    }

    #[test]
    fn dependencies_resolved_requires_every_blocker_closed() {
        let issue = Issue::from_new(
            NewIssue::new("D", "D").blocked_by("A").blocked_by("B"),
            1,
            Utc::now(),
        );
        let mut closed = HashSet::new();
        closed.insert(IssueId::new("A"));
        assert!(!issue.dependencies_resolved(&closed));
        closed.insert(IssueId::new("B"));
        assert!(issue.dependencies_resolved(&closed));
    }

    #[test]
    fn new_issue_deserializes_with_defaults() {
        let new: NewIssue = toml::from_str(
            r#"
id = "bd-1"
title = "Add endpoint"
required_gates = ["lint", "test-runner"]
"#,
        )
        .expect("deserialize new issue");
        assert_eq!(new.priority, DEFAULT_PRIORITY);
        assert!(new.blocking_ids.is_empty());
        assert_eq!(new.required_gates, vec![GateKind::Lint, GateKind::TestRunner]);
    }

    #[test]
    fn event_ids_are_unique_for_same_instant() {
        let at = Utc::now();
        let a = EventId::generate("claim", at);
        let b = EventId::generate("claim", at);
        assert_ne!(a, b);
    }
}
