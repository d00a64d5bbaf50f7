//! SQLite-backed backlog store.
//!
//! The store is the single writer of issue status. Every mutation is a
//! named operation that runs as one SQL statement or one immediate
//! transaction, so compare-and-set semantics hold across threads sharing a
//! `BacklogStore` and across processes sharing the database file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;
use wave_core::{
    has_errors, Event, GateKind, GateResult, Issue, IssueId, IssueNote, IssueStatus, NewIssue,
    Validate, ValidationIssue, WorkerId,
};

use crate::dependency_graph::DependencyGraph;

const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid status '{value}' stored for issue {issue_id}")]
    InvalidStatus { issue_id: IssueId, value: String },
    #[error("issue not found: {id}")]
    NotFound { id: IssueId },
    #[error("issue already exists: {id}")]
    DuplicateIssue { id: IssueId },
    #[error("issue id {id} maps to workspace '{slug}', already used by {existing}")]
    SlugCollision {
        id: IssueId,
        existing: IssueId,
        slug: String,
    },
    #[error("cyclic dependency: {}", render_cycle(.cycle))]
    CyclicDependency { cycle: Vec<IssueId> },
    #[error("invalid issue: {}", render_validation(.issues))]
    InvalidIssue { issues: Vec<ValidationIssue> },
    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: IssueId,
        from: IssueStatus,
        to: IssueStatus,
    },
}

fn render_cycle(cycle: &[IssueId]) -> String {
    cycle
        .iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_validation(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug)]
pub struct BacklogStore {
    conn: Mutex<Connection>,
}

const ISSUE_COLUMNS: &str = "seq, issue_id, title, status, priority, blocking_json, gates_json, \
     assigned_worker, workspace_path, notes_json, reopen_count, created_at, updated_at, \
     closed_at, archived_at";

/// Raw column values; converted outside the rusqlite row closure so JSON
/// and timestamp errors keep their own variants.
struct IssueRow {
    seq: i64,
    issue_id: String,
    title: String,
    status: String,
    priority: i64,
    blocking_json: String,
    gates_json: String,
    assigned_worker: Option<String>,
    workspace_path: Option<String>,
    notes_json: String,
    reopen_count: u32,
    created_at: String,
    updated_at: String,
    closed_at: Option<String>,
    archived_at: Option<String>,
}

impl IssueRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            issue_id: row.get(1)?,
            title: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            blocking_json: row.get(5)?,
            gates_json: row.get(6)?,
            assigned_worker: row.get(7)?,
            workspace_path: row.get(8)?,
            notes_json: row.get(9)?,
            reopen_count: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            closed_at: row.get(13)?,
            archived_at: row.get(14)?,
        })
    }

    fn into_issue(self) -> Result<Issue, StoreError> {
        let id = IssueId(self.issue_id);
        let status = self
            .status
            .parse::<IssueStatus>()
            .map_err(|_| StoreError::InvalidStatus {
                issue_id: id.clone(),
                value: self.status.clone(),
            })?;
        Ok(Issue {
            id,
            title: self.title,
            status,
            priority: self.priority,
            seq: self.seq,
            blocking_ids: serde_json::from_str(&self.blocking_json)?,
            required_gates: serde_json::from_str(&self.gates_json)?,
            assigned_worker: self.assigned_worker.map(WorkerId),
            workspace_path: self.workspace_path.map(PathBuf::from),
            notes: serde_json::from_str(&self.notes_json)?,
            reopen_count: self.reopen_count,
            created_at: parse_ts(self.created_at)?,
            updated_at: parse_ts(self.updated_at)?,
            closed_at: self.closed_at.map(parse_ts).transpose()?,
            archived_at: self.archived_at.map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse { value, source })
}

impl BacklogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\nPRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS issues (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    blocking_json TEXT NOT NULL,
    gates_json TEXT NOT NULL,
    assigned_worker TEXT,
    workspace_path TEXT,
    notes_json TEXT NOT NULL,
    reopen_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    closed_at TEXT,
    archived_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);

CREATE TABLE IF NOT EXISTS gate_results (
    result_id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    gate TEXT NOT NULL,
    passed INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gate_results_issue ON gate_results(issue_id, recorded_at);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    issue_id TEXT,
    at TEXT NOT NULL,
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_issue_at ON events(issue_id, at);
"#,
        )?;
        Ok(())
    }

    /// Inserts a new `open` issue. Rejects invalid intake, duplicate ids
    /// and any edge set that would close a dependency cycle.
    pub fn create_issue(&self, new: NewIssue, now: DateTime<Utc>) -> Result<Issue, StoreError> {
        let problems = new.validate();
        if has_errors(&problems) {
            return Err(StoreError::InvalidIssue { issues: problems });
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if issue_exists(&tx, &new.id)? {
            return Err(StoreError::DuplicateIssue { id: new.id });
        }
        if let Some(existing) = slug_owner(&tx, &new.id)? {
            return Err(StoreError::SlugCollision {
                slug: new.id.slug(),
                id: new.id,
                existing,
            });
        }
        let mut graph = load_graph(&tx)?;
        graph.insert_issue(&new.id, &new.blocking_ids);
        if let Some(cycle) = graph.find_cycle() {
            return Err(StoreError::CyclicDependency { cycle });
        }

        let issue = Issue::from_new(new, 0, now);
        tx.execute(
            r#"
INSERT INTO issues (issue_id, title, status, priority, blocking_json, gates_json,
                    notes_json, reopen_count, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', 0, ?7, ?7)
"#,
            params![
                issue.id.0,
                issue.title,
                issue.status.as_str(),
                issue.priority,
                serde_json::to_string(&issue.blocking_ids)?,
                serde_json::to_string(&issue.required_gates)?,
                now.to_rfc3339(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        debug!(issue_id = %issue.id, seq, "issue created");
        Ok(Issue { seq, ..issue })
    }

    pub fn get(&self, id: &IssueId) -> Result<Option<Issue>, StoreError> {
        let conn = self.conn();
        load_issue(&conn, id)
    }

    /// Like [`get`](Self::get) but a missing issue is an error.
    pub fn require(&self, id: &IssueId) -> Result<Issue, StoreError> {
        self.get(id)?
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    /// All issues in insertion order.
    pub fn list(&self) -> Result<Vec<Issue>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {ISSUE_COLUMNS} FROM issues ORDER BY seq ASC"))?;
        let rows = stmt.query_map([], IssueRow::from_row)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?.into_issue()?);
        }
        Ok(issues)
    }

    pub fn list_by_status(&self, status: IssueStatus) -> Result<Vec<Issue>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE status = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], IssueRow::from_row)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?.into_issue()?);
        }
        Ok(issues)
    }

    /// Atomic status compare-and-set. Returns `false` when the issue was not
    /// in `expected` at the time of the write.
    pub fn compare_and_set_status(
        &self,
        id: &IssueId,
        expected: IssueStatus,
        new: IssueStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from: expected,
                to: new,
            });
        }
        let conn = self.conn();
        let changed = conn.execute(
            r#"
UPDATE issues
SET status = ?3,
    updated_at = ?4,
    closed_at = CASE WHEN ?3 = 'closed' THEN ?4 ELSE closed_at END
WHERE issue_id = ?1 AND status = ?2
"#,
            params![id.0, expected.as_str(), new.as_str(), now.to_rfc3339()],
        )?;
        settle(&conn, id, changed)
    }

    /// open -> in_progress, recording the claiming worker.
    pub fn claim(
        &self,
        id: &IssueId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
UPDATE issues
SET status = 'in_progress', assigned_worker = ?2, updated_at = ?3
WHERE issue_id = ?1 AND status = 'open'
"#,
            params![id.0, worker_id.0, now.to_rfc3339()],
        )?;
        settle(&conn, id, changed)
    }

    /// in_progress -> open, clearing the assignment. The workspace path is
    /// kept so the next claim resumes on the same branch.
    pub fn revert_claim(&self, id: &IssueId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
UPDATE issues
SET status = 'open', assigned_worker = NULL, updated_at = ?2
WHERE issue_id = ?1 AND status = 'in_progress'
"#,
            params![id.0, now.to_rfc3339()],
        )?;
        settle(&conn, id, changed)
    }

    /// in_progress -> closed. A non-empty summary is appended as a note.
    pub fn close(&self, id: &IssueId, summary: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition_with_note(
            id,
            r#"
UPDATE issues
SET status = 'closed', closed_at = ?2, updated_at = ?2
WHERE issue_id = ?1 AND status = 'in_progress'
"#,
            summary,
            now,
        )
    }

    /// closed (and not archived) -> open after a gate or build failure.
    pub fn reopen(&self, id: &IssueId, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition_with_note(
            id,
            r#"
UPDATE issues
SET status = 'open', assigned_worker = NULL, closed_at = NULL,
    reopen_count = reopen_count + 1, updated_at = ?2
WHERE issue_id = ?1 AND status = 'closed' AND archived_at IS NULL
"#,
            reason,
            now,
        )
    }

    /// closed -> blocked once the reopen budget is spent.
    pub fn block(&self, id: &IssueId, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition_with_note(
            id,
            r#"
UPDATE issues
SET status = 'blocked', assigned_worker = NULL, updated_at = ?2
WHERE issue_id = ?1 AND status = 'closed' AND archived_at IS NULL
"#,
            reason,
            now,
        )
    }

    /// Manual release of a blocked issue; resets its reopen budget.
    pub fn unblock(&self, id: &IssueId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
UPDATE issues
SET status = 'open', reopen_count = 0, closed_at = NULL, updated_at = ?2
WHERE issue_id = ?1 AND status = 'blocked'
"#,
            params![id.0, now.to_rfc3339()],
        )?;
        settle(&conn, id, changed)
    }

    /// Marks a merged issue archived. It stays `closed`.
    pub fn archive(&self, id: &IssueId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
UPDATE issues
SET archived_at = ?2, workspace_path = NULL, assigned_worker = NULL, updated_at = ?2
WHERE issue_id = ?1 AND status = 'closed' AND archived_at IS NULL
"#,
            params![id.0, now.to_rfc3339()],
        )?;
        settle(&conn, id, changed)
    }

    pub fn set_workspace(
        &self,
        id: &IssueId,
        path: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE issues SET workspace_path = ?2, updated_at = ?3 WHERE issue_id = ?1",
            params![
                id.0,
                path.map(|p| p.to_string_lossy().into_owned()),
                now.to_rfc3339()
            ],
        )?;
        settle(&conn, id, changed).map(|_| ())
    }

    pub fn add_note(&self, id: &IssueId, text: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !issue_exists(&tx, id)? {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        push_note(&tx, id, text, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Adds `id` blocked-by `on`. Returns `false` when the edge exists.
    pub fn add_dependency(
        &self,
        id: &IssueId,
        on: &IssueId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(issue) = load_issue(&tx, id)? else {
            return Err(StoreError::NotFound { id: id.clone() });
        };
        if issue.blocking_ids.contains(on) {
            return Ok(false);
        }

        let mut graph = load_graph(&tx)?;
        graph.add_edge(id, on);
        if let Some(cycle) = graph.find_cycle() {
            return Err(StoreError::CyclicDependency { cycle });
        }

        let mut blocking = issue.blocking_ids;
        blocking.push(on.clone());
        tx.execute(
            "UPDATE issues SET blocking_json = ?2, updated_at = ?3 WHERE issue_id = ?1",
            params![id.0, serde_json::to_string(&blocking)?, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn record_gate_result(&self, result: &GateResult) -> Result<(), StoreError> {
        let payload = serde_json::to_string(result)?;
        self.conn().execute(
            r#"
INSERT INTO gate_results (issue_id, gate, passed, recorded_at, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                result.issue_id.0,
                result.gate.as_str(),
                result.passed,
                result.recorded_at.to_rfc3339(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Audit trail of gate results for one issue, oldest first.
    pub fn gate_results_for(&self, id: &IssueId) -> Result<Vec<GateResult>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM gate_results WHERE issue_id = ?1 ORDER BY result_id ASC",
        )?;
        let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for row in rows {
            let payload = row?;
            results.push(serde_json::from_str::<GateResult>(&payload)?);
        }
        Ok(results)
    }

    /// Gates whose most recent result at or after `since` passed.
    pub fn passed_gates_since(
        &self,
        id: &IssueId,
        since: DateTime<Utc>,
    ) -> Result<HashSet<GateKind>, StoreError> {
        let mut latest: Vec<GateResult> = Vec::new();
        for result in self.gate_results_for(id)? {
            if result.recorded_at < since {
                continue;
            }
            latest.retain(|prior| prior.gate != result.gate);
            latest.push(result);
        }
        Ok(latest
            .into_iter()
            .filter(|result| result.passed)
            .map(|result| result.gate)
            .collect())
    }

    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;
        self.conn().execute(
            r#"
INSERT INTO events (event_id, issue_id, at, kind_tag, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                event.id.0,
                event.issue_id.as_ref().map(|id| id.0.clone()),
                event.at.to_rfc3339(),
                event.kind.tag(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for(&self, id: &IssueId) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM events WHERE issue_id = ?1 ORDER BY at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<Event>(&payload)?);
        }
        Ok(events)
    }

    fn transition_with_note(
        &self,
        id: &IssueId,
        update_sql: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(update_sql, params![id.0, now.to_rfc3339()])?;
        if changed == 0 {
            return settle(&tx, id, changed);
        }
        if !note.trim().is_empty() {
            push_note(&tx, id, note, now)?;
        }
        tx.commit()?;
        Ok(true)
    }
}

/// Turns an UPDATE row count into the CAS answer, distinguishing "lost the
/// race" from "no such issue".
fn settle(conn: &Connection, id: &IssueId, changed: usize) -> Result<bool, StoreError> {
    if changed > 0 {
        return Ok(true);
    }
    if issue_exists(conn, id)? {
        Ok(false)
    } else {
        Err(StoreError::NotFound { id: id.clone() })
    }
}

fn issue_exists(conn: &Connection, id: &IssueId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT seq FROM issues WHERE issue_id = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// An existing issue whose workspace and branch names would clash with `id`.
fn slug_owner(conn: &Connection, id: &IssueId) -> Result<Option<IssueId>, StoreError> {
    let slug = id.slug();
    let mut stmt = conn.prepare("SELECT issue_id FROM issues")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for row in rows {
        let existing = IssueId(row?);
        if existing.slug() == slug {
            return Ok(Some(existing));
        }
    }
    Ok(None)
}

fn load_issue(conn: &Connection, id: &IssueId) -> Result<Option<Issue>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE issue_id = ?1"),
            params![id.0],
            IssueRow::from_row,
        )
        .optional()?;
    row.map(IssueRow::into_issue).transpose()
}

fn load_graph(tx: &Transaction<'_>) -> Result<DependencyGraph, StoreError> {
    let mut stmt = tx.prepare("SELECT issue_id, blocking_json FROM issues")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut graph = DependencyGraph::default();
    for row in rows {
        let (id, blocking_json) = row?;
        let blockers: Vec<IssueId> = serde_json::from_str(&blocking_json)?;
        graph.insert_issue(&IssueId(id), &blockers);
    }
    Ok(graph)
}

fn push_note(conn: &Connection, id: &IssueId, text: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
    let raw: String = conn.query_row(
        "SELECT notes_json FROM issues WHERE issue_id = ?1",
        params![id.0],
        |row| row.get(0),
    )?;
    let mut notes: Vec<IssueNote> = serde_json::from_str(&raw)?;
    notes.push(IssueNote {
        at: now,
        text: text.to_string(),
    });
    conn.execute(
        "UPDATE issues SET notes_json = ?2, updated_at = ?3 WHERE issue_id = ?1",
        params![id.0, serde_json::to_string(&notes)?, now.to_rfc3339()],
    )?;
    Ok(())
}
