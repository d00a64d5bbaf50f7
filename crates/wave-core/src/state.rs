//! Issue status and worker lifecycle state machines.

use serde::{Deserialize, Serialize};

/// Backlog status of an issue. The store is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Closed,
    /// Exhausted its reopen budget; never auto-scheduled.
    Blocked,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 4] = [
        IssueStatus::Open,
        IssueStatus::InProgress,
        IssueStatus::Closed,
        IssueStatus::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Closed => "closed",
            IssueStatus::Blocked => "blocked",
        }
    }

    /// Whether a direct status transition is legal.
    ///
    /// Claim, revert, close, reopen and block are the only edges; manual
    /// unblock returns a blocked issue to `open`.
    pub fn can_transition_to(self, next: IssueStatus) -> bool {
        use IssueStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (InProgress, Open)
                | (InProgress, Closed)
                | (Closed, Open)
                | (Closed, Blocked)
                | (Blocked, Open)
        )
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "open" => Ok(IssueStatus::Open),
            "in_progress" => Ok(IssueStatus::InProgress),
            "closed" => Ok(IssueStatus::Closed),
            "blocked" => Ok(IssueStatus::Blocked),
            other => Err(format!("unknown issue status '{other}'")),
        }
    }
}

/// Lifecycle of one worker process as seen by the completion detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Active,
    AwaitingInput,
    Stale,
    Completed,
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Active => "active",
            WorkerState::AwaitingInput => "awaiting_input",
            WorkerState::Stale => "stale",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Failed)
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        if self == next {
            return false;
        }
        match self {
            Spawning => true,
            Active | AwaitingInput | Stale => next != Spawning,
            Completed | Failed => false,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which detection path observed a completion first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    Push,
    Poll,
}

impl CompletionSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionSignal::Push => "push",
            CompletionSignal::Poll => "poll",
        }
    }
}

impl std::fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
