//! Worker pool: bounded allocation of ready issues to worker sessions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wave_agents::{render_spawn_spec, SessionHandle};
use wave_core::{CompletionSignal, EventKind, Issue, IssueId, WorkerId, WorkerState};

use crate::dependency_graph::ready_set;
use crate::runtime::{RuntimeError, SessionRole, WaveRuntime};

/// One implementation worker tracked by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub issue_id: IssueId,
    pub worker_id: WorkerId,
    /// `None` for orphans adopted after a restart.
    pub handle: Option<SessionHandle>,
    pub workspace: Option<PathBuf>,
    pub state: WorkerState,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub stale_since: Option<DateTime<Utc>>,
    pub fingerprint: Option<u64>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub closed_seen_at: Option<DateTime<Utc>>,
    pub completion: Option<CompletionSignal>,
}

impl Worker {
    fn spawned(
        issue_id: IssueId,
        worker_id: WorkerId,
        handle: SessionHandle,
        workspace: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            issue_id,
            worker_id,
            handle: Some(handle),
            workspace: Some(workspace),
            state: WorkerState::Spawning,
            spawned_at: now,
            last_activity: now,
            stale_since: None,
            fingerprint: None,
            last_poll_at: None,
            closed_seen_at: None,
            completion: None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.handle.is_none()
    }

    /// Applies a lifecycle move if the state machine allows it.
    pub fn transition(&mut self, next: WorkerState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub spawned: Vec<IssueId>,
    pub races_lost: usize,
    pub setup_failures: usize,
    pub spawn_failures: usize,
}

impl AllocationReport {
    pub fn touched(&self) -> bool {
        !self.spawned.is_empty()
            || self.races_lost > 0
            || self.setup_failures > 0
            || self.spawn_failures > 0
    }
}

/// Sole owner of implementation workers.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: BTreeMap<IssueId, Worker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, issue_id: &IssueId) -> bool {
        self.workers.contains_key(issue_id)
    }

    pub fn get(&self, issue_id: &IssueId) -> Option<&Worker> {
        self.workers.get(issue_id)
    }

    pub fn get_mut(&mut self, issue_id: &IssueId) -> Option<&mut Worker> {
        self.workers.get_mut(issue_id)
    }

    pub fn issue_ids(&self) -> Vec<IssueId> {
        self.workers.keys().cloned().collect()
    }

    pub fn remove(&mut self, issue_id: &IssueId) -> Option<Worker> {
        self.workers.remove(issue_id)
    }

    /// Tracks an `in_progress` issue that has no live worker in this
    /// process. Orphans have no session; only polling and the staleness
    /// clock can settle them.
    pub fn adopt_orphan(&mut self, issue: &Issue, now: DateTime<Utc>) -> bool {
        if self.workers.contains_key(&issue.id) {
            return false;
        }
        let worker_id = issue
            .assigned_worker
            .clone()
            .unwrap_or_else(|| WorkerId::for_issue(&issue.id, now));
        self.workers.insert(
            issue.id.clone(),
            Worker {
                issue_id: issue.id.clone(),
                worker_id,
                handle: None,
                workspace: issue.workspace_path.clone(),
                state: WorkerState::Active,
                spawned_at: now,
                last_activity: now,
                stale_since: None,
                fingerprint: None,
                last_poll_at: None,
                closed_seen_at: None,
                completion: None,
            },
        );
        true
    }

    /// Fills free slots from the front of the ready-set. `reserved` counts
    /// slots held by sessions the pool does not own (verification workers).
    pub fn allocate(
        &mut self,
        rt: &WaveRuntime,
        now: DateTime<Utc>,
        reserved: usize,
    ) -> Result<AllocationReport, RuntimeError> {
        let mut report = AllocationReport::default();
        let max = rt.config.scheduler.max_concurrency;
        let free = max.saturating_sub(self.workers.len() + reserved);
        if free == 0 {
            return Ok(report);
        }

        let issues = rt.store.list()?;
        let candidates: Vec<IssueId> = ready_set(&issues)
            .into_iter()
            .filter(|id| !self.workers.contains_key(id))
            .collect();
        let mut open_slots = free;
        for issue_id in candidates {
            if open_slots == 0 {
                break;
            }
            let Some(issue) = issues.iter().find(|issue| issue.id == issue_id) else {
                continue;
            };
            if self.start(rt, issue, now, &mut report)? {
                open_slots -= 1;
            }
        }

        if report.touched() {
            info!(
                spawned = report.spawned.len(),
                races_lost = report.races_lost,
                setup_failures = report.setup_failures,
                spawn_failures = report.spawn_failures,
                active = self.workers.len(),
                "allocation pass"
            );
        }
        Ok(report)
    }

    /// Claim, isolate, spawn. Returns whether a slot was consumed.
    fn start(
        &mut self,
        rt: &WaveRuntime,
        issue: &Issue,
        now: DateTime<Utc>,
        report: &mut AllocationReport,
    ) -> Result<bool, RuntimeError> {
        let issue_id = &issue.id;
        let worker_id = WorkerId::for_issue(issue_id, now);
        if !rt.store.claim(issue_id, &worker_id, now)? {
            debug!(issue_id = %issue_id, "claim lost to another writer");
            report.races_lost += 1;
            return Ok(false);
        }
        rt.record(
            issue_id,
            now,
            EventKind::IssueClaimed {
                worker_id: worker_id.clone(),
            },
        );

        let workspace = match rt.isolator.create(issue_id) {
            Ok(workspace) => workspace,
            Err(err) => {
                warn!(issue_id = %issue_id, error = %err, "workspace setup failed, reverting claim");
                rt.store.revert_claim(issue_id, now)?;
                rt.record(
                    issue_id,
                    now,
                    EventKind::WorkspaceSetupFailed {
                        message: err.to_string(),
                    },
                );
                report.setup_failures += 1;
                return Ok(false);
            }
        };
        rt.store.set_workspace(issue_id, Some(&workspace.path), now)?;
        rt.record(
            issue_id,
            now,
            EventKind::WorkspaceCreated {
                path: workspace.path.clone(),
                branch: workspace.branch.clone(),
            },
        );

        let vars = rt.template_vars(issue, &workspace.path);
        let spec = render_spawn_spec(
            &rt.config.worker.template(),
            &workspace.path,
            &vars,
            &rt.session_env(issue_id, SessionRole::Worker),
        );
        let handle = match rt.host.spawn(&spec) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(issue_id = %issue_id, command = %spec.display(), error = %err, "worker spawn failed, reverting claim");
                rt.store.revert_claim(issue_id, now)?;
                rt.record(
                    issue_id,
                    now,
                    EventKind::SpawnFailed {
                        message: err.to_string(),
                    },
                );
                report.spawn_failures += 1;
                return Ok(false);
            }
        };

        if let Some(input) = &rt.config.worker.initial_input {
            if let Err(err) = rt.host.send_input(&handle, &vars.render(input)) {
                warn!(issue_id = %issue_id, error = %err, "failed to send initial input");
            }
        }

        info!(issue_id = %issue_id, worker_id = %worker_id, workspace = %workspace.path.display(), "worker spawned");
        rt.record(
            issue_id,
            now,
            EventKind::WorkerSpawned {
                worker_id: worker_id.clone(),
            },
        );
        self.workers.insert(
            issue_id.clone(),
            Worker::spawned(issue_id.clone(), worker_id, handle, workspace.path, now),
        );
        report.spawned.push(issue_id.clone());
        Ok(true)
    }
}
