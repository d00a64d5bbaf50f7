//! Hybrid push/poll completion detection and staleness tracking.
//!
//! Push messages are authoritative on arrival. Polling reads the store on
//! a fixed interval and settles a closed issue once the push grace window
//! has passed. Either path may fire first; the other becomes a no-op.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wave_agents::{detect_input_prompt, output_fingerprint, HostError};
use wave_core::{CompletionSignal, DetectorSection, EventKind, IssueId, IssueStatus, WorkerState};
use wave_notify::PushMessage;

use crate::runtime::{RuntimeError, WaveRuntime};
use crate::scheduler::{Worker, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub poll_interval: Duration,
    pub push_grace: Duration,
    pub stale_after: Duration,
    pub stale_kill_after: Duration,
    pub output_lines: usize,
}

impl DetectorSettings {
    pub fn from_section(section: &DetectorSection) -> Self {
        Self {
            poll_interval: secs(section.poll_interval_secs),
            push_grace: secs(section.push_grace_secs),
            stale_after: secs(section.stale_after_secs),
            stale_kill_after: secs(section.stale_kill_after_secs),
            output_lines: section.output_lines,
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Issues whose workers completed this pass; they are now `closed`.
    pub completed: Vec<(IssueId, CompletionSignal)>,
    pub failed: Vec<IssueId>,
    pub went_stale: Vec<IssueId>,
    pub killed: Vec<IssueId>,
    pub pushes_ignored: usize,
}

impl DetectionReport {
    pub fn touched(&self) -> bool {
        !self.completed.is_empty()
            || !self.failed.is_empty()
            || !self.went_stale.is_empty()
            || !self.killed.is_empty()
    }
}

/// Why a worker is being torn down without completing.
enum Teardown {
    /// The process is gone or hung; the issue goes back to `open`.
    Revert(String),
    /// The store already moved the issue elsewhere; leave it alone.
    Abandon(String),
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    settings: DetectorSettings,
}

impl CompletionDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// One detection pass over every pooled worker. Terminal workers are
    /// removed from the pool before this returns.
    pub fn observe(
        &self,
        pool: &mut WorkerPool,
        rt: &WaveRuntime,
        pushes: Vec<PushMessage>,
        now: DateTime<Utc>,
    ) -> Result<DetectionReport, RuntimeError> {
        let mut report = DetectionReport::default();

        for message in pushes {
            if !self.apply_push(pool, rt, &message, now)? {
                report.pushes_ignored += 1;
            }
        }

        for issue_id in pool.issue_ids() {
            let Some(worker) = pool.get_mut(&issue_id) else {
                continue;
            };
            if worker.state.is_terminal() {
                continue;
            }
            if let Some(teardown) = self.check_worker(worker, rt, now, &mut report)? {
                self.tear_down(worker, rt, teardown, now, &mut report)?;
            }
        }

        for issue_id in pool.issue_ids() {
            let terminal = pool
                .get(&issue_id)
                .map(|worker| worker.state.is_terminal())
                .unwrap_or(false);
            if !terminal {
                continue;
            }
            let Some(worker) = pool.remove(&issue_id) else {
                continue;
            };
            if worker.state == WorkerState::Completed {
                kill_session(rt, &worker);
                let via = worker.completion.unwrap_or(CompletionSignal::Poll);
                info!(issue_id = %issue_id, via = %via, "worker completed");
                rt.record(
                    &issue_id,
                    now,
                    EventKind::WorkerCompleted {
                        worker_id: worker.worker_id.clone(),
                        via,
                    },
                );
                report.completed.push((issue_id, via));
            }
        }

        Ok(report)
    }

    /// Returns whether the message changed anything.
    fn apply_push(
        &self,
        pool: &mut WorkerPool,
        rt: &WaveRuntime,
        message: &PushMessage,
        now: DateTime<Utc>,
    ) -> Result<bool, RuntimeError> {
        let issue_id = message.issue_id();
        let Some(worker) = pool.get_mut(issue_id) else {
            debug!(issue_id = %issue_id, "push for unknown worker ignored");
            return Ok(false);
        };
        if worker.state.is_terminal() {
            debug!(issue_id = %issue_id, "duplicate push ignored");
            return Ok(false);
        }

        let Some(issue) = rt.store.get(issue_id)? else {
            return Ok(false);
        };
        let closed = match issue.status {
            IssueStatus::InProgress => {
                let closed_now = rt.store.close(issue_id, message.summary(), now)?;
                if closed_now {
                    rt.record(
                        issue_id,
                        now,
                        EventKind::IssueClosed {
                            summary: message.summary().to_string(),
                        },
                    );
                    true
                } else {
                    // Lost to a concurrent `wave close`; fine if it landed.
                    rt.store.require(issue_id)?.status == IssueStatus::Closed
                }
            }
            IssueStatus::Closed => true,
            IssueStatus::Open | IssueStatus::Blocked => false,
        };
        if !closed {
            debug!(issue_id = %issue_id, status = %issue.status, "push for issue that is not in progress ignored");
            return Ok(false);
        }

        worker.transition(WorkerState::Completed);
        worker.completion = Some(CompletionSignal::Push);
        Ok(true)
    }

    fn check_worker(
        &self,
        worker: &mut Worker,
        rt: &WaveRuntime,
        now: DateTime<Utc>,
        report: &mut DetectionReport,
    ) -> Result<Option<Teardown>, RuntimeError> {
        let issue_id = worker.issue_id.clone();

        // Poll path. Once a close has been seen, keep checking every pass
        // until the grace window settles it.
        let poll_due = worker.closed_seen_at.is_some()
            || worker
                .last_poll_at
                .map_or(true, |last| now - last >= self.settings.poll_interval);
        let mut issue_closed = false;
        if poll_due {
            worker.last_poll_at = Some(now);
            let Some(issue) = rt.store.get(&issue_id)? else {
                return Ok(Some(Teardown::Abandon("issue no longer exists".to_string())));
            };
            match issue.status {
                IssueStatus::Closed => {
                    issue_closed = true;
                    let seen = *worker.closed_seen_at.get_or_insert(now);
                    let closed_at = issue.closed_at.unwrap_or(seen);
                    if now - closed_at >= self.settings.push_grace {
                        worker.transition(WorkerState::Completed);
                        worker.completion = Some(CompletionSignal::Poll);
                        return Ok(None);
                    }
                }
                IssueStatus::InProgress
                    if issue.assigned_worker.as_ref() != Some(&worker.worker_id) =>
                {
                    return Ok(Some(Teardown::Abandon(
                        "issue was claimed by another worker".to_string(),
                    )));
                }
                IssueStatus::InProgress => {}
                IssueStatus::Open | IssueStatus::Blocked => {
                    return Ok(Some(Teardown::Abandon(format!(
                        "issue was moved to {} externally",
                        issue.status
                    ))));
                }
            }
        }

        if let Some(handle) = worker.handle.clone() {
            let exited = rt.host.status(&handle).has_exited();
            let captured = rt.host.capture_output(&handle, self.settings.output_lines);
            let gone = matches!(captured, Err(HostError::UnknownSession { .. }));
            if exited || gone {
                let status = rt.store.require(&issue_id)?.status;
                if status == IssueStatus::Closed {
                    // Closed then exited: no push can follow from a dead process.
                    worker.transition(WorkerState::Completed);
                    worker.completion = Some(CompletionSignal::Poll);
                    return Ok(None);
                }
                return Ok(Some(Teardown::Revert(
                    "worker exited without closing its issue".to_string(),
                )));
            }
            match captured {
                Ok(output) => self.observe_output(worker, rt, &output, now),
                Err(err) => debug!(issue_id = %issue_id, error = %err, "output capture failed"),
            }
        }

        if worker.state == WorkerState::Spawning {
            worker.transition(WorkerState::Active);
        }

        // A closed issue inside its grace window is not stale.
        if issue_closed {
            return Ok(None);
        }

        let idle = now - worker.last_activity;
        match worker.stale_since {
            None if idle >= self.settings.stale_after => {
                worker.transition(WorkerState::Stale);
                worker.stale_since = Some(now);
                warn!(issue_id = %issue_id, idle_secs = idle.num_seconds(), "worker went stale");
                rt.record(
                    &issue_id,
                    now,
                    EventKind::WorkerStale {
                        worker_id: worker.worker_id.clone(),
                        idle_secs: idle.num_seconds(),
                    },
                );
                report.went_stale.push(issue_id);
            }
            Some(since) if now - since >= self.settings.stale_kill_after => {
                return Ok(Some(Teardown::Revert(format!(
                    "no activity for {}s",
                    idle.num_seconds()
                ))));
            }
            _ => {}
        }
        Ok(None)
    }

    fn observe_output(&self, worker: &mut Worker, rt: &WaveRuntime, output: &str, now: DateTime<Utc>) {
        let fingerprint = output_fingerprint(output);
        if worker.fingerprint == Some(fingerprint) {
            return;
        }
        worker.fingerprint = Some(fingerprint);
        worker.last_activity = now;
        worker.stale_since = None;

        if let Some(prompt) = detect_input_prompt(output) {
            if worker.transition(WorkerState::AwaitingInput) {
                info!(issue_id = %worker.issue_id, prompt = %prompt, "worker is waiting for input");
                rt.record(
                    &worker.issue_id,
                    now,
                    EventKind::WorkerAwaitingInput {
                        worker_id: worker.worker_id.clone(),
                    },
                );
            }
        } else {
            worker.transition(WorkerState::Active);
        }
    }

    fn tear_down(
        &self,
        worker: &mut Worker,
        rt: &WaveRuntime,
        teardown: Teardown,
        now: DateTime<Utc>,
        report: &mut DetectionReport,
    ) -> Result<(), RuntimeError> {
        let issue_id = worker.issue_id.clone();

        match teardown {
            Teardown::Revert(reason) => {
                let reverted = rt.store.revert_claim(&issue_id, now)?;
                if !reverted && rt.store.require(&issue_id)?.status == IssueStatus::Closed {
                    // Closed since the last poll; settle it instead of dropping the work.
                    info!(issue_id = %issue_id, "issue closed before teardown, completing worker");
                    worker.transition(WorkerState::Completed);
                    worker.completion = Some(CompletionSignal::Poll);
                    return Ok(());
                }
                worker.transition(WorkerState::Failed);
                kill_session(rt, worker);
                warn!(issue_id = %issue_id, reason = %reason, "killing worker and reverting issue");
                rt.record(
                    &issue_id,
                    now,
                    EventKind::WorkerKilled {
                        worker_id: worker.worker_id.clone(),
                        reason: reason.clone(),
                    },
                );
                if reverted {
                    rt.record(&issue_id, now, EventKind::ClaimReverted { reason });
                }
                report.killed.push(issue_id);
            }
            Teardown::Abandon(reason) => {
                worker.transition(WorkerState::Failed);
                kill_session(rt, worker);
                warn!(issue_id = %issue_id, reason = %reason, "worker failed");
                rt.record(
                    &issue_id,
                    now,
                    EventKind::WorkerFailed {
                        worker_id: worker.worker_id.clone(),
                        reason,
                    },
                );
                report.failed.push(issue_id);
            }
        }
        Ok(())
    }
}

fn kill_session(rt: &WaveRuntime, worker: &Worker) {
    if let Some(handle) = &worker.handle {
        if let Err(err) = rt.host.kill(handle) {
            warn!(issue_id = %worker.issue_id, error = %err, "failed to kill worker session");
        }
    }
}
