//! Quality gates: verification workers that must pass before a closed
//! issue is eligible to merge.
//!
//! Each issue's required gates run one after another in their own
//! session. Verification sessions occupy slots from the same concurrency
//! budget as implementation workers.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wave_agents::{render_spawn_spec, SessionHandle};
use wave_core::{EventKind, GateKind, GateResult, Issue, IssueId, IssueStatus};
use wave_gates::{prepare_result_file, ReportPoll, ReportWatcher};

use crate::runtime::{FailureOutcome, RuntimeError, SessionRole, WaveRuntime};

/// Findings listed in a reopen note before the rest are elided.
const REASON_FINDINGS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunningGate {
    gate: GateKind,
    handle: SessionHandle,
    watcher: ReportWatcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GatePlan {
    issue_id: IssueId,
    remaining: VecDeque<GateKind>,
    running: Option<RunningGate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateAdvance {
    pub started: Vec<(IssueId, GateKind)>,
    /// Issues whose every required gate has passed.
    pub passed: Vec<IssueId>,
    pub reopened: Vec<IssueId>,
    pub blocked: Vec<IssueId>,
}

impl GateAdvance {
    pub fn touched(&self) -> bool {
        !self.started.is_empty()
            || !self.passed.is_empty()
            || !self.reopened.is_empty()
            || !self.blocked.is_empty()
    }
}

enum StepResult {
    Keep,
    Done,
}

#[derive(Debug, Default)]
pub struct GateRunner {
    plans: VecDeque<GatePlan>,
}

impl GateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn contains(&self, issue_id: &IssueId) -> bool {
        self.plans.iter().any(|plan| &plan.issue_id == issue_id)
    }

    /// Verification sessions currently holding a concurrency slot.
    pub fn active_sessions(&self) -> usize {
        self.plans
            .iter()
            .filter(|plan| plan.running.is_some())
            .count()
    }

    /// Queues a closed issue for verification. Gates that already passed
    /// since the issue was last closed are not run again.
    pub fn enqueue(&mut self, rt: &WaveRuntime, issue: &Issue) -> Result<bool, RuntimeError> {
        if self.contains(&issue.id) || issue.status != IssueStatus::Closed || issue.is_archived() {
            return Ok(false);
        }
        let passed = match issue.closed_at {
            Some(closed_at) => rt.store.passed_gates_since(&issue.id, closed_at)?,
            None => Default::default(),
        };
        let remaining: VecDeque<GateKind> = issue
            .required_gates
            .iter()
            .copied()
            .filter(|gate| !passed.contains(gate))
            .collect();
        debug!(issue_id = %issue.id, gates = remaining.len(), "issue queued for verification");
        self.plans.push_back(GatePlan {
            issue_id: issue.id.clone(),
            remaining,
            running: None,
        });
        Ok(true)
    }

    /// Polls running verification sessions and starts queued gates while
    /// `free_slots` allows.
    pub fn advance(
        &mut self,
        rt: &WaveRuntime,
        now: DateTime<Utc>,
        free_slots: usize,
    ) -> Result<GateAdvance, RuntimeError> {
        let mut advance = GateAdvance::default();
        let mut free = free_slots;
        let mut kept = VecDeque::with_capacity(self.plans.len());
        while let Some(mut plan) = self.plans.pop_front() {
            match step(&mut plan, rt, now, &mut free, &mut advance) {
                Ok(StepResult::Keep) => kept.push_back(plan),
                Ok(StepResult::Done) => {}
                Err(err) => {
                    kept.push_back(plan);
                    kept.extend(self.plans.drain(..));
                    self.plans = kept;
                    return Err(err);
                }
            }
        }
        self.plans = kept;

        if advance.touched() {
            info!(
                started = advance.started.len(),
                passed = advance.passed.len(),
                reopened = advance.reopened.len(),
                blocked = advance.blocked.len(),
                running = self.active_sessions(),
                "gate pass"
            );
        }
        Ok(advance)
    }
}

fn step(
    plan: &mut GatePlan,
    rt: &WaveRuntime,
    now: DateTime<Utc>,
    free: &mut usize,
    advance: &mut GateAdvance,
) -> Result<StepResult, RuntimeError> {
    if let Some(running) = &plan.running {
        let exited = rt.host.status(&running.handle).has_exited();
        let result = match running.watcher.poll(now, exited) {
            ReportPoll::Pending => return Ok(StepResult::Keep),
            ReportPoll::Ready(report) => report.into_result(running.gate, plan.issue_id.clone(), now),
            ReportPoll::Invalid(message) => {
                GateResult::failed(running.gate, plan.issue_id.clone(), message, now)
            }
            ReportPoll::TimedOut => GateResult::failed(
                running.gate,
                plan.issue_id.clone(),
                format!("gate timed out after {}s", rt.config.gates.timeout_secs),
                now,
            ),
        };
        if let Err(err) = rt.host.kill(&running.handle) {
            warn!(issue_id = %plan.issue_id, error = %err, "failed to kill verification session");
        }
        plan.running = None;
        *free += 1;
        if !settle(rt, &result, now, advance)? {
            return Ok(StepResult::Done);
        }
    }

    let Some(gate) = plan.remaining.front().copied() else {
        info!(issue_id = %plan.issue_id, "all required gates passed");
        advance.passed.push(plan.issue_id.clone());
        return Ok(StepResult::Done);
    };
    if *free == 0 {
        return Ok(StepResult::Keep);
    }

    let Some(issue) = rt.store.get(&plan.issue_id)? else {
        return Ok(StepResult::Done);
    };
    if issue.status != IssueStatus::Closed || issue.is_archived() {
        debug!(issue_id = %plan.issue_id, status = %issue.status, "issue left closed state, dropping verification");
        return Ok(StepResult::Done);
    }

    plan.remaining.pop_front();
    match start_gate(rt, &issue, gate, now) {
        Ok(running) => {
            *free -= 1;
            advance.started.push((plan.issue_id.clone(), gate));
            plan.running = Some(running);
            Ok(StepResult::Keep)
        }
        Err(message) => {
            let result = GateResult::failed(gate, plan.issue_id.clone(), message, now);
            settle(rt, &result, now, advance)?;
            Ok(StepResult::Done)
        }
    }
}

/// Persists a gate result. A failure sends the issue back through
/// reopen-or-block; returns whether verification may continue.
fn settle(
    rt: &WaveRuntime,
    result: &GateResult,
    now: DateTime<Utc>,
    advance: &mut GateAdvance,
) -> Result<bool, RuntimeError> {
    let issue_id = &result.issue_id;
    rt.store.record_gate_result(result)?;
    rt.record(
        issue_id,
        now,
        EventKind::GateCompleted {
            gate: result.gate,
            passed: result.passed,
            summary: result.summary.clone(),
        },
    );
    if result.passed {
        info!(issue_id = %issue_id, gate = %result.gate, "gate passed");
        return Ok(true);
    }

    warn!(issue_id = %issue_id, gate = %result.gate, summary = %result.summary, "gate failed");
    match rt.reopen_or_block(issue_id, &result.reason(REASON_FINDINGS), now)? {
        FailureOutcome::Reopened => advance.reopened.push(issue_id.clone()),
        FailureOutcome::Blocked => advance.blocked.push(issue_id.clone()),
        FailureOutcome::Skipped => {}
    }
    Ok(false)
}

/// Spawns the verification worker for one gate. Errors are returned as the
/// failure summary to record.
fn start_gate(
    rt: &WaveRuntime,
    issue: &Issue,
    gate: GateKind,
    now: DateTime<Utc>,
) -> Result<RunningGate, String> {
    let template = rt
        .config
        .gate_command(gate)
        .ok_or_else(|| format!("no command configured for gate {gate}"))?;
    let workspace = rt
        .isolator
        .create(&issue.id)
        .map_err(|err| format!("workspace unavailable: {err}"))?;
    let result_file = prepare_result_file(&workspace.path, gate).map_err(|err| err.to_string())?;

    let vars = rt
        .template_vars(issue, &workspace.path)
        .set("gate", gate.as_str())
        .set("result_file", result_file.display().to_string());
    let mut env = rt.session_env(&issue.id, SessionRole::Gate);
    env.push(("WAVE_GATE", gate.as_str().to_string()));
    env.push(("WAVE_GATE_RESULT", result_file.display().to_string()));
    let spec = render_spawn_spec(template, &workspace.path, &vars, &env);

    let handle = rt.host.spawn(&spec).map_err(|err| {
        warn!(issue_id = %issue.id, gate = %gate, command = %spec.display(), error = %err, "verification spawn failed");
        format!("failed to start verification worker: {err}")
    })?;

    info!(issue_id = %issue.id, gate = %gate, "verification worker started");
    rt.record(&issue.id, now, EventKind::GateStarted { gate });
    let deadline = now + Duration::from_std(rt.config.gate_timeout()).unwrap_or_else(|_| Duration::days(365));
    Ok(RunningGate {
        gate,
        handle,
        watcher: ReportWatcher::new(result_file, deadline),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    use wave_agents::{HostError, ScriptedHost, ScriptedRun, SpawnSpec};
    use wave_core::NewIssue;

    use crate::runtime::test_support::{closed_issue, init_repo, runtime};
    use crate::service::WaveService;

    /// Verification worker that writes a verdict for every gate except
    /// those listed in `silent`.
    fn verdicts(fail: &'static [&'static str], silent: &'static [&'static str]) -> ScriptedHost {
        ScriptedHost::new(move |spec: &SpawnSpec| {
            let Some(gate) = spec.env_var("WAVE_GATE") else {
                return Ok(ScriptedRun::running());
            };
            if silent.contains(&gate) {
                return Ok(ScriptedRun::running());
            }
            let path = PathBuf::from(spec.env_var("WAVE_GATE_RESULT").unwrap_or_default());
            let body = if fail.contains(&gate) {
                r#"{"passed": false, "summary": "2 failing tests",
                    "issues": [{"file": "src/lib.rs", "line": 7, "detail": "assertion failed"}]}"#
            } else {
                r#"{"passed": true, "summary": "ok"}"#
            };
            fs::write(&path, body).map_err(|err| HostError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;
            Ok(ScriptedRun::exited(0))
        })
    }

    fn closed_with_gates(service: &WaveService, id: &str, gates: &[GateKind], now: DateTime<Utc>) -> Issue {
        let new = gates
            .iter()
            .fold(NewIssue::new(id, id), |new, gate| new.with_gate(*gate));
        closed_issue(service, new, now)
    }

    const BOTH: [GateKind; 2] = [GateKind::TestRunner, GateKind::CodexReview];

    #[test]
    fn gates_run_one_after_another_then_pass() {
        let (_dir, _root, config) = init_repo();
        let host = Arc::new(verdicts(&[], &[]));
        let (service, rt) = runtime(config, host.clone());
        let now = Utc::now();
        let issue = closed_with_gates(&service, "A", &BOTH, now);

        let mut gates = GateRunner::new();
        assert!(gates.enqueue(&rt, &issue).expect("enqueue"));
        assert!(!gates.enqueue(&rt, &issue).expect("enqueue twice"));

        let first = gates.advance(&rt, now, 1).expect("advance");
        assert_eq!(first.started, vec![(issue.id.clone(), GateKind::TestRunner)]);
        assert_eq!(gates.active_sessions(), 1);

        let second = gates.advance(&rt, now, 0).expect("advance");
        assert_eq!(second.started, vec![(issue.id.clone(), GateKind::CodexReview)]);

        let done = gates.advance(&rt, now, 0).expect("advance");
        assert_eq!(done.passed, vec![issue.id.clone()]);
        assert!(gates.is_empty());

        let sessions = host.spawned_for("A");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|(_, session)| session.killed));
        assert_eq!(sessions[0].1.spec.env_var("WAVE_ROLE"), Some("gate"));
        assert!(sessions[0]
            .1
            .spec
            .args
            .last()
            .expect("result file arg")
            .ends_with(".wave/gates/test-runner.json"));
        assert_eq!(
            service.store.passed_gates_since(&issue.id, now).expect("passed").len(),
            2
        );
    }

    #[test]
    fn failing_gate_reopens_with_findings() {
        let (_dir, _root, config) = init_repo();
        let (service, rt) = runtime(config, Arc::new(verdicts(&["test-runner"], &[])));
        let now = Utc::now();
        let issue = closed_with_gates(&service, "E", &BOTH, now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        gates.advance(&rt, now, 2).expect("start");
        let result = gates.advance(&rt, now, 2).expect("settle");

        assert_eq!(result.reopened, vec![issue.id.clone()]);
        assert!(gates.is_empty());
        let reopened = service.store.require(&issue.id).expect("load");
        assert_eq!(reopened.status, IssueStatus::Open);
        assert_eq!(reopened.reopen_count, 1);
        let note = reopened.last_note().expect("note");
        assert!(note.contains("test-runner gate failed: 2 failing tests"));
        assert!(note.contains("src/lib.rs:7 assertion failed"));
        let results = service.store.gate_results_for(&issue.id).expect("results");
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
    }

    #[test]
    fn exhausted_budget_blocks_instead_of_reopening() {
        let (_dir, _root, mut config) = init_repo();
        config.gates.max_reopens = 0;
        let (service, rt) = runtime(config, Arc::new(verdicts(&["codex-review"], &[])));
        let now = Utc::now();
        let issue = closed_with_gates(&service, "B", &[GateKind::CodexReview], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        gates.advance(&rt, now, 1).expect("start");
        let result = gates.advance(&rt, now, 1).expect("settle");
        assert_eq!(result.blocked, vec![issue.id.clone()]);
        assert_eq!(
            service.store.require(&issue.id).expect("load").status,
            IssueStatus::Blocked
        );
    }

    #[test]
    fn silent_verification_worker_times_out() {
        let (_dir, _root, mut config) = init_repo();
        config.gates.timeout_secs = 30;
        let host = Arc::new(verdicts(&[], &["test-runner"]));
        let (service, rt) = runtime(config, host.clone());
        let now = Utc::now();
        let issue = closed_with_gates(&service, "T", &[GateKind::TestRunner], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        gates.advance(&rt, now, 1).expect("start");
        assert!(!gates
            .advance(&rt, now + Duration::seconds(10), 1)
            .expect("pending")
            .touched());
        let result = gates
            .advance(&rt, now + Duration::seconds(31), 1)
            .expect("timeout");
        assert_eq!(result.reopened, vec![issue.id.clone()]);
        let results = service.store.gate_results_for(&issue.id).expect("results");
        assert!(results[0].summary.contains("timed out"));
        assert!(host.spawned_for("T")[0].1.killed);
    }

    #[test]
    fn exited_worker_without_result_fails_the_gate() {
        let (_dir, _root, config) = init_repo();
        let host = Arc::new(ScriptedHost::new(|_| Ok(ScriptedRun::exited(0))));
        let (service, rt) = runtime(config, host);
        let now = Utc::now();
        let issue = closed_with_gates(&service, "X", &[GateKind::TestRunner], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        gates.advance(&rt, now, 1).expect("start");
        let result = gates.advance(&rt, now, 1).expect("settle");
        assert_eq!(result.reopened, vec![issue.id.clone()]);
        let results = service.store.gate_results_for(&issue.id).expect("results");
        assert!(results[0].summary.contains("exited without a result"));
    }

    #[test]
    fn no_free_slot_means_no_verification_session() {
        let (_dir, _root, config) = init_repo();
        let host = Arc::new(verdicts(&[], &[]));
        let (service, rt) = runtime(config, host.clone());
        let now = Utc::now();
        let issue = closed_with_gates(&service, "A", &[GateKind::TestRunner], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        assert!(!gates.advance(&rt, now, 0).expect("advance").touched());
        assert!(host.spawned().is_empty());
        assert!(gates.contains(&issue.id));
    }

    #[test]
    fn issue_without_gates_passes_immediately() {
        let (_dir, _root, config) = init_repo();
        let (service, rt) = runtime(config, Arc::new(ScriptedHost::idle()));
        let now = Utc::now();
        let issue = closed_with_gates(&service, "N", &[], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        assert_eq!(gates.advance(&rt, now, 0).expect("advance").passed, vec![issue.id]);
    }

    #[test]
    fn gates_passed_since_close_are_not_rerun() {
        let (_dir, _root, config) = init_repo();
        let host = Arc::new(verdicts(&[], &[]));
        let (service, rt) = runtime(config, host.clone());
        let now = Utc::now();
        let issue = closed_with_gates(&service, "R", &BOTH, now);
        service
            .store
            .record_gate_result(&GateResult {
                gate: GateKind::TestRunner,
                issue_id: issue.id.clone(),
                passed: true,
                summary: "ok".to_string(),
                issues: Vec::new(),
                recorded_at: now,
            })
            .expect("record");

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        let first = gates.advance(&rt, now, 1).expect("advance");
        assert_eq!(first.started, vec![(issue.id.clone(), GateKind::CodexReview)]);
    }

    #[test]
    fn reopened_issue_drops_its_pending_gates() {
        let (_dir, _root, config) = init_repo();
        let host = Arc::new(verdicts(&[], &[]));
        let (service, rt) = runtime(config, host.clone());
        let now = Utc::now();
        let issue = closed_with_gates(&service, "M", &[GateKind::TestRunner], now);

        let mut gates = GateRunner::new();
        gates.enqueue(&rt, &issue).expect("enqueue");
        service.reopen(&issue.id, "manual", now).expect("reopen");
        assert!(!gates.advance(&rt, now, 1).expect("advance").touched());
        assert!(gates.is_empty());
        assert!(host.spawned().is_empty());
    }
}
