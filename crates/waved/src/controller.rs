//! Wave controller: the outer loop tying allocation, completion detection,
//! verification and merging together.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wave_core::{EventKind, IssueId, IssueStatus};
use wave_notify::PushSource;

use crate::completion::{CompletionDetector, DetectorSettings};
use crate::dependency_graph::ready_set;
use crate::gate_runner::GateRunner;
use crate::merge::MergePipeline;
use crate::runtime::{RuntimeError, WaveRuntime};
use crate::scheduler::WorkerPool;

/// What one controller pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveTick {
    pub adopted: Vec<IssueId>,
    pub spawned: Vec<IssueId>,
    pub completed: Vec<IssueId>,
    pub killed: Vec<IssueId>,
    pub gates_started: usize,
    pub gates_passed: Vec<IssueId>,
    pub reopened: Vec<IssueId>,
    pub blocked: Vec<IssueId>,
    pub archived: Vec<IssueId>,
    pub conflicts: Vec<(IssueId, Vec<String>)>,
}

impl WaveTick {
    pub fn touched(&self) -> bool {
        !self.adopted.is_empty()
            || !self.spawned.is_empty()
            || !self.completed.is_empty()
            || !self.killed.is_empty()
            || self.gates_started > 0
            || !self.gates_passed.is_empty()
            || !self.reopened.is_empty()
            || !self.blocked.is_empty()
            || !self.archived.is_empty()
            || !self.conflicts.is_empty()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveReport {
    pub ticks: u64,
    pub archived: Vec<IssueId>,
    pub blocked: Vec<IssueId>,
    pub conflicts: Vec<(IssueId, Vec<String>)>,
    /// Stopped by a signal before the backlog drained.
    pub interrupted: bool,
}

impl WaveReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    fn absorb(&mut self, tick: &WaveTick) {
        self.ticks += 1;
        self.archived.extend(tick.archived.iter().cloned());
        self.blocked.extend(tick.blocked.iter().cloned());
        self.conflicts.extend(tick.conflicts.iter().cloned());
    }
}

pub struct WaveController {
    rt: WaveRuntime,
    pool: WorkerPool,
    detector: CompletionDetector,
    gates: GateRunner,
    merges: MergePipeline,
    inbox: Box<dyn PushSource>,
    recovered: bool,
    allocation_halted: bool,
    report: WaveReport,
}

impl WaveController {
    pub fn new(rt: WaveRuntime, inbox: Box<dyn PushSource>) -> Self {
        let detector = CompletionDetector::new(DetectorSettings::from_section(&rt.config.detector));
        Self {
            rt,
            pool: WorkerPool::new(),
            detector,
            gates: GateRunner::new(),
            merges: MergePipeline::new(),
            inbox,
            recovered: false,
            allocation_halted: false,
            report: WaveReport::default(),
        }
    }

    pub fn runtime(&self) -> &WaveRuntime {
        &self.rt
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn report(&self) -> &WaveReport {
        &self.report
    }

    pub fn allocation_halted(&self) -> bool {
        self.allocation_halted
    }

    /// Picks up where a previous controller left off: `in_progress` issues
    /// become orphans for the detector to settle, and closed but unmerged
    /// issues go back to verification.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<Vec<IssueId>, RuntimeError> {
        self.recovered = true;
        let mut adopted = Vec::new();
        for issue in self.rt.store.list_by_status(IssueStatus::InProgress)? {
            if self.pool.adopt_orphan(&issue, now) {
                warn!(issue_id = %issue.id, worker = ?issue.assigned_worker, "adopted orphaned in-progress issue");
                self.rt.record(&issue.id, now, EventKind::OrphanAdopted);
                adopted.push(issue.id);
            }
        }
        for issue in self.rt.store.list_by_status(IssueStatus::Closed)? {
            if !issue.is_archived() && self.gates.enqueue(&self.rt, &issue)? {
                info!(issue_id = %issue.id, "resuming verification for closed issue");
            }
        }
        Ok(adopted)
    }

    /// One pass of the loop.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<WaveTick, RuntimeError> {
        let mut tick = WaveTick::default();
        if !self.recovered {
            tick.adopted = self.recover(now)?;
        }

        // --- Phase 1: completions (push first, then poll and staleness) ---
        let pushes = self.inbox.drain();
        let detection = self.detector.observe(&mut self.pool, &self.rt, pushes, now)?;
        for (issue_id, _) in &detection.completed {
            self.enqueue_for_gates(issue_id)?;
            tick.completed.push(issue_id.clone());
        }
        tick.killed = detection.killed;

        // --- Phase 2: verification, sharing the concurrency budget ---
        let max = self.rt.config.scheduler.max_concurrency;
        let free = max.saturating_sub(self.pool.len() + self.gates.active_sessions());
        let gates = self.gates.advance(&self.rt, now, free)?;
        tick.gates_started = gates.started.len();
        tick.reopened.extend(gates.reopened);
        tick.blocked.extend(gates.blocked);
        for issue_id in &gates.passed {
            self.merges.enqueue(issue_id.clone());
        }
        tick.gates_passed = gates.passed;

        // --- Phase 3: merge and cleanup ---
        let merged = self.merges.process(&self.rt, now)?;
        for issue_id in &merged.regated {
            self.enqueue_for_gates(issue_id)?;
        }
        tick.archived = merged.archived;
        tick.reopened.extend(merged.reopened);
        tick.blocked.extend(merged.blocked);
        tick.conflicts = merged.conflicts;
        if !tick.conflicts.is_empty() && self.rt.config.scheduler.halt_on_conflict && !self.allocation_halted {
            warn!(conflicts = tick.conflicts.len(), "merge conflict, halting allocation for the rest of the run");
            self.allocation_halted = true;
        }

        // --- Phase 4: allocation ---
        if !self.allocation_halted {
            let allocation = self.pool.allocate(&self.rt, now, self.gates.active_sessions())?;
            tick.spawned = allocation.spawned;
        }

        self.report.absorb(&tick);
        if tick.touched() {
            debug!(
                workers = self.pool.len(),
                verifying = self.gates.active_sessions(),
                "tick complete"
            );
        }
        Ok(tick)
    }

    fn enqueue_for_gates(&mut self, issue_id: &IssueId) -> Result<(), RuntimeError> {
        if let Some(issue) = self.rt.store.get(issue_id)? {
            self.gates.enqueue(&self.rt, &issue)?;
        }
        Ok(())
    }

    /// True once there is nothing left to start and nothing in flight.
    pub fn is_idle(&self) -> Result<bool, RuntimeError> {
        if !self.pool.is_empty() || !self.gates.is_empty() || !self.merges.is_empty() {
            return Ok(false);
        }
        if self.allocation_halted {
            return Ok(true);
        }
        Ok(ready_set(&self.rt.store.list()?).is_empty())
    }

    /// Ticks until the backlog drains or `shutdown` is raised. In-progress
    /// issues left behind by a shutdown are recovered by the next run.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<WaveReport, RuntimeError> {
        info!(
            max_concurrency = self.rt.config.scheduler.max_concurrency,
            tick_ms = self.rt.config.scheduler.tick_interval_ms,
            "wave started"
        );
        loop {
            if shutdown.load(Ordering::Relaxed) {
                warn!(workers = self.pool.len(), "shutdown requested, stopping");
                self.report.interrupted = true;
                break;
            }
            self.tick(Utc::now())?;
            if self.is_idle()? {
                break;
            }
            std::thread::sleep(self.rt.config.tick_interval());
        }
        info!(
            ticks = self.report.ticks,
            archived = self.report.archived.len(),
            blocked = self.report.blocked.len(),
            conflicts = self.report.conflicts.len(),
            "wave finished"
        );
        Ok(self.report.clone())
    }

    pub fn run_once(&mut self, now: DateTime<Utc>) -> Result<WaveReport, RuntimeError> {
        self.tick(now)?;
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use chrono::Duration;
    use wave_agents::{ScriptedHost, ScriptedRun, SpawnSpec};
    use wave_core::{CompletionSignal, GateKind, NewIssue, WaveConfig};
    use wave_notify::{DirectoryInbox, PushMessage};

    use crate::runtime::test_support::{commit_file, init_repo};
    use crate::service::WaveService;
    use crate::store::BacklogStore;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Plan {
        /// Commit, close, push, keep running until killed.
        Finish,
        /// Like `Finish` but every such worker edits the same file.
        Conflict,
        /// Commit and close, then die before pushing.
        CrashAfterClose,
        /// Never produce anything.
        Hang,
    }

    #[derive(Debug, Default)]
    struct Script {
        plans: HashMap<String, Plan>,
        failing_gates: HashSet<(String, GateKind)>,
    }

    type Clock = Arc<Mutex<DateTime<Utc>>>;

    fn scripted_workers(store: Arc<BacklogStore>, script: Arc<Mutex<Script>>, clock: Clock) -> ScriptedHost {
        ScriptedHost::new(move |spec: &SpawnSpec| {
            let now = *clock.lock().expect("clock");
            let issue_id = IssueId::new(spec.env_var("WAVE_ISSUE_ID").unwrap_or_default());
            let script = script.lock().expect("script");

            if let Some(gate) = spec.env_var("WAVE_GATE") {
                let gate: GateKind = gate.parse().expect("gate kind");
                let verdict = if script.failing_gates.contains(&(issue_id.0.clone(), gate)) {
                    r#"{"passed": false, "summary": "2 tests failed"}"#
                } else {
                    r#"{"passed": true, "summary": "ok"}"#
                };
                fs::write(spec.env_var("WAVE_GATE_RESULT").expect("result path"), verdict)
                    .expect("write verdict");
                return Ok(ScriptedRun::exited(0));
            }

            let plan = script.plans.get(&issue_id.0).copied().unwrap_or(Plan::Finish);
            match plan {
                Plan::Hang => return Ok(ScriptedRun::running()),
                Plan::Conflict => commit_file(&spec.workdir, "shared.txt", &format!("{issue_id}\n")),
                Plan::Finish | Plan::CrashAfterClose => commit_file(
                    &spec.workdir,
                    &format!("{}.txt", issue_id.slug()),
                    &format!("{issue_id} at {now}\n"),
                ),
            }
            store.close(&issue_id, "implemented", now).expect("close");
            if plan == Plan::CrashAfterClose {
                return Ok(ScriptedRun::exited(137));
            }
            DirectoryInbox::new(spec.env_var("WAVE_NOTIFY_DIR").expect("notify dir"))
                .write(&PushMessage::worker_complete(issue_id.0.clone(), "implemented"))
                .expect("notify");
            Ok(ScriptedRun::running().with_output("done"))
        })
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        service: WaveService,
        host: Arc<ScriptedHost>,
        script: Arc<Mutex<Script>>,
        clock: Clock,
        t0: DateTime<Utc>,
        elapsed: i64,
        controller: WaveController,
    }

    fn controller_for(service: &WaveService, host: Arc<ScriptedHost>) -> WaveController {
        let rt = WaveRuntime::from_service(service, host).expect("runtime");
        let inbox = DirectoryInbox::new(rt.config.inbox_dir());
        WaveController::new(rt, Box::new(inbox))
    }

    impl Harness {
        fn new(tune: impl FnOnce(&mut WaveConfig)) -> Self {
            let (dir, root, mut config) = init_repo();
            config.detector.poll_interval_secs = 1;
            config.detector.push_grace_secs = 2;
            config.detector.stale_after_secs = 60;
            config.detector.stale_kill_after_secs = 30;
            config.scheduler.tick_interval_ms = 5;
            tune(&mut config);

            let service = WaveService::open(config).expect("service");
            let t0 = Utc::now();
            let clock = Arc::new(Mutex::new(t0));
            let script = Arc::new(Mutex::new(Script::default()));
            let host = Arc::new(scripted_workers(
                Arc::clone(&service.store),
                Arc::clone(&script),
                Arc::clone(&clock),
            ));
            let controller = controller_for(&service, host.clone());
            Self {
                _dir: dir,
                root,
                service,
                host,
                script,
                clock,
                t0,
                elapsed: 0,
                controller,
            }
        }

        fn plan(&self, id: &str, plan: Plan) {
            self.script
                .lock()
                .expect("script")
                .plans
                .insert(id.to_string(), plan);
        }

        fn fail_gate(&self, id: &str, gate: GateKind) {
            self.script
                .lock()
                .expect("script")
                .failing_gates
                .insert((id.to_string(), gate));
        }

        fn now(&self) -> DateTime<Utc> {
            self.t0 + Duration::seconds(self.elapsed)
        }

        fn add(&self, new: NewIssue) {
            self.service.add_issue(new, self.now()).expect("add issue");
        }

        fn tick_at(&mut self, elapsed: i64) -> WaveTick {
            self.elapsed = elapsed;
            let now = self.now();
            *self.clock.lock().expect("clock") = now;
            self.controller.tick(now).expect("tick")
        }

        fn tick(&mut self) -> WaveTick {
            self.tick_at(self.elapsed + 1)
        }

        fn run_until_idle(&mut self, max_ticks: usize) -> usize {
            for n in 1..=max_ticks {
                self.tick();
                if self.controller.is_idle().expect("idle") {
                    return n;
                }
            }
            panic!("controller still busy after {max_ticks} ticks");
        }

        fn status(&self, id: &str) -> IssueStatus {
            self.service
                .store
                .require(&IssueId::new(id))
                .expect("load")
                .status
        }

        fn archived(&self, id: &str) -> bool {
            self.service
                .store
                .require(&IssueId::new(id))
                .expect("load")
                .is_archived()
        }

        fn ready(&self) -> Vec<String> {
            self.service
                .ready()
                .expect("ready")
                .into_iter()
                .map(|issue| issue.id.0)
                .collect()
        }
    }

    fn ids(list: &[IssueId]) -> Vec<&str> {
        list.iter().map(|id| id.0.as_str()).collect()
    }

    #[test]
    fn third_issue_waits_for_a_free_slot() {
        let mut h = Harness::new(|_| {});
        h.plan("B", Plan::Hang);
        h.plan("C", Plan::Hang);
        for id in ["A", "B", "C"] {
            h.add(NewIssue::new(id, id));
        }

        let first = h.tick();
        assert_eq!(ids(&first.spawned), vec!["A", "B"]);
        assert_eq!(h.status("C"), IssueStatus::Open);

        let second = h.tick();
        assert_eq!(ids(&second.completed), vec!["A"]);
        assert_eq!(ids(&second.archived), vec!["A"]);
        assert_eq!(ids(&second.spawned), vec!["C"]);
        assert!(h.root.join("A.txt").exists());
        assert_eq!(h.host.spawned_for("A").len(), 1);
    }

    #[test]
    fn dependent_issue_waits_for_close_not_claim() {
        let mut h = Harness::new(|_| {});
        h.plan("A", Plan::Hang);
        h.plan("D", Plan::Hang);
        h.add(NewIssue::new("A", "a"));
        h.add(NewIssue::new("D", "d").blocked_by("A"));

        let first = h.tick();
        assert_eq!(ids(&first.spawned), vec!["A"]);
        assert_eq!(h.status("A"), IssueStatus::InProgress);
        assert!(h.ready().is_empty());
        assert_eq!(h.status("D"), IssueStatus::Open);

        h.service
            .close(&IssueId::new("A"), "done by hand", h.now())
            .expect("close A");
        assert_eq!(h.ready(), vec!["D"]);
        let second = h.tick();
        assert_eq!(ids(&second.spawned), vec!["D"]);
    }

    #[test]
    fn failed_gate_reopens_issue_with_reason() {
        let mut h = Harness::new(|_| {});
        h.fail_gate("E", GateKind::TestRunner);
        h.add(NewIssue::new("E", "e").with_gate(GateKind::TestRunner));

        assert_eq!(ids(&h.tick().spawned), vec!["E"]);
        h.plan("E", Plan::Hang);
        let verifying = h.tick();
        assert_eq!(ids(&verifying.completed), vec!["E"]);
        assert_eq!(verifying.gates_started, 1);
        assert_eq!(h.status("E"), IssueStatus::Closed);

        let failed = h.tick();
        assert_eq!(ids(&failed.reopened), vec!["E"]);
        assert!(failed.archived.is_empty());
        // Reopened straight into the ready-set and picked up again.
        assert_eq!(ids(&failed.spawned), vec!["E"]);

        let issue = h.service.store.require(&IssueId::new("E")).expect("load");
        assert_eq!(issue.reopen_count, 1);
        assert!(issue
            .notes
            .iter()
            .any(|note| note.text.contains("test-runner gate failed: 2 tests failed")));
        assert!(!h.root.join("E.txt").exists());
    }

    #[test]
    fn passing_gates_merge_and_clean_up() {
        let mut h = Harness::new(|_| {});
        h.add(
            NewIssue::new("F", "f")
                .with_gate(GateKind::CodexReview)
                .with_gate(GateKind::TestRunner),
        );
        let workspace = h.root.join(".wave/wt/F");

        h.tick();
        assert!(workspace.is_dir());
        h.run_until_idle(10);

        assert!(h.archived("F"));
        assert!(h.root.join("F.txt").exists());
        assert!(!workspace.exists());
        let branches = std::process::Command::new("git")
            .args(["branch", "--list", "wave/F"])
            .current_dir(&h.root)
            .output()
            .expect("git branch");
        assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());

        let results = h
            .service
            .store
            .gate_results_for(&IssueId::new("F"))
            .expect("results");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.passed));
        assert_eq!(h.controller.report().archived, vec![IssueId::new("F")]);
    }

    #[test]
    fn crash_after_close_is_caught_by_polling() {
        let mut h = Harness::new(|_| {});
        h.plan("G", Plan::CrashAfterClose);
        h.add(NewIssue::new("G", "g"));

        h.tick();
        let detected = h.tick();
        assert_eq!(ids(&detected.completed), vec!["G"]);
        assert!(detected.spawned.is_empty());
        h.run_until_idle(5);

        assert!(h.archived("G"));
        assert_eq!(h.host.spawned_for("G").len(), 1);
        let via_poll = h
            .service
            .store
            .events_for(&IssueId::new("G"))
            .expect("events")
            .into_iter()
            .any(|event| {
                matches!(
                    event.kind,
                    EventKind::WorkerCompleted {
                        via: CompletionSignal::Poll,
                        ..
                    }
                )
            });
        assert!(via_poll);
    }

    #[test]
    fn killed_worker_returns_issue_to_open_next_pass() {
        let mut h = Harness::new(|config| config.scheduler.max_concurrency = 1);
        h.plan("K", Plan::Hang);
        h.add(NewIssue::new("K", "k"));
        h.tick();
        let (handle, _) = h.host.spawned_for("K").remove(0);
        h.controller.runtime().host.kill(&handle).expect("kill");

        let next = h.tick();
        assert_eq!(ids(&next.killed), vec!["K"]);
        // Back in the ready-set, so the same pass hands it to a new worker.
        assert_eq!(ids(&next.spawned), vec!["K"]);
        let tags: Vec<_> = h
            .service
            .store
            .events_for(&IssueId::new("K"))
            .expect("events")
            .into_iter()
            .map(|event| event.kind.tag())
            .collect();
        assert!(tags.contains(&"revert"));
        assert_eq!(h.host.spawned_for("K").len(), 2);
    }

    #[test]
    fn fresh_controller_adopts_orphans_without_respawning() {
        let mut h = Harness::new(|_| {});
        h.plan("G", Plan::Hang);
        h.add(NewIssue::new("G", "g"));
        h.tick();

        let restarted = Arc::new(ScriptedHost::idle());
        h.controller = controller_for(&h.service, restarted.clone());
        let resumed = h.tick();
        assert_eq!(ids(&resumed.adopted), vec!["G"]);
        assert!(resumed.spawned.is_empty());

        h.service
            .close(&IssueId::new("G"), "finished while the controller was down", h.now())
            .expect("close");
        h.run_until_idle(10);
        assert!(h.archived("G"));
        assert!(restarted.spawned().is_empty());
    }

    #[test]
    fn orphan_without_worker_is_reverted_by_staleness() {
        let mut h = Harness::new(|_| {});
        h.plan("H", Plan::Hang);
        h.add(NewIssue::new("H", "h"));
        h.tick();

        let restarted = Arc::new(ScriptedHost::idle());
        h.controller = controller_for(&h.service, restarted.clone());
        h.tick();
        h.tick_at(70);
        let reverted = h.tick_at(101);
        assert_eq!(ids(&reverted.killed), vec!["H"]);
        assert_eq!(ids(&reverted.spawned), vec!["H"]);
        assert_eq!(restarted.spawned_for("H").len(), 1);
    }

    #[test]
    fn closed_unmerged_issues_resume_after_restart() {
        let mut h = Harness::new(|_| {});
        h.add(NewIssue::new("R", "r").with_gate(GateKind::TestRunner));
        h.tick();
        h.tick();
        assert_eq!(h.status("R"), IssueStatus::Closed);

        h.controller = controller_for(&h.service, h.host.clone());
        h.run_until_idle(10);
        assert!(h.archived("R"));
    }

    #[test]
    fn conflict_halts_allocation_when_configured() {
        let mut h = Harness::new(|config| config.scheduler.halt_on_conflict = true);
        h.plan("X", Plan::Conflict);
        h.plan("Y", Plan::Conflict);
        h.add(NewIssue::new("X", "x").with_priority(1));
        h.add(NewIssue::new("Y", "y").with_priority(1));
        h.add(NewIssue::new("Z", "z").with_priority(5));

        assert_eq!(ids(&h.tick().spawned), vec!["X", "Y"]);
        let merged = h.tick();
        assert_eq!(ids(&merged.archived), vec!["X"]);
        assert_eq!(merged.conflicts.len(), 1);
        assert_eq!(merged.conflicts[0].0, IssueId::new("Y"));
        assert!(merged.spawned.is_empty());

        assert!(h.controller.allocation_halted());
        assert!(h.controller.is_idle().expect("idle"));
        assert_eq!(h.status("Y"), IssueStatus::Closed);
        assert!(!h.archived("Y"));
        assert_eq!(h.status("Z"), IssueStatus::Open);
        assert!(h.controller.report().has_conflicts());
    }

    #[test]
    fn loop_keeps_going_while_issues_keep_arriving() {
        let mut h = Harness::new(|_| {});
        for round in 0..6 {
            h.add(NewIssue::new(format!("L{round}"), "injected"));
            h.tick();
            assert!(!h.controller.is_idle().expect("idle"));
        }
        let ticks = h.run_until_idle(30);
        assert!(ticks >= 1);
        for round in 0..6 {
            assert!(h.archived(&format!("L{round}")));
        }
        assert!(h.ready().is_empty());

        h.add(NewIssue::new("late", "late"));
        assert!(!h.controller.is_idle().expect("idle"));
        h.run_until_idle(10);
        assert!(h.archived("late"));
    }

    #[test]
    fn idle_controller_with_blocked_backlog_terminates() {
        let mut h = Harness::new(|config| config.gates.max_reopens = 0);
        h.fail_gate("E", GateKind::TestRunner);
        h.add(NewIssue::new("E", "e").with_gate(GateKind::TestRunner));
        h.run_until_idle(10);
        assert_eq!(h.status("E"), IssueStatus::Blocked);
        assert_eq!(h.controller.report().blocked, vec![IssueId::new("E")]);
    }

    #[test]
    fn run_drains_the_backlog_and_honours_shutdown() {
        let mut h = Harness::new(|_| {});
        h.add(NewIssue::new("A", "a"));
        let report = h.controller.run(&AtomicBool::new(false)).expect("run");
        assert_eq!(report.archived, vec![IssueId::new("A")]);
        assert!(!report.interrupted);

        h.add(NewIssue::new("B", "b"));
        let stopped = h.controller.run(&AtomicBool::new(true)).expect("run");
        assert!(stopped.interrupted);
        assert_eq!(h.status("B"), IssueStatus::Open);
    }
}
