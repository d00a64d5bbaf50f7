//! Serialized trunk integration for validated issues.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use wave_core::{EventKind, GateKind, Issue, IssueId, IssueStatus};
use wave_gates::{run_build, BuildOutcome};
use wave_git::{merge_into_trunk, revert_to, MergeOutcome};

use crate::runtime::{FailureOutcome, RuntimeError, WaveRuntime};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub archived: Vec<IssueId>,
    pub conflicts: Vec<(IssueId, Vec<String>)>,
    /// Closed issues missing a passing result for a required gate.
    pub regated: Vec<IssueId>,
    pub reopened: Vec<IssueId>,
    pub blocked: Vec<IssueId>,
    pub errors: Vec<(IssueId, String)>,
}

impl MergeReport {
    pub fn touched(&self) -> bool {
        !self.archived.is_empty()
            || !self.conflicts.is_empty()
            || !self.regated.is_empty()
            || !self.reopened.is_empty()
            || !self.blocked.is_empty()
            || !self.errors.is_empty()
    }
}

/// FIFO merge queue. Only one merge runs at a time, in the main checkout.
///
/// An issue that conflicts (or hits a git error) is halted: it stays
/// `closed` and unarchived, and is not retried until it is closed again.
#[derive(Debug, Default)]
pub struct MergePipeline {
    queue: VecDeque<IssueId>,
    /// Halted issue -> the `closed_at` it was halted under.
    halted: BTreeMap<IssueId, Option<DateTime<Utc>>>,
}

impl MergePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, issue_id: IssueId) -> bool {
        if self.queue.contains(&issue_id) {
            return false;
        }
        self.queue.push_back(issue_id);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_halted(&self, issue_id: &IssueId) -> bool {
        self.halted.contains_key(issue_id)
    }

    pub fn halted(&self) -> Vec<IssueId> {
        self.halted.keys().cloned().collect()
    }

    /// Drains the queue, merging one issue at a time.
    pub fn process(&mut self, rt: &WaveRuntime, now: DateTime<Utc>) -> Result<MergeReport, RuntimeError> {
        let mut report = MergeReport::default();
        while let Some(issue_id) = self.queue.pop_front() {
            self.merge_one(rt, &issue_id, now, &mut report)?;
        }
        if report.touched() {
            info!(
                archived = report.archived.len(),
                conflicts = report.conflicts.len(),
                regated = report.regated.len(),
                reopened = report.reopened.len(),
                blocked = report.blocked.len(),
                errors = report.errors.len(),
                "merge pass"
            );
        }
        Ok(report)
    }

    fn merge_one(
        &mut self,
        rt: &WaveRuntime,
        issue_id: &IssueId,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> Result<(), RuntimeError> {
        let Some(issue) = rt.store.get(issue_id)? else {
            return Ok(());
        };
        if issue.status != IssueStatus::Closed || issue.is_archived() {
            debug!(issue_id = %issue_id, status = %issue.status, "skipping merge for issue that is not closed");
            return Ok(());
        }
        if let Some(halted_at) = self.halted.get(issue_id) {
            if *halted_at == issue.closed_at {
                debug!(issue_id = %issue_id, "merge halted for this issue");
                return Ok(());
            }
            self.halted.remove(issue_id);
        }

        let missing = missing_gates(rt, &issue)?;
        if !missing.is_empty() {
            warn!(issue_id = %issue_id, missing = ?missing, "required gates have not passed, sending back to verification");
            report.regated.push(issue_id.clone());
            return Ok(());
        }

        let isolator = &rt.isolator;
        let branch = isolator.branch_name(issue_id);
        rt.record(issue_id, now, EventKind::MergeStarted);
        info!(issue_id = %issue_id, branch = %branch, trunk = %isolator.trunk(), "merging");

        let outcome = match merge_into_trunk(isolator.repo(), isolator.git(), isolator.trunk(), &branch) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(issue_id = %issue_id, error = %err, "merge failed, halting issue");
                self.halted.insert(issue_id.clone(), issue.closed_at);
                report.errors.push((issue_id.clone(), err.to_string()));
                return Ok(());
            }
        };
        let pre_merge_sha = match outcome {
            MergeOutcome::Merged { pre_merge_sha, .. } => pre_merge_sha,
            MergeOutcome::Conflict { files } => {
                warn!(issue_id = %issue_id, files = ?files, "merge conflict, halting issue");
                rt.record(
                    issue_id,
                    now,
                    EventKind::MergeConflict {
                        files: files.clone(),
                    },
                );
                self.halted.insert(issue_id.clone(), issue.closed_at);
                report.conflicts.push((issue_id.clone(), files));
                return Ok(());
            }
        };

        let build = run_build(
            &isolator.repo().root,
            rt.config.merge.build_command.as_deref(),
            rt.config.build_timeout(),
        )
        .unwrap_or_else(|err| BuildOutcome::Failed {
            command: rt.config.merge.build_command.clone().unwrap_or_default(),
            message: err.to_string(),
        });
        if let BuildOutcome::Failed { message, .. } = build {
            return self.revert_failed_build(rt, &issue, &pre_merge_sha, &message, now, report);
        }

        self.finish(rt, &issue, now, report)
    }

    fn revert_failed_build(
        &mut self,
        rt: &WaveRuntime,
        issue: &Issue,
        pre_merge_sha: &str,
        message: &str,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> Result<(), RuntimeError> {
        let issue_id = &issue.id;
        warn!(issue_id = %issue_id, "post-merge build failed, reverting trunk");
        rt.record(
            issue_id,
            now,
            EventKind::BuildFailed {
                message: message.to_string(),
            },
        );
        if let Err(err) = revert_to(rt.isolator.repo(), rt.isolator.git(), pre_merge_sha) {
            error!(issue_id = %issue_id, error = %err, "trunk reset failed, halting issue");
            self.halted.insert(issue_id.clone(), issue.closed_at);
            report.errors.push((issue_id.clone(), err.to_string()));
            return Ok(());
        }
        rt.record(issue_id, now, EventKind::MergeReverted);

        let reason = format!("post-merge build failed: {message}");
        match rt.reopen_or_block(issue_id, &reason, now)? {
            FailureOutcome::Reopened => report.reopened.push(issue_id.clone()),
            FailureOutcome::Blocked => report.blocked.push(issue_id.clone()),
            FailureOutcome::Skipped => {}
        }
        Ok(())
    }

    /// Cleanup is best-effort; the issue is archived either way.
    fn finish(
        &mut self,
        rt: &WaveRuntime,
        issue: &Issue,
        now: DateTime<Utc>,
        report: &mut MergeReport,
    ) -> Result<(), RuntimeError> {
        let issue_id = &issue.id;
        let workspace = issue
            .workspace_path
            .clone()
            .unwrap_or_else(|| rt.isolator.workspace_path(issue_id));
        if workspace.exists() {
            if let Err(err) = rt.isolator.destroy(&workspace) {
                warn!(issue_id = %issue_id, workspace = %workspace.display(), error = %err, "workspace cleanup failed");
            }
        }
        if let Err(err) = rt.isolator.delete_branch(issue_id) {
            warn!(issue_id = %issue_id, error = %err, "branch cleanup failed");
        }

        if rt.store.archive(issue_id, now)? {
            info!(issue_id = %issue_id, "issue merged and archived");
            rt.record(issue_id, now, EventKind::IssueArchived);
            report.archived.push(issue_id.clone());
        }
        Ok(())
    }
}

fn missing_gates(rt: &WaveRuntime, issue: &Issue) -> Result<Vec<GateKind>, RuntimeError> {
    if issue.required_gates.is_empty() {
        return Ok(Vec::new());
    }
    let Some(closed_at) = issue.closed_at else {
        return Ok(issue.required_gates.clone());
    };
    let passed = rt.store.passed_gates_since(&issue.id, closed_at)?;
    Ok(issue
        .required_gates
        .iter()
        .copied()
        .filter(|gate| !passed.contains(gate))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::sync::Arc;

    use wave_agents::ScriptedHost;
    use wave_core::{GateResult, NewIssue, WaveConfig};

    use crate::runtime::test_support::{closed_issue, commit_file, init_repo, runtime};
    use crate::service::WaveService;

    fn git_stdout(cwd: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Closed issue whose branch carries one commit writing `file`.
    fn finished_issue(
        service: &WaveService,
        rt: &WaveRuntime,
        new: NewIssue,
        file: &str,
        body: &str,
    ) -> Issue {
        let now = Utc::now();
        let workspace = rt.isolator.create(&new.id).expect("workspace");
        commit_file(&workspace.path, file, body);
        let issue = closed_issue(service, new, now);
        service
            .store
            .set_workspace(&issue.id, Some(&workspace.path), now)
            .expect("set workspace");
        service.store.require(&issue.id).expect("load")
    }

    fn setup(tune: impl FnOnce(&mut WaveConfig)) -> (tempfile::TempDir, PathBuf, WaveService, WaveRuntime) {
        let (dir, root, mut config) = init_repo();
        tune(&mut config);
        let (service, rt) = runtime(config, Arc::new(ScriptedHost::idle()));
        (dir, root, service, rt)
    }

    #[test]
    fn clean_merge_archives_and_cleans_up() {
        let (_dir, root, service, rt) = setup(|_| {});
        let issue = finished_issue(&service, &rt, NewIssue::new("F", "f"), "f.txt", "f\n");
        let workspace = issue.workspace_path.clone().expect("workspace");

        let mut merges = MergePipeline::new();
        assert!(merges.enqueue(issue.id.clone()));
        assert!(!merges.enqueue(issue.id.clone()));
        let report = merges.process(&rt, Utc::now()).expect("process");

        assert_eq!(report.archived, vec![issue.id.clone()]);
        assert!(root.join("f.txt").exists());
        assert!(!workspace.exists());
        assert_eq!(git_stdout(&root, &["branch", "--list", "wave/F"]), "");
        let archived = service.store.require(&issue.id).expect("load");
        assert_eq!(archived.status, IssueStatus::Closed);
        assert!(archived.is_archived());
        assert_eq!(archived.workspace_path, None);
    }

    #[test]
    fn failed_cleanup_still_archives() {
        let (_dir, root, service, rt) = setup(|_| {});
        let issue = finished_issue(&service, &rt, NewIssue::new("K", "k"), "k.txt", "k\n");
        let real = issue.workspace_path.clone().expect("workspace");
        // Point the store elsewhere so the worktree survives and keeps the
        // branch checked out; `branch -D` then refuses.
        service
            .store
            .set_workspace(&issue.id, Some(&root.join("moved")), Utc::now())
            .expect("set workspace");

        let mut merges = MergePipeline::new();
        merges.enqueue(issue.id.clone());
        let report = merges.process(&rt, Utc::now()).expect("process");

        assert_eq!(report.archived, vec![issue.id.clone()]);
        assert!(report.errors.is_empty());
        assert!(real.is_dir());
        let listed = git_stdout(&root, &["branch", "--list", "wave/K"]);
        assert_eq!(listed.trim_start_matches(['+', '*', ' ']), "wave/K");
        assert!(service.store.require(&issue.id).expect("load").is_archived());
    }

    #[test]
    fn conflict_halts_the_issue_and_keeps_trunk() {
        let (_dir, root, service, rt) = setup(|_| {});
        let x = finished_issue(&service, &rt, NewIssue::new("X", "x"), "README.md", "from X\n");
        let y = finished_issue(&service, &rt, NewIssue::new("Y", "y"), "README.md", "from Y\n");

        let mut merges = MergePipeline::new();
        merges.enqueue(x.id.clone());
        merges.enqueue(y.id.clone());
        let report = merges.process(&rt, Utc::now()).expect("process");

        assert_eq!(report.archived, vec![x.id.clone()]);
        assert_eq!(report.conflicts, vec![(y.id.clone(), vec!["README.md".to_string()])]);
        assert!(merges.is_halted(&y.id));
        assert_eq!(
            std::fs::read_to_string(root.join("README.md")).expect("read"),
            "from X\n"
        );
        let halted = service.store.require(&y.id).expect("load");
        assert_eq!(halted.status, IssueStatus::Closed);
        assert!(!halted.is_archived());

        merges.enqueue(y.id.clone());
        assert!(!merges.process(&rt, Utc::now()).expect("retry").touched());
    }

    #[test]
    fn failed_build_reverts_trunk_and_reopens() {
        let (_dir, root, service, rt) = setup(|config| {
            config.merge.build_command = Some("test ! -f broken.txt".to_string());
        });
        let before = git_stdout(&root, &["rev-parse", "HEAD"]);
        let issue = finished_issue(&service, &rt, NewIssue::new("B", "b"), "broken.txt", "x\n");

        let mut merges = MergePipeline::new();
        merges.enqueue(issue.id.clone());
        let report = merges.process(&rt, Utc::now()).expect("process");

        assert_eq!(report.reopened, vec![issue.id.clone()]);
        assert_eq!(git_stdout(&root, &["rev-parse", "HEAD"]), before);
        assert!(!root.join("broken.txt").exists());
        let reopened = service.store.require(&issue.id).expect("load");
        assert_eq!(reopened.status, IssueStatus::Open);
        assert!(reopened
            .last_note()
            .expect("note")
            .starts_with("post-merge build failed"));
        let tags: Vec<_> = service
            .store
            .events_for(&issue.id)
            .expect("events")
            .into_iter()
            .map(|event| event.kind.tag())
            .collect();
        assert!(tags.contains(&"build-failed"));
        assert!(tags.contains(&"merge-revert"));
    }

    #[test]
    fn issue_without_passing_gates_is_sent_back() {
        let (_dir, root, service, rt) = setup(|_| {});
        let issue = finished_issue(
            &service,
            &rt,
            NewIssue::new("G", "g").with_gate(GateKind::TestRunner),
            "g.txt",
            "g\n",
        );

        let mut merges = MergePipeline::new();
        merges.enqueue(issue.id.clone());
        let report = merges.process(&rt, Utc::now()).expect("process");
        assert_eq!(report.regated, vec![issue.id.clone()]);
        assert!(!root.join("g.txt").exists());

        service
            .store
            .record_gate_result(&GateResult {
                gate: GateKind::TestRunner,
                issue_id: issue.id.clone(),
                passed: true,
                summary: "ok".to_string(),
                issues: Vec::new(),
                recorded_at: Utc::now(),
            })
            .expect("record");
        merges.enqueue(issue.id.clone());
        assert_eq!(
            merges.process(&rt, Utc::now()).expect("process").archived,
            vec![issue.id]
        );
    }

    #[test]
    fn issues_that_are_not_closed_are_skipped() {
        let (_dir, _root, service, rt) = setup(|_| {});
        service
            .add_issue(NewIssue::new("O", "o"), Utc::now())
            .expect("add");

        let mut merges = MergePipeline::new();
        merges.enqueue(IssueId::new("O"));
        merges.enqueue(IssueId::new("missing"));
        assert!(!merges.process(&rt, Utc::now()).expect("process").touched());
        assert!(merges.is_empty());
    }
}
