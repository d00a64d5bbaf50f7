//! Workspace isolation: one git worktree and branch per issue.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wave_core::IssueId;

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::{branch_exists, RepoHandle};

pub const DEFAULT_WORKSPACE_ROOT: &str = ".wave/wt";
pub const DEFAULT_BRANCH_PREFIX: &str = "wave/";

/// Pattern written to `info/exclude` so orchestrator state never shows up
/// as untracked content in trunk or in a workspace.
const EXCLUDE_PATTERN: &str = ".wave/";
const LOCK_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub issue_id: IssueId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Sole allocator of per-issue workspaces.
///
/// Calls for different issues proceed in parallel; calls for the same
/// issue serialize on that issue's lock.
#[derive(Debug)]
pub struct WorkspaceIsolator {
    git: GitCli,
    repo: RepoHandle,
    relative_root: PathBuf,
    branch_prefix: String,
    trunk: String,
    locks: Mutex<HashMap<IssueId, Arc<Mutex<()>>>>,
}

impl WorkspaceIsolator {
    pub fn new(
        repo: RepoHandle,
        git: GitCli,
        relative_root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        trunk: impl Into<String>,
    ) -> Self {
        Self {
            git,
            repo,
            relative_root: relative_root.into(),
            branch_prefix: branch_prefix.into(),
            trunk: trunk.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &RepoHandle {
        &self.repo
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    pub fn branch_name(&self, issue_id: &IssueId) -> String {
        format!("{}{}", self.branch_prefix, issue_id.slug())
    }

    pub fn workspace_path(&self, issue_id: &IssueId) -> PathBuf {
        self.workspace_root().join(issue_id.slug())
    }

    pub fn workspace_root(&self) -> PathBuf {
        if self.relative_root.is_absolute() {
            self.relative_root.clone()
        } else {
            self.repo.root.join(&self.relative_root)
        }
    }

    fn issue_lock(&self, issue_id: &IssueId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(issue_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the workspace for `issue_id`, or returns the existing one.
    ///
    /// A reopened issue whose worktree was removed resumes on its
    /// previous branch.
    pub fn create(&self, issue_id: &IssueId) -> Result<Workspace, GitError> {
        let lock = self.issue_lock(issue_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.workspace_path(issue_id);
        let branch = self.branch_name(issue_id);
        let workspace = Workspace {
            issue_id: issue_id.clone(),
            branch: branch.clone(),
            path: path.clone(),
        };

        if self.is_registered(&path)? {
            debug!(issue_id = %issue_id, workspace = %path.display(), "reusing existing workspace");
            return Ok(workspace);
        }

        self.ensure_excluded();
        let root = self.workspace_root();
        fs::create_dir_all(&root).map_err(|source| GitError::WorkspaceDir {
            path: root.clone(),
            source,
        })?;

        if path.exists() {
            // Leftover directory from a crashed run that git no longer tracks.
            let _ = self.git.run(&self.repo.root, ["worktree", "prune"]);
            fs::remove_dir_all(&path).map_err(|source| GitError::WorkspaceDir {
                path: path.clone(),
                source,
            })?;
        }

        let mut args = vec![OsString::from("worktree"), OsString::from("add")];
        if branch_exists(&self.repo, &self.git, &branch)? {
            args.push(path.as_os_str().to_os_string());
            args.push(OsString::from(branch.as_str()));
        } else {
            args.push(OsString::from("-b"));
            args.push(OsString::from(branch.as_str()));
            args.push(path.as_os_str().to_os_string());
            args.push(OsString::from(self.trunk.as_str()));
        }
        self.run_with_lock_retry(&args)?;

        info!(issue_id = %issue_id, workspace = %path.display(), branch = %branch, "workspace created");
        Ok(workspace)
    }

    /// Removes the worktree at `path`. The directory is left in place when
    /// git refuses; the failure is logged and returned.
    pub fn destroy(&self, path: &Path) -> Result<(), GitError> {
        let args = vec![
            OsString::from("worktree"),
            OsString::from("remove"),
            OsString::from("--force"),
            path.as_os_str().to_os_string(),
        ];
        match self.git.run(&self.repo.root, args) {
            Ok(_) => {
                info!(workspace = %path.display(), "workspace removed");
                Ok(())
            }
            Err(err) if !path.exists() => {
                let _ = self.git.run(&self.repo.root, ["worktree", "prune"]);
                debug!(workspace = %path.display(), error = %err, "workspace already gone");
                Ok(())
            }
            Err(err) => {
                warn!(workspace = %path.display(), error = %err, "failed to remove workspace, leaving it in place");
                Err(err)
            }
        }
    }

    /// Deletes the issue branch if it exists. This is the last step for
    /// a finished issue, so its lock entry is dropped too.
    pub fn delete_branch(&self, issue_id: &IssueId) -> Result<(), GitError> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(issue_id);
        let branch = self.branch_name(issue_id);
        if !branch_exists(&self.repo, &self.git, &branch)? {
            return Ok(());
        }
        match self.git.run(&self.repo.root, ["branch", "-D", branch.as_str()]) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(issue_id = %issue_id, branch = %branch, error = %err, "failed to delete branch");
                Err(err)
            }
        }
    }

    pub fn list(&self) -> Result<Vec<ListedWorktree>, GitError> {
        let output = self
            .git
            .run(&self.repo.root, ["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&output.stdout)
    }

    fn is_registered(&self, path: &Path) -> Result<bool, GitError> {
        if !path.exists() {
            return Ok(false);
        }
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(self.list()?.iter().any(|listed| {
            listed.path == path
                || fs::canonicalize(&listed.path)
                    .map(|p| p == canonical)
                    .unwrap_or(false)
        }))
    }

    fn run_with_lock_retry(&self, args: &[OsString]) -> Result<(), GitError> {
        let mut attempt = 0;
        loop {
            match self.git.run(&self.repo.root, args) {
                Ok(_) => return Ok(()),
                Err(err) if attempt + 1 < LOCK_RETRIES && err.stderr().contains(".lock") => {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn ensure_excluded(&self) {
        let common_dir = match self
            .git
            .run(&self.repo.root, ["rev-parse", "--git-common-dir"])
        {
            Ok(output) => {
                let raw = PathBuf::from(output.stdout.trim());
                if raw.is_absolute() {
                    raw
                } else {
                    self.repo.root.join(raw)
                }
            }
            Err(_) => self.repo.git_dir.clone(),
        };
        let exclude = common_dir.join("info").join("exclude");
        let current = fs::read_to_string(&exclude).unwrap_or_default();
        if current.lines().any(|line| line.trim() == EXCLUDE_PATTERN) {
            return;
        }
        let mut body = current;
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(EXCLUDE_PATTERN);
        body.push('\n');
        if let Some(parent) = exclude.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&exclude, body) {
            warn!(path = %exclude.display(), error = %err, "failed to update git exclude file");
        }
    }
}

fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    let mut listed = Vec::new();

    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut current_head: Option<String> = None;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                    head: current_head.take(),
                });
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.trim().to_string());
        }
    }

    if listed.is_empty() && !raw.trim().is_empty() {
        return Err(GitError::Parse {
            context: "unable to parse git worktree list output".to_string(),
        });
    }

    Ok(listed)
}
