//! Trunk merges for validated issue branches.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::{current_branch, head_sha, RepoHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged {
        pre_merge_sha: String,
        merge_sha: String,
    },
    /// The merge was aborted; trunk is unchanged.
    Conflict { files: Vec<String> },
}

/// Merges `branch` into `trunk` in the repository's main checkout.
///
/// Conflicts abort the merge and are reported as an outcome, not an
/// error. Any other git failure is returned as-is.
pub fn merge_into_trunk(
    repo: &RepoHandle,
    git: &GitCli,
    trunk: &str,
    branch: &str,
) -> Result<MergeOutcome, GitError> {
    if current_branch(repo, git)? != trunk {
        git.run(&repo.root, ["checkout", trunk])?;
    }
    let pre_merge_sha = head_sha(repo, git)?;
    let message = format!("Merge {branch} into {trunk}");

    match git.run(
        &repo.root,
        ["merge", "--no-ff", "-m", message.as_str(), branch],
    ) {
        Ok(_) => {
            let merge_sha = head_sha(repo, git)?;
            info!(branch = %branch, trunk = %trunk, merge_sha = %merge_sha, "merged branch into trunk");
            Ok(MergeOutcome::Merged {
                pre_merge_sha,
                merge_sha,
            })
        }
        Err(err @ GitError::CommandFailed { .. }) => {
            let files = conflicted_files(repo, git)?;
            if let Err(abort_err) = git.run(&repo.root, ["merge", "--abort"]) {
                warn!(branch = %branch, error = %abort_err, "merge --abort failed");
            }
            if files.is_empty() {
                return Err(err);
            }
            warn!(branch = %branch, trunk = %trunk, files = ?files, "merge conflict");
            Ok(MergeOutcome::Conflict { files })
        }
        Err(err) => Err(err),
    }
}

pub fn conflicted_files(repo: &RepoHandle, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(&repo.root, ["diff", "--name-only", "--diff-filter=U"])?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Hard-resets the checked-out trunk to `sha`.
pub fn revert_to(repo: &RepoHandle, git: &GitCli, sha: &str) -> Result<(), GitError> {
    git.run(&repo.root, ["reset", "--hard", sha])?;
    info!(sha = %sha, "trunk reset");
    Ok(())
}
