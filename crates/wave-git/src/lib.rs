pub mod command;
pub mod error;
pub mod merge;
pub mod repo;
pub mod worktree;

pub use command::*;
pub use error::*;
pub use merge::*;
pub use repo::*;
pub use worktree::*;

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    pub fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Fresh repository on `main` with one commit and a local identity.
    pub fn init_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("repo");
        fs::create_dir_all(&root).expect("create repo dir");
        let root = fs::canonicalize(&root).expect("canonicalize");

        run_git(&root, &["init", "-q"]);
        run_git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run_git(&root, &["config", "user.name", "Test User"]);
        run_git(&root, &["config", "user.email", "test@example.com"]);
        run_git(&root, &["config", "commit.gpgsign", "false"]);
        fs::write(root.join("README.md"), "init\n").expect("write file");
        run_git(&root, &["add", "README.md"]);
        run_git(&root, &["commit", "-q", "-m", "init"]);

        (dir, root)
    }
}
