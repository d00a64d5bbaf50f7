use std::path::PathBuf;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git command returned non-zero exit ({command}) status={status:?}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("git command timed out after {timeout_secs}s ({command})")]
    Timeout { command: String, timeout_secs: f64 },
    #[error("git command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("path is not inside a git repository: {path}")]
    NotARepository { path: PathBuf },
    #[error("failed to prepare workspace directory {path}: {source}")]
    WorkspaceDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid git output: {context}")]
    Parse { context: String },
}

impl GitError {
    /// stderr of a failed command, empty for other variants.
    pub fn stderr(&self) -> &str {
        match self {
            GitError::CommandFailed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GitError;
    use std::error::Error;
    use std::path::PathBuf;

    #[test]
    fn io_variant_includes_command_and_io_message() {
        let err = GitError::Io {
            command: "git status".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("git command failed to start (git status)"));
        assert!(rendered.contains("missing binary"));
        assert!(err.source().is_some());
    }

    #[test]
    fn timeout_variant_mentions_limit_and_command() {
        let err = GitError::Timeout {
            command: "git worktree add".to_string(),
            timeout_secs: 1.5,
        };
        assert_eq!(
            err.to_string(),
            "git command timed out after 1.5s (git worktree add)"
        );
        assert_eq!(err.stderr(), "");
    }

    #[test]
    fn command_failed_exposes_stderr() {
        let err = GitError::CommandFailed {
            command: "git merge wave/A".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "CONFLICT".to_string(),
        };
        assert!(err.to_string().contains("status=Some(1)"));
        assert_eq!(err.stderr(), "CONFLICT");
    }

    #[test]
    fn repository_and_workspace_variants_include_paths() {
        let repo_err = GitError::NotARepository {
            path: PathBuf::from("/tmp/example"),
        };
        assert!(repo_err
            .to_string()
            .contains("path is not inside a git repository: /tmp/example"));

        let dir_err = GitError::WorkspaceDir {
            path: PathBuf::from("/tmp/example/.wave/wt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(dir_err.to_string().contains("/tmp/example/.wave/wt"));
        assert!(dir_err.source().is_some());
    }
}
