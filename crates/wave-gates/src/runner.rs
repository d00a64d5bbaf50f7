//! Post-merge build verification.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::command::run_shell_command;
use crate::discover::resolve_build_command;
use crate::error::GateError;
use crate::types::BuildOutcome;

const FAILURE_TAIL_LINES: usize = 20;

/// Runs the configured (or discovered) build command in `repo_root`.
pub fn run_build(
    repo_root: &Path,
    configured: Option<&str>,
    timeout: Duration,
) -> Result<BuildOutcome, GateError> {
    let Some(command) = resolve_build_command(repo_root, configured) else {
        info!(repo = %repo_root.display(), "no build command configured or discovered, skipping build");
        return Ok(BuildOutcome::Skipped);
    };

    let output = run_shell_command(repo_root, "sh", &command, Some(timeout))?;
    if output.success {
        return Ok(BuildOutcome::Passed { command });
    }

    let message = if output.timed_out {
        format!("build timed out after {}s", timeout.as_secs())
    } else {
        format!(
            "build exited with {:?}\n{}",
            output.exit_code,
            output.tail(FAILURE_TAIL_LINES)
        )
    };
    warn!(command = %command, "post-merge build failed");
    Ok(BuildOutcome::Failed { command, message })
}
