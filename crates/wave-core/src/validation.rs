//! Validation for configuration and issue intake.

use serde::{Deserialize, Serialize};

use crate::config::WaveConfig;
use crate::types::NewIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            ValidationLevel::Error => "error",
            ValidationLevel::Warning => "warning",
        };
        write!(f, "{level} [{}]: {}", self.code, self.message)
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for WaveConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.repo.trunk.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "repo.trunk.empty",
                "trunk branch must not be empty",
            ));
        }
        if self.repo.branch_prefix.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "repo.branch_prefix.empty",
                "branch_prefix must not be empty; issue branches would collide with trunk",
            ));
        }
        if self.repo.git_timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "repo.git_timeout.zero",
                "git_timeout_secs must be greater than zero",
            ));
        }

        if self.scheduler.max_concurrency == 0 {
            issues.push(ValidationIssue::error(
                "scheduler.max_concurrency.zero",
                "max_concurrency must be greater than zero",
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            issues.push(ValidationIssue::error(
                "scheduler.tick_interval.zero",
                "tick interval cannot be 0",
            ));
        }

        if self.detector.poll_interval_secs == 0 {
            issues.push(ValidationIssue::error(
                "detector.poll_interval.zero",
                "poll_interval_secs must be greater than zero",
            ));
        }
        if self.detector.stale_after_secs == 0 {
            issues.push(ValidationIssue::error(
                "detector.stale_after.zero",
                "stale_after_secs must be greater than zero",
            ));
        }
        if self.detector.stale_after_secs > 0
            && self.detector.poll_interval_secs > self.detector.stale_after_secs
        {
            issues.push(ValidationIssue::warning(
                "detector.poll_interval.exceeds_stale",
                format!(
                    "poll interval {}s exceeds stale threshold {}s; staleness is only noticed on polls",
                    self.detector.poll_interval_secs, self.detector.stale_after_secs
                ),
            ));
        }
        if self.detector.output_lines == 0 {
            issues.push(ValidationIssue::warning(
                "detector.output_lines.zero",
                "output_lines is 0; worker activity and input prompts cannot be observed",
            ));
        }

        if self.worker.program.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "worker.program.empty",
                "worker program must not be empty",
            ));
        }

        if self.gates.timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "gates.timeout.zero",
                "gate timeout cannot be 0",
            ));
        }
        if self.gates.max_reopens == 0 {
            issues.push(ValidationIssue::warning(
                "gates.max_reopens.zero",
                "max_reopens is 0; the first gate failure blocks the issue",
            ));
        }
        for (gate, command) in &self.gates.commands {
            if command.program.trim().is_empty() {
                issues.push(ValidationIssue::error(
                    "gates.command.program.empty",
                    format!("gate {gate} has an empty program"),
                ));
            }
        }

        if let Some(build) = &self.merge.build_command {
            if build.trim().is_empty() {
                issues.push(ValidationIssue::warning(
                    "merge.build_command.empty",
                    "build_command is empty; post-merge build will always pass",
                ));
            }
        }
        if self.merge.build_timeout_secs == 0 {
            issues.push(ValidationIssue::error(
                "merge.build_timeout.zero",
                "build_timeout_secs must be greater than zero",
            ));
        }

        issues
    }
}

impl Validate for NewIssue {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.id.0.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "issue.id.empty",
                "issue id must not be empty",
            ));
        } else if self.id.0.chars().any(char::is_whitespace) {
            issues.push(ValidationIssue::error(
                "issue.id.whitespace",
                format!("issue id '{}' must not contain whitespace", self.id),
            ));
        }

        if self.title.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "issue.title.empty",
                "title must not be empty",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for gate in &self.required_gates {
            if !seen.insert(*gate) {
                issues.push(ValidationIssue::warning(
                    "issue.required_gates.duplicate",
                    format!("gate {gate} is listed more than once"),
                ));
            }
        }

        issues
    }
}
