use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wave_core::{GateFinding, GateKind, GateResult, IssueId};

/// Contents of a gate result file written by a verification worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<GateFinding>,
}

impl GateReport {
    pub fn into_result(self, gate: GateKind, issue_id: IssueId, at: DateTime<Utc>) -> GateResult {
        GateResult {
            gate,
            issue_id,
            passed: self.passed,
            summary: self.summary,
            issues: self.issues,
            recorded_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    Passed { command: String },
    /// No build command configured or discoverable.
    Skipped,
    Failed { command: String, message: String },
}

impl BuildOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BuildOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_optional_fields() {
        let report: GateReport = serde_json::from_str(r#"{"passed": true}"#).expect("parse");
        assert!(report.passed);
        assert!(report.summary.is_empty());
        assert!(report.issues.is_empty());
    }

    #[test]
    fn report_parses_findings_with_optional_line() {
        let report: GateReport = serde_json::from_str(
            r#"{"passed": false, "summary": "2 issues",
                "issues": [{"file": "a.rs", "line": 3, "detail": "unused"},
                           {"file": "b.rs", "detail": "unsafe block"}]}"#,
        )
        .expect("parse");
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].line, Some(3));
        assert_eq!(report.issues[1].line, None);

        let result = report.into_result(GateKind::SecurityReview, IssueId::new("S"), Utc::now());
        assert!(!result.passed);
        assert_eq!(result.gate, GateKind::SecurityReview);
        assert_eq!(result.summary, "2 issues");
    }

    #[test]
    fn report_without_passed_is_rejected() {
        assert!(serde_json::from_str::<GateReport>(r#"{"summary": "ok"}"#).is_err());
    }
}
