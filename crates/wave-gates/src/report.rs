//! Gate result files and bounded waiting for them.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use wave_core::GateKind;

use crate::error::GateError;
use crate::types::GateReport;

pub const GATE_RESULT_DIR: &str = ".wave/gates";

pub fn result_file_path(workspace: &Path, gate: GateKind) -> PathBuf {
    workspace
        .join(GATE_RESULT_DIR)
        .join(format!("{}.json", gate.as_str()))
}

/// Removes any stale result file and makes sure its directory exists.
pub fn prepare_result_file(workspace: &Path, gate: GateKind) -> Result<PathBuf, GateError> {
    let path = result_file_path(workspace, gate);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| GateError::ResultDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(source) => return Err(GateError::ResultDir { path, source }),
    }
    Ok(path)
}

/// `Ok(None)` while the file does not exist yet.
pub fn read_gate_report(path: &Path) -> Result<Option<GateReport>, GateError> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(GateError::ReadResult {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|source| GateError::ParseResult {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportPoll {
    Pending,
    Ready(GateReport),
    /// The file exists but cannot be used; the gate counts as failed.
    Invalid(String),
    TimedOut,
}

/// Tick-driven wait for one gate result file with a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportWatcher {
    pub path: PathBuf,
    pub deadline: DateTime<Utc>,
}

impl ReportWatcher {
    pub fn new(path: PathBuf, deadline: DateTime<Utc>) -> Self {
        Self { path, deadline }
    }

    /// Checks the file once. `worker_exited` lets a finished verification
    /// worker settle the wait early: a partially written file gets one more
    /// chance only while the worker is still running.
    pub fn poll(&self, now: DateTime<Utc>, worker_exited: bool) -> ReportPoll {
        match read_gate_report(&self.path) {
            Ok(Some(report)) => ReportPoll::Ready(report),
            Ok(None) if now >= self.deadline => ReportPoll::TimedOut,
            Ok(None) if worker_exited => {
                ReportPoll::Invalid("verification worker exited without a result".to_string())
            }
            Ok(None) => ReportPoll::Pending,
            Err(GateError::ParseResult { .. }) if !worker_exited && now < self.deadline => {
                ReportPoll::Pending
            }
            Err(err) => ReportPoll::Invalid(err.to_string()),
        }
    }
}
