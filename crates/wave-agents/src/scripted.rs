//! In-process session host whose workers are closures.
//!
//! Each spawn runs the behavior closure synchronously; whatever side
//! effects it performs (closing an issue, writing a gate result file,
//! sending a push notification) happen before `spawn` returns. The
//! returned [`ScriptedRun`] decides what the session looks like afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::HostError;
use crate::host::SessionHost;
use crate::types::{OutputBuffer, SessionHandle, SessionStatus, SpawnSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedRun {
    pub output: Vec<String>,
    /// `None` keeps the session running until it is killed or finished.
    pub exit_code: Option<i32>,
}

impl ScriptedRun {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn exited(code: i32) -> Self {
        Self {
            output: Vec::new(),
            exit_code: Some(code),
        }
    }

    pub fn with_output(mut self, line: impl Into<String>) -> Self {
        self.output.push(line.into());
        self
    }
}

type Behavior = Box<dyn Fn(&SpawnSpec) -> Result<ScriptedRun, HostError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScriptedSession {
    pub spec: SpawnSpec,
    pub inputs: Vec<String>,
    pub exit_code: Option<i32>,
    pub killed: bool,
    output: OutputBuffer,
}

pub struct ScriptedHost {
    behavior: Behavior,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionHandle, ScriptedSession>>,
}

impl ScriptedHost {
    pub fn new(
        behavior: impl Fn(&SpawnSpec) -> Result<ScriptedRun, HostError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Every spawned session runs silently until killed.
    pub fn idle() -> Self {
        Self::new(|_| Ok(ScriptedRun::running()))
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionHandle, ScriptedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All sessions ever spawned, in spawn order.
    pub fn spawned(&self) -> Vec<(SessionHandle, ScriptedSession)> {
        let mut all: Vec<_> = self
            .sessions()
            .iter()
            .map(|(handle, session)| (handle.clone(), session.clone()))
            .collect();
        all.sort_by_key(|(handle, _)| session_number(handle));
        all
    }

    /// Sessions whose `WAVE_ISSUE_ID` matches, in spawn order.
    pub fn spawned_for(&self, issue_id: &str) -> Vec<(SessionHandle, ScriptedSession)> {
        self.spawned()
            .into_iter()
            .filter(|(_, session)| session.spec.env_var("WAVE_ISSUE_ID") == Some(issue_id))
            .collect()
    }

    pub fn finish(&self, handle: &SessionHandle, exit_code: i32) {
        if let Some(session) = self.sessions().get_mut(handle) {
            session.exit_code = Some(exit_code);
        }
    }

    pub fn emit(&self, handle: &SessionHandle, text: &str) {
        if let Some(session) = self.sessions().get_mut(handle) {
            session.output.push_str(text);
        }
    }
}

fn session_number(handle: &SessionHandle) -> u64 {
    handle
        .0
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

impl SessionHost for ScriptedHost {
    fn spawn(&self, spec: &SpawnSpec) -> Result<SessionHandle, HostError> {
        let run = (self.behavior)(spec)?;
        let handle = SessionHandle(format!(
            "scripted-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let mut output = OutputBuffer::new(1_000);
        for line in run.output {
            output.push_line(line);
        }
        self.sessions().insert(
            handle.clone(),
            ScriptedSession {
                spec: spec.clone(),
                inputs: Vec::new(),
                exit_code: run.exit_code,
                killed: false,
                output,
            },
        );
        Ok(handle)
    }

    fn send_input(&self, handle: &SessionHandle, text: &str) -> Result<(), HostError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(handle)
            .filter(|session| !session.killed)
            .ok_or_else(|| HostError::UnknownSession {
                handle: handle.clone(),
            })?;
        session.inputs.push(text.to_string());
        Ok(())
    }

    fn capture_output(&self, handle: &SessionHandle, lines: usize) -> Result<String, HostError> {
        self.sessions()
            .get(handle)
            .filter(|session| !session.killed)
            .map(|session| session.output.tail(lines))
            .ok_or_else(|| HostError::UnknownSession {
                handle: handle.clone(),
            })
    }

    fn kill(&self, handle: &SessionHandle) -> Result<(), HostError> {
        if let Some(session) = self.sessions().get_mut(handle) {
            session.killed = true;
        }
        Ok(())
    }

    fn status(&self, handle: &SessionHandle) -> SessionStatus {
        match self.sessions().get(handle) {
            Some(session) if session.killed => SessionStatus::Unknown,
            Some(session) => match session.exit_code {
                Some(code) => SessionStatus::Exited(Some(code)),
                None => SessionStatus::Running,
            },
            None => SessionStatus::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(issue: &str) -> SpawnSpec {
        SpawnSpec {
            workdir: PathBuf::from("/ws"),
            program: "worker".to_string(),
            args: Vec::new(),
            env: BTreeMap::from([("WAVE_ISSUE_ID".to_string(), issue.to_string())]),
        }
    }

    #[test]
    fn behavior_decides_output_and_exit() {
        let host = ScriptedHost::new(|spec| {
            if spec.env_var("WAVE_ISSUE_ID") == Some("boom") {
                return Err(HostError::Spawn {
                    program: spec.program.clone(),
                    message: "scripted failure".to_string(),
                });
            }
            Ok(ScriptedRun::exited(0).with_output("done"))
        });

        let ok = host.spawn(&spec("A")).expect("spawn");
        assert_eq!(host.status(&ok), SessionStatus::Exited(Some(0)));
        assert_eq!(host.capture_output(&ok, 5).expect("capture"), "done");
        assert!(host.spawn(&spec("boom")).is_err());
        assert_eq!(host.spawned().len(), 1);
    }

    #[test]
    fn idle_sessions_run_until_killed() {
        let host = ScriptedHost::idle();
        let handle = host.spawn(&spec("A")).expect("spawn");
        assert_eq!(host.status(&handle), SessionStatus::Running);

        host.send_input(&handle, "go").expect("input");
        host.emit(&handle, "working\n");
        assert_eq!(host.capture_output(&handle, 5).expect("capture"), "working");

        host.kill(&handle).expect("kill");
        assert_eq!(host.status(&handle), SessionStatus::Unknown);
        assert!(host.send_input(&handle, "late").is_err());
        let (_, session) = &host.spawned_for("A")[0];
        assert!(session.killed);
        assert_eq!(session.inputs, vec!["go".to_string()]);
    }

    #[test]
    fn finish_marks_exit() {
        let host = ScriptedHost::idle();
        let handle = host.spawn(&spec("A")).expect("spawn");
        host.finish(&handle, 3);
        assert_eq!(host.status(&handle), SessionStatus::Exited(Some(3)));
    }

    #[test]
    fn spawned_is_in_spawn_order() {
        let host = ScriptedHost::idle();
        for n in 0..12 {
            host.spawn(&spec(&format!("I{n}"))).expect("spawn");
        }
        let ids: Vec<_> = host
            .spawned()
            .into_iter()
            .map(|(_, s)| s.spec.env_var("WAVE_ISSUE_ID").map(str::to_string))
            .collect();
        assert_eq!(ids[0].as_deref(), Some("I0"));
        assert_eq!(ids[11].as_deref(), Some("I11"));
    }
}
