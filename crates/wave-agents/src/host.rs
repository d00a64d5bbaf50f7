use crate::error::HostError;
use crate::types::{SessionHandle, SessionStatus, SpawnSpec};

/// Terminal/session layer the orchestrator drives workers through.
pub trait SessionHost: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<SessionHandle, HostError>;

    fn send_input(&self, handle: &SessionHandle, text: &str) -> Result<(), HostError>;

    /// Last `lines` lines of output.
    fn capture_output(&self, handle: &SessionHandle, lines: usize) -> Result<String, HostError>;

    /// Killing a session that is already gone is not an error.
    fn kill(&self, handle: &SessionHandle) -> Result<(), HostError>;

    /// Hosts that cannot observe process exit keep the default.
    fn status(&self, _handle: &SessionHandle) -> SessionStatus {
        SessionStatus::Unknown
    }
}
