use crate::types::SessionHandle;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid spawn request: {message}")]
    InvalidRequest { message: String },
    #[error("pty setup failed: {message}")]
    PtySetup { message: String },
    #[error("worker spawn failed ({program}): {message}")]
    Spawn { program: String, message: String },
    #[error("unknown session {handle}")]
    UnknownSession { handle: SessionHandle },
    #[error("session io failed ({handle}): {source}")]
    Io {
        handle: SessionHandle,
        #[source]
        source: std::io::Error,
    },
}
