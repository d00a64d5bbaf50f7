use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("verification command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read gate result at {path}: {source}")]
    ReadResult {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gate result at {path}: {source}")]
    ParseResult {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to prepare gate result directory {path}: {source}")]
    ResultDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
