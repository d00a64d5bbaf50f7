use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to create inbox directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write notification {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode notification: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("notification channel is closed")]
    ChannelClosed,
}
