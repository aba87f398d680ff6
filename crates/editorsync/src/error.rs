use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sourcemap error: {0}")]
    Sourcemap(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("project error: {0}")]
    Project(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
