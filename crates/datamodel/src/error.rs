use crate::id::InstanceId;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("invalid instance id: {0}")]
    InvalidId(String),

    #[error("instance has no source body: {0}")]
    NotAScript(InstanceId),
}

pub type Result<T> = std::result::Result<T, TreeError>;
