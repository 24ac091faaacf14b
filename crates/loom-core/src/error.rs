use thiserror::Error;

use crate::domain::{DurationError, MessageId};
use crate::ports::{IdError, SendError, StoreError};

#[derive(Debug, Error)]
pub enum LoomError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),

    /// Job configuration that can never run; not retried.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("store: {0}")]
    Store(StoreError),

    #[error("id generation: {0}")]
    Id(#[from] IdError),

    #[error("dispatch: {0}")]
    Dispatch(#[from] SendError),

    #[error("transport: {0}")]
    Transport(String),

    #[error("config: {0}")]
    Config(String),

    #[error("broker is shut down")]
    Closed,

    #[error(transparent)]
    Duration(#[from] DurationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for LoomError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LoomError::MessageNotFound(id),
            other => LoomError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
