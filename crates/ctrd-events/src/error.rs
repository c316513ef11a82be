use ctrd_types::{Classify, ErrorKind, TypeError};

/// Errors produced by the event exchange.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid namespace: {0}")]
    Namespace(#[from] TypeError),

    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("topic {topic:?} does not match event kind {expected:?}")]
    TopicMismatch { topic: String, expected: String },
}

impl Classify for EventError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgument
    }
}

/// Convenience alias used throughout the events crate.
pub type Result<T> = std::result::Result<T, EventError>;
