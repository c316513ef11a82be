use ctrd_types::{Classify, ErrorKind, TypeError};

/// Errors from snapshotter operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot {0} does not exist")]
    NotFound(String),

    /// The key or name is already taken by an active or committed snapshot.
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),

    /// The operation is not valid for the snapshot's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for SnapshotError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::InvalidArgument(_) | Self::Type(_) => ErrorKind::InvalidArgument,
            Self::Serialization(_) => ErrorKind::Internal,
            Self::Io(e) => Classify::kind(e),
        }
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
