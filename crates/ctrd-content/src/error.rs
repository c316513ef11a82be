use ctrd_types::{Classify, Digest, ErrorKind, TypeError};

/// Errors from content store operations.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// No blob with this digest is committed.
    #[error("content {0} not found")]
    NotFound(Digest),

    /// No ingest is in progress under this reference.
    #[error("ingest ref {0:?} not found")]
    IngestNotFound(String),

    /// The blob is already committed.
    #[error("content {0} already exists")]
    AlreadyExists(Digest),

    /// Another writer holds this ingest reference.
    #[error("ref {0:?} locked")]
    Locked(String),

    /// The committed bytes do not hash to the expected digest.
    #[error("unexpected commit digest {actual}, expected {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// The committed byte count differs from the declared size.
    #[error("unexpected commit size {actual}, expected {expected}")]
    UnexpectedSize { expected: u64, actual: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store was built without the capability the call needs.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ContentError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::IngestNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Locked(_) => ErrorKind::Unavailable,
            Self::DigestMismatch { .. } | Self::UnexpectedSize { .. } | Self::NotSupported(_) => {
                ErrorKind::FailedPrecondition
            }
            Self::InvalidArgument(_) | Self::Type(_) => ErrorKind::InvalidArgument,
            Self::Io(e) => Classify::kind(e),
        }
    }
}

/// Result alias for content operations.
pub type Result<T> = std::result::Result<T, ContentError>;
