use ctrd_content::ContentError;
use ctrd_snapshot::SnapshotError;
use ctrd_types::{Classify, ErrorKind, TypeError};

/// Errors from the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No snapshotter is registered under this name.
    #[error("snapshotter {0} not loaded")]
    SnapshotterNotFound(String),

    /// The index was written by an incompatible schema.
    #[error("schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { found: u32, expected: u32 },

    /// The index file failed its integrity check.
    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The collector or its scheduler could not run.
    #[error("garbage collection: {0}")]
    Gc(String),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for MetadataError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NamespaceNotFound(_) | Self::NotFound(_) | Self::SnapshotterNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::FailedPrecondition(_) | Self::SchemaMismatch { .. } => {
                ErrorKind::FailedPrecondition
            }
            Self::InvalidArgument(_) | Self::Type(_) => ErrorKind::InvalidArgument,
            Self::Corrupt(_) | Self::Serialization(_) | Self::Gc(_) => ErrorKind::Internal,
            Self::Content(e) => e.kind(),
            Self::Snapshot(e) => e.kind(),
            Self::Io(e) => Classify::kind(e),
        }
    }
}

impl From<bincode::Error> for MetadataError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Surface index errors through the content store contract.
impl From<MetadataError> for ContentError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Content(e) => e,
            MetadataError::Type(e) => ContentError::Type(e),
            MetadataError::Io(e) => ContentError::Io(e),
            MetadataError::InvalidArgument(s) => ContentError::InvalidArgument(s),
            MetadataError::FailedPrecondition(s) => ContentError::NotSupported(s),
            other => ContentError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Surface index errors through the snapshotter contract.
impl From<MetadataError> for SnapshotError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Snapshot(e) => e,
            MetadataError::Type(e) => SnapshotError::Type(e),
            MetadataError::Io(e) => SnapshotError::Io(e),
            other => match other.kind() {
                ErrorKind::NotFound => SnapshotError::NotFound(other.to_string()),
                ErrorKind::AlreadyExists => SnapshotError::AlreadyExists(other.to_string()),
                ErrorKind::FailedPrecondition => {
                    SnapshotError::FailedPrecondition(other.to_string())
                }
                ErrorKind::InvalidArgument => SnapshotError::InvalidArgument(other.to_string()),
                _ => SnapshotError::Serialization(other.to_string()),
            },
        }
    }
}

/// Result alias for metadata operations.
pub type Result<T> = std::result::Result<T, MetadataError>;
