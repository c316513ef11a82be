use ctrd_types::{Classify, ErrorKind};

/// Errors from plugin registration, resolution and initialization.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin has no type")]
    NoType,

    #[error("plugin of type {0} has no id")]
    NoId(String),

    /// A wildcard requirement was mixed with concrete ones.
    #[error("plugin {0}: a wildcard requirement must be the only requirement")]
    InvalidRequires(String),

    #[error("plugin {0} already registered")]
    AlreadyRegistered(String),

    /// The concrete requirements do not form a DAG.
    #[error("dependency cycle between plugins: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// The plugin deliberately chose not to load.
    #[error("skip plugin: {0}")]
    Skip(String),

    #[error("no plugin {0} loaded")]
    NotFound(String),

    #[error("plugin {uri} does not provide {expected}")]
    TypeMismatch { uri: String, expected: &'static str },

    #[error("invalid config for plugin {uri}: {message}")]
    Config { uri: String, message: String },

    #[error("service {0} already registered")]
    DuplicateService(String),

    /// Any other failure of a plugin's init function.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }

    /// Whether this is a deliberate skip rather than a failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

impl Classify for PluginError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NoType
            | Self::NoId(_)
            | Self::InvalidRequires(_)
            | Self::TypeMismatch { .. }
            | Self::Config { .. } => ErrorKind::InvalidArgument,
            Self::AlreadyRegistered(_) | Self::DuplicateService(_) => ErrorKind::AlreadyExists,
            Self::Cycle(_) => ErrorKind::FailedPrecondition,
            Self::Skip(_) => ErrorKind::Unavailable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Other(_) => ErrorKind::Internal,
            Self::Io(e) => Classify::kind(e),
        }
    }
}

/// Result alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;
