use ctrd_plugin::PluginError;
use ctrd_types::{Classify, ErrorKind};

/// Errors from loading configuration and starting the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// A plugin's init function failed with something other than a skip.
    #[error("failed to load plugin {uri}: {source}")]
    Init {
        uri: String,
        #[source]
        source: PluginError,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ServerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Parse(_) => ErrorKind::InvalidArgument,
            Self::Render(_) => ErrorKind::Internal,
            Self::Init { source, .. } | Self::Plugin(source) => source.kind(),
            Self::Io(e) => Classify::kind(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
