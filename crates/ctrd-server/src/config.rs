use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ServerError};

/// Config file version this daemon understands.
pub const CONFIG_VERSION: u32 = 1;

/// Daemon configuration, read from a TOML file.
///
/// Plugin tables are kept as raw TOML and decoded by each plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    /// Persistent data, one directory per plugin.
    pub root: PathBuf,
    /// Runtime state, one directory per plugin.
    pub state: PathBuf,
    /// URIs of plugins that are never initialized.
    pub disabled_plugins: Vec<String>,
    pub grpc: GrpcConfig,
    pub debug: DebugConfig,
    /// Per-plugin tables keyed by URI or by bare id.
    pub plugins: BTreeMap<String, toml::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub address: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            root: PathBuf::from("/var/lib/ctrd"),
            state: PathBuf::from("/run/ctrd"),
            disabled_plugins: Vec::new(),
            grpc: GrpcConfig::default(),
            debug: DebugConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            address: "/run/ctrd/ctrd.sock".to_string(),
            uid: 0,
            gid: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Config {
    /// Read and validate the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match Self::load(path.as_ref()) {
            Err(ServerError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.as_ref().display(), "no config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > CONFIG_VERSION {
            return Err(ServerError::Config(format!(
                "config version {} is newer than supported version {CONFIG_VERSION}",
                self.version
            )));
        }
        if self.root.as_os_str().is_empty() {
            return Err(ServerError::Config("root must be set".into()));
        }
        if self.state.as_os_str().is_empty() {
            return Err(ServerError::Config("state must be set".into()));
        }
        if self.root == self.state {
            return Err(ServerError::Config("root and state must be different directories".into()));
        }
        Ok(())
    }

    /// The raw table for a plugin, looked up by URI first and then by id.
    pub fn plugin_config(&self, uri: &str, id: &str) -> Option<toml::Value> {
        self.plugins.get(uri).or_else(|| self.plugins.get(id)).cloned()
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrd_types::Classify;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.grpc.address, "/run/ctrd/ctrd.sock");
        assert_eq!(config.debug.level, "info");
    }

    #[test]
    fn default_renders_and_parses_back() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            root = "/data/ctrd"
            disabled_plugins = ["io.ctrd.snapshotter.v1.overlayfs"]

            [debug]
            level = "debug"

            [plugins."io.ctrd.gc.v1.scheduler"]
            mutation_threshold = 5

            [plugins.naive]
            extra = true
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/data/ctrd"));
        assert_eq!(config.state, PathBuf::from("/run/ctrd"));
        assert_eq!(config.debug.level, "debug");
        assert_eq!(config.disabled_plugins.len(), 1);

        let gc = config.plugin_config("io.ctrd.gc.v1.scheduler", "scheduler").unwrap();
        assert_eq!(gc.get("mutation_threshold").and_then(toml::Value::as_integer), Some(5));
        assert!(config.plugin_config("io.ctrd.snapshotter.v1.naive", "naive").is_some());
        assert!(config.plugin_config("io.ctrd.content.v1.content", "content").is_none());
    }

    #[test]
    fn validate_rejects_bad_directories() {
        let mut config = Config::default();
        config.state = config.root.clone();
        assert!(config.validate().unwrap_err().is_invalid_argument());

        let mut config = Config::default();
        config.root = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.version = CONFIG_VERSION + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());

        fs::write(&path, "root = 3").unwrap();
        assert!(matches!(Config::load_or_default(&path), Err(ServerError::Parse(_))));
    }
}
