use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::context::InitContext;
use crate::error::{PluginError, Result};

/// Kind of capability a plugin provides. Requirements name types, not
/// individual plugins.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginType(Cow<'static, str>);

impl PluginType {
    pub const CONTENT: Self = Self(Cow::Borrowed("io.ctrd.content.v1"));
    pub const SNAPSHOTTER: Self = Self(Cow::Borrowed("io.ctrd.snapshotter.v1"));
    pub const METADATA: Self = Self(Cow::Borrowed("io.ctrd.metadata.v1"));
    pub const GC: Self = Self(Cow::Borrowed("io.ctrd.gc.v1"));
    pub const SERVICE: Self = Self(Cow::Borrowed("io.ctrd.service.v1"));
    pub const INTERNAL: Self = Self(Cow::Borrowed("io.ctrd.internal.v1"));
    /// Requirement on every other plugin. Must be the only requirement.
    pub const ALL: Self = Self(Cow::Borrowed("*"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == "*"
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receives the services of initialized plugins.
pub trait Transport {
    fn register(&mut self, name: &str, handler: Arc<dyn Any + Send + Sync>) -> Result<()>;
}

/// Capability of an instance that exposes itself over the transport.
pub trait Service: Send + Sync {
    fn register(&self, transport: &mut dyn Transport) -> Result<()>;
}

/// What an init function produced.
///
/// Whether an instance is a service is fixed by the constructor its plugin
/// used, not discovered afterwards.
#[derive(Clone)]
pub enum Instance {
    Value(Arc<dyn Any + Send + Sync>),
    Service {
        value: Arc<dyn Any + Send + Sync>,
        service: Arc<dyn Service>,
    },
}

impl Instance {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(Arc::new(value))
    }

    pub fn service<T: Service + Any>(value: T) -> Self {
        let value = Arc::new(value);
        Self::Service {
            value: value.clone(),
            service: value,
        }
    }

    pub fn value(&self) -> &Arc<dyn Any + Send + Sync> {
        match self {
            Self::Value(value) | Self::Service { value, .. } => value,
        }
    }

    pub fn as_service(&self) -> Option<&Arc<dyn Service>> {
        match self {
            Self::Value(_) => None,
            Self::Service { service, .. } => Some(service),
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(self.value()).downcast::<T>().ok()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Instance::Value"),
            Self::Service { .. } => f.write_str("Instance::Service"),
        }
    }
}

pub type InitFn = Box<dyn Fn(&mut InitContext<'_>) -> Result<Instance> + Send + Sync>;

/// Static description of a plugin. Never mutated once registered.
pub struct Registration {
    pub plugin_type: PluginType,
    pub id: String,
    pub requires: Vec<PluginType>,
    config: Option<toml::Value>,
    config_error: Option<String>,
    init: InitFn,
}

impl Registration {
    pub fn new(
        plugin_type: PluginType,
        id: impl Into<String>,
        init: impl Fn(&mut InitContext<'_>) -> Result<Instance> + Send + Sync + 'static,
    ) -> Self {
        Self {
            plugin_type,
            id: id.into(),
            requires: Vec::new(),
            config: None,
            config_error: None,
            init: Box::new(init),
        }
    }

    pub fn requires(mut self, plugin_type: PluginType) -> Self {
        self.requires.push(plugin_type);
        self
    }

    /// Default configuration, overlaid by the plugin's table in the config
    /// file. It must serialize to a TOML table; otherwise the registration
    /// fails [`validate`](Self::validate).
    pub fn with_config<T: Serialize>(mut self, config: &T) -> Self {
        let table = toml::Value::try_from(config).map_err(|e| e.to_string()).and_then(|value| {
            if value.is_table() {
                Ok(value)
            } else {
                Err(format!("expected a table, got {}", value.type_str()))
            }
        });
        match table {
            Ok(value) => {
                self.config = Some(value);
                self.config_error = None;
            }
            Err(message) => {
                warn!(uri = %self.uri(), error = %message, "default config is not representable as toml");
                self.config = None;
                self.config_error = Some(message);
            }
        }
        self
    }

    pub fn default_config(&self) -> Option<&toml::Value> {
        self.config.as_ref()
    }

    /// `<type>.<id>`, the plugin's unique name.
    pub fn uri(&self) -> String {
        format!("{}.{}", self.plugin_type, self.id)
    }

    pub fn requires_all(&self) -> bool {
        self.requires.iter().any(PluginType::is_wildcard)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_type.as_str().is_empty() {
            return Err(PluginError::NoType);
        }
        if self.id.is_empty() {
            return Err(PluginError::NoId(self.plugin_type.to_string()));
        }
        if self.requires_all() && self.requires.len() != 1 {
            return Err(PluginError::InvalidRequires(self.uri()));
        }
        if let Some(message) = &self.config_error {
            return Err(PluginError::Config {
                uri: self.uri(),
                message: format!("default config: {message}"),
            });
        }
        Ok(())
    }

    /// Run the plugin's init function.
    pub fn init(&self, ic: &mut InitContext<'_>) -> Result<Instance> {
        (self.init)(ic)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("uri", &self.uri())
            .field("requires", &self.requires)
            .finish()
    }
}

/// A registration contributed at link time with `inventory::submit!`.
pub struct StaticRegistration {
    pub build: fn() -> Registration,
}

inventory::collect!(StaticRegistration);
