use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use ctrd_events::Exchange;

use crate::error::{PluginError, Result};
use crate::plugin::{Instance, PluginType, Registration};
use crate::set::PluginSet;

/// Facts a plugin declares about itself while initializing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub exports: BTreeMap<String, String>,
    pub platforms: Vec<String>,
    pub capabilities: Vec<String>,
}

/// Everything an init function gets to work with.
pub struct InitContext<'a> {
    /// Persistent directory of this plugin, `<root>/<uri>`.
    pub root: PathBuf,
    /// Runtime directory of this plugin, `<state>/<uri>`.
    pub state: PathBuf,
    pub address: String,
    pub events: Arc<Exchange>,
    /// The registration's default config overlaid by the config file.
    pub config: Option<toml::Value>,
    pub meta: Meta,
    uri: String,
    plugins: &'a PluginSet,
}

impl<'a> InitContext<'a> {
    pub fn new(registration: &Registration, plugins: &'a PluginSet, root: &Path, state: &Path) -> Self {
        let uri = registration.uri();
        Self {
            root: root.join(&uri),
            state: state.join(&uri),
            address: String::new(),
            events: Arc::new(Exchange::new()),
            config: registration.default_config().cloned(),
            meta: Meta::default(),
            uri,
            plugins,
        }
    }

    /// Overlay the plugin's table from the config file onto its defaults.
    pub fn with_config(mut self, table: Option<toml::Value>) -> Self {
        self.config = match (self.config.take(), table) {
            (Some(base), Some(overlay)) => Some(merge(base, overlay)),
            (base, overlay) => overlay.or(base),
        };
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Decode the plugin's config, falling back to `T::default()` when the
    /// plugin has none.
    pub fn decode_config<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match &self.config {
            None => Ok(T::default()),
            Some(value) => value.clone().try_into().map_err(|e: toml::de::Error| PluginError::Config {
                uri: self.uri.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// The first loaded instance of `plugin_type`.
    pub fn get<T: Any + Send + Sync>(&self, plugin_type: &PluginType) -> Result<Arc<T>> {
        downcast(self.plugins.get(plugin_type)?, plugin_type.as_str())
    }

    pub fn get_by_id<T: Any + Send + Sync>(&self, plugin_type: &PluginType, id: &str) -> Result<Arc<T>> {
        let instance = self.plugins.get_by_id(plugin_type, id)?;
        downcast(instance, &format!("{plugin_type}.{id}"))
    }

    /// Every loaded instance of `plugin_type`, by id.
    pub fn get_all<T: Any + Send + Sync>(&self, plugin_type: &PluginType) -> Result<BTreeMap<String, Arc<T>>> {
        self.plugins
            .get_all(plugin_type)
            .into_iter()
            .map(|(id, instance)| {
                let value = downcast(instance, &format!("{plugin_type}.{id}"))?;
                Ok((id, value))
            })
            .collect()
    }

    /// Plugins initialized before this one.
    pub fn plugins(&self) -> &'a PluginSet {
        self.plugins
    }
}

fn downcast<T: Any + Send + Sync>(instance: &Instance, uri: &str) -> Result<Arc<T>> {
    instance.downcast::<T>().ok_or_else(|| PluginError::TypeMismatch {
        uri: uri.to_string(),
        expected: type_name::<T>(),
    })
}

/// Merge `overlay` into `base`. Tables merge key by key; anything else in
/// `overlay` replaces the value in `base`.
pub fn merge(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            toml::Value::Table(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::set::{Plugin, Status};
    use ctrd_types::Classify;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Cfg {
        threshold: u32,
        name: String,
    }

    fn registration() -> Registration {
        Registration::new(PluginType::GC, "scheduler", |_| Ok(Instance::new(())))
    }

    #[test]
    fn directories_are_per_plugin() {
        let set = PluginSet::new();
        let ic = InitContext::new(&registration(), &set, Path::new("/var/lib/ctrd"), Path::new("/run/ctrd"));
        assert_eq!(ic.root, Path::new("/var/lib/ctrd/io.ctrd.gc.v1.scheduler"));
        assert_eq!(ic.state, Path::new("/run/ctrd/io.ctrd.gc.v1.scheduler"));
        assert_eq!(ic.uri(), "io.ctrd.gc.v1.scheduler");
    }

    #[test]
    fn config_overlays_defaults() {
        let set = PluginSet::new();
        let reg = registration().with_config(&Cfg { threshold: 5, name: "default".into() });
        let overlay: toml::Value = toml::from_str("threshold = 9").unwrap();
        let ic = InitContext::new(&reg, &set, Path::new("/r"), Path::new("/s")).with_config(Some(overlay));
        let cfg: Cfg = ic.decode_config().unwrap();
        assert_eq!(cfg, Cfg { threshold: 9, name: "default".into() });

        let bare = InitContext::new(&registration(), &set, Path::new("/r"), Path::new("/s"));
        assert_eq!(bare.decode_config::<Cfg>().unwrap(), Cfg::default());

        let bad: toml::Value = toml::from_str("threshold = \"many\"").unwrap();
        let ic = InitContext::new(&registration(), &set, Path::new("/r"), Path::new("/s")).with_config(Some(bad));
        assert!(ic.decode_config::<Cfg>().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn typed_lookups() {
        let mut set = PluginSet::new();
        for (id, n) in [("a", 1u32), ("b", 2u32)] {
            set.add(Plugin {
                plugin_type: PluginType::CONTENT,
                id: id.to_string(),
                meta: Meta::default(),
                status: Status::Loaded(Instance::new(n)),
            })
            .unwrap();
        }
        let ic = InitContext::new(&registration(), &set, Path::new("/r"), Path::new("/s"));
        assert_eq!(*ic.get::<u32>(&PluginType::CONTENT).unwrap(), 1);
        assert_eq!(*ic.get_by_id::<u32>(&PluginType::CONTENT, "b").unwrap(), 2);
        assert_eq!(ic.get_all::<u32>(&PluginType::CONTENT).unwrap().len(), 2);
        assert!(matches!(
            ic.get::<String>(&PluginType::CONTENT),
            Err(PluginError::TypeMismatch { .. })
        ));
        assert!(ic.get::<u32>(&PluginType::METADATA).unwrap_err().is_not_found());
    }

    #[test]
    fn merge_is_recursive() {
        let base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3\nz = 4").unwrap();
        let merged = merge(base, overlay);
        let a = merged.get("a").unwrap();
        assert_eq!(a.get("x").and_then(toml::Value::as_integer), Some(1));
        assert_eq!(a.get("y").and_then(toml::Value::as_integer), Some(3));
        assert_eq!(a.get("z").and_then(toml::Value::as_integer), Some(4));
    }
}
