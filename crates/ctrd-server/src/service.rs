use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use ctrd_metadata::{GcStats, NamespaceStore, NamespacedContent, NamespacedSnapshotter, Result, DB};
use ctrd_plugin::{Meta, PluginError, PluginSet, Service, Status, Transport};

/// In-process transport: records every registered service by name, in
/// registration order.
#[derive(Default)]
pub struct ServiceTable {
    order: Vec<String>,
    handlers: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service names in the order they were registered.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.handlers.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Transport for ServiceTable {
    fn register(&mut self, name: &str, handler: Arc<dyn Any + Send + Sync>) -> ctrd_plugin::Result<()> {
        if self.handlers.contains_key(name) {
            return Err(PluginError::DuplicateService(name.to_string()));
        }
        self.order.push(name.to_string());
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.order).finish()
    }
}

/// Namespaced access to the content store.
#[derive(Clone)]
pub struct ContentService {
    db: Arc<DB>,
}

impl ContentService {
    pub const NAME: &'static str = "ctrd.services.content.v1.Content";

    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn store(&self, namespace: &str) -> Result<NamespacedContent> {
        self.db.content_store(namespace)
    }
}

impl Service for ContentService {
    fn register(&self, transport: &mut dyn Transport) -> ctrd_plugin::Result<()> {
        transport.register(Self::NAME, Arc::new(self.clone()))
    }
}

/// Namespaced access to the named snapshotters.
#[derive(Clone)]
pub struct SnapshotsService {
    db: Arc<DB>,
}

impl SnapshotsService {
    pub const NAME: &'static str = "ctrd.services.snapshots.v1.Snapshots";

    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn snapshotter(&self, name: &str, namespace: &str) -> Result<NamespacedSnapshotter> {
        self.db.snapshotter(name, namespace)
    }

    pub fn snapshotters(&self) -> Vec<String> {
        self.db.snapshotter_names()
    }

    /// Run a collection pass right away.
    pub fn collect_garbage(&self) -> Result<GcStats> {
        self.db.garbage_collect()
    }
}

impl Service for SnapshotsService {
    fn register(&self, transport: &mut dyn Transport) -> ctrd_plugin::Result<()> {
        transport.register(Self::NAME, Arc::new(self.clone()))
    }
}

#[derive(Clone)]
pub struct NamespacesService {
    db: Arc<DB>,
}

impl NamespacesService {
    pub const NAME: &'static str = "ctrd.services.namespaces.v1.Namespaces";

    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn namespaces(&self) -> NamespaceStore {
        self.db.namespaces()
    }
}

impl Service for NamespacesService {
    fn register(&self, transport: &mut dyn Transport) -> ctrd_plugin::Result<()> {
        transport.register(Self::NAME, Arc::new(self.clone()))
    }
}

/// What introspection reports about one plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub id: String,
    pub meta: Meta,
    /// Skip reason, if the plugin did not load.
    pub skipped: Option<String>,
}

/// Reports every plugin initialized before it and how it fared.
#[derive(Clone)]
pub struct IntrospectionService {
    plugins: Arc<Vec<PluginInfo>>,
}

impl IntrospectionService {
    pub const NAME: &'static str = "ctrd.services.introspection.v1.Introspection";

    pub fn new(set: &PluginSet) -> Self {
        let plugins = set
            .iter()
            .map(|p| PluginInfo {
                plugin_type: p.plugin_type.to_string(),
                id: p.id.clone(),
                meta: p.meta.clone(),
                skipped: match &p.status {
                    Status::Loaded(_) => None,
                    Status::Skipped(reason) => Some(reason.clone()),
                },
            })
            .collect();
        Self {
            plugins: Arc::new(plugins),
        }
    }

    pub fn plugins(&self) -> &[PluginInfo] {
        &self.plugins
    }
}

impl Service for IntrospectionService {
    fn register(&self, transport: &mut dyn Transport) -> ctrd_plugin::Result<()> {
        transport.register(Self::NAME, Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrd_plugin::{Instance, Plugin, PluginType};
    use ctrd_types::Classify;

    #[test]
    fn table_keeps_registration_order() {
        let mut table = ServiceTable::new();
        table.register("b", Arc::new(2u8)).unwrap();
        table.register("a", Arc::new(1u8)).unwrap();
        assert_eq!(table.names(), ["b", "a"]);
        assert_eq!(table.get::<u8>("a").as_deref(), Some(&1));
        assert!(table.get::<u32>("a").is_none());

        let err = table.register("a", Arc::new(3u8)).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn introspection_reports_skips() {
        let mut set = PluginSet::new();
        set.add(Plugin {
            plugin_type: PluginType::CONTENT,
            id: "content".into(),
            meta: Meta::default(),
            status: Status::Loaded(Instance::new(())),
        })
        .unwrap();
        set.add(Plugin {
            plugin_type: PluginType::SNAPSHOTTER,
            id: "overlayfs".into(),
            meta: Meta::default(),
            status: Status::Skipped("overlayfs requires linux".into()),
        })
        .unwrap();

        let svc = IntrospectionService::new(&set);
        assert_eq!(svc.plugins().len(), 2);
        assert_eq!(svc.plugins()[0].skipped, None);
        assert_eq!(svc.plugins()[1].skipped.as_deref(), Some("overlayfs requires linux"));

        let mut table = ServiceTable::new();
        svc.register(&mut table).unwrap();
        assert!(table.get::<IntrospectionService>(IntrospectionService::NAME).is_some());
    }
}
