//! Plugins that ship with the daemon.
//!
//! The snapshotters contribute themselves with `inventory::submit!`; the
//! rest are registered explicitly by [`register_builtins`].

use std::fs;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use ctrd_content::{ContentStore, LocalStore};
use ctrd_events::Publisher;
use ctrd_metadata::{GcScheduler, KvStore, SchedulerConfig, DB};
use ctrd_plugin::{
    InitContext, Instance, PluginError, PluginType, Registration, Registry, Result, StaticRegistration,
};
use ctrd_snapshot::{NaiveSnapshotter, OverlaySnapshotter, Snapshotter};

use crate::service::{ContentService, IntrospectionService, NamespacesService, SnapshotsService};

/// Register every builtin plugin that is not self-registered.
pub fn register_builtins(registry: &mut Registry) -> Result<()> {
    registry.register(content())?;
    registry.register(metadata())?;
    registry.register(gc_scheduler())?;
    registry.register(content_service())?;
    registry.register(snapshots_service())?;
    registry.register(namespaces_service())?;
    registry.register(introspection())?;
    Ok(())
}

/// All builtins: the self-registered ones plus [`register_builtins`].
pub fn builtin_registry() -> Result<Registry> {
    let mut registry = Registry::with_builtins()?;
    register_builtins(&mut registry)?;
    Ok(registry)
}

inventory::submit! {
    StaticRegistration { build: naive }
}

inventory::submit! {
    StaticRegistration { build: overlayfs }
}

fn export_root(ic: &mut InitContext<'_>) {
    let root = ic.root.display().to_string();
    ic.meta.exports.insert("root".into(), root);
}

pub fn content() -> Registration {
    Registration::new(PluginType::CONTENT, "content", |ic| {
        let store = LocalStore::open(&ic.root).map_err(PluginError::other)?;
        export_root(ic);
        Ok(Instance::new(Arc::new(store) as Arc<dyn ContentStore>))
    })
}

pub fn naive() -> Registration {
    Registration::new(PluginType::SNAPSHOTTER, "naive", |ic| {
        let snapshotter = NaiveSnapshotter::open(&ic.root).map_err(PluginError::other)?;
        export_root(ic);
        Ok(Instance::new(Arc::new(snapshotter) as Arc<dyn Snapshotter>))
    })
}

pub fn overlayfs() -> Registration {
    Registration::new(PluginType::SNAPSHOTTER, "overlayfs", |ic| {
        if !cfg!(target_os = "linux") {
            return Err(PluginError::skip("overlayfs requires linux"));
        }
        let snapshotter = OverlaySnapshotter::open(&ic.root).map_err(PluginError::other)?;
        export_root(ic);
        ic.meta.platforms.push("linux".into());
        Ok(Instance::new(Arc::new(snapshotter) as Arc<dyn Snapshotter>))
    })
}

/// The metadata store over the first content store and every loaded
/// snapshotter.
pub fn metadata() -> Registration {
    Registration::new(PluginType::METADATA, "index", |ic| {
        let content = ic.get::<Arc<dyn ContentStore>>(&PluginType::CONTENT)?;
        let snapshotters: Vec<(String, Arc<dyn Snapshotter>)> = ic
            .get_all::<Arc<dyn Snapshotter>>(&PluginType::SNAPSHOTTER)?
            .into_iter()
            .map(|(name, s)| (name, (*s).clone()))
            .collect();

        fs::create_dir_all(&ic.root)?;
        let path = ic.root.join("meta.db");
        let kv = KvStore::open(&path).map_err(PluginError::other)?;
        let names: Vec<&str> = snapshotters.iter().map(|(n, _)| n.as_str()).collect();
        info!(path = %path.display(), snapshotters = ?names, "opening metadata index");

        let publisher: Arc<dyn Publisher> = ic.events.clone();
        let db = DB::new(kv, (*content).clone(), snapshotters).with_publisher(publisher);
        db.init().map_err(PluginError::other)?;
        ic.meta.exports.insert("path".into(), path.display().to_string());
        Ok(Instance::new(db))
    })
    .requires(PluginType::CONTENT)
    .requires(PluginType::SNAPSHOTTER)
}

/// Background garbage collection driven by metadata mutations.
pub fn gc_scheduler() -> Registration {
    Registration::new(PluginType::GC, "scheduler", |ic| {
        let db = ic.get::<DB>(&PluginType::METADATA)?;
        let config: SchedulerConfig = ic.decode_config()?;
        if Handle::try_current().is_err() {
            return Err(PluginError::skip("no async runtime to schedule collection on"));
        }
        let scheduler = GcScheduler::start(db.clone(), config).map_err(|e| PluginError::Config {
            uri: ic.uri().to_string(),
            message: e.to_string(),
        })?;
        db.register_mutation_callback(scheduler.mutation_callback());
        Ok(Instance::new(scheduler))
    })
    .requires(PluginType::METADATA)
    .with_config(&SchedulerConfig::default())
}

pub fn content_service() -> Registration {
    Registration::new(PluginType::SERVICE, "content", |ic| {
        let db = ic.get::<DB>(&PluginType::METADATA)?;
        Ok(Instance::service(ContentService::new(db)))
    })
    .requires(PluginType::METADATA)
}

pub fn snapshots_service() -> Registration {
    Registration::new(PluginType::SERVICE, "snapshots", |ic| {
        let db = ic.get::<DB>(&PluginType::METADATA)?;
        Ok(Instance::service(SnapshotsService::new(db)))
    })
    .requires(PluginType::METADATA)
}

pub fn namespaces_service() -> Registration {
    Registration::new(PluginType::SERVICE, "namespaces", |ic| {
        let db = ic.get::<DB>(&PluginType::METADATA)?;
        Ok(Instance::service(NamespacesService::new(db)))
    })
    .requires(PluginType::METADATA)
}

pub fn introspection() -> Registration {
    Registration::new(PluginType::SERVICE, "introspection", |ic| {
        Ok(Instance::service(IntrospectionService::new(ic.plugins())))
    })
    .requires(PluginType::ALL)
}
