use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use ctrd_events::Exchange;
use ctrd_plugin::{InitContext, Plugin, PluginSet, Registry, Status};

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::service::ServiceTable;

/// A started daemon: every plugin initialized and every service registered.
pub struct Server {
    config: Config,
    plugins: PluginSet,
    services: ServiceTable,
    events: Arc<Exchange>,
}

impl Server {
    /// Initialize the plugins of `registry` in dependency order.
    ///
    /// A plugin that reports a skip is recorded and startup continues. Any
    /// other init failure aborts startup; nothing is registered with the
    /// transport unless every plugin got through.
    pub fn new(config: Config, registry: &Registry) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        fs::create_dir_all(&config.state)?;
        scan_plugin_dir(&config.root.join("plugins"))?;

        let order = registry.resolve(&config.disabled_plugins)?;
        let events = Arc::new(Exchange::new());
        let mut plugins = PluginSet::new();

        for registration in order {
            let uri = registration.uri();
            info!(uri = %uri, "loading plugin");

            let (result, meta) = {
                let mut ic = InitContext::new(registration, &plugins, &config.root, &config.state)
                    .with_config(config.plugin_config(&uri, &registration.id));
                ic.address = config.grpc.address.clone();
                ic.events = Arc::clone(&events);
                let result = registration.init(&mut ic);
                (result, ic.meta)
            };

            let status = match result {
                Ok(instance) => Status::Loaded(instance),
                Err(e) if e.is_skip() => {
                    info!(uri = %uri, reason = %e, "skip loading plugin");
                    Status::Skipped(e.to_string())
                }
                Err(source) => {
                    error!(uri = %uri, error = %source, "failed to load plugin");
                    return Err(ServerError::Init { uri, source });
                }
            };

            plugins.add(Plugin {
                plugin_type: registration.plugin_type.clone(),
                id: registration.id.clone(),
                meta,
                status,
            })?;
        }

        let mut services = ServiceTable::new();
        for plugin in plugins.iter() {
            if let Some(service) = plugin.instance().and_then(|i| i.as_service()) {
                debug!(uri = %plugin.uri(), "registering service");
                service.register(&mut services)?;
            }
        }
        info!(
            plugins = plugins.len(),
            services = services.len(),
            address = %config.grpc.address,
            "daemon started"
        );

        Ok(Self {
            config,
            plugins,
            services,
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    /// The event sink every plugin publishes to.
    pub fn events(&self) -> &Arc<Exchange> {
        &self.events
    }
}

/// Create the directory dynamically loaded plugins would live in. Loading
/// them is not supported, so anything found there is only reported.
fn scan_plugin_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        warn!(path = %entry.path().display(), "ignoring entry in plugin directory, dynamic plugins are not supported");
    }
    Ok(())
}
