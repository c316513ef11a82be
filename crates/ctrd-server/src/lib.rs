//! Daemon startup for ctrd.
//!
//! [`Server::new`] takes a [`Config`] and a plugin
//! [`Registry`](ctrd_plugin::Registry), resolves the initialization order,
//! runs every init function in that order and finally registers the
//! service plugins with a [`ServiceTable`]. The plugins that ship with the
//! daemon are in [`builtins`].

pub mod builtins;
pub mod config;
pub mod error;
pub mod server;
pub mod service;

pub use builtins::{builtin_registry, register_builtins};
pub use config::{Config, DebugConfig, GrpcConfig, CONFIG_VERSION};
pub use error::{Result, ServerError};
pub use server::Server;
pub use service::{
    ContentService, IntrospectionService, NamespacesService, PluginInfo, ServiceTable, SnapshotsService,
};
