//! Plugin registrations and their initialization order.
//!
//! Every capability of the daemon (content store, snapshotters, metadata,
//! garbage collection, services) is a plugin: a [`Registration`] naming its
//! [`PluginType`], an id, the types it requires and an init function. A
//! [`Registry`] orders the registrations so that each plugin is initialized
//! after everything it requires, and each init function receives an
//! [`InitContext`] through which it can look up the instances initialized
//! before it.
//!
//! # Design Rules
//!
//! 1. Requirements name plugin types, never individual plugins.
//! 2. A plugin requiring `*` is initialized after every other plugin and
//!    may not list any other requirement.
//! 3. Independent plugins are initialized in registration order.
//! 4. A plugin that cannot run on this host reports a skip; the daemon
//!    keeps going without it.

pub mod context;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod set;

pub use context::{merge, InitContext, Meta};
pub use error::{PluginError, Result};
pub use plugin::{InitFn, Instance, PluginType, Registration, Service, StaticRegistration, Transport};
pub use registry::Registry;
pub use set::{Plugin, PluginSet, Status};

/// Re-exported so plugins can be contributed with
/// `ctrd_plugin::inventory::submit!` without a direct dependency.
pub use inventory;
