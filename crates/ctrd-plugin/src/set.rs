use std::collections::BTreeMap;

use crate::context::Meta;
use crate::error::{PluginError, Result};
use crate::plugin::{Instance, PluginType};

/// Result of initializing one plugin.
#[derive(Clone, Debug)]
pub enum Status {
    Loaded(Instance),
    /// The plugin reported a skip; the reason is kept for introspection.
    Skipped(String),
}

/// An initialized (or skipped) plugin.
#[derive(Clone, Debug)]
pub struct Plugin {
    pub plugin_type: PluginType,
    pub id: String,
    pub meta: Meta,
    pub status: Status,
}

impl Plugin {
    pub fn uri(&self) -> String {
        format!("{}.{}", self.plugin_type, self.id)
    }

    pub fn instance(&self) -> Option<&Instance> {
        match &self.status {
            Status::Loaded(instance) => Some(instance),
            Status::Skipped(_) => None,
        }
    }
}

/// Plugins in the order they were initialized.
#[derive(Debug, Default)]
pub struct PluginSet {
    ordered: Vec<Plugin>,
    by_type: BTreeMap<PluginType, Vec<usize>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Plugin) -> Result<()> {
        if self.get_plugin(&plugin.plugin_type, &plugin.id).is_some() {
            return Err(PluginError::AlreadyRegistered(plugin.uri()));
        }
        self.by_type
            .entry(plugin.plugin_type.clone())
            .or_default()
            .push(self.ordered.len());
        self.ordered.push(plugin);
        Ok(())
    }

    fn of_type<'a>(&'a self, plugin_type: &PluginType) -> impl Iterator<Item = &'a Plugin> + 'a {
        self.by_type
            .get(plugin_type)
            .into_iter()
            .flatten()
            .map(move |&i| &self.ordered[i])
    }

    pub fn get_plugin(&self, plugin_type: &PluginType, id: &str) -> Option<&Plugin> {
        self.of_type(plugin_type).find(|p| p.id == id)
    }

    /// The first loaded instance of a type.
    pub fn get(&self, plugin_type: &PluginType) -> Result<&Instance> {
        self.of_type(plugin_type)
            .find_map(Plugin::instance)
            .ok_or_else(|| PluginError::NotFound(plugin_type.to_string()))
    }

    pub fn get_by_id(&self, plugin_type: &PluginType, id: &str) -> Result<&Instance> {
        self.get_plugin(plugin_type, id)
            .and_then(Plugin::instance)
            .ok_or_else(|| PluginError::NotFound(format!("{plugin_type}.{id}")))
    }

    /// Every loaded instance of a type, by id.
    pub fn get_all(&self, plugin_type: &PluginType) -> BTreeMap<String, &Instance> {
        self.of_type(plugin_type)
            .filter_map(|p| p.instance().map(|i| (p.id.clone(), i)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plugin> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
