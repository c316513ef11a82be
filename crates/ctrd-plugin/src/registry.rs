use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{PluginError, Result};
use crate::plugin::{Registration, StaticRegistration};

/// The plugins known to a daemon, in registration order.
///
/// Built once at startup and handed to the server; there is no global
/// registry.
#[derive(Debug, Default)]
pub struct Registry {
    registrations: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every plugin contributed with `inventory::submit!`.
    ///
    /// Link order is not stable, so these are registered sorted by URI.
    pub fn with_builtins() -> Result<Self> {
        let mut statics: Vec<Registration> =
            inventory::iter::<StaticRegistration>().map(|s| (s.build)()).collect();
        statics.sort_by_key(Registration::uri);
        let mut registry = Self::new();
        for registration in statics {
            registry.register(registration)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, registration: Registration) -> Result<()> {
        registration.validate()?;
        let uri = registration.uri();
        if self.registrations.iter().any(|r| r.uri() == uri) {
            return Err(PluginError::AlreadyRegistered(uri));
        }
        debug!(uri = %uri, requires = ?registration.requires, "plugin registered");
        self.registrations.push(registration);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Order the registrations not named in `disabled` (by URI) for
    /// initialization.
    ///
    /// Every plugin comes after all plugins of the types it requires, and
    /// plugins requiring `*` come after everything else. Independent plugins
    /// keep their registration order.
    pub fn resolve(&self, disabled: &[String]) -> Result<Vec<&Registration>> {
        let enabled: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| !disabled.contains(&r.uri()))
            .collect();
        let (last, concrete): (Vec<&Registration>, Vec<&Registration>) =
            enabled.into_iter().partition(|r| r.requires_all());

        // deps[i]: plugins that must precede concrete[i].
        let deps: Vec<Vec<usize>> = concrete
            .iter()
            .enumerate()
            .map(|(i, r)| {
                concrete
                    .iter()
                    .enumerate()
                    .filter(|(j, other)| *j != i && r.requires.contains(&other.plugin_type))
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        // A concrete plugin cannot wait for one that waits for everything.
        for r in &concrete {
            if let Some(w) = last.iter().find(|w| r.requires.contains(&w.plugin_type)) {
                return Err(PluginError::Cycle(vec![r.uri(), w.uri()]));
            }
        }

        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..concrete.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(concrete.len() + last.len());
        while let Some(i) = ready.pop_first() {
            order.push(concrete[i]);
            for (j, d) in deps.iter().enumerate() {
                if d.contains(&i) {
                    pending[j] -= 1;
                    if pending[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
        }

        if order.len() < concrete.len() {
            let stuck = (0..concrete.len())
                .filter(|&i| pending[i] > 0)
                .map(|i| concrete[i].uri())
                .collect();
            return Err(PluginError::Cycle(stuck));
        }

        order.extend(last);
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use proptest::prelude::*;

    use super::*;
    use crate::context::{InitContext, Meta};
    use crate::plugin::{Instance, PluginType};
    use crate::set::{Plugin, PluginSet, Status};
    use ctrd_types::Classify;

    fn reg(plugin_type: &PluginType, id: &str, requires: &[&PluginType]) -> Registration {
        requires.iter().fold(
            Registration::new(plugin_type.clone(), id, |_| Ok(Instance::new(()))),
            |r, t| r.requires((*t).clone()),
        )
    }

    fn uris(order: &[&Registration]) -> Vec<String> {
        order.iter().map(|r| r.uri()).collect()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[test]
    fn duplicates_and_mixed_wildcards_rejected() {
        let mut registry = Registry::new();
        registry.register(reg(&PluginType::CONTENT, "content", &[])).unwrap();
        let err = registry.register(reg(&PluginType::CONTENT, "content", &[])).unwrap_err();
        assert!(err.is_already_exists());

        let mixed = reg(&PluginType::SERVICE, "x", &[&PluginType::ALL, &PluginType::CONTENT]);
        assert!(matches!(registry.register(mixed), Err(PluginError::InvalidRequires(_))));
        assert_eq!(registry.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[test]
    fn requirements_come_first() {
        let mut registry = Registry::new();
        registry
            .register(reg(&PluginType::METADATA, "index", &[&PluginType::CONTENT, &PluginType::SNAPSHOTTER]))
            .unwrap();
        registry.register(reg(&PluginType::SERVICE, "introspection", &[&PluginType::ALL])).unwrap();
        registry.register(reg(&PluginType::SNAPSHOTTER, "naive", &[])).unwrap();
        registry.register(reg(&PluginType::CONTENT, "content", &[])).unwrap();
        registry.register(reg(&PluginType::SNAPSHOTTER, "overlayfs", &[])).unwrap();

        let order = registry.resolve(&[]).unwrap();
        assert_eq!(
            uris(&order),
            vec![
                "io.ctrd.snapshotter.v1.naive",
                "io.ctrd.content.v1.content",
                "io.ctrd.snapshotter.v1.overlayfs",
                "io.ctrd.metadata.v1.index",
                "io.ctrd.service.v1.introspection",
            ]
        );
    }

    #[test]
    fn disabled_plugins_are_left_out() {
        let mut registry = Registry::new();
        registry.register(reg(&PluginType::SNAPSHOTTER, "naive", &[])).unwrap();
        registry.register(reg(&PluginType::SNAPSHOTTER, "overlayfs", &[])).unwrap();
        let order = registry.resolve(&["io.ctrd.snapshotter.v1.overlayfs".to_string()]).unwrap();
        assert_eq!(uris(&order), vec!["io.ctrd.snapshotter.v1.naive"]);
    }

    #[test]
    fn cycles_are_reported() {
        let a = PluginType::new("test.a");
        let b = PluginType::new("test.b");
        let mut registry = Registry::new();
        registry.register(reg(&PluginType::CONTENT, "free", &[])).unwrap();
        registry.register(reg(&a, "one", &[&b])).unwrap();
        registry.register(reg(&b, "two", &[&a])).unwrap();
        match registry.resolve(&[]) {
            Err(PluginError::Cycle(uris)) => assert_eq!(uris, vec!["test.a.one", "test.b.two"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn depending_on_a_wildcard_plugin_is_a_cycle() {
        let mut registry = Registry::new();
        registry.register(reg(&PluginType::SERVICE, "introspection", &[&PluginType::ALL])).unwrap();
        registry.register(reg(&PluginType::INTERNAL, "needs", &[&PluginType::SERVICE])).unwrap();
        assert!(registry.resolve(&[]).unwrap_err().is_failed_precondition());
    }

    #[test]
    fn same_type_plugins_do_not_depend_on_themselves() {
        let t = PluginType::new("test.chain");
        let mut registry = Registry::new();
        registry.register(reg(&t, "solo", &[&t])).unwrap();
        assert_eq!(registry.resolve(&[]).unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // End to end
    // -----------------------------------------------------------------------

    #[test]
    fn init_in_order_with_lookups() {
        let mut registry = Registry::new();
        registry
            .register(
                Registration::new(PluginType::METADATA, "index", |ic| {
                    let content = ic.get::<String>(&PluginType::CONTENT)?;
                    let snapshotters = ic.get_all::<String>(&PluginType::SNAPSHOTTER)?;
                    Ok(Instance::new(format!("{content}+{}", snapshotters.len())))
                })
                .requires(PluginType::CONTENT)
                .requires(PluginType::SNAPSHOTTER),
            )
            .unwrap();
        registry
            .register(Registration::new(PluginType::SNAPSHOTTER, "naive", |_| {
                Ok(Instance::new("naive".to_string()))
            }))
            .unwrap();
        registry
            .register(Registration::new(PluginType::CONTENT, "content", |_| {
                Ok(Instance::new("A".to_string()))
            }))
            .unwrap();

        let mut set = PluginSet::new();
        for r in registry.resolve(&[]).unwrap() {
            let mut ic = InitContext::new(r, &set, Path::new("/r"), Path::new("/s"));
            let instance = r.init(&mut ic).unwrap();
            let meta = ic.meta;
            set.add(Plugin {
                plugin_type: r.plugin_type.clone(),
                id: r.id.clone(),
                meta,
                status: Status::Loaded(instance),
            })
            .unwrap();
        }
        let index = set.get(&PluginType::METADATA).unwrap();
        assert_eq!(*index.downcast::<String>().unwrap(), "A+1");
        assert_eq!(set.iter().last().map(|p| p.meta.clone()), Some(Meta::default()));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    /// Plugins with a type level and requirements on strictly lower levels,
    /// which always form a DAG, plus wildcard flags.
    fn dag() -> impl Strategy<Value = Vec<(usize, Vec<usize>, bool)>> {
        prop::collection::vec((0usize..5, prop::collection::vec(0usize..5, 0..3), prop::bool::weighted(0.15)), 1..12)
            .prop_map(|nodes| {
                nodes
                    .into_iter()
                    .map(|(level, reqs, wildcard)| {
                        let reqs: Vec<usize> = reqs.into_iter().filter(|r| *r < level).collect();
                        (level, reqs, wildcard)
                    })
                    .collect::<Vec<_>>()
            })
    }

    proptest! {
        #[test]
        fn resolve_is_a_topological_order(nodes in dag()) {
            let level_type = |l: usize| PluginType::new(format!("test.level{l}"));
            let mut registry = Registry::new();
            for (i, (level, reqs, wildcard)) in nodes.iter().enumerate() {
                let plugin_type = if *wildcard { PluginType::new("test.wild") } else { level_type(*level) };
                let mut r = Registration::new(plugin_type, format!("p{i}"), |_| Ok(Instance::new(())));
                if *wildcard {
                    r = r.requires(PluginType::ALL);
                } else {
                    for req in reqs {
                        r = r.requires(level_type(*req));
                    }
                }
                registry.register(r).unwrap();
            }

            let order = registry.resolve(&[]).unwrap();
            prop_assert_eq!(order.len(), nodes.len());
            let first_wildcard = order.iter().position(|r| r.requires_all()).unwrap_or(order.len());
            for (pos, r) in order.iter().enumerate() {
                if r.requires_all() {
                    prop_assert!(pos >= first_wildcard);
                    continue;
                }
                prop_assert!(pos < first_wildcard);
                for (earlier_pos, other) in order.iter().enumerate() {
                    if !other.requires_all() && other.uri() != r.uri() && r.requires.contains(&other.plugin_type) {
                        prop_assert!(earlier_pos < pos, "{} must precede {}", other.uri(), r.uri());
                    }
                }
            }
        }
    }
}
