//! Built-in plugins and the catalog the daemon loads plugins from.
//!
//! Plugins are compiled in. Each one is a function returning its
//! [`PluginSpec`], registered here under the plugin's name:
//! - `config`: per-instance variable store fed by `VARIABLE_SET`
//! - `on_event`: run a command when an event fires (`ON_EVENT`)

pub mod config;
pub mod on_event;

use crate::error::{DaemonError, Result};
use crate::plugin::{PluginSet, PluginSpec};

type SpecFn = fn() -> PluginSpec;

const BUILTINS: &[(&str, SpecFn)] = &[
    (config::NAME, config::spec),
    (on_event::NAME, on_event::spec),
];

/// Names of the built-in plugins, in default load order.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|(name, _)| *name)
}

/// Plugin specs available to the daemon, by name.
#[derive(Debug, Clone)]
pub struct PluginCatalog {
    entries: Vec<(&'static str, SpecFn)>,
}

impl Default for PluginCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginCatalog {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            entries: BUILTINS.to_vec(),
        }
    }

    /// Register another plugin. A name already in the catalog keeps its
    /// first entry.
    #[must_use]
    pub fn with(mut self, name: &'static str, spec: SpecFn) -> Self {
        if !self.contains(name) {
            self.entries.push((name, spec));
        }
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| *n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    /// Fresh spec for `name`.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<PluginSpec> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, spec)| spec())
    }

    /// Load the named plugins in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownPlugin`] for a name missing from the
    /// catalog, or the load error of the first invalid spec.
    pub fn load<S: AsRef<str>>(&self, names: &[S]) -> Result<PluginSet> {
        let specs = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.spec(name)
                    .ok_or_else(|| DaemonError::UnknownPlugin(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        PluginSet::load(specs)
    }
}
