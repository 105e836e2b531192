//! Plugin registry and lifecycle hooks.
//!
//! A plugin is a hook table: up to three lifecycle callbacks run for every
//! instance. Hooks receive a [`HookContext`] bundling the instance with the
//! primitives a plugin uses to extend it (`require`, `export`,
//! `export_dict`, `connect`, `connect_dict`). Plugins are loaded once at
//! daemon start, in configuration order, and never reloaded.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use hive_protocol::normalize_event;
use tracing::{debug, error, info_span, warn};

use crate::error::{DaemonError, Result};
use crate::export::Export;
use crate::handler::{Callback, EventArgs, EventHandler, isolate};
use crate::instance::Instance;

type HookFn = dyn Fn(&mut HookContext<'_>) -> anyhow::Result<()>;

/// Which lifecycle hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Init,
    After,
    Cleanup,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::After => "after",
            Self::Cleanup => "cleanup",
        })
    }
}

/// Hook table describing a plugin before it is loaded.
pub struct PluginSpec {
    name: String,
    init: Option<Box<HookFn>>,
    after: Option<Box<HookFn>>,
    cleanup: Option<Box<HookFn>>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
            after: None,
            cleanup: None,
        }
    }

    /// Runs once per instance after its start event, before any `after`.
    #[must_use]
    pub fn init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.init = Some(Box::new(hook));
        self
    }

    /// Runs once per instance after every plugin's `init`.
    #[must_use]
    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.after = Some(Box::new(hook));
        self
    }

    /// Runs once per instance when it closes, whether or not `init` ran.
    #[must_use]
    pub fn cleanup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.cleanup = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .field("after", &self.after.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// A loaded plugin.
pub struct Plugin {
    name: String,
    init: Option<Box<HookFn>>,
    after: Option<Box<HookFn>>,
    cleanup: Option<Box<HookFn>>,
    /// Handlers this plugin created, across all instances. Non-owning; dead
    /// entries are pruned on lookup.
    handlers: RefCell<Vec<Weak<EventHandler>>>,
}

impl Plugin {
    /// Validate a hook table and turn it into a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidPlugin`] if the hook table defines none of the
    /// three hooks.
    pub fn load(spec: PluginSpec) -> Result<Rc<Self>> {
        if spec.init.is_none() && spec.after.is_none() && spec.cleanup.is_none() {
            return Err(DaemonError::InvalidPlugin(spec.name));
        }

        Ok(Rc::new(Self {
            name: spec.name,
            init: spec.init,
            after: spec.after,
            cleanup: spec.cleanup,
            handlers: RefCell::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn hook(&self, kind: HookKind) -> Option<&HookFn> {
        match kind {
            HookKind::Init => self.init.as_deref(),
            HookKind::After => self.after.as_deref(),
            HookKind::Cleanup => self.cleanup.as_deref(),
        }
    }

    #[must_use]
    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.hook(kind).is_some()
    }

    /// Run one hook over `instance` inside the plugin's log span. A failing
    /// hook is logged; it never stops the caller.
    pub(crate) fn run_hook(
        self: &Rc<Self>,
        kind: HookKind,
        plugins: &PluginSet,
        instance: &mut Instance,
    ) {
        let Some(hook) = self.hook(kind) else {
            return;
        };

        let span = info_span!("plugin", name = %self.name, instance = %instance.id());
        let _entered = span.enter();

        let mut ctx = HookContext {
            plugin: self,
            plugins,
            instance,
        };
        if let Err(e) = isolate(|| hook(&mut ctx)) {
            error!("{} hook of {} failed: {:#}", kind, self.name, e);
        }
    }

    /// Bind `callback` to `event` on `instance`, or return the identical
    /// binding if it already exists there.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an empty event name or one containing
    /// whitespace.
    pub fn connect(
        &self,
        instance: &mut Instance,
        event: &str,
        callback: &Callback,
        bound: EventArgs,
    ) -> Result<Rc<EventHandler>> {
        let event = normalize_event(event)?;

        if let Some(existing) = self.find_handler(instance, &event, callback, &bound) {
            debug!("Reusing {}", existing);
            return Ok(existing);
        }

        let handler = Rc::new(EventHandler::new(
            instance.id(),
            &self.name,
            event,
            callback.clone(),
            bound,
        ));
        instance.bind(Rc::clone(&handler));
        self.handlers.borrow_mut().push(Rc::downgrade(&handler));
        debug!("Connected {}", handler);
        Ok(handler)
    }

    /// `connect` each `(event, callback)` pair without bound arguments.
    ///
    /// # Errors
    ///
    /// Stops at the first invalid event name.
    pub fn connect_dict<'e, I>(
        &self,
        instance: &mut Instance,
        bindings: I,
    ) -> Result<Vec<Rc<EventHandler>>>
    where
        I: IntoIterator<Item = (&'e str, Callback)>,
    {
        bindings
            .into_iter()
            .map(|(event, callback)| self.connect(instance, event, &callback, EventArgs::new()))
            .collect()
    }

    /// Claim `name` on `instance` for this plugin.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ExportConflict`] if another plugin already
    /// exported `name` there; the existing export is left untouched.
    pub fn export(&self, instance: &mut Instance, name: &str, export: Export) -> Result<()> {
        instance.insert_export(&self.name, name, export)
    }

    /// `export` each pair in order.
    ///
    /// # Errors
    ///
    /// Stops at the first naming conflict.
    pub fn export_dict<S, I>(&self, instance: &mut Instance, exports: I) -> Result<()>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Export)>,
    {
        for (name, export) in exports {
            self.export(instance, name.as_ref(), export)?;
        }
        Ok(())
    }

    fn find_handler(
        &self,
        instance: &Instance,
        event: &str,
        callback: &Callback,
        bound: &EventArgs,
    ) -> Option<Rc<EventHandler>> {
        let mut handlers = self.handlers.borrow_mut();
        handlers.retain(|weak| weak.strong_count() > 0);
        handlers
            .iter()
            .filter_map(Weak::upgrade)
            .find(|h| h.matches(instance.id(), event, callback, bound))
    }

    /// Ids of handlers created by this plugin that are still bound somewhere.
    #[must_use]
    pub fn live_handler_ids(&self) -> Vec<u64> {
        let mut handlers = self.handlers.borrow_mut();
        handlers.retain(|weak| weak.strong_count() > 0);
        handlers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|h| h.id())
            .collect()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .field("after", &self.after.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}

/// Loaded plugins in load order.
#[derive(Debug, Default)]
pub struct PluginSet {
    plugins: Vec<Rc<Plugin>>,
}

impl PluginSet {
    /// Load every spec. Duplicate names keep the first occurrence.
    ///
    /// # Errors
    ///
    /// Fails on the first hook table without hooks; the daemon never runs with a
    /// partial plugin set.
    pub fn load<I>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = PluginSpec>,
    {
        let mut set = Self::default();
        for spec in specs {
            if set.get(spec.name()).is_some() {
                warn!("Plugin {} already loaded, skipping duplicate", spec.name());
                continue;
            }
            let plugin = Plugin::load(spec)?;
            debug!("Loaded plugin {}", plugin.name());
            set.plugins.push(plugin);
        }
        Ok(set)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Rc<Plugin>> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Look up a plugin another plugin depends on.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::MissingPlugin`] if it was not loaded.
    pub fn require(&self, name: &str) -> Result<&Rc<Plugin>> {
        self.get(name)
            .ok_or_else(|| DaemonError::MissingPlugin(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Plugin>> {
        self.plugins.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run one hook of every plugin over `instance`, in load order.
    pub(crate) fn run_hooks(&self, kind: HookKind, instance: &mut Instance) {
        for plugin in &self.plugins {
            plugin.run_hook(kind, self, instance);
        }
    }
}

/// What a hook gets to work with: the instance, the calling plugin, and the
/// rest of the loaded plugins.
pub struct HookContext<'a> {
    plugin: &'a Rc<Plugin>,
    plugins: &'a PluginSet,
    instance: &'a mut Instance,
}

impl HookContext<'_> {
    #[must_use]
    pub fn plugin(&self) -> &Rc<Plugin> {
        self.plugin
    }

    #[must_use]
    pub fn instance(&self) -> &Instance {
        &*self.instance
    }

    pub fn instance_mut(&mut self) -> &mut Instance {
        &mut *self.instance
    }

    /// Fail unless `name` is loaded. Use with `?` to halt the hook.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::MissingPlugin`].
    pub fn require(&self, name: &str) -> Result<Rc<Plugin>> {
        self.plugins.require(name).map(Rc::clone)
    }

    /// See [`Plugin::export`].
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ExportConflict`] on a name claimed by another plugin.
    pub fn export(&mut self, name: &str, export: Export) -> Result<()> {
        self.plugin.export(self.instance, name, export)
    }

    /// See [`Plugin::export_dict`].
    ///
    /// # Errors
    ///
    /// Stops at the first naming conflict.
    pub fn export_dict<S, I>(&mut self, exports: I) -> Result<()>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, Export)>,
    {
        self.plugin.export_dict(self.instance, exports)
    }

    /// See [`Plugin::connect`].
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an invalid event name.
    pub fn connect(
        &mut self,
        event: &str,
        callback: &Callback,
        bound: EventArgs,
    ) -> Result<Rc<EventHandler>> {
        self.plugin.connect(self.instance, event, callback, bound)
    }

    /// See [`Plugin::connect_dict`].
    ///
    /// # Errors
    ///
    /// Stops at the first invalid event name.
    pub fn connect_dict<'e, I>(&mut self, bindings: I) -> Result<Vec<Rc<EventHandler>>>
    where
        I: IntoIterator<Item = (&'e str, Callback)>,
    {
        self.plugin.connect_dict(self.instance, bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_plugin_without_hooks() {
        let err = Plugin::load(PluginSpec::new("empty")).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidPlugin(name) if name == "empty"));
    }

    #[test]
    fn test_load_accepts_single_hook() {
        let plugin = Plugin::load(PluginSpec::new("tidy").cleanup(|_| Ok(()))).unwrap();
        assert_eq!(plugin.name(), "tidy");
        assert!(plugin.has_hook(HookKind::Cleanup));
        assert!(!plugin.has_hook(HookKind::Init));
        assert!(!plugin.has_hook(HookKind::After));
    }

    #[test]
    fn test_set_load_fails_whole_set_on_invalid() {
        let specs = vec![
            PluginSpec::new("good").init(|_| Ok(())),
            PluginSpec::new("bad"),
        ];
        assert!(matches!(
            PluginSet::load(specs),
            Err(DaemonError::InvalidPlugin(_))
        ));
    }

    #[test]
    fn test_set_first_match_wins() {
        let specs = vec![
            PluginSpec::new("dup").init(|_| Ok(())),
            PluginSpec::new("other").after(|_| Ok(())),
            PluginSpec::new("dup").cleanup(|_| Ok(())),
        ];
        let set = PluginSet::load(specs).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["dup", "other"]);
        assert!(set.get("dup").unwrap().has_hook(HookKind::Init));
        assert!(!set.get("dup").unwrap().has_hook(HookKind::Cleanup));
    }

    #[test]
    fn test_require() {
        let set = PluginSet::load(vec![PluginSpec::new("config").init(|_| Ok(()))]).unwrap();
        assert_eq!(set.require("config").unwrap().name(), "config");
        assert!(matches!(
            set.require("history"),
            Err(DaemonError::MissingPlugin(name)) if name == "history"
        ));
    }

    #[test]
    fn test_hook_kind_display() {
        assert_eq!(HookKind::Init.to_string(), "init");
        assert_eq!(HookKind::After.to_string(), "after");
        assert_eq!(HookKind::Cleanup.to_string(), "cleanup");
    }
}
