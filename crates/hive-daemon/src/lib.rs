//! Hive daemon library: the event bus between connected instances and
//! in-process plugins.
//!
//! Instances connect over a Unix socket and report events as text lines.
//! The daemon dispatches each event to the handlers plugins bound on that
//! instance, and writes back whatever commands the handlers queue.

pub mod config;
pub mod error;
pub mod export;
pub mod handler;
pub mod instance;
pub mod pidfile;
pub mod plugin;
pub mod plugins;
pub mod server;

pub use config::DaemonConfig;
pub use error::{DaemonError, Result};
pub use export::{Export, ExportEntry};
pub use handler::{Callback, EventArgs, EventHandler, Kwargs};
pub use instance::{ConnectionTable, Instance, InstanceId, InstanceState};
pub use plugin::{HookContext, HookKind, Plugin, PluginSet, PluginSpec};
pub use plugins::{PluginCatalog, builtin_names};
pub use server::{Daemon, is_listening, run};
