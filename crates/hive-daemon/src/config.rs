//! Daemon configuration.
//!
//! Loaded from `<config_dir>/hive/config.json` (or `--config`), then
//! overridden by command-line flags, and passed by value into the daemon.
//! Every field has a default, so an absent file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plugins;

const CONFIG_FILE: &str = "config.json";

fn default_pid_file() -> Option<PathBuf> {
    Some(hive_protocol::pid_path())
}

fn default_plugins() -> Vec<String> {
    plugins::builtin_names().map(String::from).collect()
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Listening socket path
    #[serde(default = "hive_protocol::socket_path")]
    pub socket_path: PathBuf,

    /// PID marker; `null` disables it
    #[serde(default = "default_pid_file")]
    pub pid_file: Option<PathBuf>,

    /// Plugins to load, in load order
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,

    /// Stop once every instance has disconnected (after at least one connected)
    #[serde(default)]
    pub auto_close: bool,

    /// Echo every received line through the `hive_daemon::echo` log target
    #[serde(default)]
    pub print_events: bool,

    /// Upper bound on one readiness wait
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: hive_protocol::socket_path(),
            pid_file: default_pid_file(),
            plugins: default_plugins(),
            auto_close: false,
            print_events: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load config from file, falling back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Default config file location (`~/.config/hive/config.json` on Linux).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hive").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
