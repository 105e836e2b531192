//! Default runtime locations shared by the daemon and its clients.

use std::path::PathBuf;

const SOCKET_NAME: &str = "hive.sock";
const PID_NAME: &str = "hive.pid";

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Get the listening socket path for the hive daemon.
///
/// On Linux, prefers `$XDG_RUNTIME_DIR` for proper runtime file handling.
/// Falls back to the system temp directory for cross-platform compatibility.
#[must_use]
pub fn socket_path() -> PathBuf {
    runtime_dir().join(SOCKET_NAME)
}

/// Get the PID file path, next to the default socket.
#[must_use]
pub fn pid_path() -> PathBuf {
    runtime_dir().join(PID_NAME)
}
