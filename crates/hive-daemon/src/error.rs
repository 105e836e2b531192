//! Error types for the hive daemon.

use std::path::PathBuf;

use hive_protocol::{CodecError, ProtocolError};

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed record
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Listening socket could not be bound
    #[error("Failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another daemon answers on the socket path
    #[error("Another daemon is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    /// Record carries a different name than the one fixed for the connection
    #[error("Instance name mismatch: expected {expected:?}, got {found:?}")]
    NameMismatch { expected: String, found: String },

    /// Start event seen twice on one connection
    #[error("Duplicate INSTANCE_START for instance {0}")]
    DuplicateStart(String),

    /// Start event payload is not a decimal process id
    #[error("Invalid process id: {0:?}")]
    InvalidPid(String),

    /// Export name already claimed by another plugin
    #[error("Export {name:?} is already claimed by plugin {owner:?}")]
    ExportConflict { name: String, owner: String },

    /// No export under that name
    #[error("Export not found: {0}")]
    ExportNotFound(String),

    /// Export holds data, not a function
    #[error("Export {0:?} is not callable")]
    NotCallable(String),

    /// `require` named a plugin that is not loaded
    #[error("Required plugin not loaded: {0}")]
    MissingPlugin(String),

    /// Configured plugin name has no catalog entry
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Plugin defines none of the lifecycle hooks
    #[error("Plugin {0} defines none of init, after, cleanup")]
    InvalidPlugin(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
