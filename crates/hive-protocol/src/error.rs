//! Error types for the hive-protocol crate.

use crate::codec::MAX_LINE_LENGTH;

/// Errors that can occur while framing bytes into lines
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line too long: {0} bytes (max: {MAX_LINE_LENGTH})")]
    LineTooLong(usize),
}

/// Errors for a single malformed record line. The line is dropped, the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Missing {field} field in record: {line:?}")]
    MissingField { field: &'static str, line: String },

    #[error("Invalid event name {0:?}")]
    InvalidEventName(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
