//! Record types for the line protocol spoken by instances.
//!
//! Each line is split into at most four whitespace-delimited fields:
//!
//! ```text
//! EVENT <instance-name> <EVENT_NAME> <free-form-args>
//! ```
//!
//! The fourth field is greedy and kept as one opaque string; handlers
//! tokenize it themselves (see [`crate::split_quoted`]).

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Literal tag that marks a line as an event record.
pub const EVENT_TAG: &str = "EVENT";

/// Event carrying the instance's process id; runs plugin `init`/`after` hooks.
pub const INSTANCE_START: &str = "INSTANCE_START";

/// Event announcing that the instance is going away.
pub const INSTANCE_EXIT: &str = "INSTANCE_EXIT";

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// An `EVENT` line to be dispatched.
    Event(EventRecord),
    /// Anything else the instance wrote; observed, never dispatched.
    Other(String),
}

/// One event emitted by an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub instance: String,
    /// Upper-cased event name.
    pub event: String,
    pub args: Option<String>,
}

impl Record {
    /// Parse one line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingField`] when an `EVENT` line lacks the
    /// instance name or the event name.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (tag, rest) = next_field(line);
        if tag != EVENT_TAG {
            return Ok(Self::Other(line.to_string()));
        }

        let (name, rest) = next_field(rest);
        let instance = strip_brackets(name);
        if instance.is_empty() {
            return Err(ProtocolError::MissingField {
                field: "name",
                line: line.to_string(),
            });
        }

        let (event, rest) = next_field(rest);
        if event.is_empty() {
            return Err(ProtocolError::MissingField {
                field: "event",
                line: line.to_string(),
            });
        }

        let args = rest.trim_start();
        Ok(Self::Event(EventRecord {
            instance: instance.to_string(),
            event: normalize_event(event)?,
            args: (!args.is_empty()).then(|| args.to_string()),
        }))
    }
}

impl EventRecord {
    /// Build a record, normalizing the event name.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEventName`] for an unusable event name.
    pub fn new(instance: impl Into<String>, event: &str, args: Option<&str>) -> Result<Self> {
        Ok(Self {
            instance: instance.into(),
            event: normalize_event(event)?,
            args: args.map(String::from),
        })
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EVENT_TAG} {} {}", self.instance, self.event)?;
        if let Some(args) = &self.args {
            write!(f, " {args}")?;
        }
        Ok(())
    }
}

/// Normalize an event name for routing: upper-case, no whitespace.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidEventName`] for empty names or names
/// containing whitespace.
pub fn normalize_event(event: &str) -> Result<String> {
    if event.is_empty() || event.contains(char::is_whitespace) {
        return Err(ProtocolError::InvalidEventName(event.to_string()));
    }
    Ok(event.to_uppercase())
}

fn next_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    }
}

fn strip_brackets(name: &str) -> &str {
    name.strip_prefix('[')
        .and_then(|n| n.strip_suffix(']'))
        .unwrap_or(name)
}
