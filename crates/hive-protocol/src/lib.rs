//! Line-based event protocol for hive.
//!
//! Instances talk to the hive daemon over a Unix socket, one record per line.
//! This crate provides the framing codec, the record parser, the argument
//! tokenizer handlers use on free-form payloads, and the default runtime
//! paths.
//!
//! # Architecture
//!
//! - [`codec`]: newline framing over `BytesMut` (`tokio_util` codec traits)
//! - [`record`]: `EVENT <name> <EVENT> <args>` parsing
//! - [`split`]: quote-aware splitting of argument strings
//! - [`paths`]: default socket and PID file locations
//! - [`error`]: codec and protocol error types
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use hive_protocol::{EventCodec, Record};
//! use tokio_util::codec::Decoder;
//!
//! let mut codec = EventCodec::new();
//! let mut buf = BytesMut::from(&b"EVENT web PING hello world\n"[..]);
//!
//! let line = codec.decode(&mut buf).unwrap().unwrap();
//! let Record::Event(event) = Record::parse(&line).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(event.event, "PING");
//! assert_eq!(event.args.as_deref(), Some("hello world"));
//! ```

pub mod codec;
pub mod error;
pub mod paths;
pub mod record;
pub mod split;

pub use codec::{EventCodec, MAX_LINE_LENGTH, decode_lossy};
pub use error::{CodecError, ProtocolError, Result};
pub use paths::{pid_path, socket_path};
pub use record::{
    EVENT_TAG, EventRecord, INSTANCE_EXIT, INSTANCE_START, Record, normalize_event,
};
pub use split::split_quoted;
