//! Newline-delimited transport codec for instance traffic.
//!
//! Every record travels as one line of text terminated by `\n`. The decoder
//! yields complete lines and keeps the bytes after the last newline buffered
//! until more data arrives, so the decoded sequence never depends on how the
//! stream was chunked by the socket.
//!
//! Frame format:
//! ```text
//! +---------------------------+------+
//! |  N bytes (UTF-8, lossy)   |  \n  |
//! +---------------------------+------+
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::CodecError;

/// Maximum accepted line length (1 MiB), terminator excluded.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec for newline-terminated event records and commands.
#[derive(Debug, Default)]
pub struct EventCodec {
    /// Offset up to which the buffered remainder is known to hold no newline.
    next_index: usize,
}

impl EventCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decode bytes as UTF-8, dropping invalid sequences instead of failing.
#[must_use]
pub fn decode_lossy(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

impl Decoder for EventCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_from = self.next_index.min(src.len());
        let newline = src
            .get(scan_from..)
            .and_then(|tail| tail.iter().position(|b| *b == b'\n'));

        let Some(offset) = newline else {
            // A trailing `\r` may still turn out to be part of the terminator.
            let limit = MAX_LINE_LENGTH + usize::from(src.last() == Some(&b'\r'));
            if src.len() > limit {
                let len = src.len();
                src.clear();
                self.next_index = 0;
                return Err(CodecError::LineTooLong(len));
            }
            self.next_index = src.len();
            return Ok(None);
        };

        let end = scan_from + offset;
        self.next_index = 0;

        let frame = src.split_to(end + 1);
        let mut payload = frame.get(..end).unwrap_or_default();
        if let Some(stripped) = payload.strip_suffix(b"\r") {
            payload = stripped;
        }

        if payload.len() > MAX_LINE_LENGTH {
            return Err(CodecError::LineTooLong(payload.len()));
        }

        Ok(Some(decode_lossy(payload)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        if !buf.is_empty() {
            debug!("Discarding {} bytes of unterminated input at EOF", buf.len());
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<&str> for EventCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let terminated = item.ends_with('\n');
        dst.reserve(item.len() + usize::from(!terminated));
        dst.put_slice(item.as_bytes());
        if !terminated {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"EVENT web-1 INSTANCE_START 4242\n\
        EVENT web-1 LOAD_COMMIT https://example.org/caf\xc3\xa9\r\n\
        status: idle\n\
        \n\
        EVENT web-1 KEY_PRESS 'a b' \"c\\\"d\"\n\
        EVENT web-1 INSTANCE_EXIT\n";

    fn decode_all(codec: &mut EventCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    fn decode_chunked(stream: &[u8], chunk_size: usize) -> Vec<String> {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            buf.extend_from_slice(chunk);
            lines.extend(decode_all(&mut codec, &mut buf));
        }
        lines
    }

    #[test]
    fn test_decode_single_line() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"EVENT a PING hello\n"[..]);

        let line = codec.decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("EVENT a PING hello"));
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_line_is_kept_as_remainder() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"EVENT a PI"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"EVENT a PI");

        buf.extend_from_slice(b"NG\nEVENT a");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("EVENT a PING")
        );
        assert_eq!(&buf[..], b"EVENT a");
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let whole = decode_chunked(STREAM, STREAM.len());
        assert_eq!(whole.len(), 6);

        for chunk_size in 1..STREAM.len() {
            assert_eq!(
                decode_chunked(STREAM, chunk_size),
                whole,
                "chunk size {chunk_size} changed the decoded records"
            );
        }
    }

    #[test]
    fn test_crlf_line_at_limit_independent_of_chunking() {
        let mut stream = vec![b'x'; MAX_LINE_LENGTH];
        stream.extend_from_slice(b"\r\n");

        let whole = decode_chunked(&stream, stream.len());
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].len(), MAX_LINE_LENGTH);

        let split_before_newline = decode_chunked(&stream, MAX_LINE_LENGTH + 1);
        assert_eq!(split_before_newline, whole);
    }

    #[test]
    fn test_line_over_limit_rejected_with_trailing_cr() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LENGTH + 1].as_slice());
        buf.extend_from_slice(b"\r");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong(n) if n == MAX_LINE_LENGTH + 2));
    }

    #[test]
    fn test_carriage_return_is_stripped() {
        let lines = decode_chunked(b"status\r\n", 3);
        assert_eq!(lines, vec!["status".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_dropped() {
        let lines = decode_chunked(b"EVENT a X \xff\xfeok\n", 64);
        assert_eq!(lines, vec!["EVENT a X ok".to_string()]);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let lines = decode_chunked("EVENT a TITLE na\u{ef}ve\n".as_bytes(), 1);
        assert_eq!(lines, vec!["EVENT a TITLE na\u{ef}ve".to_string()]);
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LENGTH + 1].as_slice());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong(n) if n == MAX_LINE_LENGTH + 1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_discards_remainder() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"EVENT a DONE\nEVENT a HALF"[..]);

        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().as_deref(),
            Some("EVENT a DONE")
        );
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("set zoom = 2", &mut buf).unwrap();
        codec.encode("reload\n", &mut buf).unwrap();

        assert_eq!(&buf[..], b"set zoom = 2\nreload\n");
    }

    #[test]
    fn test_encoded_commands_decode_back() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("js alert('hi')", &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("js alert('hi')")
        );
    }
}
