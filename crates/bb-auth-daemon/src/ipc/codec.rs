//! Newline-delimited frame codec for the local socket protocol.
//!
//! Each frame is one UTF-8 JSON object terminated by `\n`. The decoder
//! enforces the line cap *before* buffering a full line: a connection that
//! accumulates more than [`MAX_MESSAGE_SIZE`] bytes without a newline is in
//! violation and the decode fails hard, which the server turns into a
//! disconnect. Trailing `\r` is tolerated, blank lines are skipped.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use bb_auth_core::constants::MAX_MESSAGE_SIZE;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A line exceeded the protocol cap.
    #[error("line too long: {size} bytes (max {max})")]
    LineTooLong {
        /// Bytes observed so far.
        size: usize,
        /// The configured cap.
        max: usize,
    },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Line codec with a bounded maximum line length.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_len: usize,
    /// Offset up to which the buffer is known to contain no newline.
    scanned: usize,
}

impl LineCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_len(MAX_MESSAGE_SIZE)
    }

    /// Creates a codec with a custom cap (tests mostly).
    #[must_use]
    pub fn with_max_len(max_line_len: usize) -> Self {
        Self {
            max_line_len,
            scanned: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            let newline = src[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|pos| self.scanned + pos);

            let Some(pos) = newline else {
                // No complete line yet; reject before buffering past the cap.
                if src.len() > self.max_line_len {
                    return Err(FramingError::LineTooLong {
                        size: src.len(),
                        max: self.max_line_len,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            if pos > self.max_line_len {
                return Err(FramingError::LineTooLong {
                    size: pos,
                    max: self.max_line_len,
                });
            }

            let mut line = src.split_to(pos + 1);
            self.scanned = 0;
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            // Skip blank lines rather than surfacing empty frames.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(line.freeze()));
        }
    }
}

impl Encoder<&[u8]> for LineCodec {
    type Error = FramingError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
        if item.len() > self.max_line_len {
            return Err(FramingError::LineTooLong {
                size: item.len(),
                max: self.max_line_len,
            });
        }
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(item);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = codec.decode(buf) {
            out.push(line);
        }
        out
    }

    #[test]
    fn splits_on_newlines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ping\"}\n{\"type\":\"next\"}\n"[..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[0][..], b"{\"type\":\"ping\"}");
        assert_eq!(&lines[1][..], b"{\"type\":\"next\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn holds_partial_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"ping\"}\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&line[..], b"{\"type\":\"ping\"}");
    }

    #[test]
    fn strips_carriage_return_and_skips_blanks() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\n  \n{\"a\":1}\r\n"[..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines.len(), 1);
        assert_eq!(&lines[0][..], b"{\"a\":1}");
    }

    #[test]
    fn rejects_unterminated_oversize() {
        let mut codec = LineCodec::with_max_len(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::LineTooLong { size: 10, max: 8 })
        ));
    }

    #[test]
    fn rejects_terminated_oversize() {
        let mut codec = LineCodec::with_max_len(4);
        let mut buf = BytesMut::from(&b"0123456789\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::LineTooLong { .. })
        ));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(b"{}".as_slice(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{}\n");
    }
}
