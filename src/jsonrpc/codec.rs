//! Line framing for the child's stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so a child that never emits a newline cannot make the bridge buffer
//! without bound.
//!
//! Unlike a plain `LinesCodec`, the decoder never fails on an oversized or
//! non-UTF-8 line. It yields [`Frame::Oversized`] / [`Frame::Invalid`]
//! instead, because [`FramedRead`](tokio_util::codec::FramedRead) ends the
//! stream after a decoder error and the read loop must outlive bad lines.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::jsonrpc::message::Message;
use crate::{AppError, Result};

/// Default maximum inbound line length: 4 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1_048_576;

/// One decoded unit of the child's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line exceeded the ceiling; its bytes up to the next newline are discarded.
    Oversized,
    /// A complete line that was not valid UTF-8.
    Invalid,
}

/// Newline-delimited JSON codec for child stdio.
#[derive(Debug)]
pub struct LineFramer {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl LineFramer {
    /// Create a framer that rejects lines longer than `max_line_bytes`.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    /// Configured ceiling in bytes.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl Decoder for LineFramer {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.inner.decode_eof(src))
    }
}

/// Parse one line into a message.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns [`AppError::MalformedMessage`] if the line is not a single
/// well-formed JSON-RPC message.
pub fn parse_line(line: &str) -> Result<Option<Message>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Message::from_slice(trimmed.as_bytes()).map(Some)
}

/// Encode `message` as one compact JSON line terminated by `\n`.
///
/// # Errors
///
/// Returns [`AppError::MalformedMessage`] if serialization fails.
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| AppError::MalformedMessage(format!("failed to serialise message: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn map_decoded(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Frame::Invalid))
        }
        Err(LinesCodecError::Io(err)) => Err(AppError::Io(err.to_string())),
    }
}
