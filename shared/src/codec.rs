//! Line and message framing
//!
//! Stream-oriented channels carry one frame per line:
//! ```text
//! [ N bytes: UTF-8 frame ][ optional '\r' ][ '\n' ]
//! ```
//!
//! Message-oriented channels carry one frame per message, possibly split
//! across several wire fragments that [`MessageAssembler`] stitches back
//! together.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::limits::MAX_FRAME_LEN;
use crate::Frame;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too long: {len} bytes (max: {max})")]
    FrameTooLong { len: usize, max: usize },

    /// Rejected before anything reached the wire
    #[error("Outbound frame too long: {len} bytes (max: {max})")]
    OutboundTooLong { len: usize, max: usize },

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Outbound frame contains an embedded line terminator")]
    EmbeddedNewline,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn encode_into(frame: &str, buf: &mut BytesMut, max_len: usize) -> Result<(), CodecError> {
    if frame.len() > max_len {
        return Err(CodecError::OutboundTooLong {
            len: frame.len(),
            max: max_len,
        });
    }
    if !crate::is_line_safe(frame) {
        return Err(CodecError::EmbeddedNewline);
    }

    buf.reserve(frame.len() + 1);
    buf.put_slice(frame.as_bytes());
    buf.put_u8(b'\n');
    Ok(())
}

/// Try to decode one complete line from the front of a buffer, scanning
/// for the terminator from `start`
///
/// Returns:
/// - `Ok(Some(frame))` if a complete line was decoded (terminator stripped)
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the line is oversized or not UTF-8
fn decode_from(buf: &mut BytesMut, start: usize, max_len: usize) -> Result<Option<Frame>, CodecError> {
    let Some(offset) = buf[start..].iter().position(|b| *b == b'\n') else {
        if buf.len() > max_len {
            return Err(CodecError::FrameTooLong {
                len: buf.len(),
                max: max_len,
            });
        }
        return Ok(None);
    };

    let newline = start + offset;
    if newline > max_len {
        return Err(CodecError::FrameTooLong {
            len: newline,
            max: max_len,
        });
    }

    let line = buf.split_to(newline + 1);
    Ok(Some(into_frame(&line[..newline])?))
}

fn into_frame(line: &[u8]) -> Result<Frame, CodecError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Ok(String::from_utf8(line.to_vec())?)
}

/// Newline-delimited frame codec for `FramedRead`/`FramedWrite`
#[derive(Debug, Clone)]
pub struct LineFrameCodec {
    max_len: usize,
    /// Bytes already scanned for a terminator
    scanned: usize,
}

impl Default for LineFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFrameCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    /// Create a codec rejecting frames longer than `max_len` bytes
    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Decoder for LineFrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let result = decode_from(buf, self.scanned.min(buf.len()), self.max_len);
        self.scanned = match &result {
            Ok(None) => buf.len(),
            _ => 0,
        };
        result
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // Unterminated tail at end-of-stream still counts as a line
        self.scanned = 0;
        let tail = buf.split();
        Ok(Some(into_frame(&tail)?))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: T, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_into(frame.as_ref(), buf, self.max_len)
    }
}

/// Reassembles message fragments into whole frames
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    max_len: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl MessageAssembler {
    /// Create an assembler rejecting messages longer than `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_len,
        }
    }

    /// Add one wire fragment.
    ///
    /// Returns the reassembled frame once the fragment carrying the
    /// end-of-message marker has been pushed. An oversized or non-UTF-8
    /// message discards everything buffered so far.
    pub fn push(&mut self, fragment: &[u8], end_of_message: bool) -> Result<Option<Frame>, CodecError> {
        let len = self.buffer.len() + fragment.len();
        if len > self.max_len {
            self.buffer.clear();
            return Err(CodecError::FrameTooLong {
                len,
                max: self.max_len,
            });
        }

        self.buffer.extend_from_slice(fragment);
        if !end_of_message {
            return Ok(None);
        }

        let message = self.buffer.split();
        Ok(Some(String::from_utf8(message.to_vec())?))
    }

    /// True when no partial message is buffered
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }
}
