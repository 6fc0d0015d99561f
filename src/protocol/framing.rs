//! Length-value framing.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! Bytes are fed in whatever chunks the socket delivers. A frame is only
//! released once its whole payload is buffered; partial frames stay in the
//! parser across calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Width of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default upper bound for a single frame payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Streaming decoder for length-prefixed frames.
#[derive(Debug)]
pub struct LengthValueParser {
    buffer: BytesMut,
    max_frame_bytes: usize,
}

impl LengthValueParser {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Append `chunk` and try to release the next complete frame.
    ///
    /// Returns `Ok(None)` while the frame is incomplete; nothing is consumed
    /// in that case, so repeating the call with an empty chunk is harmless.
    /// When several frames are buffered, each call releases one of them.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                length,
                limit: self.max_frame_bytes,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_BYTES + length {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Bytes held for a frame that is not complete yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LengthValueParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}
