//! Streaming encoder and decoder for STOMP frames.

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::BytesMut;

/// Encodes frames to their wire form.
pub struct Encoder;

impl Encoder {
    /// Encodes a frame, terminator included.
    pub fn encode(frame: &Frame) -> BytesMut {
        frame.encode()
    }
}

/// Incremental frame decoder.
///
/// One decoder per connection. Bytes can be fed one at a time or in
/// bulk; a frame is produced exactly once per observed terminator, and
/// bytes following a terminator are retained for the next frame.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Feeds a single byte, returning a frame if this byte completed one.
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<Frame>, ProtocolError> {
        self.buffer.extend_from_slice(&[byte]);
        if byte == crate::FRAME_TERMINATOR {
            Frame::decode(&mut self.buffer)
        } else if self.buffer.len() > crate::MAX_FRAME_SIZE {
            Err(ProtocolError::FrameTooLarge {
                size: self.buffer.len(),
                max: crate::MAX_FRAME_SIZE,
            })
        } else {
            Ok(None)
        }
    }

    /// Appends a chunk of bytes to the accumulation buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next buffered frame.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
