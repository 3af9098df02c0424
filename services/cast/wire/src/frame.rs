//! Message framing for the wire protocol.
//!
//! Every frame is a big-endian `u32` length followed by exactly that many
//! bytes of protobuf-encoded [`CastMessage`](crate::proto::CastMessage).

use crate::error::WireError;
use crate::message::Message;
use crate::proto::CastMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;

/// Maximum frame size accepted by Cast devices (64 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message into a length-prefixed frame
pub fn encode(message: &Message, max_frame_size: usize) -> Result<Bytes, WireError> {
    let envelope = message.to_envelope();
    let body_len = envelope.encoded_len();
    if body_len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: body_len,
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(body_len as u32);
    envelope
        .encode(&mut buf)
        .map_err(|e| WireError::Protobuf(e.to_string()))?;

    Ok(buf.freeze())
}

/// Outcome of decoding from a byte slice
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete frame was found
    Frame {
        /// The decoded message
        message: Message,
        /// Bytes of input that belonged to this frame (prefix included)
        consumed: usize,
    },
    /// More bytes are needed; nothing was consumed
    Incomplete,
}

/// Frame decoder for parsing incoming frames
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured size limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Peek at the declared length of the next frame.
    ///
    /// Returns `Ok(None)` until the prefix is available. A declaration above
    /// the limit is rejected right away, without waiting for the body.
    fn declared_len(&self, buf: &[u8]) -> Result<Option<usize>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        Ok(Some(frame_len))
    }

    /// Decode at most one frame from the start of `buf` without mutating it
    pub fn decode_slice(&self, buf: &[u8]) -> Result<Decoded, WireError> {
        let Some(frame_len) = self.declared_len(buf)? else {
            return Ok(Decoded::Incomplete);
        };

        let consumed = LENGTH_PREFIX_SIZE + frame_len;
        if buf.len() < consumed {
            return Ok(Decoded::Incomplete);
        }

        let message = decode_body(&buf[LENGTH_PREFIX_SIZE..consumed])?;
        Ok(Decoded::Frame { message, consumed })
    }

    /// Decode one frame from a buffer, advancing past it.
    ///
    /// The buffer is advanced past a complete frame even when its payload
    /// turns out to be malformed, so the next call starts on a frame boundary.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        let Some(frame_len) = self.declared_len(buf)? else {
            return Ok(None);
        };

        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            buf.reserve(LENGTH_PREFIX_SIZE + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(frame_len).freeze();

        decode_body(&body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(body: &[u8]) -> Result<Message, WireError> {
    let envelope = CastMessage::decode(body).map_err(|e| WireError::Protobuf(e.to_string()))?;
    Message::from_envelope(envelope)
}
