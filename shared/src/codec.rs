//! Length-prefixed framing for envelopes on a byte stream
//!
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Envelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Largest envelope accepted in either direction (1 MiB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Encode an envelope into a single frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let body_len = envelope.encoded_len();
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
    buf.put_u32(body_len as u32);
    envelope.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Pop one complete frame off the front of `buf`
///
/// Returns `Ok(None)` and leaves `buf` untouched while the frame is incomplete.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(body_len));
    }

    if buf.len() < LEN_PREFIX + body_len as usize {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    let body = buf.split_to(body_len as usize);
    Ok(Some(Envelope::decode(body)?))
}

/// Accumulates stream reads and yields whole envelopes
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Call repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
