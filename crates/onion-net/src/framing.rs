//! Message framing for network transport
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes. There is no type byte; the payload is
//! opaque at this layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {length} bytes (max {max})")]
    TooLarge { length: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("Timed out")]
    Timeout,
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: payload length (big-endian)
/// - N bytes: payload
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a new codec with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec that rejects payloads above `max_frame_bytes`
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(u32::MAX as usize),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                length,
                max: self.max_frame_bytes,
            });
        }

        // Need full frame
        if src.len() < LENGTH_PREFIX_BYTES + length {
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                length: item.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(LENGTH_PREFIX_BYTES + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}
