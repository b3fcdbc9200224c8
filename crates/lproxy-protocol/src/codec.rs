use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Big-endian u32 ahead of every JSON payload
const LENGTH_PREFIX: usize = 4;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec for tunnel frames
///
/// Wire format (one or more per WebSocket binary message):
/// ```text
/// +----------------+------------------+
/// | Length (4 bytes| JSON payload     |
/// | big-endian u32)| (variable)       |
/// +----------------+------------------+
/// ```
pub struct TunnelCodec<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> TunnelCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T> Default for TunnelCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> TunnelCodec<T> {
    /// Decode every complete frame currently buffered, leaving a trailing
    /// partial frame in `src`
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<T>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl<T: Serialize> TunnelCodec<T> {
    /// Encode a single frame into a fresh buffer
    pub fn encode_to_vec(&mut self, item: T) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(item, &mut buf)?;
        Ok(buf.to_vec())
    }
}

impl<T: DeserializeOwned> Decoder for TunnelCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Wait for the whole length prefix
        let Some(mut prefix) = src.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };

        // Read it in place; nothing is consumed until the frame is complete
        let length = prefix.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let frame_len = LENGTH_PREFIX + length;
        if src.len() < frame_len {
            // Rest of the frame is still in flight
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(LENGTH_PREFIX);
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<T: Serialize> Encoder<T> for TunnelCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        // The peer drops oversized frames, so never emit one
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
