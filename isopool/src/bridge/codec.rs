//! Length-prefixed JSON framing for unit pipes.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Works over any AsyncRead/AsyncWrite, in practice a child's stdin/stdout.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted by default (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Frames above this size are logged when encoded.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Reject frames larger than `max` bytes in either direction.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            max_frame_length: max,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = json.len();
        if len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {len} bytes exceeds limit of {} bytes",
                    self.max_frame_length
                ),
            ));
        }
        tracing::trace!(frame_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::debug!(frame_kb = len / 1024, "Large frame being encoded");
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
