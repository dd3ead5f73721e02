//! Length-prefixed framing.
//!
//! Every frame on the wire is a 4-byte big-endian payload length followed by
//! the payload itself:
//!
//! ```text
//! 00 00 00 01 30    length 1, payload 0x30
//! ```

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use monoio::io::{AsyncReadRent, AsyncReadRentExt};
use monolink_core::{Decoder, Message};

pub const HEADER_LEN: usize = 4;
/// 10 MiB
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Largest payload the 4-byte length header can describe.
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;

/// One frame payload, without its length header.
///
/// The payload always fits the length header: [`Frame::new`] rejects anything
/// larger than [`MAX_FRAME_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        header_len(payload.len())?;
        Ok(Self(payload))
    }


    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The header value for a payload of `len` bytes.
fn header_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::FrameTooLarge {
        len,
        max: MAX_FRAME_SIZE,
    })
}

impl Message for Frame {
    fn serialize(&self) -> Bytes {
        // payloads are capped to MAX_FRAME_SIZE on construction
        let len = header_len(self.0.len()).unwrap_or(u32::MAX);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.0.len());
        buf.put_u32(len);
        buf.put_slice(&self.0);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LengthDelimited {
    max_frame_size: usize,
}

impl Default for LengthDelimited {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl LengthDelimited {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for LengthDelimited {
    type Message = Frame;
    type Error = CodecError;

    async fn decode<R>(&self, io: &mut R) -> Result<Frame, CodecError>
    where
        R: AsyncReadRent,
    {
        let (res, header) = io.read_exact(Vec::with_capacity(HEADER_LEN)).await;
        res?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        if len == 0 {
            return Ok(Frame::default());
        }
        let (res, payload) = io.read_exact(Vec::with_capacity(len)).await;
        res?;
        Ok(Frame(Bytes::from(payload)))
    }
}
