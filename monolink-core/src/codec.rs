//! The two wire-facing capabilities an application plugs into the engine.
//!
//! The engine never looks inside a message: [`Decoder`] turns bytes read from
//! a connection into messages, [`Message::serialize`] turns them back into
//! bytes on the send path. Framing, size limits and validation all belong to
//! the decoder.

use std::{fmt::Display, future::Future};

use bytes::Bytes;
use monoio::io::AsyncReadRent;

pub trait Message: Send + 'static {
    fn serialize(&self) -> Bytes;
}

impl Message for Bytes {
    #[inline]
    fn serialize(&self) -> Bytes {
        self.clone()
    }
}

impl Message for Vec<u8> {
    #[inline]
    fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

/// Reads exactly one message from the read half of a connection.
///
/// The call may wait as long as the peer stays silent; the engine bounds it
/// with the idle watchdog and cancels it when the connection closes. Any
/// error terminates the connection.
pub trait Decoder: Send + Sync + 'static {
    type Message: Message;
    type Error: Display;

    fn decode<R>(&self, io: &mut R) -> impl Future<Output = Result<Self::Message, Self::Error>>
    where
        R: AsyncReadRent;
}
