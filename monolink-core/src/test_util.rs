use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use monoio::{
    io::{AsyncReadRent, AsyncReadRentExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    codec::{Decoder, Message},
    connection::ConnectionRef,
    handler::{ErrorKind, Handler},
};

/// Returns `(server side, peer address seen by the server, client side)`.
pub(crate) async fn tcp_pair() -> (TcpStream, SocketAddr, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (server, peer, client)
}

pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Polls `cond` until it holds or about two seconds have passed.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        monoio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A one-byte message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Byte(pub u8);

impl Message for Byte {
    fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.0])
    }
}

pub(crate) struct ByteDecoder;

impl Decoder for ByteDecoder {
    type Message = Byte;
    type Error = io::Error;

    async fn decode<R>(&self, io: &mut R) -> Result<Byte, io::Error>
    where
        R: AsyncReadRent,
    {
        let (res, buf) = io.read_exact(Vec::with_capacity(1)).await;
        res?;
        Ok(Byte(buf[0]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Connect(u64),
    Message(u8),
    Error(u8, ErrorKind),
    Close(u64),
}

/// Records every callback. Optionally rejects admission, echoes messages or
/// ends the connection on a given byte.
pub(crate) struct Recorder {
    admit: bool,
    echo: bool,
    stop_on: Option<u8>,
    panic_on: Option<u8>,
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::with(true, false, None))
    }

    pub(crate) fn rejecting() -> Arc<Self> {
        Arc::new(Self::with(false, false, None))
    }

    pub(crate) fn echoing() -> Arc<Self> {
        Arc::new(Self::with(true, true, None))
    }

    pub(crate) fn stopping_on(byte: u8) -> Arc<Self> {
        Arc::new(Self::with(true, false, Some(byte)))
    }

    pub(crate) fn panicking_on(byte: u8) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(byte),
            ..Self::with(true, false, None)
        })
    }

    fn with(admit: bool, echo: bool, stop_on: Option<u8>) -> Self {
        Self {
            admit,
            echo,
            stop_on,
            panic_on: None,
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn messages(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Message(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn connects(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Connect(_)))
            .count()
    }

    pub(crate) fn closes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Close(_)))
            .count()
    }
}

impl Handler<Byte> for Recorder {
    fn on_connect(&self, conn: &ConnectionRef<Byte>) -> bool {
        self.push(Event::Connect(conn.id()));
        self.admit
    }

    fn on_close(&self, conn: &ConnectionRef<Byte>) {
        self.push(Event::Close(conn.id()));
    }

    fn on_message(&self, conn: &ConnectionRef<Byte>, msg: Byte) -> bool {
        self.push(Event::Message(msg.0));
        if self.stop_on == Some(msg.0) {
            return false;
        }
        if self.panic_on == Some(msg.0) {
            panic!("boom on {}", msg.0);
        }
        if self.echo {
            let _ = conn.try_write(msg);
        }
        true
    }

    fn on_error(&self, _conn: &ConnectionRef<Byte>, msg: Byte, kind: ErrorKind) {
        self.push(Event::Error(msg.0, kind));
    }
}

pub(crate) struct NoopHandler;

impl<M, P> Handler<M, P> for NoopHandler
where
    M: 'static,
    P: 'static,
{
    fn on_connect(&self, _conn: &ConnectionRef<M, P>) -> bool {
        true
    }

    fn on_close(&self, _conn: &ConnectionRef<M, P>) {}

    fn on_message(&self, _conn: &ConnectionRef<M, P>, _msg: M) -> bool {
        true
    }

    fn on_error(&self, _conn: &ConnectionRef<M, P>, _msg: M, _kind: ErrorKind) {}
}
