use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{atomic::Ordering, Arc},
};

use futures_util::FutureExt;
use monoio::{
    io::{AsyncWriteRentExt, OwnedReadHalf, OwnedWriteHalf, Splitable},
    net::TcpStream,
};
use tracing::{debug, error, trace};

use super::{
    watchdog::{IdleTimeout, IdleWatchdog},
    ConnectionRef,
};
use crate::{handler::ErrorKind, Decoder, Message};

#[derive(Debug, Clone, Copy)]
enum Role {
    Receive,
    Dispatch,
    Send,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Receive => "receive",
            Role::Dispatch => "dispatch",
            Role::Send => "send",
        })
    }
}

pub(super) fn spawn<D, P>(
    conn: ConnectionRef<D::Message, P>,
    decoder: Arc<D>,
    stream: TcpStream,
) where
    D: Decoder,
    P: Send + Sync + 'static,
{
    let (reader, writer) = stream.into_split();
    monoio::spawn(supervise(
        conn.clone(),
        Role::Dispatch,
        dispatch(conn.clone()),
    ));
    monoio::spawn(supervise(
        conn.clone(),
        Role::Receive,
        receive(conn.clone(), decoder, reader),
    ));
    monoio::spawn(supervise(conn.clone(), Role::Send, send(conn, writer)));
}

/// Fault boundary of one worker: a panic is logged and, like any other way
/// the worker can end, turned into a close of the connection.
async fn supervise<M, P, F>(conn: ConnectionRef<M, P>, role: Role, worker: F)
where
    M: 'static,
    P: 'static,
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
        error!(
            conn = conn.id(),
            peer = %conn.peer_addr(),
            "{role} worker panicked: {}",
            panic_message(panic.as_ref())
        );
    }
    trace!(conn = conn.id(), "{role} worker exit");
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| conn.close())) {
        error!(
            conn = conn.id(),
            "close callback panicked: {}",
            panic_message(panic.as_ref())
        );
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum ReceiveError<E> {
    Decode(E),
    Idle(IdleTimeout),
}

impl<E: fmt::Display> fmt::Display for ReceiveError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::Decode(e) => write!(f, "decode failed: {e}"),
            ReceiveError::Idle(e) => write!(f, "{e}"),
        }
    }
}

async fn receive<D, P>(
    conn: ConnectionRef<D::Message, P>,
    decoder: Arc<D>,
    mut reader: OwnedReadHalf<TcpStream>,
) where
    D: Decoder,
    P: 'static,
{
    let mut watchdog = conn
        .heartbeat()
        .map(|interval| IdleWatchdog::new(interval, conn.idle_ceiling()));
    loop {
        if conn.should_stop() {
            return;
        }
        let decoded = monoio::select! {
            _ = conn.close_signal.fired() => return,
            _ = conn.shutdown.fired() => return,
            decoded = read_message(
                &*decoder,
                &mut reader,
                watchdog.as_mut(),
                &conn.socket,
            ) => decoded,
        };
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = conn.id(), peer = %conn.peer_addr(), "receive stopped: {e}");
                return;
            }
        };
        // blocks while dispatch is behind; fails once the queue is closed
        if conn.recv_tx.send(msg).await.is_err() {
            return;
        }
        conn.receive_count.fetch_add(1, Ordering::Relaxed);
    }
}

async fn read_message<D>(
    decoder: &D,
    reader: &mut OwnedReadHalf<TcpStream>,
    watchdog: Option<&mut IdleWatchdog>,
    socket: &super::SocketCloser,
) -> Result<D::Message, ReceiveError<D::Error>>
where
    D: Decoder,
{
    let decoded = match watchdog {
        Some(watchdog) => watchdog
            .watch(decoder.decode(reader), || socket.shutdown())
            .await
            .map_err(ReceiveError::Idle)?,
        None => decoder.decode(reader).await,
    };
    decoded.map_err(ReceiveError::Decode)
}

async fn dispatch<M, P>(conn: ConnectionRef<M, P>)
where
    M: 'static,
    P: 'static,
{
    let inbound = conn.recv_rx.clone();
    loop {
        let msg = monoio::select! {
            _ = conn.close_signal.fired() => return,
            _ = conn.shutdown.fired() => return,
            msg = inbound.recv() => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };
        if conn.is_closed() {
            conn.handler.on_error(&conn, msg, ErrorKind::HandleFailed);
            return;
        }
        if !conn.handler.on_message(&conn, msg) {
            debug!(conn = conn.id(), "handler finished the connection");
            return;
        }
    }
}

async fn send<M, P>(conn: ConnectionRef<M, P>, mut writer: OwnedWriteHalf<TcpStream>)
where
    M: Message,
    P: 'static,
{
    let outbound = conn.send_rx.clone();
    loop {
        let msg = monoio::select! {
            _ = conn.close_signal.fired() => return,
            _ = conn.shutdown.fired() => return,
            msg = outbound.recv() => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };
        if conn.is_closed() {
            conn.handler.on_error(&conn, msg, ErrorKind::SendFailed);
            return;
        }
        let (res, _) = writer.write_all(msg.serialize()).await;
        if let Err(e) = res {
            debug!(conn = conn.id(), peer = %conn.peer_addr(), "write failed: {e}");
            return;
        }
        conn.send_count.fetch_add(1, Ordering::Relaxed);
    }
}
