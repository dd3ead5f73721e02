//! One accepted socket and the pipeline that serves it.
//!
//! Every admitted connection runs three workers on the runtime thread that
//! accepted it:
//!
//! - **receive**: asks the [`Decoder`](crate::Decoder) for the next message and pushes it onto
//!   the inbound queue, optionally under the [idle watchdog](watchdog).
//! - **dispatch**: pops the inbound queue and hands each message to [`Handler::on_message`].
//! - **send**: pops the outbound queue fed by [`Connection::write`] and writes the serialized
//!   bytes to the socket.
//!
//! Whichever worker stops first drives [`Connection::close`]. The close sequence runs once no
//! matter how many workers, handlers or foreign threads call it, and it is the only place where
//! the queues, the close signal and the socket are torn down.
//!
//! A [`Connection`] is `Send + Sync`: writes and closes may come from any thread, e.g. through
//! a [`Registry`](crate::Registry) lookup.

use std::{
    fmt, io,
    net::{Shutdown, SocketAddr, TcpStream as StdTcpStream},
    os::fd::{AsRawFd, BorrowedFd},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use async_channel::{Receiver, Sender, TrySendError};
use monoio::net::TcpStream;
use tracing::{debug, error, info};

use crate::{
    config::{ServerConfig, MAX_TIMER_MS},
    handler::{ErrorKind, Handler},
    signal::Signal,
    Decoder, Error, Result,
};

pub(crate) mod watchdog;
mod worker;

pub type ConnectionRef<M, P = ()> = Arc<Connection<M, P>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    /// The admission callback is running, no worker has started.
    Admitting = 0,
    Active = 1,
    /// The close sequence has started; writes are rejected from here on.
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Admitting,
            1 => ConnState::Active,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

pub struct Connection<M, P = ()> {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: AtomicU8,
    close_signal: Signal,
    shutdown: Signal,
    send_tx: Sender<M>,
    send_rx: Receiver<M>,
    recv_tx: Sender<M>,
    recv_rx: Receiver<M>,
    send_count: AtomicU64,
    receive_count: AtomicU64,
    heartbeat_ms: AtomicU64,
    idle_ceiling: Duration,
    payload: RwLock<Option<P>>,
    handler: Arc<dyn Handler<M, P>>,
    socket: SocketCloser,
}

impl<M, P> Connection<M, P>
where
    M: 'static,
    P: 'static,
{
    pub(crate) fn new(
        stream: &TcpStream,
        peer_addr: SocketAddr,
        config: &ServerConfig,
        handler: Arc<dyn Handler<M, P>>,
        shutdown: Signal,
    ) -> io::Result<ConnectionRef<M, P>> {
        let local_addr = stream.local_addr()?;
        let socket = SocketCloser::new(stream)?;
        let (send_tx, send_rx) = async_channel::bounded(config.send_queue_capacity);
        let (recv_tx, recv_rx) = async_channel::bounded(config.receive_queue_capacity);
        Ok(Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            state: AtomicU8::new(ConnState::Admitting as u8),
            close_signal: Signal::new(),
            shutdown,
            send_tx,
            send_rx,
            recv_tx,
            recv_rx,
            send_count: AtomicU64::new(0),
            receive_count: AtomicU64::new(0),
            heartbeat_ms: AtomicU64::new(config.heartbeat_interval_ms.min(MAX_TIMER_MS)),
            idle_ceiling: config.idle_ceiling(),
            payload: RwLock::new(None),
            handler,
            socket,
        }))
    }

    /// Process-unique, never reused.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state() >= ConnState::Closing
    }

    /// Messages written to the socket so far.
    #[inline]
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    /// Messages decoded from the socket so far.
    #[inline]
    pub fn receive_count(&self) -> u64 {
        self.receive_count.load(Ordering::Relaxed)
    }

    /// Messages accepted by `write` and not yet taken by the send worker.
    #[inline]
    pub fn pending_writes(&self) -> usize {
        self.send_tx.len()
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        match self.heartbeat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Overrides the server-wide heartbeat interval for this connection.
    ///
    /// The receive worker reads it once when it starts, so this is meant to be
    /// called from [`Handler::on_connect`]. `Duration::ZERO` disables the
    /// idle watchdog; intervals above [`MAX_TIMER_MS`] are capped to it.
    pub fn set_heartbeat(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .min(MAX_TIMER_MS);
        self.heartbeat_ms.store(ms, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn idle_ceiling(&self) -> Duration {
        self.idle_ceiling
    }

    /// Stores the application payload, returning the previous one.
    pub fn set_payload(&self, payload: P) -> Option<P> {
        self.payload
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(payload)
    }

    pub fn take_payload(&self) -> Option<P> {
        self.payload
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(Option<&P>) -> R) -> R {
        let guard = self.payload.read().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_ref())
    }

    pub fn payload(&self) -> Option<P>
    where
        P: Clone,
    {
        self.with_payload(|p| p.cloned())
    }

    /// Admitting -> Active. Fails if the connection was closed during admission.
    fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::Admitting as u8,
                ConnState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves the connection into Closing. Exactly one caller ever wins.
    fn begin_close(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < ConnState::Closing as u8).then_some(ConnState::Closing as u8)
            })
            .is_ok()
    }

    #[inline]
    fn should_stop(&self) -> bool {
        self.close_signal.is_fired() || self.shutdown.is_fired()
    }
}

impl<M, P> Connection<M, P>
where
    M: 'static,
    P: 'static,
{
    /// Enqueues a message for the send worker.
    ///
    /// - `timeout == 0`: never waits; a full queue fails with [`Error::WriteBlocking`].
    /// - `timeout > 0`: waits for room up to `timeout`, then fails with
    ///   [`Error::WriteBlocking`]. Closing the connection meanwhile counts as
    ///   writing to a closed connection.
    ///
    /// Writing to a closed connection reports the message through
    /// [`Handler::on_error`] with [`ErrorKind::WriteFailed`] and fails with
    /// [`Error::ConnectionClosed`]. A positive timeout needs a runtime with the
    /// timer enabled and is capped to [`MAX_TIMER_MS`].
    pub async fn write(self: &Arc<Self>, msg: M, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(self.reject_write(msg));
        }
        if timeout.is_zero() {
            return self.enqueue(msg);
        }
        let timeout = timeout.min(Duration::from_millis(MAX_TIMER_MS));
        // close() closes the queue, which hands a pending message back here
        monoio::select! {
            sent = self.send_tx.send(msg) => sent.map_err(|e| self.reject_write(e.0)),
            _ = monoio::time::sleep(timeout) => Err(Error::WriteBlocking),
        }
    }

    /// The non-blocking form of [`write`](Self::write), usable from synchronous
    /// callbacks and from threads without a runtime.
    pub fn try_write(self: &Arc<Self>, msg: M) -> Result<()> {
        if self.is_closed() {
            return Err(self.reject_write(msg));
        }
        self.enqueue(msg)
    }

    fn enqueue(self: &Arc<Self>, msg: M) -> Result<()> {
        match self.send_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::WriteBlocking),
            // lost the race against close() after the state check
            Err(TrySendError::Closed(msg)) => Err(self.reject_write(msg)),
        }
    }

    fn reject_write(self: &Arc<Self>, msg: M) -> Error {
        self.handler.on_error(self, msg, ErrorKind::WriteFailed);
        Error::ConnectionClosed
    }

    /// Tears the connection down. Idempotent and safe to call from any thread,
    /// including from inside handler callbacks.
    ///
    /// The closed flag is raised first so that concurrent writers observe it
    /// before anything else is released. Then the close signal wakes every
    /// worker, both queues stop accepting messages, the socket is shut down
    /// and finally [`Handler::on_close`] runs.
    pub fn close(self: &Arc<Self>) {
        if !self.begin_close() {
            return;
        }
        self.close_signal.fire();
        self.send_tx.close();
        self.recv_tx.close();
        self.socket.shutdown();
        info!(
            conn = self.id,
            peer = %self.peer_addr,
            sent = self.send_count(),
            received = self.receive_count(),
            "connection closed"
        );
        self.handler.on_close(self);
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }
}

impl<M, P> fmt::Debug for Connection<M, P>
where
    M: 'static,
    P: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Runs the admission decision and, if the handler accepts, starts the workers.
pub(crate) async fn admit<D, P>(
    conn: ConnectionRef<D::Message, P>,
    decoder: Arc<D>,
    stream: TcpStream,
) where
    D: Decoder,
    P: Send + Sync + 'static,
{
    let admitted = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        conn.handler.on_connect(&conn)
    })) {
        Ok(admitted) => admitted,
        Err(panic) => {
            error!(
                conn = conn.id,
                peer = %conn.peer_addr,
                "admission callback panicked: {}",
                worker::panic_message(panic.as_ref())
            );
            conn.close();
            false
        }
    };
    if !admitted {
        debug!(conn = conn.id, peer = %conn.peer_addr, "connection rejected");
        return;
    }
    if !conn.activate() {
        debug!(conn = conn.id, "connection closed during admission");
        return;
    }
    debug!(conn = conn.id, peer = %conn.peer_addr, "connection admitted");
    worker::spawn(conn, decoder, stream);
}

/// A second handle on the accepted socket.
///
/// The runtime-bound stream halves belong to the workers; this duplicate lets
/// the close sequence and the idle watchdog shut the socket down from any
/// thread, which also fails any read or write still pending on it.
struct SocketCloser(Mutex<Option<StdTcpStream>>);

impl SocketCloser {
    fn new(stream: &TcpStream) -> io::Result<Self> {
        // Safety: `stream` owns the fd and outlives this borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
        let dup = fd.try_clone_to_owned()?;
        Ok(Self(Mutex::new(Some(StdTcpStream::from(dup)))))
    }

    fn shutdown(&self) {
        let stream = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stream) = stream {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    debug!("socket shutdown failed: {e}");
                }
            }
        }
    }
}
