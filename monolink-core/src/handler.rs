use std::fmt;

use crate::connection::ConnectionRef;

/// Why a message could not make it through the pipeline.
///
/// The numeric codes are stable and can be forwarded to clients or logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    /// The send worker dequeued a message after the connection closed.
    SendFailed,
    /// The dispatch worker dequeued a message after the connection closed.
    HandleFailed,
    /// `write` was called on a closed connection.
    WriteFailed,
}

impl ErrorKind {
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::Unknown => 0,
            ErrorKind::SendFailed => -1,
            ErrorKind::HandleFailed => -2,
            ErrorKind::WriteFailed => -3,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::SendFailed => "send failed",
            ErrorKind::HandleFailed => "handle failed",
            ErrorKind::WriteFailed => "write failed",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Application callbacks for every connection of a server.
///
/// One implementer covers the whole lifecycle and is shared by all
/// connections as an `Arc<dyn Handler<M, P>>`. Callbacks run on the worker
/// that observed the event and must not block for long: `on_message` stalls
/// the dispatch worker of that connection until it returns.
pub trait Handler<M, P = ()>: Send + Sync + 'static {
    /// Admission decision for a freshly accepted socket. Workers only start
    /// when this returns true; a rejected socket is dropped once the call
    /// returns unless the handler keeps the connection around.
    fn on_connect(&self, conn: &ConnectionRef<M, P>) -> bool;

    /// Called exactly once, at the end of the close sequence.
    fn on_close(&self, conn: &ConnectionRef<M, P>);

    /// Returning false closes the connection.
    fn on_message(&self, conn: &ConnectionRef<M, P>, msg: M) -> bool;

    fn on_error(&self, conn: &ConnectionRef<M, P>, msg: M, kind: ErrorKind);
}
