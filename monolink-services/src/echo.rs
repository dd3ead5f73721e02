use std::sync::Arc;

use monolink_core::{ConnectionRef, ErrorKind, Handler, Registry};
use tracing::{debug, info, warn};

use crate::codec::Frame;

pub type FrameRegistry = Registry<u64, Frame>;

/// Ping-pong handler: every frame is written straight back to its sender.
///
/// Live connections are kept in a shared registry under their id so other
/// threads can push frames to them.
#[derive(Clone, Default)]
pub struct EchoHandler {
    registry: Arc<FrameRegistry>,
}

impl EchoHandler {
    pub fn new(registry: Arc<FrameRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<FrameRegistry> {
        &self.registry
    }
}

impl Handler<Frame> for EchoHandler {
    fn on_connect(&self, conn: &ConnectionRef<Frame>) -> bool {
        info!(conn = conn.id(), peer = %conn.peer_addr(), "connect");
        self.registry.join(conn.id(), conn);
        true
    }

    fn on_close(&self, conn: &ConnectionRef<Frame>) {
        self.registry.quit(&conn.id(), conn);
        info!(
            conn = conn.id(),
            peer = %conn.peer_addr(),
            online = self.registry.len(),
            "close"
        );
    }

    fn on_message(&self, conn: &ConnectionRef<Frame>, msg: Frame) -> bool {
        debug!(conn = conn.id(), len = msg.len(), "receive");
        match conn.try_write(msg) {
            Ok(()) => true,
            // slow reader: drop this echo, keep the connection
            Err(e) if e.is_blocking() => {
                warn!(conn = conn.id(), "echo dropped: {e}");
                true
            }
            Err(_) => false,
        }
    }

    fn on_error(&self, conn: &ConnectionRef<Frame>, msg: Frame, kind: ErrorKind) {
        warn!(conn = conn.id(), len = msg.len(), "frame lost: {kind}");
    }
}
