use std::{io, net::SocketAddr};

use monoio::net::{ListenerOpts, TcpListener};
use service_async::MakeService;

const DEFAULT_BACKLOG: i32 = 1024;

/// Everything needed to bind a listener, without binding it yet.
///
/// Each worker thread builds its own listener from the same builder; with
/// `SO_REUSEPORT` the kernel spreads incoming connections across them.
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    addr: SocketAddr,
    opts: ListenerOpts,
}

impl ListenerBuilder {
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn build(&self) -> io::Result<TcpListener> {
        TcpListener::bind_with_config(self.addr, &self.opts)
    }
}

impl From<SocketAddr> for ListenerBuilder {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            opts: default_opts(),
        }
    }
}

pub fn default_opts() -> ListenerOpts {
    ListenerOpts::new()
        .reuse_port(true)
        .reuse_addr(true)
        .backlog(DEFAULT_BACKLOG)
}

impl MakeService for ListenerBuilder {
    type Service = TcpListener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}
