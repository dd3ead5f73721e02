use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use monoio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub use self::{manager::Manager, runtime::RuntimeWrapper};
use crate::{
    config::ServerConfig,
    connection::{self, Connection},
    handler::Handler,
    listener::ListenerBuilder,
    signal::Signal,
    Decoder, Error, Result,
};

mod manager;
mod runtime;

/// Accept loop of one listening socket.
///
/// Every accepted socket becomes a [`Connection`]; admission and the workers
/// run as tasks on the current runtime thread so the loop goes straight back
/// to accepting.
pub struct Server<D: Decoder, P = ()> {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    decoder: Arc<D>,
    handler: Arc<dyn Handler<D::Message, P>>,
    shutdown: Signal,
}

impl<D, P> Server<D, P>
where
    D: Decoder,
    P: Send + Sync + 'static,
{
    /// Validates `config` and binds its address.
    pub fn bind(
        config: ServerConfig,
        decoder: D,
        handler: Arc<dyn Handler<D::Message, P>>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = ListenerBuilder::from(config.socket_addr())
            .build()
            .map_err(Error::Bind)?;
        Ok(Self::from_listener(
            Arc::new(config),
            listener,
            Arc::new(decoder),
            handler,
        ))
    }

    /// Wraps an already bound listener. `config` is expected to be validated.
    pub fn from_listener(
        config: Arc<ServerConfig>,
        listener: TcpListener,
        decoder: Arc<D>,
        handler: Arc<dyn Handler<D::Message, P>>,
    ) -> Self {
        Self {
            config,
            listener,
            decoder,
            handler,
            shutdown: Signal::new(),
        }
    }

    /// Replaces the shutdown signal, e.g. with one shared by several servers.
    pub fn with_shutdown(mut self, shutdown: Signal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Firing the returned signal stops [`run`](Self::run) and closes every
    /// connection the server has accepted.
    pub fn shutdown_handle(&self) -> Signal {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs until the shutdown signal fires, then closes every connection
    /// still open before returning.
    pub async fn run(self) {
        let accept_timeout = self.config.accept_timeout();
        match self.local_addr() {
            Ok(addr) => info!("server listening on {addr}"),
            Err(e) => warn!("server listening on unknown address: {e}"),
        }
        let mut live: Vec<Weak<Connection<D::Message, P>>> = Vec::new();
        loop {
            if self.shutdown.is_fired() {
                break;
            }
            let accepted = monoio::select! {
                _ = self.shutdown.fired() => break,
                accepted = monoio::time::timeout(accept_timeout, self.listener.accept()) => accepted,
            };
            match accepted {
                Ok(Ok((stream, peer))) => {
                    live.retain(|conn| conn.strong_count() > 0);
                    if let Some(conn) = self.spawn_connection(stream, peer) {
                        live.push(conn);
                    }
                }
                Ok(Err(e)) => warn!("accept connection failed: {e}"),
                // nothing arrived, go back and re-check shutdown
                Err(_) => continue,
            }
        }
        info!("server is notified to stop");
        for conn in live.iter().filter_map(Weak::upgrade) {
            conn.close();
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Option<Weak<Connection<D::Message, P>>> {
        let conn = match Connection::new(
            &stream,
            peer,
            &self.config,
            self.handler.clone(),
            self.shutdown.clone(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, "setting up connection failed: {e}");
                return None;
            }
        };
        debug!(conn = conn.id(), %peer, "accepted connection");
        let tracked = Arc::downgrade(&conn);
        monoio::spawn(connection::admit(conn, self.decoder.clone(), stream));
        Some(tracked)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    };

    use monoio::{
        io::{AsyncReadRent, AsyncWriteRentExt},
        net::TcpStream,
    };

    use super::Server;
    use crate::{
        config::{ServerConfig, MAX_TIMER_MS},
        handler::Handler,
        test_util::{free_port, wait_until, Byte, ByteDecoder, Recorder},
        Error, Signal,
    };

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::new(free_port());
        config.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.accept_timeout_ms = 50;
        config
    }

    fn start(config: ServerConfig, recorder: &Arc<Recorder>) -> (SocketAddr, Signal) {
        let handler: Arc<dyn Handler<Byte>> = recorder.clone();
        let server = Server::bind(config, ByteDecoder, handler).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        monoio::spawn(server.run());
        (addr, shutdown)
    }

    async fn read_byte(client: &mut TcpStream) -> Option<u8> {
        let read = client.read(Vec::with_capacity(1));
        let (res, buf) = monoio::time::timeout(Duration::from_secs(2), read)
            .await
            .ok()?;
        match res {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn bind_rejects_invalid_config() {
        let handler: Arc<dyn Handler<Byte>> = Recorder::new();
        let err = Server::bind(ServerConfig::new(0), ByteDecoder, handler.clone())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        let mut config = local_config();
        config.receive_queue_capacity = 0;
        let err = Server::bind(config, ByteDecoder, handler).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[monoio::test(timer_enabled = true)]
    async fn bind_reports_busy_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = local_config();
        config.port = taken.local_addr().unwrap().port();
        let handler: Arc<dyn Handler<Byte>> = Recorder::new();
        let err = Server::bind(config, ByteDecoder, handler).err().unwrap();
        assert!(matches!(err, Error::Bind(_)));
    }

    #[monoio::test(timer_enabled = true)]
    async fn dispatches_in_decode_order() {
        let recorder = Recorder::new();
        let (addr, shutdown) = start(local_config(), &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (res, _) = client.write_all(vec![b'A', b'B', b'C']).await;
        res.unwrap();
        assert!(wait_until(|| recorder.messages().len() == 3).await);
        assert_eq!(recorder.messages(), vec![b'A', b'B', b'C']);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn echoes_through_send_worker() {
        let recorder = Recorder::echoing();
        let (addr, shutdown) = start(local_config(), &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (res, _) = client.write_all(vec![42u8]).await;
        res.unwrap();
        assert_eq!(read_byte(&mut client).await, Some(42));
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn rejected_connection_never_starts_workers() {
        let recorder = Recorder::rejecting();
        let (addr, shutdown) = start(local_config(), &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| recorder.connects() == 1).await);
        let (res, _) = client.write_all(vec![1u8]).await;
        let _ = res;
        // the socket is dropped after admission: the peer sees it go away
        assert_eq!(read_byte(&mut client).await, None);
        monoio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.messages().is_empty());
        assert_eq!(recorder.closes(), 0);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn handler_can_end_connection() {
        let recorder = Recorder::stopping_on(9);
        let (addr, shutdown) = start(local_config(), &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (res, _) = client.write_all(vec![1u8, 9]).await;
        res.unwrap();
        assert!(wait_until(|| recorder.closes() == 1).await);
        assert_eq!(recorder.messages(), vec![1, 9]);
        assert_eq!(read_byte(&mut client).await, None);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn worker_panic_only_closes_its_connection() {
        let recorder = Recorder::panicking_on(7);
        let (addr, shutdown) = start(local_config(), &recorder);

        let mut faulty = TcpStream::connect(addr).await.unwrap();
        let (res, _) = faulty.write_all(vec![7u8]).await;
        res.unwrap();
        assert!(wait_until(|| recorder.closes() == 1).await);
        assert_eq!(read_byte(&mut faulty).await, None);

        // the server keeps serving other peers
        let mut healthy = TcpStream::connect(addr).await.unwrap();
        let (res, _) = healthy.write_all(vec![1u8]).await;
        res.unwrap();
        assert!(wait_until(|| recorder.messages() == vec![7, 1]).await);
        assert_eq!(recorder.closes(), 1);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn shutdown_stops_accepting_and_closes_connections() {
        let recorder = Recorder::new();
        let handler: Arc<dyn Handler<Byte>> = recorder.clone();
        let server = Server::bind(local_config(), ByteDecoder, handler).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let running = monoio::spawn(server.run());

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| recorder.connects() == 2).await);

        assert!(shutdown.fire());
        monoio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap();
        assert!(wait_until(|| recorder.closes() == 2).await);
    }

    #[monoio::test(timer_enabled = true)]
    async fn silent_peer_hits_idle_ceiling() {
        let mut config = local_config();
        config.heartbeat_interval_ms = 10_000;
        config.idle_ceiling_ms = 100;
        let recorder = Recorder::new();
        let (addr, shutdown) = start(config, &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| recorder.closes() == 1).await);
        assert_eq!(read_byte(&mut client).await, None);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn heartbeat_deadline_drops_idle_peer() {
        let mut config = local_config();
        config.heartbeat_interval_ms = 100;
        let recorder = Recorder::new();
        let (addr, shutdown) = start(config, &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (res, _) = client.write_all(vec![3u8]).await;
        res.unwrap();
        // one message refreshes the deadline, then the peer goes quiet
        assert!(wait_until(|| recorder.closes() == 1).await);
        assert_eq!(recorder.messages(), vec![3]);
        shutdown.fire();
    }

    #[monoio::test(timer_enabled = true)]
    async fn longest_heartbeat_keeps_serving() {
        let mut config = local_config();
        config.heartbeat_interval_ms = MAX_TIMER_MS;
        let recorder = Recorder::new();
        let (addr, shutdown) = start(config, &recorder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (res, _) = client.write_all(vec![1u8, 2]).await;
        res.unwrap();
        assert!(wait_until(|| recorder.messages().len() == 2).await);
        assert_eq!(recorder.messages(), vec![1, 2]);
        assert_eq!(recorder.closes(), 0);
        shutdown.fire();
    }
}
