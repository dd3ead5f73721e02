use std::{io, sync::Arc, thread::JoinHandle};

use monoio::utils::bind_to_cpu_set;
use service_async::MakeService;
use tracing::{error, info, warn};

use super::{RuntimeWrapper, Server};
use crate::{
    config::{RuntimeConfig, ServerConfig},
    handler::Handler,
    listener::ListenerBuilder,
    signal::Signal,
    Decoder, Error, Result,
};

/// Manager is held by the main thread and starts one server per worker thread.
///
/// Every worker builds its own runtime and binds its own listener on the
/// shared address; all of them watch the same shutdown signal.
pub struct Manager {
    runtime_config: RuntimeConfig,
    shutdown: Signal,
}

impl Manager {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            shutdown: Signal::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    /// Firing the returned signal stops every worker's server.
    pub fn shutdown_handle(&self) -> Signal {
        self.shutdown.clone()
    }

    /// Starts `worker_threads` servers and returns once all of them are
    /// listening. If any worker fails to start, the others are stopped and the
    /// first failure is returned.
    pub fn serve<D, P>(
        &self,
        config: ServerConfig,
        decoder: D,
        handler: Arc<dyn Handler<D::Message, P>>,
    ) -> Result<Vec<JoinHandle<()>>>
    where
        D: Decoder,
        P: Send + Sync + 'static,
    {
        config.validate()?;
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok().map(usize::from)
        } else {
            None
        };

        let workers = self.runtime_config.worker_threads.max(1);
        let runtime_config = Arc::new(self.runtime_config.clone());
        let listener_builder = Arc::new(ListenerBuilder::from(config.socket_addr()));
        let config = Arc::new(config);
        let decoder = Arc::new(decoder);
        let (ready_tx, ready_rx) = async_channel::bounded::<io::Result<()>>(workers);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let runtime_config = runtime_config.clone();
            let listener_builder = listener_builder.clone();
            let config = config.clone();
            let decoder = decoder.clone();
            let handler = handler.clone();
            let shutdown = self.shutdown.clone();
            let ready_tx = ready_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("monolink-worker-{worker_id}"))
                .spawn(move || {
                    // bind thread to cpu core
                    if let Some(cores) = cores {
                        let core = worker_id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = match RuntimeWrapper::new(&runtime_config) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = ready_tx.send_blocking(Err(e));
                            return;
                        }
                    };
                    runtime.block_on(async move {
                        let listener = match listener_builder.make() {
                            Ok(listener) => listener,
                            Err(e) => {
                                let _ = ready_tx.send(Err(e)).await;
                                return;
                            }
                        };
                        let _ = ready_tx.send(Ok(())).await;
                        drop(ready_tx);
                        Server::from_listener(config, listener, decoder, handler)
                            .with_shutdown(shutdown)
                            .run()
                            .await;
                    });
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.abort(handles);
                    return Err(Error::Io(e));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..workers {
            let started = match ready_rx.recv_blocking() {
                Ok(started) => started,
                Err(_) => Err(io::Error::other("worker exited before listening")),
            };
            if let Err(e) = started {
                error!("worker failed to start: {e}");
                self.abort(handles);
                return Err(Error::Bind(e));
            }
        }
        info!("{workers} workers listening on {}", listener_builder.addr());
        Ok(handles)
    }

    fn abort(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.fire();
        for handle in handles {
            let _ = handle.join();
        }
    }
}
