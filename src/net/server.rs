//! Server side: one listening descriptor, inbound connection lifecycle,
//! and frame dispatch to a user-supplied handler.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    thread::{Builder, JoinHandle},
};

use mio::net::TcpListener;

use super::config::ServerConfig;
use super::registry::ConnectionRegistry;
use super::{drain_read, drain_write, ReadOutcome, SocketId, WriteOutcome};
use crate::assembler::FrameCallback;
use crate::error::{Error, Result};
use crate::frame::{decode_frame, encode_frame, CorrelationId};
use crate::poll::{InterestSet, IoEvent, Multiplexer};
use crate::reactor::{Reactor, StopSignal};
use crate::thread_pool::WorkerPool;

/// Application logic invoked once per completed inbound frame.
///
/// Handlers run synchronously on read-pool workers, so several may execute
/// concurrently for different connections; implementations must be
/// thread-safe and reasonably quick to avoid stalling a worker.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        correlation_id: &CorrelationId,
        payload: Vec<u8>,
        ctx: &ServerContext,
        conn: SocketId,
    );
}

impl<F> RequestHandler for F
where
    F: Fn(&CorrelationId, Vec<u8>, &ServerContext, SocketId) + Send + Sync + 'static,
{
    fn handle(
        &self,
        correlation_id: &CorrelationId,
        payload: Vec<u8>,
        ctx: &ServerContext,
        conn: SocketId,
    ) {
        self(correlation_id, payload, ctx, conn)
    }
}

/// Handle passed to the request handler for pushing frames back out:
/// the response to a request, or an unsolicited frame to any connection
/// whose id the caller holds.
pub struct ServerContext {
    inner: Weak<ServerInner>,
}

impl ServerContext {
    /// Encode and enqueue a frame to the given connection and request
    /// writable interest. No callback bookkeeping: the server never
    /// initiates request/response correlation.
    pub fn send(
        &self,
        correlation_id: &CorrelationId,
        payload: &[u8],
        conn: SocketId,
    ) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(Error::ConnectionClosed)?;
        inner.send_frame(conn, correlation_id, payload)
    }
}

/// RPC server: binds a port, accepts connections, hands completed frames
/// to the handler.
pub struct Server {
    inner: Arc<ServerInner>,
    reactor: Mutex<Option<Reactor>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

struct ServerInner {
    cfg: ServerConfig,
    local_addr: SocketAddr,
    listener: Mutex<TcpListener>,
    mux: Arc<Multiplexer>,
    registry: ConnectionRegistry,
    handler: Box<dyn RequestHandler>,
    accept_pool: WorkerPool,
    read_pool: WorkerPool,
    write_pool: WorkerPool,
    stop: Arc<StopSignal>,
}

impl Server {
    /// Bind to the given port on all interfaces with default config.
    pub fn bind<H: RequestHandler>(port: u16, handler: H) -> Result<Server> {
        Self::with_config(ServerConfig::builder().port(port).build(), handler)
    }

    pub fn with_config<H: RequestHandler>(cfg: ServerConfig, handler: H) -> Result<Server> {
        let mut listener = TcpListener::bind(cfg.address)?;
        let local_addr = listener.local_addr()?;
        let mux = Arc::new(Multiplexer::new()?);
        mux.register(&mut listener, SocketId::LISTENER, InterestSet::READABLE)?;

        let inner = Arc::new(ServerInner {
            accept_pool: WorkerPool::new("server-accept", cfg.workers),
            read_pool: WorkerPool::new("server-read", cfg.workers),
            write_pool: WorkerPool::new("server-write", cfg.workers),
            cfg,
            local_addr,
            listener: Mutex::new(listener),
            mux,
            registry: ConnectionRegistry::new(),
            handler: Box::new(handler),
            stop: Arc::new(StopSignal::new()),
        });

        Ok(Server {
            inner,
            reactor: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of live inbound connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    /// Spawn the dispatch thread and the zombie reaper, then return.
    pub fn start(&self) {
        let mut reactor = self.reactor.lock().unwrap();
        if reactor.is_some() {
            return;
        }

        let reap_interval = self.inner.cfg.reap_interval;
        let weak = Arc::downgrade(&self.inner);
        let reap_stop = self.inner.stop.clone();
        let reaper = Builder::new()
            .name("server-reaper".to_string())
            .spawn(move || {
                tracing::info!("starting zombied resource reaper");
                while !reap_stop.wait_for(reap_interval) {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.reap();
                }
            })
            .expect("failed to spawn reaper thread");
        self.background.lock().unwrap().push(reaper);

        let weak = Arc::downgrade(&self.inner);
        *reactor = Some(Reactor::spawn(
            "server-mux",
            self.inner.mux.clone(),
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::dispatch(&inner, event);
                }
            },
        ));
        tracing::info!("server listening on {}", self.inner.local_addr);
    }

    /// Start and block until [`shutdown`](Server::shutdown) is called.
    pub fn run(&self) {
        self.start();
        self.inner.stop.wait();
    }

    /// Stop the dispatch thread and the reaper; unblocks `run`.
    pub fn shutdown(&self) {
        self.inner.stop.trigger();
        if let Some(reactor) = self.reactor.lock().unwrap().take() {
            reactor.stop();
        }
        for handle in self.background.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerInner {
    fn dispatch(inner: &Arc<ServerInner>, event: IoEvent) {
        let id = event.id;
        if id == SocketId::LISTENER {
            // connection requests pending: drain them on the accept pool
            let weak = Arc::downgrade(inner);
            inner.accept_pool.submit(move || {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::accept_loop(&inner);
                }
            });
            return;
        }
        if event.failed {
            tracing::error!("multiplexer reported error/hangup on connection {id}");
            inner.fail_connection(id);
            return;
        }
        if event.readable {
            match inner
                .registry
                .set_interest(id, |i| i.without(InterestSet::READABLE))
            {
                Ok(true) => {
                    let weak = Arc::downgrade(inner);
                    inner.read_pool.submit(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.read_task(id);
                        }
                    });
                }
                Ok(false) => {}
                Err(e) => tracing::error!("could not clear readable interest on {id}: {e}"),
            }
        }
        if event.writable {
            match inner
                .registry
                .set_interest(id, |i| i.without(InterestSet::WRITABLE))
            {
                Ok(true) => {
                    let weak = Arc::downgrade(inner);
                    inner.write_pool.submit(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.write_task(id);
                        }
                    });
                }
                Ok(false) => {}
                Err(e) => tracing::error!("could not clear writable interest on {id}: {e}"),
            }
        }
    }

    /// Accept pending connections until the call would block, registering
    /// each one readable with the shared multiplexer.
    fn accept_loop(inner: &Arc<ServerInner>) {
        loop {
            let accepted = inner.listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, addr)) => {
                    let id = SocketId::next();
                    tracing::info!("incoming connection from {addr} as {id}");

                    let weak = Arc::downgrade(inner);
                    let on_frame: FrameCallback = Box::new(move |body| {
                        if let Some(inner) = weak.upgrade() {
                            ServerInner::handle_frame(&inner, id, body);
                        }
                    });
                    if let Err(e) = inner.registry.insert(
                        id,
                        stream,
                        inner.mux.clone(),
                        addr.to_string(),
                        on_frame,
                    ) {
                        tracing::error!("could not register connection {id}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("error accepting a new connection: {e}");
                    break;
                }
            }
        }
    }

    fn read_task(&self, id: SocketId) {
        let Some(resource) = self.registry.read_resource(id) else {
            return;
        };
        let Some(stream) = self.registry.stream(id) else {
            return;
        };
        let mut resource = resource.lock().unwrap();
        if !resource.valid {
            return;
        }
        let outcome = drain_read(&stream, &mut resource.assembler, self.cfg.read_chunk);
        let zombied = self.registry.is_zombied(id);
        match outcome {
            ReadOutcome::Rearm if !zombied => {
                drop(resource);
                if let Err(e) = self
                    .registry
                    .set_interest(id, |i| i.with(InterestSet::READABLE))
                {
                    tracing::error!("could not re-arm readable interest on {id}: {e}");
                }
            }
            _ => {
                resource.valid = false;
                drop(resource);
                self.connection_dead(id);
            }
        }
    }

    fn write_task(&self, id: SocketId) {
        let Some(resource) = self.registry.write_resource(id) else {
            return;
        };
        let Some(stream) = self.registry.stream(id) else {
            return;
        };
        let mut resource = resource.lock().unwrap();
        if !resource.valid {
            return;
        }
        match drain_write(&stream, &mut resource.outbound, self.cfg.write_chunk) {
            WriteOutcome::Idle => {}
            WriteOutcome::Rearm => {
                drop(resource);
                if let Err(e) = self
                    .registry
                    .set_interest(id, |i| i.with(InterestSet::WRITABLE))
                {
                    tracing::error!("could not re-arm writable interest on {id}: {e}");
                }
            }
            WriteOutcome::Dead => {
                resource.valid = false;
                drop(resource);
                self.connection_dead(id);
            }
        }
    }

    /// Decode a completed frame and hand it to the handler, synchronously
    /// on the read-pool worker that assembled it.
    fn handle_frame(inner: &Arc<ServerInner>, id: SocketId, body: Vec<u8>) {
        match decode_frame(&body) {
            Ok((cid, payload)) => {
                let ctx = ServerContext {
                    inner: Arc::downgrade(inner),
                };
                inner.handler.handle(&cid, payload, &ctx, id);
            }
            Err(e) => {
                tracing::error!("undecodable frame on connection {id}: {e}");
                inner.connection_dead(id);
            }
        }
    }

    fn send_frame(&self, conn: SocketId, cid: &CorrelationId, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(cid, payload);
        let resource = self
            .registry
            .write_resource(conn)
            .ok_or(Error::ConnectionClosed)?;
        {
            let mut resource = resource.lock().unwrap();
            if !resource.valid {
                return Err(Error::ConnectionClosed);
            }
            resource.outbound.append(&frame);
        }
        if !self
            .registry
            .set_interest(conn, |i| i.with(InterestSet::WRITABLE))?
        {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn connection_dead(&self, id: SocketId) {
        self.registry.mark_zombie(id);
        tracing::warn!("connection {id} marked as zombie");
    }

    fn fail_connection(&self, id: SocketId) {
        self.registry.invalidate(id);
        self.connection_dead(id);
        self.registry.shutdown_stream(id);
    }

    fn reap(&self) {
        tracing::info!("reaping zombied resources");
        let grace = self.cfg.reap_grace.as_millis() as u64;
        for id in self.registry.due_zombies(grace) {
            if self.registry.close_and_remove(id).is_some() {
                tracing::info!("cleaned up resources for connection {id}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .workers(2)
            .build()
    }

    #[test]
    fn test_bind_assigns_ephemeral_port() {
        let server = Server::with_config(test_config(), |_: &CorrelationId, _: Vec<u8>, _: &ServerContext, _: SocketId| {})
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_start_is_idempotent_and_shutdown_unblocks_run() {
        let server = Arc::new(
            Server::with_config(test_config(), |_: &CorrelationId, _: Vec<u8>, _: &ServerContext, _: SocketId| {})
                .unwrap(),
        );
        server.start();
        server.start();

        let runner = server.clone();
        let handle = std::thread::spawn(move || runner.run());
        std::thread::sleep(std::time::Duration::from_millis(50));
        server.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_send_to_unknown_connection_fails() {
        let server = Server::with_config(test_config(), |_: &CorrelationId, _: Vec<u8>, _: &ServerContext, _: SocketId| {})
            .unwrap();
        let ctx = ServerContext {
            inner: Arc::downgrade(&server.inner),
        };
        let err = ctx
            .send(&CorrelationId::generate(), b"data", SocketId::next())
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
