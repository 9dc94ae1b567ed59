//! Client side: a pool of outbound connections to named hosts, request
//! routing by key hash or explicit index, and response correlation.
//!
//! Each connection owns its own multiplexer and dispatch thread; actual
//! reads and writes run on the shared read/write pools. A background
//! reaper closes zombied connections and immediately attempts to
//! reconnect; hosts that stay unreachable are retried on a fixed period.

use std::{
    collections::{HashMap, HashSet},
    net::TcpStream as StdTcpStream,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use mio::net::TcpStream;

use super::config::ClientConfig;
use super::registry::ConnectionRegistry;
use super::{drain_read, drain_write, ReadOutcome, SocketId, WriteOutcome};
use crate::assembler::FrameCallback;
use crate::error::{Error, Result};
use crate::frame::{decode_frame, encode_frame, CorrelationId};
use crate::poll::{InterestSet, IoEvent, Multiplexer};
use crate::reactor::{Reactor, StopSignal};
use crate::thread_pool::WorkerPool;
use crate::util::{route_hash, split_host_port};

/// Callback invoked with the response payload for one request.
pub type ResponseCallback = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

/// Per-host connection state, read by the routing check before every send.
struct HostStatus {
    healthy: bool,
    id: Option<SocketId>,
    mux: Option<Arc<Multiplexer>>,
}

#[derive(Default)]
struct CallTables {
    /// Registered response callbacks, scoped per connection.
    pending: HashMap<SocketId, HashMap<CorrelationId, ResponseCallback>>,
    /// Ids whose blocking caller timed out; a late response for one of
    /// these is dropped instead of being treated as desynchronization.
    expired: HashMap<SocketId, HashSet<CorrelationId>>,
}

enum Route {
    Deliver(ResponseCallback),
    Late,
    Unknown,
}

/// RPC client over a pool of persistent TCP connections.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    hosts: Vec<String>,
    cfg: ClientConfig,
    registry: ConnectionRegistry,
    status: Mutex<HashMap<String, HostStatus>>,
    calls: Mutex<CallTables>,
    retry_hosts: Mutex<Vec<String>>,
    reactors: Mutex<HashMap<SocketId, Reactor>>,
    read_pool: WorkerPool,
    write_pool: WorkerPool,
    late_responses: AtomicU64,
    stop: Arc<StopSignal>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Create a client for the given `"host:port"` list with default
    /// configuration. No connections are made until
    /// [`connect_to_hosts`](Client::connect_to_hosts).
    pub fn new(hosts: Vec<String>) -> Client {
        Self::with_config(hosts, ClientConfig::default())
    }

    pub fn with_config(hosts: Vec<String>, cfg: ClientConfig) -> Client {
        let stop = Arc::new(StopSignal::new());
        let inner = Arc::new(ClientInner {
            hosts,
            read_pool: WorkerPool::new("client-read", cfg.workers),
            write_pool: WorkerPool::new("client-write", cfg.workers),
            cfg,
            registry: ConnectionRegistry::new(),
            status: Mutex::new(HashMap::new()),
            calls: Mutex::new(CallTables::default()),
            retry_hosts: Mutex::new(Vec::new()),
            reactors: Mutex::new(HashMap::new()),
            late_responses: AtomicU64::new(0),
            stop: stop.clone(),
            background: Mutex::new(Vec::new()),
        });

        let reap_interval = inner.cfg.reap_interval;
        let weak = Arc::downgrade(&inner);
        let reap_stop = stop.clone();
        let reaper = Builder::new()
            .name("client-reaper".to_string())
            .spawn(move || {
                tracing::info!("starting zombied resource reaper");
                while !reap_stop.wait_for(reap_interval) {
                    let Some(inner) = weak.upgrade() else { break };
                    ClientInner::reap(&inner);
                }
            })
            .expect("failed to spawn reaper thread");

        let retry_interval = inner.cfg.retry_interval;
        let weak = Arc::downgrade(&inner);
        let retry_stop = stop;
        let retrier = Builder::new()
            .name("client-retry".to_string())
            .spawn(move || {
                while !retry_stop.wait_for(retry_interval) {
                    let Some(inner) = weak.upgrade() else { break };
                    ClientInner::retry_failed_hosts(&inner);
                }
            })
            .expect("failed to spawn retry thread");

        inner.background.lock().unwrap().extend([reaper, retrier]);
        Client { inner }
    }

    /// Connect to every configured host that is not already healthy.
    /// Returns the number of healthy hosts after the pass; the rest are
    /// queued for background retry.
    pub fn connect_to_hosts(&self) -> usize {
        let mut healthy = 0;
        for host in &self.inner.hosts {
            if self.inner.host_is_healthy(host) {
                healthy += 1;
                continue;
            }
            match ClientInner::make_connection(&self.inner, host) {
                Ok(()) => healthy += 1,
                Err(e) => {
                    tracing::error!("could not connect to remote host {host}: {e}");
                    self.inner.queue_for_retry(host.clone());
                }
            }
        }
        healthy
    }

    /// Send to the host at `index`; `callback` fires with the response
    /// payload. Fails fast without I/O when the host is unhealthy.
    pub fn request_to<F>(&self, index: usize, payload: &[u8], callback: F) -> Result<CorrelationId>
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.inner
            .send_to_index(index, payload, Some(Box::new(callback)))
            .map(|(_, cid)| cid)
    }

    /// Send to the host `key` hashes to. Identical keys always pick the
    /// same host for a fixed host count.
    pub fn request<F>(&self, key: &str, payload: &[u8], callback: F) -> Result<CorrelationId>
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.request_to(self.route(key)?, payload, callback)
    }

    /// Fire-and-forget send by index: no callback is registered, so the
    /// response (if any) is treated as unexpected.
    pub fn notify_to(&self, index: usize, payload: &[u8]) -> Result<CorrelationId> {
        self.inner
            .send_to_index(index, payload, None)
            .map(|(_, cid)| cid)
    }

    /// Fire-and-forget send by routing key.
    pub fn notify(&self, key: &str, payload: &[u8]) -> Result<CorrelationId> {
        self.notify_to(self.route(key)?, payload)
    }

    /// Send to the host at `index` and block until the response arrives
    /// or `timeout` elapses. On timeout the registered callback is
    /// deregistered; a response arriving later is dropped and counted.
    pub fn request_blocking_to(
        &self,
        index: usize,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let slot: Arc<(Mutex<Option<Vec<u8>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let callback_slot = slot.clone();
        let (conn, cid) = self.inner.send_to_index(
            index,
            payload,
            Some(Box::new(move |response| {
                let (value, cv) = &*callback_slot;
                *value.lock().unwrap() = Some(response);
                cv.notify_all();
            })),
        )?;

        let (value, cv) = &*slot;
        let deadline = Instant::now() + timeout;
        let mut guard = value.lock().unwrap();
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
        }
        if let Some(response) = guard.take() {
            return Ok(response);
        }
        drop(guard);

        // deregister so a late response cannot fire into a dead frame
        let deregistered = {
            let mut calls = self.inner.calls.lock().unwrap();
            let removed = calls
                .pending
                .get_mut(&conn)
                .and_then(|table| table.remove(&cid))
                .is_some();
            if removed {
                calls.expired.entry(conn).or_default().insert(cid);
            }
            removed
        };
        if deregistered {
            return Err(Error::Timeout);
        }

        // the response raced in between timeout and deregistration; give
        // the in-flight callback a moment to land
        let mut guard = value.lock().unwrap();
        while guard.is_none() {
            let (next, waited) = cv
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = next;
            if guard.is_none() && waited.timed_out() {
                return Err(Error::Timeout);
            }
        }
        Ok(guard.take().expect("response slot checked above"))
    }

    /// Send to the host `key` hashes to and block for the response.
    pub fn request_blocking(
        &self,
        key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.request_blocking_to(self.route(key)?, payload, timeout)
    }

    /// Index the given routing key resolves to.
    pub fn route(&self, key: &str) -> Result<usize> {
        if self.inner.hosts.is_empty() {
            return Err(Error::NoSuchHost(0));
        }
        Ok(route_hash(key) as usize % self.inner.hosts.len())
    }

    /// Whether the host at `index` is currently marked healthy.
    pub fn is_host_healthy(&self, index: usize) -> bool {
        self.inner
            .hosts
            .get(index)
            .map(|host| self.inner.host_is_healthy(host))
            .unwrap_or(false)
    }

    /// Responses that arrived after their blocking caller timed out.
    pub fn late_responses(&self) -> u64 {
        self.inner.late_responses.load(Ordering::Relaxed)
    }

    /// Number of live outbound connections (zombies included until the
    /// reaper erases them).
    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    /// Stop the reaper, retry and per-connection dispatch threads.
    pub fn shutdown(&self) {
        self.inner.stop.trigger();
        for handle in self.inner.background.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        let reactors: Vec<Reactor> = {
            let mut map = self.inner.reactors.lock().unwrap();
            map.drain().map(|(_, reactor)| reactor).collect()
        };
        for reactor in reactors {
            reactor.stop();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ClientInner {
    fn host_is_healthy(&self, host: &str) -> bool {
        self.status
            .lock()
            .unwrap()
            .get(host)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    fn queue_for_retry(&self, host: String) {
        let mut retry = self.retry_hosts.lock().unwrap();
        if !retry.contains(&host) {
            retry.push(host);
        }
    }

    /// Connect to one host and wire up its resources and dispatch thread.
    fn make_connection(inner: &Arc<ClientInner>, host: &str) -> Result<()> {
        tracing::info!("connecting to remote host: {host}");
        let result = ClientInner::try_connect(inner, host);
        if result.is_err() {
            let mut status = inner.status.lock().unwrap();
            status.insert(
                host.to_string(),
                HostStatus {
                    healthy: false,
                    id: None,
                    mux: None,
                },
            );
        }
        result
    }

    fn try_connect(inner: &Arc<ClientInner>, host: &str) -> Result<()> {
        let (name, port) = split_host_port(host)?;
        let std_stream = StdTcpStream::connect((name.as_str(), port))?;
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream);

        let id = SocketId::next();
        let mux = Arc::new(Multiplexer::new()?);

        let weak = Arc::downgrade(inner);
        let on_frame: FrameCallback = Box::new(move |body| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_frame(id, body);
            }
        });
        inner
            .registry
            .insert(id, stream, mux.clone(), host.to_string(), on_frame)?;

        inner.status.lock().unwrap().insert(
            host.to_string(),
            HostStatus {
                healthy: true,
                id: Some(id),
                mux: Some(mux.clone()),
            },
        );

        let weak = Arc::downgrade(inner);
        let reactor = Reactor::spawn(
            &format!("client-mux-{}", id.as_usize()),
            mux,
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    ClientInner::dispatch(&inner, event);
                }
            },
        );
        inner.reactors.lock().unwrap().insert(id, reactor);
        Ok(())
    }

    /// Fast path run on the dispatch thread: toggle the interest bit off
    /// and hand the slow I/O to a pool.
    fn dispatch(inner: &Arc<ClientInner>, event: IoEvent) {
        let id = event.id;
        if event.failed {
            tracing::error!("multiplexer reported error/hangup on connection {id}");
            inner.fail_connection(id);
            return;
        }
        if event.readable {
            match inner.registry.set_interest(id, |i| i.without(InterestSet::READABLE)) {
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
            match inner.registry.set_interest(id, |i| i.without(InterestSet::WRITABLE)) {
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
        // a frame handler may have zombied the connection mid-drain
        let desynced = self.registry.is_zombied(id);
        match outcome {
            ReadOutcome::Rearm if !desynced => {
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

    /// Decode a completed frame and route it to its pending callback.
    fn handle_frame(&self, id: SocketId, body: Vec<u8>) {
        let (cid, payload) = match decode_frame(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!("undecodable frame on connection {id}: {e}");
                self.connection_dead(id);
                return;
            }
        };

        let route = {
            let mut calls = self.calls.lock().unwrap();
            match calls.pending.get_mut(&id).and_then(|t| t.remove(&cid)) {
                Some(callback) => Route::Deliver(callback),
                None => {
                    if calls
                        .expired
                        .get_mut(&id)
                        .map(|set| set.remove(&cid))
                        .unwrap_or(false)
                    {
                        Route::Late
                    } else {
                        Route::Unknown
                    }
                }
            }
        };

        match route {
            Route::Deliver(callback) => callback(payload),
            Route::Late => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping late response for expired call {cid}");
            }
            Route::Unknown => {
                tracing::error!(
                    "no callback registered for correlation id {cid} on connection {id}"
                );
                self.connection_dead(id);
            }
        }
    }

    /// Health-check, correlate, frame and enqueue one send.
    fn send_to_index(
        &self,
        index: usize,
        payload: &[u8],
        callback: Option<ResponseCallback>,
    ) -> Result<(SocketId, CorrelationId)> {
        let host = self
            .hosts
            .get(index)
            .ok_or(Error::NoSuchHost(index))?
            .clone();
        let id = {
            let status = self.status.lock().unwrap();
            match status.get(&host) {
                Some(entry) if entry.healthy => match entry.id {
                    Some(id) => id,
                    None => return Err(Error::UnhealthyHost(host)),
                },
                _ => return Err(Error::UnhealthyHost(host)),
            }
        };

        let cid = CorrelationId::generate();
        if let Some(callback) = callback {
            self.calls
                .lock()
                .unwrap()
                .pending
                .entry(id)
                .or_default()
                .insert(cid, callback);
        }

        let enqueued = self.enqueue_frame(id, &cid, payload, &host);
        if let Err(e) = enqueued {
            let mut calls = self.calls.lock().unwrap();
            if let Some(table) = calls.pending.get_mut(&id) {
                table.remove(&cid);
            }
            return Err(e);
        }
        Ok((id, cid))
    }

    fn enqueue_frame(
        &self,
        id: SocketId,
        cid: &CorrelationId,
        payload: &[u8],
        host: &str,
    ) -> Result<()> {
        let frame = encode_frame(cid, payload);
        let resource = self
            .registry
            .write_resource(id)
            .ok_or(Error::ConnectionClosed)?;
        {
            let mut resource = resource.lock().unwrap();
            if !resource.valid {
                return Err(Error::UnhealthyHost(host.to_string()));
            }
            resource.outbound.append(&frame);
        }
        if !self
            .registry
            .set_interest(id, |i| i.with(InterestSet::WRITABLE))?
        {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Mark the connection dead: record time of death and flip the host's
    /// health flag so sends fail fast.
    fn connection_dead(&self, id: SocketId) {
        self.registry.mark_zombie(id);
        if let Some(host) = self.registry.peer(id) {
            if let Some(entry) = self.status.lock().unwrap().get_mut(&host) {
                entry.healthy = false;
            }
            tracing::warn!("connection {id} to host {host} marked as zombie");
        }
    }

    /// Multiplexer error/hangup: invalidate, mark and close immediately.
    fn fail_connection(&self, id: SocketId) {
        self.registry.invalidate(id);
        self.connection_dead(id);
        self.registry.shutdown_stream(id);
    }

    /// Close zombies past their grace period and reconnect to their hosts.
    fn reap(inner: &Arc<ClientInner>) {
        tracing::info!("reaping zombied resources");
        let grace = inner.cfg.reap_grace.as_millis() as u64;
        for id in inner.registry.due_zombies(grace) {
            if let Some(reactor) = inner.reactors.lock().unwrap().remove(&id) {
                reactor.stop();
            }
            {
                let mut calls = inner.calls.lock().unwrap();
                calls.pending.remove(&id);
                calls.expired.remove(&id);
            }
            let Some(host) = inner.registry.close_and_remove(id) else {
                continue;
            };
            tracing::warn!("closed socket {id} on host {host}");
            {
                let mut status = inner.status.lock().unwrap();
                if let Some(entry) = status.get_mut(&host) {
                    if entry.id == Some(id) {
                        entry.healthy = false;
                        entry.id = None;
                        entry.mux = None;
                    }
                }
            }
            if ClientInner::make_connection(inner, &host).is_err() {
                inner.queue_for_retry(host);
            }
        }
    }

    fn retry_failed_hosts(inner: &Arc<ClientInner>) {
        let hosts: Vec<String> = {
            let mut retry = inner.retry_hosts.lock().unwrap();
            std::mem::take(&mut *retry)
        };
        for host in hosts {
            tracing::info!("attempting to reconnect to host: {host}");
            if ClientInner::make_connection(inner, &host).is_err() {
                inner.queue_for_retry(host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClientConfig {
        ClientConfig::builder()
            .workers(2)
            .reap_interval(Duration::from_millis(20))
            .reap_grace(Duration::from_millis(10))
            .retry_interval(Duration::from_millis(50))
            .build()
    }

    #[test]
    fn test_routing_is_deterministic() {
        let client = Client::with_config(
            vec!["localhost:1".to_string(), "localhost:2".to_string()],
            test_config(),
        );
        for key in ["0", "1", "abc", "zzz"] {
            let first = client.route(key).unwrap();
            for _ in 0..10 {
                assert_eq!(client.route(key).unwrap(), first);
            }
        }
        assert_eq!(client.route("0").unwrap(), 0);
        assert_eq!(client.route("1").unwrap(), 1);
    }

    #[test]
    fn test_send_to_unknown_index_fails() {
        let client = Client::with_config(vec!["localhost:1".to_string()], test_config());
        let err = client.notify_to(5, b"payload").unwrap_err();
        assert!(matches!(err, Error::NoSuchHost(5)));
    }

    #[test]
    fn test_send_to_unconnected_host_fails_fast() {
        let client = Client::with_config(vec!["localhost:1".to_string()], test_config());
        let err = client.notify_to(0, b"payload").unwrap_err();
        assert!(matches!(err, Error::UnhealthyHost(_)));
    }

    #[test]
    fn test_connect_to_unreachable_host_queues_retry() {
        // slow retry period so the queued host stays observable
        let cfg = ClientConfig::builder()
            .workers(2)
            .retry_interval(Duration::from_secs(60))
            .build();
        // a port from the discard range that nothing listens on
        let client = Client::with_config(vec!["127.0.0.1:9".to_string()], cfg);
        assert_eq!(client.connect_to_hosts(), 0);
        assert!(!client.is_host_healthy(0));
        assert_eq!(
            *client.inner.retry_hosts.lock().unwrap(),
            vec!["127.0.0.1:9".to_string()]
        );
    }

    #[test]
    fn test_route_with_no_hosts() {
        let client = Client::with_config(Vec::new(), test_config());
        assert!(client.route("anything").is_err());
    }
}
