//! Per-descriptor resource ownership and zombie bookkeeping.
//!
//! The registry exclusively owns every per-descriptor resource. Structural
//! mutation (insert/erase/lookup) happens under one coarse lock; activity
//! on a resource is serialized by that resource's own lock, so I/O on
//! different descriptors proceeds concurrently. A resource's validity
//! flag, read and written only under its own lock, is the one safe way to
//! detect that a descriptor died while a stale reference was held: check
//! it after acquiring the lock, never before.

use std::{
    collections::HashMap,
    io,
    net::Shutdown,
    sync::{Arc, Mutex},
};

use mio::net::TcpStream;

use super::SocketId;
use crate::assembler::{FrameAssembler, FrameCallback};
use crate::frame::FRAME_DELIMITER;
use crate::outbound::OutboundBuffer;
use crate::poll::{InterestSet, Multiplexer};
use crate::util::now_millis;

/// Frame assembler plus validity flag; long-lived for the socket's
/// lifetime.
pub struct ReadResource {
    pub assembler: FrameAssembler,
    pub valid: bool,
}

/// Outbound byte queue plus validity flag; same ownership and lifetime as
/// [`ReadResource`].
pub struct WriteResource {
    pub outbound: OutboundBuffer,
    pub valid: bool,
}

struct Connection {
    stream: Arc<Mutex<TcpStream>>,
    read: Arc<Mutex<ReadResource>>,
    write: Arc<Mutex<WriteResource>>,
    interest: InterestSet,
    mux: Arc<Multiplexer>,
    peer: String,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<SocketId, Connection>>,
    zombies: Mutex<HashMap<SocketId, u64>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a connected, non-blocking stream: create its
    /// read/write resources, register it readable with the multiplexer,
    /// and record it under `id`.
    pub(crate) fn insert(
        &self,
        id: SocketId,
        stream: TcpStream,
        mux: Arc<Multiplexer>,
        peer: String,
        on_frame: FrameCallback,
    ) -> io::Result<()> {
        let interest = InterestSet::READABLE;
        let stream = Arc::new(Mutex::new(stream));
        let conn = Connection {
            stream: stream.clone(),
            read: Arc::new(Mutex::new(ReadResource {
                assembler: FrameAssembler::new(FRAME_DELIMITER, on_frame),
                valid: true,
            })),
            write: Arc::new(Mutex::new(WriteResource {
                outbound: OutboundBuffer::new(),
                valid: true,
            })),
            interest,
            mux: mux.clone(),
            peer,
        };
        // the entry must be visible before the first readiness edge can
        // fire, or the dispatch thread would drop it as unknown
        self.conns.lock().unwrap().insert(id, conn);
        let registered = {
            let mut stream = stream.lock().unwrap();
            mux.register(&mut *stream, id, interest)
        };
        if let Err(e) = registered {
            self.conns.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub fn read_resource(&self, id: SocketId) -> Option<Arc<Mutex<ReadResource>>> {
        self.conns.lock().unwrap().get(&id).map(|c| c.read.clone())
    }

    pub fn write_resource(&self, id: SocketId) -> Option<Arc<Mutex<WriteResource>>> {
        self.conns.lock().unwrap().get(&id).map(|c| c.write.clone())
    }

    pub(crate) fn stream(&self, id: SocketId) -> Option<Arc<Mutex<TcpStream>>> {
        self.conns.lock().unwrap().get(&id).map(|c| c.stream.clone())
    }

    pub fn peer(&self, id: SocketId) -> Option<String> {
        self.conns.lock().unwrap().get(&id).map(|c| c.peer.clone())
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.conns.lock().unwrap().contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Update the descriptor's interest set under the coarse lock and
    /// apply the change through its multiplexer. Returns false when the
    /// descriptor is no longer registered (e.g. reaped concurrently).
    pub(crate) fn set_interest<F>(&self, id: SocketId, update: F) -> io::Result<bool>
    where
        F: FnOnce(InterestSet) -> InterestSet,
    {
        let mut conns = self.conns.lock().unwrap();
        let Some(conn) = conns.get_mut(&id) else {
            return Ok(false);
        };
        let prev = conn.interest;
        let next = update(prev);
        if next != prev {
            let mut stream = conn.stream.lock().unwrap();
            conn.mux.apply_interest(&mut *stream, id, prev, next)?;
            conn.interest = next;
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn interest(&self, id: SocketId) -> Option<InterestSet> {
        self.conns.lock().unwrap().get(&id).map(|c| c.interest)
    }

    /// Record the descriptor's time of death; keeps the earliest time if
    /// it is already marked.
    pub fn mark_zombie(&self, id: SocketId) {
        self.zombies
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(now_millis);
    }

    pub fn is_zombied(&self, id: SocketId) -> bool {
        self.zombies.lock().unwrap().contains_key(&id)
    }

    /// Zombies whose grace period has elapsed.
    pub fn due_zombies(&self, grace_millis: u64) -> Vec<SocketId> {
        let now = now_millis();
        self.zombies
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, died)| now.saturating_sub(**died) > grace_millis)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Set validity false on both resources so any stale holder stops.
    pub fn invalidate(&self, id: SocketId) {
        if let Some(read) = self.read_resource(id) {
            read.lock().unwrap().valid = false;
        }
        if let Some(write) = self.write_resource(id) {
            write.lock().unwrap().valid = false;
        }
    }

    /// Shut the socket down at the OS level without waiting for the
    /// reaper; used on multiplexer error/hangup.
    pub(crate) fn shutdown_stream(&self, id: SocketId) {
        if let Some(stream) = self.stream(id) {
            let _ = stream.lock().unwrap().shutdown(Shutdown::Both);
        }
    }

    /// Erase the descriptor from every map, deregister it from its
    /// multiplexer, and drop the socket (closing it once the last stale
    /// reference goes away). Returns the peer label for reconnection.
    pub(crate) fn close_and_remove(&self, id: SocketId) -> Option<String> {
        let conn = self.conns.lock().unwrap().remove(&id)?;
        self.zombies.lock().unwrap().remove(&id);
        {
            let mut stream = conn.stream.lock().unwrap();
            if !conn.interest.is_empty() {
                let _ = conn.mux.deregister(&mut *stream);
            }
        }
        Some(conn.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn test_stream() -> (TcpStream, StdTcpListener) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let std_stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        (TcpStream::from_std(std_stream), listener)
    }

    fn noop_callback() -> FrameCallback {
        Box::new(|_frame| {})
    }

    #[test]
    fn test_insert_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let mux = Arc::new(Multiplexer::new().unwrap());
        let (stream, _listener) = test_stream();
        let id = SocketId::next();

        registry
            .insert(id, stream, mux, "localhost:9".to_string(), noop_callback())
            .unwrap();

        assert!(registry.contains(id));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.peer(id).unwrap(), "localhost:9");
        assert!(registry.read_resource(id).is_some());
        assert!(registry.write_resource(id).is_some());
        assert_eq!(registry.interest(id), Some(InterestSet::READABLE));

        let peer = registry.close_and_remove(id).unwrap();
        assert_eq!(peer, "localhost:9");
        assert!(!registry.contains(id));
        assert!(registry.read_resource(id).is_none());
        assert!(registry.write_resource(id).is_none());
    }

    #[test]
    fn test_set_interest_toggles() {
        let registry = ConnectionRegistry::new();
        let mux = Arc::new(Multiplexer::new().unwrap());
        let (stream, _listener) = test_stream();
        let id = SocketId::next();
        registry
            .insert(id, stream, mux, "x:1".to_string(), noop_callback())
            .unwrap();

        assert!(registry
            .set_interest(id, |i| i.with(InterestSet::WRITABLE))
            .unwrap());
        assert_eq!(
            registry.interest(id),
            Some(InterestSet::READABLE.with(InterestSet::WRITABLE))
        );

        // clearing everything deregisters, re-adding re-registers
        assert!(registry.set_interest(id, |_| InterestSet::EMPTY).unwrap());
        assert_eq!(registry.interest(id), Some(InterestSet::EMPTY));
        assert!(registry
            .set_interest(id, |i| i.with(InterestSet::READABLE))
            .unwrap());
        assert_eq!(registry.interest(id), Some(InterestSet::READABLE));
    }

    #[test]
    fn test_set_interest_on_missing_id() {
        let registry = ConnectionRegistry::new();
        assert!(!registry
            .set_interest(SocketId::next(), |i| i)
            .unwrap());
    }

    #[test]
    fn test_zombie_bookkeeping() {
        let registry = ConnectionRegistry::new();
        let id = SocketId::next();

        registry.mark_zombie(id);
        assert!(registry.is_zombied(id));
        // freshly marked: not due under a generous grace period
        assert!(registry.due_zombies(60_000).is_empty());
        // due immediately under a zero grace period
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(registry.due_zombies(0), vec![id]);
    }

    #[test]
    fn test_invalidate_flips_validity() {
        let registry = ConnectionRegistry::new();
        let mux = Arc::new(Multiplexer::new().unwrap());
        let (stream, _listener) = test_stream();
        let id = SocketId::next();
        registry
            .insert(id, stream, mux, "x:1".to_string(), noop_callback())
            .unwrap();

        registry.invalidate(id);
        assert!(!registry.read_resource(id).unwrap().lock().unwrap().valid);
        assert!(!registry.write_resource(id).unwrap().lock().unwrap().valid);
    }
}
