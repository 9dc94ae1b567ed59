//! Thin wrapper over the OS readiness-event facility.

use std::{io, sync::Mutex, time::Duration};

use mio::{event::Source, Events, Interest, Poll, Token, Waker};

use crate::net::SocketId;

/// Token reserved for the shutdown waker.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Interest bitmask over "readable" and "writable".
///
/// This is the per-descriptor state the registry stores and the dispatch
/// protocol toggles; it maps onto `mio::Interest` at the syscall boundary.
/// `mio::Interest` cannot represent an empty set, so an empty mask
/// deregisters the descriptor instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const EMPTY: InterestSet = InterestSet(0);
    pub const READABLE: InterestSet = InterestSet(0b01);
    pub const WRITABLE: InterestSet = InterestSet(0b10);

    pub fn with(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 | other.0)
    }

    pub fn without(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 & !other.0)
    }

    pub fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_mio(self) -> Option<Interest> {
        match (
            self.contains(InterestSet::READABLE),
            self.contains(InterestSet::WRITABLE),
        ) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// One readiness event, decoupled from the mio event type.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub id: SocketId,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup reported by the OS; the connection is unusable.
    pub failed: bool,
}

impl IoEvent {
    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            id: SocketId::from_token(event.token()),
            readable: event.is_readable(),
            writable: event.is_writable(),
            failed: event.is_error() || (event.is_read_closed() && event.is_write_closed()),
        }
    }
}

/// Readiness-event multiplexer: register/modify interest on descriptors
/// and block waiting for events.
///
/// Registration goes through a cloned registry handle so other threads can
/// add or modify descriptors while the dispatch thread is blocked in
/// [`wait`](Multiplexer::wait).
pub struct Multiplexer {
    poll: Mutex<Poll>,
    registry: mio::Registry,
    waker: Waker,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
        })
    }

    /// Register a descriptor with its initial interest set.
    pub fn register<S>(&self, source: &mut S, id: SocketId, interest: InterestSet) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match interest.to_mio() {
            Some(interest) => self.registry.register(source, id.token(), interest),
            None => Ok(()),
        }
    }

    /// Move a descriptor from `prev` to `next` interest.
    ///
    /// An empty `next` deregisters; a previously-empty `prev` registers
    /// afresh. Registering a descriptor that is already ready delivers the
    /// pending edge immediately, so no readiness is lost across a toggle.
    pub fn apply_interest<S>(
        &self,
        source: &mut S,
        id: SocketId,
        prev: InterestSet,
        next: InterestSet,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match (prev.to_mio(), next.to_mio()) {
            (Some(_), Some(interest)) => self.registry.reregister(source, id.token(), interest),
            (Some(_), None) => self.registry.deregister(source),
            (None, Some(interest)) => self.registry.register(source, id.token(), interest),
            (None, None) => Ok(()),
        }
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.deregister(source)
    }

    /// Block until events arrive or the timeout elapses. `None` waits
    /// forever (until woken).
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.lock().unwrap().poll(events, timeout)
    }

    /// Wake a thread blocked in [`wait`](Multiplexer::wait).
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_set_ops() {
        let both = InterestSet::READABLE.with(InterestSet::WRITABLE);
        assert!(both.contains(InterestSet::READABLE));
        assert!(both.contains(InterestSet::WRITABLE));

        let read_only = both.without(InterestSet::WRITABLE);
        assert!(read_only.contains(InterestSet::READABLE));
        assert!(!read_only.contains(InterestSet::WRITABLE));

        assert!(read_only.without(InterestSet::READABLE).is_empty());
        assert!(InterestSet::EMPTY.is_empty());
    }

    #[test]
    fn test_empty_set_has_no_mio_mapping() {
        assert!(InterestSet::EMPTY.to_mio().is_none());
        assert!(InterestSet::READABLE.to_mio().is_some());
    }

    #[test]
    fn test_wait_with_timeout() {
        let mux = Multiplexer::new().unwrap();
        let mut events = Events::with_capacity(8);
        mux.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_wake_unblocks_wait() {
        let mux = std::sync::Arc::new(Multiplexer::new().unwrap());
        let waker_mux = mux.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker_mux.wake().unwrap();
        });

        let mut events = Events::with_capacity(8);
        mux.wait(&mut events, None).unwrap();
        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        assert_eq!(tokens, vec![WAKE_TOKEN]);
        handle.join().unwrap();
    }
}
