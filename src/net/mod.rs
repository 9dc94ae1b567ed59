//! TCP transport core: registry, drain loops, client and server.

pub mod client;
pub mod config;
pub mod registry;
pub mod server;

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use mio::net::TcpStream;
use mio::Token;

use crate::assembler::FrameAssembler;
use crate::outbound::OutboundBuffer;

/// Opaque handle identifying one registered connection.
///
/// Allocated from a process-wide counter; never a raw OS descriptor.
/// Ownership of the underlying socket moves from accept/connect into the
/// registry and from the registry to the reaper; the id is just a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(usize);

// token 0 is the waker, token 1 the server listener; connections start at 2
static NEXT_SOCKET_ID: AtomicUsize = AtomicUsize::new(2);

impl SocketId {
    pub(crate) const LISTENER: SocketId = SocketId(1);

    pub(crate) fn next() -> Self {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        SocketId(token.0)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum ReadOutcome {
    /// Would block: no more data for now, re-arm readable interest.
    Rearm,
    /// End-of-stream or hard error: the connection is done.
    Dead,
}

pub(crate) enum WriteOutcome {
    /// The outbound buffer drained completely.
    Idle,
    /// Would block with bytes still pending: re-arm writable interest.
    Rearm,
    /// Hard error: the connection is done.
    Dead,
}

/// Drain the socket into the frame assembler until it would block.
///
/// The stream lock is held only across each read syscall, never across the
/// assembler callback, so frame handlers may send on the same connection.
pub(crate) fn drain_read(
    stream: &Mutex<TcpStream>,
    assembler: &mut FrameAssembler,
    chunk: usize,
) -> ReadOutcome {
    let mut buf = vec![0u8; chunk];
    loop {
        let result = {
            let mut stream = stream.lock().unwrap();
            stream.read(&mut buf)
        };
        match result {
            Ok(0) => {
                tracing::info!("remote closed the connection");
                return ReadOutcome::Dead;
            }
            Ok(n) => assembler.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Rearm,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("error reading from socket: {e}");
                return ReadOutcome::Dead;
            }
        }
    }
}

/// Drain the outbound buffer into the socket until it empties or would
/// block. Only bytes the socket actually accepted are discarded.
pub(crate) fn drain_write(
    stream: &Mutex<TcpStream>,
    outbound: &mut OutboundBuffer,
    chunk: usize,
) -> WriteOutcome {
    loop {
        let pending = outbound.peek(chunk);
        if pending.is_empty() {
            return WriteOutcome::Idle;
        }
        let result = {
            let mut stream = stream.lock().unwrap();
            stream.write(&pending)
        };
        match result {
            Ok(0) => {
                tracing::error!("socket accepted zero bytes; treating as closed");
                return WriteOutcome::Dead;
            }
            Ok(n) => outbound.discard(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Rearm,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("error writing to socket: {e}");
                return WriteOutcome::Dead;
            }
        }
    }
}
