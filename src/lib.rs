//! # framewire
//! A minimal RPC transport: client and server exchange correlation-tagged
//! byte-string messages over persistent TCP connections, multiplexed with a
//! readiness-event loop and processed by bounded worker pools.
//!
//! Framewire targets request/response workloads where connections are
//! long-lived, message boundaries are framed explicitly, and failures
//! (partial writes, dropped peers) must never block the event-dispatch
//! thread.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────┐
//! │ Reactor  │───▶│ Multiplexer │───▶│ WorkerPools  │
//! └──────────┘    └─────────────┘    │ (read/write) │
//!       │                            └──────────────┘
//!       ▼                                   │
//! ┌────────────────────┐      ┌─────────────▼──────────────┐
//! │ ConnectionRegistry │◀────▶│ FrameAssembler / Outbound  │
//! └────────────────────┘      └────────────────────────────┘
//! ```
//!
//! One dedicated thread per multiplexer blocks waiting for readiness; on
//! an event it toggles off the corresponding interest bit and hands the
//! actual read or write to a worker pool, decoupling fast dispatch from
//! slow I/O. Worker-pool submission blocks while the bounded queue is
//! full; that backpressure is the system's only flow-control mechanism.
//!
//! ## Wire format
//!
//! `[37-byte correlation id][payload][0x04]`, repeated back-to-back with
//! no length prefix. Frame boundaries are discovered solely by scanning
//! for the delimiter byte, so payloads must not contain it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use framewire::{Client, Server};
//! use std::time::Duration;
//!
//! // server: echo a canned reply, correlating by the request's id
//! let server = Server::bind(8080, |id: &framewire::CorrelationId,
//!                                  _payload: Vec<u8>,
//!                                  ctx: &framewire::ServerContext,
//!                                  conn: framewire::SocketId| {
//!     let _ = ctx.send(id, b"no way bro", conn);
//! })?;
//! server.start();
//!
//! // client: two-host pool, requests routed by key hash
//! let client = Client::new(vec![
//!     "localhost:8080".to_string(),
//!     "localhost:8081".to_string(),
//! ]);
//! let connected = client.connect_to_hosts();
//! assert!(connected > 0);
//!
//! let reply = client.request_blocking("0", b"blah blah", Duration::from_secs(3))?;
//! assert_eq!(reply, b"no way bro");
//! # Ok::<(), framewire::Error>(())
//! ```
//!
//! ## Connection lifecycle
//!
//! `Connecting → Healthy → Zombied → Reaped`, plus `Reaped → Connecting`
//! on the client (automatic reconnection). A hard read/write error,
//! end-of-stream, or a multiplexer error/hangup marks the connection as a
//! zombie: its resources are flagged invalid so in-flight work stops, and
//! the host's health flag (client) flips false so sends fail fast. A
//! periodic reaper closes zombies after a grace period and erases them
//! from every per-descriptor map; the client then reconnects, falling
//! back to a retry list scanned in the background.

pub mod assembler;
pub mod error;
pub mod frame;
pub mod net;
pub mod outbound;
pub mod poll;
pub mod reactor;
pub mod thread_pool;
pub mod util;

pub use assembler::FrameAssembler;
pub use error::{Error, Result};
pub use frame::{decode_frame, encode_frame, CorrelationId, CORRELATION_ID_LEN, FRAME_DELIMITER};
pub use net::client::{Client, ResponseCallback};
pub use net::config::{ClientConfig, ServerConfig};
pub use net::server::{RequestHandler, Server, ServerContext};
pub use net::SocketId;
pub use outbound::OutboundBuffer;
pub use poll::{InterestSet, IoEvent, Multiplexer};
pub use thread_pool::WorkerPool;

/// Re-exports of the types most applications touch.
///
/// ```rust
/// use framewire::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::frame::CorrelationId;
    pub use crate::net::client::Client;
    pub use crate::net::config::{ClientConfig, ServerConfig};
    pub use crate::net::server::{RequestHandler, Server, ServerContext};
    pub use crate::net::SocketId;
}
