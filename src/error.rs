use std::io;

use thiserror::Error;

/// Errors surfaced by the transport.
///
/// Fatal I/O and protocol-integrity failures are handled inside the core
/// (zombie-marking and reaping); callers only ever see the fail-fast and
/// timeout variants on the send path.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket or poll operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The target host is currently marked unhealthy; no I/O was attempted.
    #[error("host is not healthy: {0}")]
    UnhealthyHost(String),

    /// The explicit host index is outside the configured host list.
    #[error("no host at index {0}")]
    NoSuchHost(usize),

    /// A `"host:port"` string could not be parsed.
    #[error("could not parse host: {0}")]
    InvalidHost(String),

    /// A blocking send elapsed its caller-supplied timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// The connection backing this operation is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// An inbound frame was shorter than the fixed correlation id.
    #[error("frame of {0} bytes is shorter than the correlation id")]
    TruncatedFrame(usize),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
