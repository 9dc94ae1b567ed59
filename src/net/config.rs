//! Client and server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for [`Client`](crate::net::client::Client).
///
/// Defaults match production behavior: zombies are reaped every 30s after
/// a 10s grace period, unreachable hosts are retried every 10s, and I/O
/// drains in 1024-byte chunks. Tests shrink the periods to milliseconds.
#[derive(Clone)]
pub struct ClientConfig {
    /// Bytes per read syscall in the drain loop.
    pub read_chunk: usize,
    /// Bytes per write syscall in the drain loop.
    pub write_chunk: usize,
    /// How often the reaper scans the zombie map.
    pub reap_interval: Duration,
    /// How long a zombie must be dead before it is reaped.
    pub reap_grace: Duration,
    /// How often the background thread retries unreachable hosts.
    pub retry_interval: Duration,
    /// Worker count for each of the read and write pools.
    pub workers: usize,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_chunk: 1024,
            write_chunk: 1024,
            reap_interval: Duration::from_secs(30),
            reap_grace: Duration::from_secs(10),
            retry_interval: Duration::from_secs(10),
            workers: default_workers(),
        }
    }
}

pub struct ClientConfigBuilder {
    read_chunk: Option<usize>,
    write_chunk: Option<usize>,
    reap_interval: Option<Duration>,
    reap_grace: Option<Duration>,
    retry_interval: Option<Duration>,
    workers: Option<usize>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            read_chunk: None,
            write_chunk: None,
            reap_interval: None,
            reap_grace: None,
            retry_interval: None,
            workers: None,
        }
    }

    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = Some(bytes);
        self
    }

    pub fn write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = Some(bytes);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = Some(grace);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn build(self) -> ClientConfig {
        let default = ClientConfig::default();
        ClientConfig {
            read_chunk: self.read_chunk.unwrap_or(default.read_chunk),
            write_chunk: self.write_chunk.unwrap_or(default.write_chunk),
            reap_interval: self.reap_interval.unwrap_or(default.reap_interval),
            reap_grace: self.reap_grace.unwrap_or(default.reap_grace),
            retry_interval: self.retry_interval.unwrap_or(default.retry_interval),
            workers: self.workers.unwrap_or(default.workers),
        }
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`Server`](crate::net::server::Server).
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub address: SocketAddr,
    /// Bytes per read syscall in the drain loop.
    pub read_chunk: usize,
    /// Bytes per write syscall in the drain loop.
    pub write_chunk: usize,
    /// How often the reaper scans the zombie map.
    pub reap_interval: Duration,
    /// How long a zombie must be dead before it is reaped.
    pub reap_grace: Duration,
    /// Worker count for each of the accept, read and write pools.
    pub workers: usize,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".parse().unwrap(),
            read_chunk: 1024,
            write_chunk: 1024,
            reap_interval: Duration::from_secs(30),
            reap_grace: Duration::from_secs(60),
            workers: default_workers(),
        }
    }
}

pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    read_chunk: Option<usize>,
    write_chunk: Option<usize>,
    reap_interval: Option<Duration>,
    reap_grace: Option<Duration>,
    workers: Option<usize>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            address: None,
            read_chunk: None,
            write_chunk: None,
            reap_interval: None,
            reap_grace: None,
            workers: None,
        }
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Bind to the given port on all interfaces.
    pub fn port(mut self, port: u16) -> Self {
        self.address = Some(SocketAddr::from(([0, 0, 0, 0], port)));
        self
    }

    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = Some(bytes);
        self
    }

    pub fn write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = Some(bytes);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = Some(grace);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            read_chunk: self.read_chunk.unwrap_or(default.read_chunk),
            write_chunk: self.write_chunk.unwrap_or(default.write_chunk),
            reap_interval: self.reap_interval.unwrap_or(default.reap_interval),
            reap_grace: self.reap_grace.unwrap_or(default.reap_grace),
            workers: self.workers.unwrap_or(default.workers),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(crate::thread_pool::DEFAULT_POOL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder_defaults() {
        let cfg = ClientConfig::builder().build();
        assert_eq!(cfg.read_chunk, 1024);
        assert_eq!(cfg.reap_interval, Duration::from_secs(30));
        assert_eq!(cfg.reap_grace, Duration::from_secs(10));
        assert_eq!(cfg.retry_interval, Duration::from_secs(10));
        assert!(cfg.workers >= 1);
    }

    #[test]
    fn test_server_builder_overrides() {
        let cfg = ServerConfig::builder()
            .port(9000)
            .read_chunk(4096)
            .reap_grace(Duration::from_millis(50))
            .workers(2)
            .build();
        assert_eq!(cfg.address.port(), 9000);
        assert_eq!(cfg.read_chunk, 4096);
        assert_eq!(cfg.reap_grace, Duration::from_millis(50));
        assert_eq!(cfg.reap_interval, Duration::from_secs(30));
        assert_eq!(cfg.workers, 2);
    }
}
