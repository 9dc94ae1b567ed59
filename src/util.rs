use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Additive polynomial hash used for request routing.
///
/// Not cryptographic. Deterministic across runs so identical keys always
/// land on the same host index for a fixed host count.
pub fn route_hash(key: &str) -> u32 {
    let mut h: u32 = 0;
    for &b in key.as_bytes() {
        h = h
            .wrapping_add(h.wrapping_mul(31))
            .wrapping_add(u32::from(b));
    }
    h
}

/// Splits a `"host:port"` string into its parts.
pub fn split_host_port(node: &str) -> Result<(String, u16)> {
    let (host, port) = node
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidHost(node.to_string()))?;
    if host.is_empty() {
        return Err(Error::InvalidHost(node.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidHost(node.to_string()))?;
    Ok((host.to_string(), port))
}
