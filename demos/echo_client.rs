//! Drives keyed requests against a pair of echo servers.
//!
//! Run with: `cargo run --example echo_client [host:port host:port ...]`

use std::time::Duration;

use framewire::util::now_micros;
use framewire::Client;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut hosts: Vec<String> = std::env::args().skip(1).collect();
    if hosts.is_empty() {
        hosts = vec!["localhost:8080".to_string(), "localhost:8081".to_string()];
    }

    let client = Client::new(hosts);
    let connected = client.connect_to_hosts();
    if connected == 0 {
        anyhow::bail!("cannot connect to any of the configured hosts");
    }
    tracing::info!("connected to {connected} host(s)");

    let total = 1000u32;
    let start = now_micros();
    let mut answered = 0u32;
    for i in 0..total {
        let key = i.to_string();
        match client.request_blocking(&key, b"blah blah", Duration::from_secs(3)) {
            Ok(reply) => {
                answered += 1;
                tracing::debug!("got back: {}", String::from_utf8_lossy(&reply));
            }
            Err(e) => tracing::error!("problem sending msg: {e}"),
        }
    }
    let elapsed = now_micros() - start;
    tracing::info!("{answered}/{total} requests answered in {elapsed} us");

    client.shutdown();
    Ok(())
}
