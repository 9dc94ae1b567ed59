//! Frame server that answers every request with a canned reply.
//!
//! Run with: `cargo run --example echo_server [port]`

use framewire::{CorrelationId, Server, ServerContext, SocketId};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(8080);

    let server = Server::bind(
        port,
        |id: &CorrelationId, payload: Vec<u8>, ctx: &ServerContext, conn: SocketId| {
            tracing::info!(
                "request {} from {}: {}",
                id,
                conn,
                String::from_utf8_lossy(&payload)
            );
            if let Err(e) = ctx.send(id, b"no way bro", conn) {
                tracing::error!("could not reply on {conn}: {e}");
            }
        },
    )?;

    tracing::info!("echo server listening on {}", server.local_addr());
    server.run();
    Ok(())
}
