//! Deck relay: WebSocket fan-out for collaborative presentations.
//!
//! Usage: `deck-relay [BIND_ADDR]`. The address falls back to
//! `DECK_RELAY_ADDR`, then `127.0.0.1:8000`. Set `RUST_LOG=info` (or
//! `debug`) to see connection traffic.

use deck_collab::{RelayConfig, RelayServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::from_env();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    info!(
        "Starting Deck relay on {} (room buffer {})",
        config.bind_addr, config.broadcast_capacity
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections and {} messages",
                stats.total_connections, stats.total_messages
            );
        }
    }
}
