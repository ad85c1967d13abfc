//! Standalone relay server.
//!
//! Usage: `fade-relay [bind-addr]`. The address falls back to
//! `FADE_RELAY_ADDR`, then to `127.0.0.1:9090`. Log level via `RUST_LOG`.

use fade_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FADE_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    RelayServer::new(config).run().await
}
