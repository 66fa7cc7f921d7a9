//! Tavern sync server.
//!
//! Configuration comes from the environment (`TAVERN_BIND`,
//! `TAVERN_DATA_DIR`, `TAVERN_BROADCAST_CAPACITY`, `TAVERN_MAX_PEERS`,
//! `TAVERN_HEARTBEAT_SECS`). Log level follows `RUST_LOG`, default `info`.

use log::info;
use tavern_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Starting Tavern sync server with storage at {}", path.display()),
        None => info!("Starting Tavern sync server in memory"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
