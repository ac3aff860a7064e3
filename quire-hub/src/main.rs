//! Quire Hub: standalone relay for real-time page sync.
//!
//! Reads its settings from `QUIRE_*` environment variables (see
//! [`ServerConfig::from_env`]) and runs until Ctrl-C.

use log::{error, info};
use quire_sync::{ServerConfig, SyncServer};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting Quire Hub on {}...", config.bind_addr);

    let handle = match SyncServer::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to bind relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Relay listening on {}", handle.url());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    let stats = handle.stats().await;
    handle.shutdown().await;
    info!(
        "Relay stopped: {} connections served, {} updates relayed, {} dropped",
        stats.total_connections, stats.messages_relayed, stats.messages_dropped
    );
    ExitCode::SUCCESS
}
