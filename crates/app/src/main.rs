//! Roomlink relay server
//!
//! Usage: `roomlink [config.toml]`
//!
//! Clients connect with any line-based TCP client (or `roomlink_net::Client`)
//! and land in a shared lobby where each line is relayed to everyone else.

use std::path::PathBuf;
use std::sync::Arc;

use roomlink_net::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod relay;

use config::AppConfig;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("roomlink: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_deref().unwrap_or("info")));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Starting Roomlink");

    let server = match Server::with_config(&config.server).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    let relay = relay::Relay::install(server.clone(), config.lobby_name.clone());
    tracing::info!(port = server.port(), room_id = %relay.lobby().id(), "Relay listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    relay.uninstall(&server);
    server.close().await;
}
