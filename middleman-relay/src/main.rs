//! Middleman relay server -- join-code rooms in front of backend services.
//!
//! Clients open a control connection, send one `create_room` or `join_room`
//! request, and from then on the same connection relays raw bytes to and
//! from the room's backend service.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:5000 with two backends
//! cargo run --bin middleman-relay -- \
//!     --service trivia=127.0.0.1:6000 \
//!     --service battleship=127.0.0.1:6001
//!
//! # Run on custom address
//! cargo run --bin middleman-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! MIDDLEMAN_ADDR=127.0.0.1:8080 cargo run --bin middleman-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use middleman_relay::config::{RelayCliArgs, RelayConfig};
use middleman_relay::directory::ServiceDirectory;
use middleman_relay::dispatcher;
use middleman_relay::registry::RoomRegistry;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting middleman relay server");

    let services = Arc::new(ServiceDirectory::new());
    for (name, addr) in &config.services {
        services.register(name, addr.clone());
    }
    let registered = services.list();
    if registered.is_empty() {
        tracing::warn!("no backend services configured; every create_room will fail");
    }
    let names: Vec<&str> = registered.iter().map(|(name, _)| name.as_str()).collect();
    tracing::info!(count = names.len(), services = ?names, "service directory ready");

    let registry = Arc::new(RoomRegistry::new(services, config.registry.clone()));

    match dispatcher::start_server(
        &config.bind_addr,
        Arc::clone(&registry),
        config.dispatcher.clone(),
    )
    .await
    {
        Ok((bound_addr, mut handle)) => {
            tracing::info!(addr = %bound_addr, "control listener ready");
            tokio::select! {
                result = &mut handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "accept loop task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    handle.abort();
                }
            }
            registry.shutdown().await;
            tracing::info!("all rooms closed");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start control listener");
            std::process::exit(1);
        }
    }
}
