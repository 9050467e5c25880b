//! Arena Server - match/zone concurrency core of a game server cluster
//!
//! This process owns the running zones, the match state machines and the
//! timer-driven phase transitions. It handles:
//! - Zone entity registries and connected-client bookkeeping
//! - PvP match lifecycle (queue, confirmation, scoring, settlement)
//! - Cooperative boss-gauge matches with lottery recruitment
//! - Channel-to-world reconciliation of queue/team/match state
//!
//! Packet encode/decode, persistence engines and the lobby flow live in
//! sibling processes and reach this core through narrow seams.

mod app;
mod config;
mod game;
mod net;
mod store;
mod sync;
mod util;
mod zone;

use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::util::time::{init_server_time, uptime_secs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize the monotonic server clock
    init_server_time();

    info!("Starting Arena Server");

    // Create application state
    let (state, mut sync_rx) = AppState::new(config);

    // Global zones exist from startup; instanced zones come and go
    state.zones.create_global_zones();

    // Drain the outgoing world link. The channel process attaches here in
    // production; standalone runs just log the batches.
    tokio::spawn(async move {
        while let Some(batch) = sync_rx.recv().await {
            debug!(events = batch.len(), "Outgoing sync batch");
        }
    });

    // Periodic flush of anything queued outside an explicit flush point
    let matches = state.matches.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            matches.sync_outgoing();
        }
    });

    info!(
        zones = state.zones.zone_count(),
        connections = state.connections.len(),
        pending_sync = state.sync.pending(),
        "Server ready, awaiting world link"
    );

    shutdown_signal().await;

    info!(uptime_secs = uptime_secs(), "Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
