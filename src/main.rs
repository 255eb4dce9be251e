// =============================================================================
// Orderflow Telemetry & Paper Execution Engine — Main Entry Point
// =============================================================================
//
// Every configured symbol gets its own Symbol Coordinator task ingesting
// depth/trade/kline data, deriving microstructure telemetry, driving the
// orchestrator, and publishing metrics frames for the REST/WebSocket API to
// serve. Shutdown is cooperative: a `watch` channel tells every coordinator
// to wind down, each gets a grace period to flush, then the process exits.
// =============================================================================

mod ai_policy;
mod api;
mod app_state;
mod backfill;
mod binance;
mod config;
mod coordinator;
mod dry_run;
mod fp;
mod ids;
mod indicators;
mod market_data;
mod microstructure;
mod orchestrator;
mod persistence;
mod regime;
mod session;
mod signals;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("orderflow telemetry engine starting up");

    let config = EngineConfig::from_env();
    info!(symbols = ?config.symbols, decision_mode = %config.decision_mode, "configuration loaded");

    if config.auth.api_key_secret.as_deref().unwrap_or_default().is_empty() {
        anyhow::bail!("API_KEY_SECRET must be set; refusing to start with authentication unconfigured");
    }

    if config.archive_enabled {
        if let Err(e) = persistence::ensure_backfill_dirs(&config.sessions_dir, &config.symbols) {
            warn!(error = %e, "failed to prepare archive directories, continuing without archival");
        }
    }

    let state = Arc::new(AppState::new(config));

    for symbol in state.config.symbols.iter() {
        if let Some(snapshot) = persistence::load_session_snapshot(&state.config.sessions_dir, symbol) {
            info!(symbol, saved_at_ms = snapshot.saved_at_ms, "prior session snapshot found on disk (informational only)");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut coordinator_tasks = Vec::with_capacity(state.config.symbols.len());
    for symbol in &state.config.symbols {
        let symbol = symbol.clone();
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        coordinator_tasks.push(tokio::spawn(coordinator::run(symbol, state, shutdown_rx)));
    }
    info!(count = coordinator_tasks.len(), "symbol coordinators launched");

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!(error = %e, "API server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in coordinator_tasks {
        let _ = task.await;
    }

    if state.config.archive_enabled {
        for (symbol, session) in state.dry_run_sessions.read().iter() {
            if let Err(e) = persistence::save_session_snapshot(&state.config.sessions_dir, symbol, session) {
                warn!(symbol, error = %e, "failed to persist session snapshot on shutdown");
            }
        }
    }

    info!("engine shut down complete");
    Ok(())
}
