// =============================================================================
// Central Application State — shared across REST, WebSocket, and the
// Symbol Coordinator
// =============================================================================
//
// Two independent families of per-symbol sessions are kept: `dry_run` (the
// orchestrator-driven paper trading surface) and `ai_dry_run` (the same
// engine, but entries are sourced from an external policy instead of the
// built-in orchestrator). They never share state — swapping the decision
// source must never let one surface's fills leak into the other's ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::dry_run::engine::EngineParams;
use crate::fp::Fp;
use crate::session::Session;

/// Per-connection client backpressure channel depth used as the broadcast
/// channel capacity too, so a lagging client drops intermediate metrics
/// frames rather than stalling the publisher.
const METRICS_CHANNEL_CAPACITY_FLOOR: usize = 16;

pub struct AppState {
    pub config: EngineConfig,

    /// Monotonically increasing version counter, bumped on every mutation
    /// clients might care about (session start/stop, feature changes).
    pub state_version: AtomicU64,

    pub start_time: Instant,

    pub dry_run_sessions: RwLock<HashMap<String, Session>>,
    pub ai_dry_run_sessions: RwLock<HashMap<String, Session>>,

    /// One metrics broadcast channel per configured symbol, fed by the
    /// Symbol Coordinator and fanned out to WebSocket clients.
    pub metrics_tx: HashMap<String, broadcast::Sender<Arc<String>>>,

    /// Count of AI policy responses that failed schema validation or timed
    /// out. Never drives a HOLD->ENTRY transition on its own; it's exposed
    /// for operators to notice a misbehaving policy source.
    pub invalid_ai_responses: AtomicU64,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        let mut dry_run_sessions = HashMap::new();
        let mut ai_dry_run_sessions = HashMap::new();
        let mut metrics_tx = HashMap::new();
        let capacity = config.client_backpressure_limit.max(METRICS_CHANNEL_CAPACITY_FLOOR);
        for symbol in &config.symbols {
            dry_run_sessions.insert(symbol.clone(), Session::new(symbol.clone(), &config.dry_run));
            ai_dry_run_sessions.insert(symbol.clone(), Session::new(symbol.clone(), &config.dry_run));
            metrics_tx.insert(symbol.clone(), broadcast::channel(capacity).0);
        }

        Self {
            state_version: AtomicU64::new(1),
            start_time: Instant::now(),
            dry_run_sessions: RwLock::new(dry_run_sessions),
            ai_dry_run_sessions: RwLock::new(ai_dry_run_sessions),
            metrics_tx,
            invalid_ai_responses: AtomicU64::new(0),
            config,
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Build the engine parameters the Dry-Run Engine needs from the
    /// resolved configuration. Fixed-point conversion failures (non-finite
    /// env-supplied floats) fall back to zero rather than panicking.
    pub fn engine_params(&self) -> EngineParams {
        let c = &self.config.dry_run;
        EngineParams {
            maintenance_margin_rate: Fp::to_fp(c.maintenance_margin_rate).unwrap_or(Fp::ZERO),
            taker_fee_bps: Fp::to_fp(c.taker_fee_bps).unwrap_or(Fp::ZERO),
            maker_fee_bps: Fp::to_fp(c.maker_fee_bps).unwrap_or(Fp::ZERO),
            funding_interval_ms: c.funding_interval_ms as i64,
        }
    }

    pub fn record_invalid_ai_response(&self) -> u64 {
        self.invalid_ai_responses.fetch_add(1, Ordering::SeqCst) + 1
    }
}
