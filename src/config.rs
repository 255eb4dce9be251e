// =============================================================================
// Engine Configuration — read once at startup into an immutable struct
// =============================================================================
//
// Global process configuration lives in environment variables; we read it
// once into `EngineConfig` and pass it by reference to every component
// instead of re-reading `std::env` scattered through the codebase.

use serde::{Deserialize, Serialize};
use std::env;

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Documented mainnet hosts. Any configured upstream host that doesn't match
/// one of these is a fatal configuration error at Dry-Run Engine construction.
pub const MAINNET_REST_HOSTS: &[&str] = &["fapi.binance.com"];
pub const MAINNET_WS_HOSTS: &[&str] = &["fstream.binance.com"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub rest_host: String,
    pub ws_host: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            rest_host: MAINNET_REST_HOSTS[0].to_string(),
            ws_host: MAINNET_WS_HOSTS[0].to_string(),
        }
    }
}

/// Auth configuration: bearer (full access) and viewer (read-only) tokens.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key_secret: Option<String>,
    pub readonly_view_token: Option<String>,
    pub allow_localhost_no_auth: bool,
    pub allow_public_market_data: bool,
    pub external_readonly_mode: bool,
}

#[derive(Debug, Clone)]
pub struct HtfConfig {
    pub refresh_ms: u64,
    pub bars_limit: usize,
    pub atr_period: usize,
    pub swing_lookback: usize,
}

#[derive(Debug, Clone)]
pub struct DryRunConfig {
    pub event_interval_ms: u64,
    pub depth: usize,
    pub tp_bps: f64,
    pub stop_bps: f64,
    pub cooldown_ms: u64,
    pub heartbeat_ms: u64,
    pub log_tail_size: usize,
    pub maintenance_margin_rate: f64,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub funding_interval_ms: u64,
    pub max_reprices: u32,
    pub reprice_ms: u64,
    pub chase_expiry_ms: u64,
    pub maker_exit_attempts: u32,
    pub max_position_notional: f64,
}

impl Default for HtfConfig {
    fn default() -> Self {
        Self {
            refresh_ms: env_u64("HTF_REFRESH_MS", 60_000),
            bars_limit: env_usize("HTF_BARS_LIMIT", 200),
            atr_period: env_usize("HTF_ATR_PERIOD", 14),
            swing_lookback: env_usize("HTF_SWING_LOOKBACK", 3),
        }
    }
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            event_interval_ms: env_u64("DRY_RUN_EVENT_INTERVAL_MS", 1_000),
            depth: env_usize("DRY_RUN_DEPTH", 20),
            tp_bps: env_f64("DRY_RUN_TP_BPS", 30.0),
            stop_bps: env_f64("DRY_RUN_STOP_BPS", 20.0),
            cooldown_ms: env_u64("DRY_RUN_COOLDOWN_MS", 30_000),
            heartbeat_ms: env_u64("DRY_RUN_HEARTBEAT_MS", 10_000),
            log_tail_size: env_usize("DRY_RUN_LOG_TAIL_SIZE", 200),
            maintenance_margin_rate: env_f64("DRY_RUN_MAINTENANCE_MARGIN_RATE", 0.01),
            taker_fee_bps: env_f64("DRY_RUN_TAKER_FEE_BPS", 4.0),
            maker_fee_bps: env_f64("DRY_RUN_MAKER_FEE_BPS", 2.0),
            funding_interval_ms: env_u64("DRY_RUN_FUNDING_INTERVAL_MS", 8 * 60 * 60 * 1000),
            max_reprices: env_u64("DRY_RUN_MAX_REPRICES", 5) as u32,
            reprice_ms: env_u64("DRY_RUN_REPRICE_MS", 2_000),
            chase_expiry_ms: env_u64("DRY_RUN_CHASE_EXPIRY_MS", 20_000),
            maker_exit_attempts: env_u64("DRY_RUN_MAKER_EXIT_ATTEMPTS", 3) as u32,
            max_position_notional: env_f64("DRY_RUN_MAX_POSITION_NOTIONAL", 5_000.0),
        }
    }
}

/// Orchestrator gate thresholds. Values here are illustrative defaults, not
/// normative — operators tune them per symbol via environment override.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub trendiness_min: f64,
    pub chop_max: f64,
    pub vol_of_vol_max: f64,
    pub spread_max_bps: f64,
    pub z_min: f64,
    pub vwap_distance_band_bps: f64,
    pub realized_vol_band: (f64, f64),
    pub consecutive_confirmations: u32,
    pub impulse_pps_min: f64,
    pub impulse_z_min: f64,
    pub impulse_spread_max_bps: f64,
    pub fallback_notional_fraction: f64,
    pub reversal_min_confirmations: u32,
    pub reversal_cooldown_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            trendiness_min: env_f64("GATE_TRENDINESS_MIN", 0.3),
            chop_max: env_f64("GATE_CHOP_MAX", 0.6),
            vol_of_vol_max: env_f64("GATE_VOL_OF_VOL_MAX", 2.0),
            spread_max_bps: env_f64("GATE_SPREAD_MAX_BPS", 5.0),
            z_min: env_f64("GATE_Z_MIN", 1.0),
            vwap_distance_band_bps: env_f64("GATE_VWAP_DISTANCE_BAND_BPS", 50.0),
            realized_vol_band: (
                env_f64("GATE_REALIZED_VOL_MIN", 0.0),
                env_f64("GATE_REALIZED_VOL_MAX", 5.0),
            ),
            consecutive_confirmations: env_u64("GATE_CONSECUTIVE_CONFIRMATIONS", 3) as u32,
            impulse_pps_min: env_f64("GATE_IMPULSE_PPS_MIN", 2.0),
            impulse_z_min: env_f64("GATE_IMPULSE_Z_MIN", 1.5),
            impulse_spread_max_bps: env_f64("GATE_IMPULSE_SPREAD_MAX_BPS", 8.0),
            fallback_notional_fraction: env_f64("GATE_FALLBACK_NOTIONAL_FRACTION", 0.25),
            reversal_min_confirmations: env_u64("GATE_REVERSAL_MIN_CONFIRMATIONS", 3) as u32,
            reversal_cooldown_ms: env_u64("GATE_REVERSAL_COOLDOWN_MS", 60_000),
        }
    }
}

/// The fully-resolved, immutable runtime configuration for the process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub htf: HtfConfig,
    pub dry_run: DryRunConfig,
    pub gates: GateConfig,
    pub decision_mode: String,
    pub archive_enabled: bool,
    pub sessions_dir: String,
    pub client_fanout_hz: f64,
    pub client_backpressure_limit: usize,
    pub backfill_retry_ms: u64,
    pub backfill_max_concurrent: usize,
}

impl EngineConfig {
    /// Load configuration from the process environment. `.env` is loaded
    /// first (best-effort) so local development doesn't require exporting
    /// every variable manually.
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();

        let symbols = env_string("SYMBOLS", "BTCUSDT")
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let fanout_hz = env_f64("CLIENT_FANOUT_HZ", 4.0).clamp(4.0, 20.0);

        Self {
            symbols,
            upstream: UpstreamConfig::default(),
            auth: AuthConfig {
                api_key_secret: env::var("API_KEY_SECRET").ok(),
                readonly_view_token: env::var("READONLY_VIEW_TOKEN").ok(),
                allow_localhost_no_auth: env_bool("ALLOW_LOCALHOST_NO_AUTH", false),
                allow_public_market_data: env_bool("ALLOW_PUBLIC_MARKET_DATA", false),
                external_readonly_mode: env_bool("EXTERNAL_READONLY_MODE", false),
            },
            htf: HtfConfig::default(),
            dry_run: DryRunConfig::default(),
            gates: GateConfig::default(),
            decision_mode: env_string("DECISION_MODE", "dry_run"),
            archive_enabled: env_bool("ARCHIVE_ENABLED", false),
            sessions_dir: env_string("SESSIONS_DIR", "data/sessions"),
            client_fanout_hz: fanout_hz,
            client_backpressure_limit: env_usize("CLIENT_BACKPRESSURE_LIMIT", 64),
            backfill_retry_ms: env_u64("BACKFILL_RETRY_MS", 15_000),
            backfill_max_concurrent: env_usize("BACKFILL_MAX_CONCURRENT", 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_upstream_is_mainnet() {
        let u = UpstreamConfig::default();
        assert!(MAINNET_REST_HOSTS.contains(&u.rest_host.as_str()));
        assert!(MAINNET_WS_HOSTS.contains(&u.ws_host.as_str()));
    }

    #[test]
    fn fanout_hz_is_clamped_to_documented_range() {
        std::env::set_var("CLIENT_FANOUT_HZ", "100");
        let cfg = EngineConfig::from_env();
        assert!(cfg.client_fanout_hz <= 20.0 && cfg.client_fanout_hz >= 4.0);
        std::env::remove_var("CLIENT_FANOUT_HZ");
    }
}
