// =============================================================================
// Shared types used across the orderflow engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggressor {
    Buy,
    Sell,
}

impl std::fmt::Display for Aggressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Position / order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn sign(self) -> i32 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Orderbook manager lifecycle state (see the Orderbook Manager state
/// machine: UNKNOWN on construction, LIVE while diffs stay contiguous,
/// STALE when diffs stop arriving, RESYNCING on gap or CRITICAL staleness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookState {
    Unknown,
    Live,
    Stale,
    Resyncing,
}

impl std::fmt::Display for BookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Live => write!(f, "LIVE"),
            Self::Stale => write!(f, "STALE"),
            Self::Resyncing => write!(f, "RESYNCING"),
        }
    }
}

/// Orderbook integrity severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrityLevel {
    Ok,
    Degraded,
    Critical,
}

/// Per-timeframe CVD volatility tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CvdTier {
    Normal,
    HighVol,
    Extreme,
}

/// Orchestrator decision for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent")]
pub enum Intent {
    Hold,
    Entry,
    Add,
    ExitRisk,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "HOLD"),
            Self::Entry => write!(f, "ENTRY"),
            Self::Add => write!(f, "ADD"),
            Self::ExitRisk => write!(f, "EXIT_RISK"),
        }
    }
}

/// Order type accepted by the Dry-Run Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    MarketIoc,
    LimitGtc,
    LimitIoc,
}

/// Order result reason code emitted by the Dry-Run Engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderResultReason {
    Filled,
    PartiallyFilled,
    Resting,
    PostonlyReject,
    ForcedLiquidation,
    Canceled,
}

/// Session lifecycle for the Session Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}
