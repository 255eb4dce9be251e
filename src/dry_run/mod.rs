// =============================================================================
// Dry-Run Engine — deterministic paper matching, funding, and liquidation
// =============================================================================

pub mod engine;
pub mod position;

pub use engine::DryRunEngine;
pub use position::Position;

use serde::{Deserialize, Serialize};

use crate::fp::Fp;
use crate::types::{OrderResultReason, OrderType, Side};

/// One price level in the book snapshot handed to the engine for a tick.
/// Bids should be sorted descending, asks ascending; the engine does not
/// re-sort its input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Fp,
    pub qty: Fp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// One order submitted for this tick. `order_id` is optional; when absent
/// the engine mints a deterministic one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInput {
    #[serde(default)]
    pub order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Fp,
    #[serde(default)]
    pub price: Option<Fp>,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub trade_ids: Vec<String>,
    pub reason: OrderResultReason,
    pub filled_qty: Fp,
    pub avg_price: Option<Fp>,
}

/// A GTC order resting in the engine's book across ticks.
#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub order_id: String,
    pub side: Side,
    pub price: Fp,
    pub remaining_qty: Fp,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct EventInput {
    pub timestamp_ms: i64,
    pub mark_price: Fp,
    pub funding_rate: Fp,
    pub book: BookSnapshot,
    pub orders: Vec<OrderInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub wallet_balance: Fp,
    pub position_side: Option<Side>,
    pub position_qty: Fp,
    pub position_entry_price: Fp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub event_id: String,
    pub order_results: Vec<OrderResult>,
    pub realized_pnl: Fp,
    pub fee: Fp,
    pub funding_impact: Fp,
    pub liquidation_triggered: bool,
    pub state: StateSnapshot,
}
