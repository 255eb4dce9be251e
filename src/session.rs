// =============================================================================
// Session Service — per-symbol dry-run lifecycle, event intake
// =============================================================================
//
// One `Session` per symbol. It never talks to the network directly: the
// Symbol Coordinator hands it a depth tick plus whatever orders the
// orchestrator derived for this tick, and the session is responsible for
// input hygiene (staleness, spacing, empty-book heartbeats), folding in any
// queued manual test orders, and invoking the Dry-Run Engine.

use std::collections::VecDeque;

use anyhow::Result;
use tracing::warn;

use crate::config::DryRunConfig;
use crate::dry_run::engine::{DryRunEngine, EngineParams};
use crate::dry_run::{BookSnapshot, EventLog, OrderInput, Position};
use crate::fp::Fp;
use crate::types::SessionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NotRunning,
    StaleTimestamp,
    TooFrequent,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "session is not running"),
            Self::StaleTimestamp => write!(f, "event timestamp did not strictly advance"),
            Self::TooFrequent => write!(f, "event arrived before minimum inter-event spacing"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub symbol: String,
    pub state: SessionState,
    pub mark_price: Option<Fp>,
    pub position: Option<Position>,
    pub wallet_balance: Option<Fp>,
    pub realized_pnl: Fp,
    pub funding_pnl: Fp,
    pub event_count: u64,
    pub log_tail: Vec<String>,
}

pub struct Session {
    symbol: String,
    state: SessionState,
    engine: Option<DryRunEngine>,
    min_spacing_ms: i64,
    last_event_ts: Option<i64>,
    last_mark_price: Option<Fp>,
    event_count: u64,
    realized_pnl: Fp,
    funding_pnl: Fp,
    log_tail: VecDeque<String>,
    log_tail_size: usize,
    manual_orders: VecDeque<OrderInput>,
}

impl Session {
    pub fn new(symbol: impl Into<String>, cfg: &DryRunConfig) -> Self {
        Self {
            symbol: symbol.into(),
            state: SessionState::Idle,
            engine: None,
            min_spacing_ms: cfg.event_interval_ms as i64,
            last_event_ts: None,
            last_mark_price: None,
            event_count: 0,
            realized_pnl: Fp::ZERO,
            funding_pnl: Fp::ZERO,
            log_tail: VecDeque::with_capacity(cfg.log_tail_size),
            log_tail_size: cfg.log_tail_size.max(1),
            manual_orders: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn start(
        &mut self,
        run_id: impl Into<String>,
        rest_host: &str,
        ws_host: &str,
        initial_wallet_balance: Fp,
        params: EngineParams,
    ) -> Result<()> {
        let engine = DryRunEngine::new(run_id, rest_host, ws_host, initial_wallet_balance, params)?;
        self.engine = Some(engine);
        self.state = SessionState::Running;
        self.last_event_ts = None;
        self.event_count = 0;
        self.realized_pnl = Fp::ZERO;
        self.funding_pnl = Fp::ZERO;
        self.log_tail.clear();
        self.push_log("session started".to_string());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state = SessionState::Stopped;
        self.push_log("session stopped".to_string());
    }

    pub fn reset(&mut self) {
        self.engine = None;
        self.state = SessionState::Idle;
        self.last_event_ts = None;
        self.last_mark_price = None;
        self.event_count = 0;
        self.realized_pnl = Fp::ZERO;
        self.funding_pnl = Fp::ZERO;
        self.log_tail.clear();
        self.manual_orders.clear();
    }

    pub fn queue_test_order(&mut self, order: OrderInput) {
        self.manual_orders.push_back(order);
    }

    /// Process one depth tick. `derived_orders` are whatever the orchestrator
    /// decided for this tick (adds, stops); queued manual test orders are
    /// always prepended ahead of them.
    pub fn on_depth_event(
        &mut self,
        now_ms: i64,
        mark_price: Fp,
        funding_rate: Fp,
        book: BookSnapshot,
        derived_orders: Vec<OrderInput>,
    ) -> Result<Option<EventLog>, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::NotRunning);
        }

        if let Some(last_ts) = self.last_event_ts {
            if now_ms <= last_ts {
                return Err(SessionError::StaleTimestamp);
            }
            if now_ms - last_ts < self.min_spacing_ms {
                return Err(SessionError::TooFrequent);
            }
        }

        if book.bids.is_empty() || book.asks.is_empty() {
            warn!(symbol = %self.symbol, "empty side of book on depth event, heartbeat only");
            return Ok(None);
        }

        let mut orders = Vec::with_capacity(self.manual_orders.len() + derived_orders.len());
        orders.extend(self.manual_orders.drain(..));
        orders.extend(derived_orders);

        let engine = self.engine.as_mut().ok_or(SessionError::NotRunning)?;
        let log = engine.process_event(crate::dry_run::EventInput {
            timestamp_ms: now_ms,
            mark_price,
            funding_rate,
            book,
            orders,
        });

        self.realized_pnl = self.realized_pnl.add(log.realized_pnl);
        self.funding_pnl = self.funding_pnl.add(log.funding_impact);
        self.last_event_ts = Some(now_ms);
        self.last_mark_price = Some(mark_price);
        self.event_count += 1;

        self.push_log(format!(
            "event {} fills={} realized={} funding={} liquidated={}",
            log.event_id,
            log.order_results.len(),
            log.realized_pnl,
            log.funding_impact,
            log.liquidation_triggered
        ));

        Ok(Some(log))
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            symbol: self.symbol.clone(),
            state: self.state,
            mark_price: self.last_mark_price,
            position: self.engine.as_ref().and_then(|e| e.position()),
            wallet_balance: self.engine.as_ref().map(|e| e.wallet_balance()),
            realized_pnl: self.realized_pnl,
            funding_pnl: self.funding_pnl,
            event_count: self.event_count,
            log_tail: self.log_tail.iter().cloned().collect(),
        }
    }

    fn push_log(&mut self, line: String) {
        if self.log_tail.len() >= self.log_tail_size {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::BookLevel;
    use crate::types::{OrderType, Side};

    fn fp(x: f64) -> Fp {
        Fp::to_fp(x).unwrap()
    }

    fn params() -> EngineParams {
        EngineParams {
            maintenance_margin_rate: fp(0.01),
            taker_fee_bps: Fp::ZERO,
            maker_fee_bps: Fp::ZERO,
            funding_interval_ms: 8 * 60 * 60 * 1000,
        }
    }

    fn book() -> BookSnapshot {
        BookSnapshot {
            bids: vec![BookLevel { price: fp(99.0), qty: fp(5.0) }],
            asks: vec![BookLevel { price: fp(100.0), qty: fp(5.0) }],
        }
    }

    fn started_session() -> Session {
        let mut s = Session::new("BTCUSDT", &DryRunConfig { event_interval_ms: 1_000, ..DryRunConfig::default() });
        s.start("run-session", "fapi.binance.com", "fstream.binance.com", fp(1_000.0), params()).unwrap();
        s
    }

    #[test]
    fn event_before_start_is_rejected() {
        let mut s = Session::new("BTCUSDT", &DryRunConfig::default());
        let err = s.on_depth_event(1, fp(100.0), Fp::ZERO, book(), vec![]).unwrap_err();
        assert_eq!(err, SessionError::NotRunning);
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let mut s = started_session();
        s.on_depth_event(1_000, fp(100.0), Fp::ZERO, book(), vec![]).unwrap();
        let err = s.on_depth_event(1_000, fp(100.0), Fp::ZERO, book(), vec![]).unwrap_err();
        assert_eq!(err, SessionError::StaleTimestamp);
    }

    #[test]
    fn too_frequent_event_is_rejected() {
        let mut s = started_session();
        s.on_depth_event(1_000, fp(100.0), Fp::ZERO, book(), vec![]).unwrap();
        let err = s.on_depth_event(1_100, fp(100.0), Fp::ZERO, book(), vec![]).unwrap_err();
        assert_eq!(err, SessionError::TooFrequent);
    }

    #[test]
    fn empty_book_side_is_a_heartbeat_with_no_advance() {
        let mut s = started_session();
        let empty = BookSnapshot { bids: vec![], asks: book().asks };
        let result = s.on_depth_event(1_000, fp(100.0), Fp::ZERO, empty, vec![]).unwrap();
        assert!(result.is_none());
        assert_eq!(s.status().event_count, 0);
    }

    #[test]
    fn manual_test_order_is_prepended_ahead_of_derived_orders() {
        let mut s = started_session();
        s.queue_test_order(OrderInput {
            order_id: None,
            side: Side::Long,
            order_type: OrderType::MarketIoc,
            qty: fp(1.0),
            price: None,
            post_only: false,
            reduce_only: false,
        });
        let log = s.on_depth_event(1_000, fp(100.0), Fp::ZERO, book(), vec![]).unwrap().unwrap();
        assert_eq!(log.order_results.len(), 1);
        assert!(s.status().position.is_some());
    }
}
