// =============================================================================
// Symbol Coordinator — per-symbol ingestion, derivation, decisioning, fan-out
// =============================================================================
//
// One task per configured symbol. It owns the book, trade tape, candle
// buffer, microstructure derivators, and orchestrator for that symbol alone
// — nothing else ever mutates them. Three independent sub-tasks (depth,
// trade, kline/premium-index poll) each reconnect with their own backoff and
// feed this task through channels; the coordinator drains them with
// `tokio::select!` and processes one event at a time, so there is never a
// lock to contend for.
//
// A known scoping limit of this pass: the funding-rate/long-short/open-
// interest monitors in `futures_intel` are not wired in. Their would-be
// metrics-frame fields ship as explicit JSON `null`s rather than silently
// vanishing — see DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::backfill::BackfillCoordinator;
use crate::binance::client::{BinanceClient, PremiumIndex};
use crate::config::EngineConfig;
use crate::dry_run::{BookLevel, BookSnapshot, OrderInput};
use crate::fp::Fp;
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
use crate::market_data::orderbook::{fetch_snapshot_retrying, run_depth_stream, DepthEvent, OrderBook, PriceLevel};
use crate::market_data::trade_stream::run_trade_stream;
use crate::market_data::trade_tape::{TradeEvent, TradeTape};
use crate::microstructure::{compute_htf, compute_liquidity, MicrostructureFrame, MicrostructureState};
use crate::orchestrator::{ChaseAction, Orchestrator, OrchestratorInput, OrchestratorSnapshot};
use crate::persistence::{append_archive_line, ArchiveStream};
use crate::signals::weighted_score::{ScoringResult, WeightedScorer};
use crate::types::{Aggressor, Intent, IntegrityLevel, OrderType, Side};

/// Candle history requested per refresh for the 1m/5m/15m regime inputs and
/// the 1h structure input.
const KLINE_INTERVALS: [&str; 4] = ["1m", "5m", "15m", "1h"];
const KLINE_FETCH_LIMIT: u32 = 200;
const PREMIUM_INDEX_REFRESH: Duration = Duration::from_secs(5);
const SNAPSHOT_DEPTH_LIMIT: u32 = 1000;
const SNAPSHOT_RETRY_ATTEMPTS: u32 = 5;
const DEPTH_LEVELS_OUT: usize = 20;
const SLIPPAGE_REFERENCE_NOTIONAL: f64 = 10_000.0;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// No exchangeInfo lookup is wired, so tick size falls back to this
/// conservative constant for reprice-threshold and rounding purposes.
const TICK_SIZE_FALLBACK: f64 = 0.1;

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { current: BACKOFF_FLOOR }
    }

    async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(BACKOFF_CAP);
    }

    fn reset(&mut self) {
        self.current = BACKOFF_FLOOR;
    }
}

/// Run the coordinator for `symbol` until `shutdown` fires. Each upstream
/// feed reconnects independently — a depth stream drop never interrupts the
/// trade tape, and vice versa.
pub async fn run(symbol: String, state: Arc<AppState>, shutdown: watch::Receiver<bool>) {
    let cfg = state.config.clone();
    let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("failed to build reqwest client");
    let binance = match BinanceClient::new(cfg.upstream.rest_host.clone()) {
        Ok(c) => c,
        Err(e) => {
            warn!(symbol, error = %e, "refusing to start coordinator against non-mainnet host");
            return;
        }
    };

    let (depth_tx, mut depth_rx) = mpsc::channel::<DepthEvent>(256);
    let (trade_tx, mut trade_rx) = mpsc::channel::<TradeEvent>(1024);
    let candles = Arc::new(CandleBuffer::new(cfg.htf.bars_limit.max(KLINE_FETCH_LIMIT as usize)));

    let depth_task = tokio::spawn(run_depth_loop(symbol.clone(), cfg.clone(), http, depth_tx, shutdown.clone()));
    let trade_task = tokio::spawn(run_trade_loop(symbol.clone(), cfg.clone(), trade_tx, shutdown.clone()));
    let kline_task = tokio::spawn(run_kline_loop(symbol.clone(), binance.clone(), candles.clone(), cfg.htf.refresh_ms, shutdown.clone()));

    // Bounded, deduplicated 1m warm-up prefetch (C6). Runs in the background;
    // the periodic refresh loop above keeps candles current regardless of
    // whether this completes in time, so a slow or failed backfill never
    // blocks the coordinator from starting.
    let backfill = Arc::new(BackfillCoordinator::new(
        binance.clone(),
        candles.clone(),
        cfg.backfill_max_concurrent,
        Duration::from_millis(cfg.backfill_retry_ms),
    ));
    {
        let backfill = backfill.clone();
        let symbol = symbol.clone();
        tokio::spawn(async move { backfill.ensure(&symbol).await });
    }

    let mut book = OrderBook::new(symbol.clone());
    let mut tape = TradeTape::new();
    let mut micro = MicrostructureState::new();
    let mut orchestrator = Orchestrator::new(cfg.gates.clone(), cfg.dry_run.clone());
    let mut samples_seen: u32 = 0;
    let mut premium: Option<PremiumIndex> = None;
    let mut last_trade_price: f64 = 0.0;
    let mut last_publish_ms: Option<i64> = None;
    let mut shutdown = shutdown;

    let mut premium_interval = tokio::time::interval(PREMIUM_INDEX_REFRESH);

    info!(symbol, "symbol coordinator starting");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(event) = depth_rx.recv() => {
                if cfg.archive_enabled {
                    archive_depth_event(&symbol, &event);
                }
                apply_depth_event(&symbol, &mut book, event);
                if book.mid_price().is_some() {
                    samples_seen = samples_seen.saturating_add(1);
                    on_tick(
                        &symbol,
                        &state,
                        &cfg,
                        &binance,
                        &mut book,
                        &tape,
                        &mut micro,
                        &mut orchestrator,
                        samples_seen,
                        &premium,
                        &candles,
                        last_trade_price,
                        &mut last_publish_ms,
                    )
                    .await;
                }
            }
            Some(trade) = trade_rx.recv() => {
                if cfg.archive_enabled {
                    archive_trade_event(&symbol, &trade);
                }
                last_trade_price = trade.price.from_fp();
                micro.toxicity.on_trade(trade.qty.from_fp(), trade.aggressor == Aggressor::Buy);
                micro.session_vwap.on_trade(trade.ts, trade.price.from_fp(), trade.qty.from_fp());
                tape.on_trade(trade);
            }
            _ = premium_interval.tick() => {
                match binance.get_premium_index(&symbol).await {
                    Ok(p) => {
                        if cfg.archive_enabled {
                            archive_premium_index(&symbol, &p);
                        }
                        premium = Some(p);
                    }
                    Err(e) => warn!(symbol, error = %e, "premium index poll failed"),
                }
            }
        }
    }

    info!(symbol, "symbol coordinator shutting down, waiting for sub-tasks");
    let joined = async {
        let _ = depth_task.await;
        let _ = trade_task.await;
        let _ = kline_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, joined).await.is_err() {
        warn!(symbol, "sub-tasks did not exit within the grace period");
    }
}

fn apply_depth_event(symbol: &str, book: &mut OrderBook, event: DepthEvent) {
    let now = now_ms();
    match event {
        DepthEvent::Snapshot { last_update_id, bids, asks } => {
            book.apply_snapshot(last_update_id, &bids, &asks, now);
        }
        DepthEvent::Diff { u_start, u_end, bids, asks, event_ts } => {
            let outcome = book.apply_diff(u_start, u_end, &bids, &asks, event_ts, now);
            if !outcome.ok {
                warn!(symbol, reason = outcome.reason, "orderbook diff rejected");
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Only full snapshots are archived, never diffs — a diff is meaningless on
/// its own to anyone replaying the archive later, and archiving every diff
/// would dwarf trade/funding volume for no analytical benefit.
fn archive_depth_event(symbol: &str, event: &DepthEvent) {
    if let DepthEvent::Snapshot { last_update_id, bids, asks } = event {
        let value = serde_json::json!({
            "ts_ms": now_ms(),
            "last_update_id": last_update_id,
            "bids": bids.iter().map(|l| (l.price.from_fp(), l.qty.from_fp())).collect::<Vec<_>>(),
            "asks": asks.iter().map(|l| (l.price.from_fp(), l.qty.from_fp())).collect::<Vec<_>>(),
        });
        if let Err(e) = append_archive_line(symbol, ArchiveStream::Orderbook, &value) {
            warn!(symbol, error = %e, "failed to archive orderbook snapshot");
        }
    }
}

fn archive_trade_event(symbol: &str, trade: &TradeEvent) {
    let value = serde_json::json!({
        "ts_ms": trade.ts,
        "price": trade.price.from_fp(),
        "qty": trade.qty.from_fp(),
        "aggressor": trade.aggressor,
    });
    if let Err(e) = append_archive_line(symbol, ArchiveStream::Trade, &value) {
        warn!(symbol, error = %e, "failed to archive trade");
    }
}

fn archive_premium_index(symbol: &str, premium: &PremiumIndex) {
    let value = serde_json::json!({
        "ts_ms": now_ms(),
        "mark_price": premium.mark_price,
        "index_price": premium.index_price,
        "last_funding_rate": premium.last_funding_rate,
        "next_funding_time": premium.next_funding_time,
    });
    if let Err(e) = append_archive_line(symbol, ArchiveStream::Funding, &value) {
        warn!(symbol, error = %e, "failed to archive funding tick");
    }
}

// -----------------------------------------------------------------------------
// Upstream sub-tasks
// -----------------------------------------------------------------------------

async fn run_depth_loop(
    symbol: String,
    cfg: EngineConfig,
    http: reqwest::Client,
    tx: mpsc::Sender<DepthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    loop {
        if *shutdown.borrow() {
            return;
        }

        let snapshot = fetch_snapshot_retrying(&http, &cfg.upstream.rest_host, &symbol, SNAPSHOT_DEPTH_LIMIT, SNAPSHOT_RETRY_ATTEMPTS).await;
        let snapshot = match snapshot {
            Ok(s) => {
                backoff.reset();
                s
            }
            Err(e) => {
                warn!(symbol, error = %e, "depth snapshot fetch failed, backing off");
                backoff.wait().await;
                continue;
            }
        };
        if tx.send(snapshot).await.is_err() {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            result = run_depth_stream(&cfg.upstream.ws_host, &symbol, tx.clone()) => {
                if let Err(e) = result {
                    warn!(symbol, error = %e, "depth stream ended, reconnecting");
                }
            }
        }
        backoff.wait().await;
    }
}

async fn run_trade_loop(symbol: String, cfg: EngineConfig, tx: mpsc::Sender<TradeEvent>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new();
    loop {
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            result = run_trade_stream(&cfg.upstream.ws_host, &symbol, tx.clone()) => {
                match result {
                    Ok(()) => backoff.reset(),
                    Err(e) => warn!(symbol, error = %e, "trade stream error, reconnecting"),
                }
            }
        }
        backoff.wait().await;
    }
}

async fn run_kline_loop(symbol: String, binance: BinanceClient, candles: Arc<CandleBuffer>, refresh_ms: u64, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(refresh_ms.max(1_000)));
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                for iv in KLINE_INTERVALS {
                    match binance.get_klines(&symbol, iv, KLINE_FETCH_LIMIT).await {
                        Ok(batch) => {
                            let key = CandleKey { symbol: symbol.clone(), interval: iv.to_string() };
                            for candle in batch {
                                candles.update(key.clone(), candle);
                            }
                        }
                        Err(e) => warn!(symbol, interval = iv, error = %e, "kline refresh failed"),
                    }
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Per-tick assembly: derivation, decisioning, fan-out
// -----------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn on_tick(
    symbol: &str,
    state: &Arc<AppState>,
    cfg: &EngineConfig,
    binance: &BinanceClient,
    book: &mut OrderBook,
    tape: &TradeTape,
    micro: &mut MicrostructureState,
    orchestrator: &mut Orchestrator,
    samples_seen: u32,
    premium: &Option<PremiumIndex>,
    candles: &CandleBuffer,
    last_trade_price: f64,
    last_publish_ms: &mut Option<i64>,
) {
    let now = now_ms();
    let mid = book.mid_price().expect("mid_price checked by caller").from_fp();
    let mark_price = premium.as_ref().map(|p| p.mark_price).filter(|p| *p > 0.0).unwrap_or(mid);
    let index_price = premium.as_ref().map(|p| p.index_price).filter(|p| *p > 0.0).unwrap_or(mid);
    let last_price = if last_trade_price > 0.0 { last_trade_price } else { mid };
    let funding_rate = premium.as_ref().map(|p| p.last_funding_rate).unwrap_or(0.0);

    let integrity = book.integrity(now);

    let liquidity = compute_liquidity(book, SLIPPAGE_REFERENCE_NOTIONAL);
    let best_depth_qty = book.best_bid().map(|l| l.qty.from_fp());
    let toxicity = micro.toxicity.compute(tape, best_depth_qty);
    let passive_flow = micro.passive_flow.on_book_tick(book, now);
    let derivatives = micro.derivatives.compute(last_price, mark_price, index_price);

    let key_1m = CandleKey { symbol: symbol.to_string(), interval: "1m".to_string() };
    let key_5m = CandleKey { symbol: symbol.to_string(), interval: "5m".to_string() };
    let key_15m = CandleKey { symbol: symbol.to_string(), interval: "15m".to_string() };
    let key_1h = CandleKey { symbol: symbol.to_string(), interval: "1h".to_string() };

    let closes_1m = candles.get_closes(&key_1m, cfg.htf.bars_limit);
    let closes_5m = candles.get_closes(&key_5m, cfg.htf.bars_limit);
    let closes_15m = candles.get_closes(&key_15m, cfg.htf.bars_limit);
    let candles_1m = candles.get_closed(&key_1m, cfg.htf.bars_limit);
    let candles_1h = candles.get_closed(&key_1h, cfg.htf.bars_limit);

    let regime = micro.regime.compute(&closes_1m, &closes_5m, &closes_15m, &candles_1m);
    let htf = compute_htf(&candles_1h, cfg.htf.atr_period, cfg.htf.swing_lookback);

    let cvd_delta_sign = tape.cvd_1m.delta.sign();
    let delta_z_opt = tape.delta_z();
    let delta_z = delta_z_opt.unwrap_or(0.0);
    let intended_side = if cvd_delta_sign >= 0 { Side::Long } else { Side::Short };

    // "Deep" imbalance reads the depth=20 bucket (index 3 of the fixed [1,5,10,20,50] ladder).
    let obi_deep = liquidity.imbalance[3];
    let obi_deep_supports_side = match intended_side {
        Side::Long => obi_deep.unwrap_or(0.0) > 0.0,
        Side::Short => obi_deep.unwrap_or(0.0) < 0.0,
    };

    let best_price_same_side = match intended_side {
        Side::Long => book.best_bid().map(|l| l.price.from_fp()).unwrap_or(mid),
        Side::Short => book.best_ask().map(|l| l.price.from_fp()).unwrap_or(mid),
    };

    // Missing spread data fails gate A conservatively rather than passing it.
    let spread_bps = liquidity.effective_spread_bps.unwrap_or(f64::MAX);

    let dry_run_status = state.dry_run_sessions.read().get(symbol).map(|s| s.status());
    let has_open_position = dry_run_status.as_ref().map(|s| s.position.is_some()).unwrap_or(false);

    let input = OrchestratorInput {
        now_ms: now,
        samples_seen,
        intended_side,
        trendiness: regime.trendiness,
        chop: regime.chop,
        vol_of_vol: regime.vol_of_vol,
        spread_bps,
        sharp_oi_drop: false, // open-interest tracking is out of scope this pass
        cvd_slope_sign: cvd_delta_sign,
        obi_deep_supports_side,
        delta_z,
        session_vwap_distance_bps: micro.session_vwap.price_distance_bps,
        realized_vol_1m: regime.realized_vol_1m,
        prints_per_second: tape.prints_per_second(),
        best_price_same_side,
        tick_size: TICK_SIZE_FALLBACK,
        integrity_level: integrity.level,
        regime_flip: false, // no prior-regime comparison is tracked this pass
        flow_flip: false,
        reversal_confirmations: 0,
    };

    let snapshot = orchestrator.decide(&input, has_open_position);
    let derived_orders = derive_orders(orchestrator, &snapshot, &input, cfg, dry_run_status.as_ref(), mark_price);

    let mark_fp = Fp::to_fp(mark_price).unwrap_or(Fp::ZERO);
    let funding_fp = Fp::to_fp(funding_rate).unwrap_or(Fp::ZERO);
    let book_snapshot = book_snapshot_for_session(book);

    {
        let mut sessions = state.dry_run_sessions.write();
        if let Some(session) = sessions.get_mut(symbol) {
            if session.state() == crate::types::SessionState::Running {
                match session.on_depth_event(now, mark_fp, funding_fp, book_snapshot.clone(), derived_orders) {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(e) => warn!(symbol, error = %e, "dry-run session rejected depth event"),
                }
            }
        }
    }

    // The AI-policy-driven surface tracks mark price and drains manual test
    // orders even before an external policy is wired in; it never receives
    // orchestrator-derived entries.
    {
        let mut sessions = state.ai_dry_run_sessions.write();
        if let Some(session) = sessions.get_mut(symbol) {
            if session.state() == crate::types::SessionState::Running {
                match session.on_depth_event(now, mark_fp, funding_fp, book_snapshot, vec![]) {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(e) => warn!(symbol, error = %e, "ai-dry-run session rejected depth event"),
                }
            }
        }
    }

    if orchestrator.chase_state().filled {
        orchestrator.on_chase_fill();
    }

    let signal_display = WeightedScorer::default().score(
        liquidity.imbalance[0],
        delta_z_opt,
        toxicity.signed_volume_ratio,
        regime.trendiness,
    );

    let frame = MicrostructureFrame { liquidity, toxicity, passive_flow, derivatives, regime, htf, session_vwap: micro.session_vwap.clone() };

    // C10: throttle the broadcast to the configured fan-out cadence rather
    // than publishing on every depth tick, which can arrive far faster than
    // any client needs to redraw.
    let min_interval_ms = (1000.0 / cfg.client_fanout_hz) as i64;
    let due = last_publish_ms.map(|last| now - last >= min_interval_ms).unwrap_or(true);
    if due {
        publish_metrics(symbol, state, book, tape, &frame, &snapshot, &integrity, premium, dry_run_status, signal_display);
        *last_publish_ms = Some(now);
    }

    let _ = binance; // retained for symmetry with the kline loop's client; no per-tick REST call here
}

fn book_snapshot_for_session(book: &OrderBook) -> BookSnapshot {
    let (bids, asks) = book.depth_at(DEPTH_LEVELS_OUT);
    BookSnapshot {
        bids: bids.into_iter().map(|(l, _)| BookLevel { price: l.price, qty: l.qty }).collect(),
        asks: asks.into_iter().map(|(l, _)| BookLevel { price: l.price, qty: l.qty }).collect(),
    }
}

/// Translate the orchestrator's intent into concrete orders. The maker chase
/// loop only opens and times out here; replacement-order issuance against a
/// live resting order is not wired this pass (see DESIGN.md), so a timed-out
/// chase falls straight through to the fallback taker when the orchestrator
/// allows it.
///
/// Take-profit/stop-loss is checked first and, when breached, pre-empts
/// whatever the orchestrator decided this tick — protective exits are never
/// subject to gate confirmations or chase state.
fn derive_orders(
    orchestrator: &mut Orchestrator,
    snapshot: &OrchestratorSnapshot,
    input: &OrchestratorInput,
    cfg: &EngineConfig,
    status: Option<&crate::session::SessionStatus>,
    mark_price: f64,
) -> Vec<OrderInput> {
    if let Some(order) = take_profit_stop_order(status, cfg, mark_price) {
        orchestrator.reset_adds();
        return vec![order];
    }

    let mut orders = Vec::new();

    match snapshot.intent {
        Intent::Hold => {
            if orchestrator.chase_state().active {
                let action = orchestrator.tick_chase(input.now_ms, input.best_price_same_side, input.tick_size);
                if matches!(action, ChaseAction::Expired | ChaseAction::MaxRepricesReached) && orchestrator.fallback_allowed(snapshot) {
                    if let Some(side) = snapshot.side.or(orchestrator.chase_state().side) {
                        let notional = orchestrator.fallback_notional(cfg.dry_run.max_position_notional);
                        if let Some(order) = market_order(side, notional, input.best_price_same_side, false) {
                            orchestrator.record_fallback_fired();
                            orders.push(order);
                        }
                    }
                }
            }
        }
        Intent::Entry => {
            if let Some(side) = snapshot.side {
                if !orchestrator.chase_state().active {
                    if let Some(order) = limit_post_only_order(side, cfg.dry_run.max_position_notional, input.best_price_same_side) {
                        orchestrator.start_chase(side, input.best_price_same_side, input.now_ms);
                        orders.push(order);
                    }
                }
            }
        }
        Intent::Add => {
            if let (Some(side), Some(status)) = (snapshot.side, status) {
                if let Some(pos) = &status.position {
                    let unrealized_pct = if !pos.notional().is_zero() {
                        pos.unrealized_pnl(Fp::to_fp(input.best_price_same_side).unwrap_or(Fp::ZERO)).from_fp() / pos.notional().from_fp().abs() * 100.0
                    } else {
                        0.0
                    };
                    let rung = orchestrator.adds_used() + 1;
                    let signal_score = input.delta_z.abs();
                    let add_notional = cfg.dry_run.max_position_notional / 2.0;
                    let allowed = orchestrator.try_add_rung(rung, unrealized_pct, 0.5, signal_score, 1.0, input.spread_bps, input.now_ms);
                    if allowed {
                        if let Some(order) = limit_post_only_order(side, add_notional, input.best_price_same_side) {
                            orders.push(order);
                        }
                    }
                }
            }
        }
        Intent::ExitRisk => {
            if let Some(status) = status {
                if let Some(pos) = &status.position {
                    orders.push(OrderInput {
                        order_id: None,
                        side: pos.side.opposite(),
                        order_type: OrderType::MarketIoc,
                        qty: pos.qty,
                        price: None,
                        post_only: false,
                        reduce_only: true,
                    });
                    orchestrator.reset_adds();
                }
            }
        }
    }

    orders
}

/// Price-based protective exit: closes the open position with a reduce-only
/// market order once unrealized PnL crosses `tp_bps` in favor or `stop_bps`
/// against, measured from the position's weighted-average entry price.
fn take_profit_stop_order(status: Option<&crate::session::SessionStatus>, cfg: &EngineConfig, mark_price: f64) -> Option<OrderInput> {
    let pos = status?.position.as_ref()?;
    let entry = pos.entry_price.from_fp();
    if entry <= 0.0 || mark_price <= 0.0 {
        return None;
    }

    let raw_bps = (mark_price - entry) / entry * 10_000.0;
    let favorable_bps = if pos.side == Side::Long { raw_bps } else { -raw_bps };

    if favorable_bps >= cfg.dry_run.tp_bps || favorable_bps <= -cfg.dry_run.stop_bps {
        return Some(OrderInput {
            order_id: None,
            side: pos.side.opposite(),
            order_type: OrderType::MarketIoc,
            qty: pos.qty,
            price: None,
            post_only: false,
            reduce_only: true,
        });
    }

    None
}

fn limit_post_only_order(side: Side, notional: f64, price: f64) -> Option<OrderInput> {
    if price <= 0.0 {
        return None;
    }
    let qty = Fp::to_fp(notional / price).ok()?;
    let price_fp = Fp::to_fp(price).ok()?;
    Some(OrderInput { order_id: None, side, order_type: OrderType::LimitGtc, qty, price: Some(price_fp), post_only: true, reduce_only: false })
}

fn market_order(side: Side, notional: f64, price: f64, reduce_only: bool) -> Option<OrderInput> {
    if price <= 0.0 {
        return None;
    }
    let qty = Fp::to_fp(notional / price).ok()?;
    Some(OrderInput { order_id: None, side, order_type: OrderType::MarketIoc, qty, price: None, post_only: false, reduce_only })
}

// -----------------------------------------------------------------------------
// Metrics frame fan-out
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct FundingFrame {
    last_funding_rate: f64,
    next_funding_time: i64,
}

#[derive(Serialize)]
struct BookLevelWithCum {
    price: f64,
    qty: f64,
    cum_qty: f64,
}

#[derive(Serialize)]
struct MetricsFrame<'a> {
    symbol: &'a str,
    timestamp_ms: i64,
    book_state: crate::types::BookState,
    integrity: &'a crate::market_data::orderbook::IntegrityRecord,
    micro: &'a MicrostructureFrame,
    cvd_1m: CvdSection,
    cvd_5m: CvdSection,
    cvd_15m: CvdSection,
    burst_side: Option<Aggressor>,
    burst_count: u32,
    prints_per_second: f64,
    orchestrator: &'a OrchestratorSnapshot,
    dry_run_status: Option<SessionStatusSection>,
    funding: Option<FundingFrame>,
    signal_display: ScoringResult,
    /// Not wired this pass; see DESIGN.md.
    open_interest: Option<f64>,
    /// Not wired this pass; see DESIGN.md.
    cross_market_metrics: Option<serde_json::Value>,
    bids: Vec<BookLevelWithCum>,
    asks: Vec<BookLevelWithCum>,
    mid_price: Option<f64>,
    last_update_id: i64,
}

#[derive(Serialize)]
struct CvdSection {
    cvd: f64,
    delta: f64,
    state: crate::types::CvdTier,
}

#[derive(Serialize)]
struct SessionStatusSection {
    state: crate::types::SessionState,
    mark_price: Option<f64>,
    position_side: Option<Side>,
    position_qty: Option<f64>,
    realized_pnl: f64,
    event_count: u64,
}

impl From<&crate::session::SessionStatus> for SessionStatusSection {
    fn from(s: &crate::session::SessionStatus) -> Self {
        Self {
            state: s.state,
            mark_price: s.mark_price.map(|p| p.from_fp()),
            position_side: s.position.as_ref().map(|p| p.side),
            position_qty: s.position.as_ref().map(|p| p.qty.from_fp()),
            realized_pnl: s.realized_pnl.from_fp(),
            event_count: s.event_count,
        }
    }
}

fn publish_metrics(
    symbol: &str,
    state: &Arc<AppState>,
    book: &OrderBook,
    tape: &TradeTape,
    micro: &MicrostructureFrame,
    orchestrator: &OrchestratorSnapshot,
    integrity: &crate::market_data::orderbook::IntegrityRecord,
    premium: &Option<PremiumIndex>,
    dry_run_status: Option<crate::session::SessionStatus>,
    signal_display: ScoringResult,
) {
    let burst = tape.burst();
    let (bid_levels, ask_levels) = book.depth_at(DEPTH_LEVELS_OUT);
    let bids = bid_levels
        .into_iter()
        .map(|(l, cum)| BookLevelWithCum { price: l.price.from_fp(), qty: l.qty.from_fp(), cum_qty: cum.from_fp() })
        .collect();
    let asks = ask_levels
        .into_iter()
        .map(|(l, cum)| BookLevelWithCum { price: l.price.from_fp(), qty: l.qty.from_fp(), cum_qty: cum.from_fp() })
        .collect();

    let frame = MetricsFrame {
        symbol,
        timestamp_ms: now_ms(),
        book_state: book.state,
        integrity,
        micro,
        cvd_1m: CvdSection { cvd: tape.cvd_1m.cvd.from_fp(), delta: tape.cvd_1m.delta.from_fp(), state: tape.cvd_1m.state },
        cvd_5m: CvdSection { cvd: tape.cvd_5m.cvd.from_fp(), delta: tape.cvd_5m.delta.from_fp(), state: tape.cvd_5m.state },
        cvd_15m: CvdSection { cvd: tape.cvd_15m.cvd.from_fp(), delta: tape.cvd_15m.delta.from_fp(), state: tape.cvd_15m.state },
        burst_side: burst.side,
        burst_count: burst.count,
        prints_per_second: tape.prints_per_second(),
        orchestrator,
        dry_run_status: dry_run_status.as_ref().map(SessionStatusSection::from),
        funding: premium.as_ref().map(|p| FundingFrame { last_funding_rate: p.last_funding_rate, next_funding_time: p.next_funding_time }),
        signal_display,
        open_interest: None,
        cross_market_metrics: None,
        bids,
        asks,
        mid_price: book.mid_price().map(|p| p.from_fp()),
        last_update_id: book.last_update_id,
    };

    let Ok(json) = serde_json::to_string(&frame) else {
        warn!(symbol, "failed to serialize metrics frame");
        return;
    };

    if let Some(tx) = state.metrics_tx.get(symbol) {
        // No receivers is the common case between client connections; the
        // send failing then is not an error worth logging.
        let _ = tx.send(Arc::new(json));
    }
}
