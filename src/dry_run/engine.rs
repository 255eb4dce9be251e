// =============================================================================
// Dry-Run Engine — matching, funding accrual, liquidation, determinism
// =============================================================================
//
// No wall-clock time enters this module. Every timestamp is supplied by the
// caller inside an `EventInput`; identical `(runId, events)` sequences must
// produce byte-identical logs and IDs across independent processes.

use anyhow::{bail, Result};

use crate::config::{MAINNET_REST_HOSTS, MAINNET_WS_HOSTS};
use crate::dry_run::position::{apply_fill, Position};
use crate::dry_run::{
    BookLevel, BookSnapshot, EventInput, EventLog, OrderInput, OrderResult, RestingOrder,
    StateSnapshot,
};
use crate::fp::Fp;
use crate::ids::IdGenerator;
use crate::types::{OrderResultReason, OrderType, Side};

#[derive(Debug)]
pub struct EngineParams {
    pub maintenance_margin_rate: Fp,
    pub taker_fee_bps: Fp,
    pub maker_fee_bps: Fp,
    pub funding_interval_ms: i64,
}

#[derive(Debug)]
pub struct DryRunEngine {
    id_gen: IdGenerator,
    params: EngineParams,
    wallet_balance: Fp,
    position: Option<Position>,
    resting_orders: Vec<RestingOrder>,
    last_funding_ts: Option<i64>,
}

impl DryRunEngine {
    /// Construct the engine. `rest_host`/`ws_host` are validated against the
    /// documented mainnet hosts; any other value is a fatal configuration
    /// error, per the upstream guard.
    pub fn new(
        run_id: impl Into<String>,
        rest_host: &str,
        ws_host: &str,
        initial_wallet_balance: Fp,
        params: EngineParams,
    ) -> Result<Self> {
        if !MAINNET_REST_HOSTS.contains(&rest_host) {
            bail!("upstream guard: '{rest_host}' is not a recognized mainnet REST host");
        }
        if !MAINNET_WS_HOSTS.contains(&ws_host) {
            bail!("upstream guard: '{ws_host}' is not a recognized mainnet WS host");
        }

        Ok(Self {
            id_gen: IdGenerator::new(run_id),
            params,
            wallet_balance: initial_wallet_balance,
            position: None,
            resting_orders: Vec::new(),
            last_funding_ts: None,
        })
    }

    pub fn wallet_balance(&self) -> Fp {
        self.wallet_balance
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn process_event(&mut self, event: EventInput) -> EventLog {
        let event_id = self.id_gen.next_event_id(&format!("{}", event.timestamp_ms));

        let funding_impact = self.accrue_funding(event.timestamp_ms, event.mark_price, event.funding_rate);

        let mut book = event.book.clone();
        let mut realized_pnl = Fp::ZERO;
        let mut fee = Fp::ZERO;
        let mut order_results = Vec::with_capacity(event.orders.len());

        for order in &event.orders {
            let (result, order_realized, order_fee) = self.match_order(order, &mut book);
            realized_pnl = realized_pnl.add(order_realized);
            fee = fee.add(order_fee);
            order_results.push(result);
        }

        let (swept_realized, swept_fee) = self.sweep_resting_orders(&mut book, &mut order_results);
        realized_pnl = realized_pnl.add(swept_realized);
        fee = fee.add(swept_fee);

        if self.last_funding_ts.is_none() && self.position.is_some() {
            self.last_funding_ts = Some(event.timestamp_ms);
        }

        let (liquidation_triggered, liquidation_fee) =
            self.check_liquidation(event.mark_price, &book, &mut order_results);
        fee = fee.add(liquidation_fee);

        EventLog {
            event_id,
            order_results,
            realized_pnl,
            fee,
            funding_impact,
            liquidation_triggered,
            state: self.snapshot(),
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            wallet_balance: self.wallet_balance,
            position_side: self.position.map(|p| p.side),
            position_qty: self.position.map(|p| p.qty).unwrap_or(Fp::ZERO),
            position_entry_price: self.position.map(|p| p.entry_price).unwrap_or(Fp::ZERO),
        }
    }

    // -------------------------------------------------------------------------
    // Funding
    // -------------------------------------------------------------------------

    /// Catch up on every whole funding interval elapsed since the last
    /// accrual. Returns the signed wallet delta applied (negative = debit).
    fn accrue_funding(&mut self, now_ms: i64, mark_price: Fp, funding_rate: Fp) -> Fp {
        let Some(position) = self.position else { return Fp::ZERO };
        let Some(last_ts) = self.last_funding_ts else { return Fp::ZERO };

        let elapsed = now_ms - last_ts;
        if elapsed < self.params.funding_interval_ms {
            return Fp::ZERO;
        }
        let intervals = elapsed / self.params.funding_interval_ms;

        let sign = if position.side == Side::Long { 1 } else { -1 };
        let per_interval = funding_rate.mul(position.qty).mul(mark_price);
        let per_interval_signed = if sign == 1 { per_interval } else { per_interval.neg() };
        let total = Fp(per_interval_signed.0 * intervals as i128);
        let funding_impact = total.neg();

        self.wallet_balance = self.wallet_balance.add(funding_impact);
        self.last_funding_ts = Some(last_ts + intervals * self.params.funding_interval_ms);

        funding_impact
    }

    // -------------------------------------------------------------------------
    // Matching
    // -------------------------------------------------------------------------

    fn reduce_only_cap(&self, order_side: Side, qty: Fp) -> Fp {
        match self.position {
            Some(p) if p.side != order_side => qty.min(p.qty),
            _ => Fp::ZERO,
        }
    }

    fn match_order(&mut self, order: &OrderInput, book: &mut BookSnapshot) -> (OrderResult, Fp, Fp) {
        let order_id = order
            .order_id
            .clone()
            .unwrap_or_else(|| self.id_gen.next_order_id(&format!("{:?}|{}", order.side, order.qty.0)));

        match order.order_type {
            OrderType::MarketIoc => self.match_taker(&order_id, order, book, None),
            OrderType::LimitIoc => {
                let price = order.price;
                self.match_taker(&order_id, order, book, price)
            }
            OrderType::LimitGtc => self.match_gtc(&order_id, order, book),
        }
    }

    /// MARKET IOC / LIMIT IOC: fill what the book offers now, cancel the rest.
    fn match_taker(
        &mut self,
        order_id: &str,
        order: &OrderInput,
        book: &mut BookSnapshot,
        limit_price: Option<Fp>,
    ) -> (OrderResult, Fp, Fp) {
        let mut want_qty = order.qty;
        if order.reduce_only {
            want_qty = self.reduce_only_cap(order.side, want_qty);
        }

        let levels = match order.side {
            Side::Long => &mut book.asks,
            Side::Short => &mut book.bids,
        };

        let fills = walk_levels(levels, want_qty, limit_price, order.side);
        let (filled_qty, avg_price, trade_ids, notional) = self.book_fills(order_id, &fills);

        let mut realized = Fp::ZERO;
        if let Some(avg) = avg_price {
            realized = apply_fill(&mut self.position, order.side, filled_qty, avg);
        }
        let fee = notional.mul(self.params.taker_fee_bps).div(Fp::to_fp(10_000.0).unwrap()).unwrap_or(Fp::ZERO);
        self.wallet_balance = self.wallet_balance.sub(fee).add(realized);

        let reason = if filled_qty.0 == 0 {
            OrderResultReason::Canceled
        } else if filled_qty.cmp_fp(order.qty) == std::cmp::Ordering::Less {
            OrderResultReason::PartiallyFilled
        } else {
            OrderResultReason::Filled
        };

        (
            OrderResult { order_id: order_id.to_string(), trade_ids, reason, filled_qty, avg_price },
            realized,
            fee,
        )
    }

    /// LIMIT GTC, optionally postOnly: reject on cross if postOnly, otherwise
    /// fill the marketable portion and rest the remainder.
    fn match_gtc(&mut self, order_id: &str, order: &OrderInput, book: &mut BookSnapshot) -> (OrderResult, Fp, Fp) {
        let price = order.price.unwrap_or(Fp::ZERO);
        let crosses = would_cross(order.side, price, book);

        if order.post_only && crosses {
            return (
                OrderResult {
                    order_id: order_id.to_string(),
                    trade_ids: vec![],
                    reason: OrderResultReason::PostonlyReject,
                    filled_qty: Fp::ZERO,
                    avg_price: None,
                },
                Fp::ZERO,
                Fp::ZERO,
            );
        }

        let levels = match order.side {
            Side::Long => &mut book.asks,
            Side::Short => &mut book.bids,
        };
        let fills = walk_levels(levels, order.qty, Some(price), order.side);
        let (filled_qty, avg_price, trade_ids, notional) = self.book_fills(order_id, &fills);

        let mut realized = Fp::ZERO;
        if filled_qty.0 > 0 {
            if let Some(avg) = avg_price {
                realized = apply_fill(&mut self.position, order.side, filled_qty, avg);
            }
        }
        let fee = notional.mul(self.params.taker_fee_bps).div(Fp::to_fp(10_000.0).unwrap()).unwrap_or(Fp::ZERO);
        self.wallet_balance = self.wallet_balance.sub(fee).add(realized);

        let remaining = order.qty.sub(filled_qty);
        let reason = if remaining.0 > 0 {
            self.resting_orders.push(RestingOrder {
                order_id: order_id.to_string(),
                side: order.side,
                price,
                remaining_qty: remaining,
                reduce_only: order.reduce_only,
            });
            if filled_qty.0 == 0 {
                OrderResultReason::Resting
            } else {
                OrderResultReason::PartiallyFilled
            }
        } else {
            OrderResultReason::Filled
        };

        (
            OrderResult { order_id: order_id.to_string(), trade_ids, reason, filled_qty, avg_price },
            realized,
            fee,
        )
    }

    /// After new resting orders are added, see whether the (possibly now
    /// stale) book snapshot crosses any resting price.
    fn sweep_resting_orders(
        &mut self,
        book: &mut BookSnapshot,
        results: &mut Vec<OrderResult>,
    ) -> (Fp, Fp) {
        let mut total_realized = Fp::ZERO;
        let mut total_fee = Fp::ZERO;

        let mut remaining_orders = Vec::with_capacity(self.resting_orders.len());
        for mut resting in std::mem::take(&mut self.resting_orders) {
            let levels = match resting.side {
                Side::Long => &mut book.asks,
                Side::Short => &mut book.bids,
            };
            let fills = walk_levels(levels, resting.remaining_qty, Some(resting.price), resting.side);
            if fills.is_empty() {
                remaining_orders.push(resting);
                continue;
            }

            let (filled_qty, avg_price, trade_ids, notional) = self.book_fills(&resting.order_id, &fills);
            let mut realized = Fp::ZERO;
            if let Some(avg) = avg_price {
                realized = apply_fill(&mut self.position, resting.side, filled_qty, avg);
            }
            let fee = notional.mul(self.params.maker_fee_bps).div(Fp::to_fp(10_000.0).unwrap()).unwrap_or(Fp::ZERO);
            self.wallet_balance = self.wallet_balance.sub(fee).add(realized);
            total_realized = total_realized.add(realized);
            total_fee = total_fee.add(fee);

            resting.remaining_qty = resting.remaining_qty.sub(filled_qty);
            let reason = if resting.remaining_qty.0 <= 0 {
                OrderResultReason::Filled
            } else {
                remaining_orders.push(resting.clone());
                OrderResultReason::PartiallyFilled
            };

            if let Some(existing) = results.iter_mut().find(|r| r.order_id == resting.order_id) {
                existing.reason = reason;
                existing.filled_qty = existing.filled_qty.add(filled_qty);
                existing.trade_ids.extend(trade_ids);
            } else {
                results.push(OrderResult {
                    order_id: resting.order_id.clone(),
                    trade_ids,
                    reason,
                    filled_qty,
                    avg_price,
                });
            }
        }
        self.resting_orders = remaining_orders;

        (total_realized, total_fee)
    }

    fn book_fills(&self, order_id: &str, fills: &[(Fp, Fp)]) -> (Fp, Option<Fp>, Vec<String>, Fp) {
        if fills.is_empty() {
            return (Fp::ZERO, None, vec![], Fp::ZERO);
        }
        let mut filled_qty = Fp::ZERO;
        let mut notional = Fp::ZERO;
        let mut trade_ids = Vec::with_capacity(fills.len());
        for (price, qty) in fills {
            filled_qty = filled_qty.add(*qty);
            notional = notional.add(price.mul(*qty));
            trade_ids.push(self.id_gen.next_trade_id(&format!("{order_id}|{}", price.0)));
        }
        let avg_price = notional.div(filled_qty).ok();
        (filled_qty, avg_price, trade_ids, notional)
    }

    // -------------------------------------------------------------------------
    // Liquidation
    // -------------------------------------------------------------------------

    fn check_liquidation(
        &mut self,
        mark_price: Fp,
        book: &BookSnapshot,
        results: &mut Vec<OrderResult>,
    ) -> (bool, Fp) {
        let Some(position) = self.position else { return (false, Fp::ZERO) };

        let unrealized = position.unrealized_pnl(mark_price);
        let threshold = position.notional().mul(self.params.maintenance_margin_rate);

        if self.wallet_balance.add(unrealized).cmp_fp(threshold) != std::cmp::Ordering::Less {
            return (false, Fp::ZERO);
        }

        let closing_side = position.side.opposite();
        let liquidation_price = match position.side {
            Side::Long => book.bids.first().map(|l| l.price).unwrap_or(mark_price),
            Side::Short => book.asks.first().map(|l| l.price).unwrap_or(mark_price),
        };

        let order_id = self.id_gen.next_order_id("liquidation");
        let trade_id = self.id_gen.next_trade_id(&format!("{order_id}|liquidation"));

        let filled_qty = position.qty;
        let realized = apply_fill(&mut self.position, closing_side, filled_qty, liquidation_price);
        let notional = liquidation_price.mul(filled_qty);
        let fee = notional.mul(self.params.taker_fee_bps).div(Fp::to_fp(10_000.0).unwrap()).unwrap_or(Fp::ZERO);
        self.wallet_balance = self.wallet_balance.sub(fee).add(realized);

        results.push(OrderResult {
            order_id,
            trade_ids: vec![trade_id],
            reason: OrderResultReason::ForcedLiquidation,
            filled_qty,
            avg_price: Some(liquidation_price),
        });

        (true, fee)
    }
}

/// Does a GTC order at `price` cross the current book on submission?
fn would_cross(side: Side, price: Fp, book: &BookSnapshot) -> bool {
    match side {
        Side::Long => book.asks.first().map(|l| price.cmp_fp(l.price) != std::cmp::Ordering::Less).unwrap_or(false),
        Side::Short => book.bids.first().map(|l| price.cmp_fp(l.price) != std::cmp::Ordering::Greater).unwrap_or(false),
    }
}

/// Consume `levels` (mutating them in place) to satisfy up to `qty_wanted`,
/// respecting `limit_price` if present (buy: level price <= limit; sell:
/// level price >= limit). Returns the list of (price, qty) fills in the
/// order they were taken.
fn walk_levels(
    levels: &mut Vec<BookLevel>,
    qty_wanted: Fp,
    limit_price: Option<Fp>,
    taker_side: Side,
) -> Vec<(Fp, Fp)> {
    let mut fills = Vec::new();
    let mut remaining = qty_wanted;

    for level in levels.iter_mut() {
        if remaining.0 <= 0 {
            break;
        }
        if let Some(limit) = limit_price {
            let acceptable = match taker_side {
                Side::Long => level.price.cmp_fp(limit) != std::cmp::Ordering::Greater,
                Side::Short => level.price.cmp_fp(limit) != std::cmp::Ordering::Less,
            };
            if !acceptable {
                break;
            }
        }

        let take = level.qty.min(remaining);
        if take.0 <= 0 {
            continue;
        }
        fills.push((level.price, take));
        level.qty = level.qty.sub(take);
        remaining = remaining.sub(take);
    }

    levels.retain(|l| l.qty.0 > 0);
    fills
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn lvl(price: f64, qty: f64) -> BookLevel {
        BookLevel { price: fp(price), qty: fp(qty) }
    }

    /// A non-mainnet upstream host is a fatal construction error.
    #[test]
    fn upstream_guard_rejects_non_mainnet_host() {
        let err = DryRunEngine::new(
            "run-guard",
            "testnet.binancefuture.com",
            "fstream.binance.com",
            fp(1000.0),
            params(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("upstream guard"));
    }

    /// Identical event sequences must produce byte-identical logs and IDs
    /// across independently constructed engines.
    #[test]
    fn determinism_scenario_is_stable_across_runs() {
        let run_once = || {
            let mut engine = DryRunEngine::new(
                "run-deterministic-001",
                "fapi.binance.com",
                "fstream.binance.com",
                fp(10_000.0),
                params(),
            )
            .unwrap();

            let log1 = engine.process_event(EventInput {
                timestamp_ms: 1_700_000_000_000,
                mark_price: fp(100.0),
                funding_rate: Fp::ZERO,
                book: BookSnapshot { bids: vec![lvl(99.0, 5.0)], asks: vec![lvl(100.0, 2.0)] },
                orders: vec![OrderInput {
                    order_id: None,
                    side: Side::Long,
                    order_type: OrderType::MarketIoc,
                    qty: fp(3.0),
                    price: None,
                    post_only: false,
                    reduce_only: false,
                }],
            });

            let log2 = engine.process_event(EventInput {
                timestamp_ms: 1_700_000_001_000,
                mark_price: fp(100.0),
                funding_rate: Fp::ZERO,
                book: BookSnapshot { bids: vec![lvl(99.0, 5.0)], asks: vec![] },
                orders: vec![OrderInput {
                    order_id: None,
                    side: Side::Short,
                    order_type: OrderType::MarketIoc,
                    qty: fp(1.0),
                    price: None,
                    post_only: false,
                    reduce_only: false,
                }],
            });

            (log1, log2, engine.wallet_balance())
        };

        let (a1, a2, a_balance) = run_once();
        let (b1, b2, b_balance) = run_once();

        assert_eq!(a1.order_results[0].filled_qty, fp(2.0));
        assert_eq!(a1.order_results[0].reason, OrderResultReason::PartiallyFilled);
        assert_eq!(a2.order_results[0].reason, OrderResultReason::Filled);

        assert_eq!(a1.event_id, b1.event_id);
        assert_eq!(a1.order_results[0].order_id, b1.order_results[0].order_id);
        assert_eq!(a2.order_results[0].order_id, b2.order_results[0].order_id);
        assert_eq!(a_balance, b_balance);

        for id in a1.order_results[0]
            .trade_ids
            .iter()
            .chain(a2.order_results[0].trade_ids.iter())
        {
            assert!(!id.contains('-'));
        }
    }

    /// Liquidation closes the entire position at the best available price
    /// even when book depth is insufficient to absorb it cleanly.
    #[test]
    fn liquidation_force_closes_full_position() {
        let mut engine = DryRunEngine::new(
            "run-liquidation",
            "fapi.binance.com",
            "fstream.binance.com",
            fp(100.0),
            params(),
        )
        .unwrap();

        engine.process_event(EventInput {
            timestamp_ms: 1,
            mark_price: fp(100.0),
            funding_rate: Fp::ZERO,
            book: BookSnapshot { bids: vec![lvl(99.0, 10.0)], asks: vec![lvl(100.0, 10.0)] },
            orders: vec![OrderInput {
                order_id: None,
                side: Side::Long,
                order_type: OrderType::MarketIoc,
                qty: fp(5.0),
                price: None,
                post_only: false,
                reduce_only: false,
            }],
        });

        let log = engine.process_event(EventInput {
            timestamp_ms: 2,
            mark_price: fp(1.0),
            funding_rate: Fp::ZERO,
            book: BookSnapshot { bids: vec![lvl(1.0, 1.0)], asks: vec![] },
            orders: vec![],
        });

        assert!(log.liquidation_triggered);
        let liq = log
            .order_results
            .iter()
            .find(|r| r.reason == OrderResultReason::ForcedLiquidation)
            .unwrap();
        assert_eq!(liq.filled_qty, fp(5.0));
        assert!(engine.position().is_none());
    }

    /// A gap spanning multiple funding intervals accrues every whole
    /// interval elapsed, not just one.
    #[test]
    fn funding_gap_applies_whole_intervals_only() {
        let mut engine = DryRunEngine::new(
            "run-funding",
            "fapi.binance.com",
            "fstream.binance.com",
            fp(5_000.0),
            params(),
        )
        .unwrap();

        engine.process_event(EventInput {
            timestamp_ms: 1,
            mark_price: fp(100.0),
            funding_rate: fp(0.01),
            book: BookSnapshot { bids: vec![lvl(99.0, 5.0)], asks: vec![lvl(100.0, 5.0)] },
            orders: vec![OrderInput {
                order_id: None,
                side: Side::Long,
                order_type: OrderType::MarketIoc,
                qty: fp(1.0),
                price: None,
                post_only: false,
                reduce_only: false,
            }],
        });

        let sixteen_hours_plus_1 = 16 * 60 * 60 * 1000 + 1;
        let log = engine.process_event(EventInput {
            timestamp_ms: sixteen_hours_plus_1,
            mark_price: fp(100.0),
            funding_rate: fp(0.01),
            book: BookSnapshot { bids: vec![lvl(99.0, 5.0)], asks: vec![] },
            orders: vec![],
        });

        assert!((log.funding_impact.from_fp() - (-2.0)).abs() < 1e-8);
        assert!((engine.wallet_balance().from_fp() - 4_998.0).abs() < 1e-8);
    }

    #[test]
    fn postonly_order_rejects_on_cross() {
        let mut engine = DryRunEngine::new(
            "run-postonly",
            "fapi.binance.com",
            "fstream.binance.com",
            fp(1_000.0),
            params(),
        )
        .unwrap();

        let log = engine.process_event(EventInput {
            timestamp_ms: 1,
            mark_price: fp(100.0),
            funding_rate: Fp::ZERO,
            book: BookSnapshot { bids: vec![lvl(99.0, 5.0)], asks: vec![lvl(100.0, 5.0)] },
            orders: vec![OrderInput {
                order_id: None,
                side: Side::Long,
                order_type: OrderType::LimitGtc,
                qty: fp(1.0),
                price: Some(fp(100.0)),
                post_only: true,
                reduce_only: false,
            }],
        });

        assert_eq!(log.order_results[0].reason, OrderResultReason::PostonlyReject);
    }
}
