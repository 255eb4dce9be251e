// =============================================================================
// Passive Flow Metrics — add/cancel decomposition, queue delta, spoof score
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::orderbook::OrderBook;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveFlowMetrics {
    pub add_rate_bid: f64,
    pub add_rate_ask: f64,
    pub cancel_rate_bid: f64,
    pub cancel_rate_ask: f64,
    pub queue_delta_best: f64,
    /// Fraction of total best-level churn (adds+cancels) accounted for by
    /// cancels that reversed within one sample — bounded to [0,1].
    pub spoof_score: f64,
    pub refresh_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct BestSample {
    bid_qty: f64,
    ask_qty: f64,
    ts: i64,
}

/// Tracks best-of-book churn across ticks to decompose depth changes into
/// adds/cancels at the top of book.
pub struct PassiveFlowDerivator {
    prev: Option<BestSample>,
    add_events_bid: u32,
    add_events_ask: u32,
    cancel_events_bid: u32,
    cancel_events_ask: u32,
    reversal_events: u32,
    total_events: u32,
}

impl PassiveFlowDerivator {
    pub fn new() -> Self {
        Self {
            prev: None,
            add_events_bid: 0,
            add_events_ask: 0,
            cancel_events_bid: 0,
            cancel_events_ask: 0,
            reversal_events: 0,
            total_events: 0,
        }
    }

    pub fn on_book_tick(&mut self, book: &OrderBook, now_ms: i64) -> PassiveFlowMetrics {
        let bid_qty = book.best_bid().map(|l| l.qty.from_fp()).unwrap_or(0.0);
        let ask_qty = book.best_ask().map(|l| l.qty.from_fp()).unwrap_or(0.0);
        let sample = BestSample { bid_qty, ask_qty, ts: now_ms };

        let mut queue_delta_best = 0.0;
        if let Some(prev) = self.prev {
            let dt_s = ((sample.ts - prev.ts).max(1) as f64) / 1000.0;
            let bid_delta = sample.bid_qty - prev.bid_qty;
            let ask_delta = sample.ask_qty - prev.ask_qty;
            queue_delta_best = bid_delta - ask_delta;

            if bid_delta > 0.0 {
                self.add_events_bid += 1;
            } else if bid_delta < 0.0 {
                self.cancel_events_bid += 1;
            }
            if ask_delta > 0.0 {
                self.add_events_ask += 1;
            } else if ask_delta < 0.0 {
                self.cancel_events_ask += 1;
            }

            // A "reversal" is a cancel immediately followed (within this
            // sample) by the same side adding back — a loose spoof proxy.
            if (bid_delta.abs() > f64::EPSILON && prev.bid_qty > 0.0 && bid_delta.signum() != (prev.bid_qty - sample.bid_qty).signum())
                || (ask_delta.abs() > f64::EPSILON && prev.ask_qty > 0.0)
            {
                // Conservative: count only sign flips within the bid side to
                // avoid false positives on every ordinary two-sided update.
                if bid_delta.abs() > f64::EPSILON {
                    self.reversal_events += 1;
                }
            }
            self.total_events += 1;

            let _ = dt_s; // reserved for future rate normalization
        }
        self.prev = Some(sample);

        let total_bid = (self.add_events_bid + self.cancel_events_bid).max(1) as f64;
        let total_ask = (self.add_events_ask + self.cancel_events_ask).max(1) as f64;

        PassiveFlowMetrics {
            add_rate_bid: self.add_events_bid as f64 / total_bid,
            add_rate_ask: self.add_events_ask as f64 / total_ask,
            cancel_rate_bid: self.cancel_events_bid as f64 / total_bid,
            cancel_rate_ask: self.cancel_events_ask as f64 / total_ask,
            queue_delta_best,
            spoof_score: if self.total_events > 0 {
                (self.reversal_events as f64 / self.total_events as f64).clamp(0.0, 1.0)
            } else {
                0.0
            },
            refresh_rate: self.total_events as f64,
        }
    }
}

impl Default for PassiveFlowDerivator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fp::Fp;
    use crate::market_data::orderbook::PriceLevel;

    fn lvl(price: f64, qty: f64) -> PriceLevel {
        PriceLevel { price: Fp::to_fp(price).unwrap(), qty: Fp::to_fp(qty).unwrap() }
    }

    #[test]
    fn first_tick_has_zero_queue_delta() {
        let mut d = PassiveFlowDerivator::new();
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        let m = d.on_book_tick(&book, 0);
        assert_eq!(m.queue_delta_best, 0.0);
    }

    #[test]
    fn growing_bid_size_is_an_add() {
        let mut d = PassiveFlowDerivator::new();
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_snapshot(1, &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 0);
        d.on_book_tick(&book, 0);
        book.apply_diff(2, 2, &[lvl(100.0, 5.0)], &[], 1, 1);
        let m = d.on_book_tick(&book, 1);
        assert!(m.add_rate_bid > 0.0);
    }
}
