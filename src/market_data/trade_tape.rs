// =============================================================================
// Trade Tape Aggregator — aggressive volume, CVD by timeframe, bursts, PPS
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::fp::Fp;
use crate::types::{Aggressor, CvdTier};

#[derive(Debug, Clone, Copy)]
pub struct TradeEvent {
    pub ts: i64,
    pub price: Fp,
    pub qty: Fp,
    pub aggressor: Aggressor,
}

/// Classify a trade's aggressor from the prevailing best bid/ask. A trade
/// executed at or above the best ask is buyer-aggressive; otherwise seller.
pub fn classify_aggressor(trade_price: Fp, best_ask: Option<Fp>) -> Aggressor {
    match best_ask {
        Some(ask) if trade_price.cmp_fp(ask) != std::cmp::Ordering::Less => Aggressor::Buy,
        _ => Aggressor::Sell,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketCounts {
    pub small: u64,
    pub mid: u64,
    pub large: u64,
}

impl Default for BucketCounts {
    fn default() -> Self {
        Self { small: 0, mid: 0, large: 0 }
    }
}

/// Notional-size bucket thresholds; a trade below `small_max` is "small",
/// below `mid_max` is "mid", otherwise "large".
#[derive(Debug, Clone, Copy)]
pub struct BucketThresholds {
    pub small_max: f64,
    pub mid_max: f64,
}

impl Default for BucketThresholds {
    fn default() -> Self {
        Self { small_max: 1_000.0, mid_max: 10_000.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeCvd {
    pub cvd: Fp,
    pub delta: Fp,
    pub state: CvdTier,
    bar_start_ms: i64,
    bar_delta: Fp,
    recent_bar_deltas: VecDeque<f64>,
}

impl TimeframeCvd {
    fn new() -> Self {
        Self {
            cvd: Fp::ZERO,
            delta: Fp::ZERO,
            state: CvdTier::Normal,
            bar_start_ms: 0,
            bar_delta: Fp::ZERO,
            recent_bar_deltas: VecDeque::new(),
        }
    }

    fn on_trade(&mut self, ts: i64, bar_ms: i64, signed_qty: Fp) {
        let bar_start = (ts / bar_ms) * bar_ms;
        if bar_start != self.bar_start_ms {
            if self.bar_start_ms != 0 {
                self.recent_bar_deltas.push_back(self.bar_delta.from_fp());
                if self.recent_bar_deltas.len() > 50 {
                    self.recent_bar_deltas.pop_front();
                }
            }
            self.bar_start_ms = bar_start;
            self.bar_delta = Fp::ZERO;
        }
        self.bar_delta = self.bar_delta.add(signed_qty);
        self.cvd = self.cvd.add(signed_qty);
        self.delta = self.bar_delta;
        self.state = self.classify_tier();
    }

    fn classify_tier(&self) -> CvdTier {
        if self.recent_bar_deltas.len() < 5 {
            return CvdTier::Normal;
        }
        let mean = self.recent_bar_deltas.iter().sum::<f64>() / self.recent_bar_deltas.len() as f64;
        let var = self
            .recent_bar_deltas
            .iter()
            .map(|d| (d - mean).powi(2))
            .sum::<f64>()
            / self.recent_bar_deltas.len() as f64;
        let std = var.sqrt();
        if std < f64::EPSILON {
            return CvdTier::Normal;
        }
        let z = (self.delta.from_fp() - mean).abs() / std;
        if z >= 3.0 {
            CvdTier::Extreme
        } else if z >= 1.5 {
            CvdTier::HighVol
        } else {
            CvdTier::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstState {
    pub side: Option<Aggressor>,
    pub count: u32,
}

pub struct TradeTape {
    window_1s: VecDeque<TradeEvent>,
    window_5s: VecDeque<TradeEvent>,
    window_1m: VecDeque<TradeEvent>,
    window_5m: VecDeque<TradeEvent>,
    window_15m: VecDeque<TradeEvent>,
    pub cvd_1m: TimeframeCvd,
    pub cvd_5m: TimeframeCvd,
    pub cvd_15m: TimeframeCvd,
    pub buckets: BucketCounts,
    thresholds: BucketThresholds,
    burst: BurstState,
    pps_ewma: f64,
    last_pps_sample_ts: i64,
}

impl TradeTape {
    pub fn new() -> Self {
        Self {
            window_1s: VecDeque::new(),
            window_5s: VecDeque::new(),
            window_1m: VecDeque::new(),
            window_5m: VecDeque::new(),
            window_15m: VecDeque::new(),
            cvd_1m: TimeframeCvd::new(),
            cvd_5m: TimeframeCvd::new(),
            cvd_15m: TimeframeCvd::new(),
            buckets: BucketCounts::default(),
            thresholds: BucketThresholds::default(),
            burst: BurstState { side: None, count: 0 },
            pps_ewma: 0.0,
            last_pps_sample_ts: 0,
        }
    }

    pub fn on_trade(&mut self, trade: TradeEvent) {
        push_and_trim(&mut self.window_1s, trade, 1_000);
        push_and_trim(&mut self.window_5s, trade, 5_000);
        push_and_trim(&mut self.window_1m, trade, 60_000);
        push_and_trim(&mut self.window_5m, trade, 300_000);
        push_and_trim(&mut self.window_15m, trade, 900_000);

        let signed_qty = match trade.aggressor {
            Aggressor::Buy => trade.qty,
            Aggressor::Sell => trade.qty.neg(),
        };

        self.cvd_1m.on_trade(trade.ts, 60_000, signed_qty);
        self.cvd_5m.on_trade(trade.ts, 300_000, signed_qty);
        self.cvd_15m.on_trade(trade.ts, 900_000, signed_qty);

        let notional = trade.price.mul(trade.qty).from_fp();
        if notional < self.thresholds.small_max {
            self.buckets.small += 1;
        } else if notional < self.thresholds.mid_max {
            self.buckets.mid += 1;
        } else {
            self.buckets.large += 1;
        }

        match self.burst.side {
            Some(side) if side == trade.aggressor => self.burst.count += 1,
            _ => {
                self.burst.side = Some(trade.aggressor);
                self.burst.count = 1;
            }
        }

        self.update_pps(trade.ts);
    }

    fn update_pps(&mut self, ts: i64) {
        if self.last_pps_sample_ts == 0 {
            self.last_pps_sample_ts = ts;
            self.pps_ewma = 1.0;
            return;
        }
        let dt_s = ((ts - self.last_pps_sample_ts).max(1) as f64) / 1000.0;
        let instantaneous = 1.0 / dt_s;
        // Half-life ~2s EWMA.
        let alpha = 1.0 - (-dt_s * std::f64::consts::LN_2 / 2.0).exp();
        self.pps_ewma += alpha * (instantaneous - self.pps_ewma);
        self.last_pps_sample_ts = ts;
    }

    pub fn prints_per_second(&self) -> f64 {
        self.pps_ewma
    }

    pub fn burst(&self) -> BurstState {
        self.burst
    }

    /// Signed-delta z-score over the 5s window (buy volume minus sell
    /// volume, normalized by the window's own standard deviation of
    /// per-trade signed qty).
    pub fn delta_z(&self) -> Option<f64> {
        if self.window_5s.len() < 5 {
            return None;
        }
        let signed: Vec<f64> = self
            .window_5s
            .iter()
            .map(|t| match t.aggressor {
                Aggressor::Buy => t.qty.from_fp(),
                Aggressor::Sell => -t.qty.from_fp(),
            })
            .collect();
        let delta: f64 = signed.iter().sum();
        let mean = delta / signed.len() as f64;
        let var = signed.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / signed.len() as f64;
        let std = var.sqrt();
        if std < f64::EPSILON {
            return Some(0.0);
        }
        Some(delta / (std * (signed.len() as f64).sqrt()))
    }

    pub fn delta_1s(&self) -> Fp {
        signed_sum(&self.window_1s)
    }

    pub fn delta_5s(&self) -> Fp {
        signed_sum(&self.window_5s)
    }

    pub fn window_1m_trades(&self) -> &VecDeque<TradeEvent> {
        &self.window_1m
    }
}

impl Default for TradeTape {
    fn default() -> Self {
        Self::new()
    }
}

fn signed_sum(window: &VecDeque<TradeEvent>) -> Fp {
    window.iter().fold(Fp::ZERO, |acc, t| match t.aggressor {
        Aggressor::Buy => acc.add(t.qty),
        Aggressor::Sell => acc.sub(t.qty),
    })
}

fn push_and_trim(window: &mut VecDeque<TradeEvent>, trade: TradeEvent, span_ms: i64) {
    window.push_back(trade);
    let cutoff = trade.ts - span_ms;
    while let Some(front) = window.front() {
        if front.ts < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, price: f64, qty: f64, aggressor: Aggressor) -> TradeEvent {
        TradeEvent { ts, price: Fp::to_fp(price).unwrap(), qty: Fp::to_fp(qty).unwrap(), aggressor }
    }

    #[test]
    fn classify_aggressor_by_best_ask() {
        let ask = Fp::to_fp(100.0).unwrap();
        assert_eq!(classify_aggressor(Fp::to_fp(100.0).unwrap(), Some(ask)), Aggressor::Buy);
        assert_eq!(classify_aggressor(Fp::to_fp(99.9).unwrap(), Some(ask)), Aggressor::Sell);
    }

    #[test]
    fn cvd_accumulates_signed_qty() {
        let mut tape = TradeTape::new();
        tape.on_trade(trade(1, 100.0, 1.0, Aggressor::Buy));
        tape.on_trade(trade(2, 100.0, 0.5, Aggressor::Sell));
        assert!((tape.cvd_1m.cvd.from_fp() - 0.5).abs() < 1e-8);
    }

    #[test]
    fn cvd_rotates_at_bar_boundary() {
        let mut tape = TradeTape::new();
        tape.on_trade(trade(0, 100.0, 1.0, Aggressor::Buy));
        tape.on_trade(trade(60_000, 100.0, 2.0, Aggressor::Buy));
        // Delta resets per-bar even though cvd keeps accumulating.
        assert!((tape.cvd_1m.delta.from_fp() - 2.0).abs() < 1e-8);
        assert!((tape.cvd_1m.cvd.from_fp() - 3.0).abs() < 1e-8);
    }

    #[test]
    fn burst_counts_consecutive_same_side() {
        let mut tape = TradeTape::new();
        tape.on_trade(trade(1, 100.0, 1.0, Aggressor::Buy));
        tape.on_trade(trade(2, 100.0, 1.0, Aggressor::Buy));
        tape.on_trade(trade(3, 100.0, 1.0, Aggressor::Buy));
        let b = tape.burst();
        assert_eq!(b.side, Some(Aggressor::Buy));
        assert_eq!(b.count, 3);

        tape.on_trade(trade(4, 100.0, 1.0, Aggressor::Sell));
        assert_eq!(tape.burst().count, 1);
    }

    #[test]
    fn buckets_classify_by_notional() {
        let mut tape = TradeTape::new();
        tape.on_trade(trade(1, 100.0, 1.0, Aggressor::Buy)); // 100 notional -> small
        tape.on_trade(trade(2, 100.0, 50.0, Aggressor::Buy)); // 5000 -> mid
        tape.on_trade(trade(3, 100.0, 200.0, Aggressor::Buy)); // 20000 -> large
        assert_eq!(tape.buckets.small, 1);
        assert_eq!(tape.buckets.mid, 1);
        assert_eq!(tape.buckets.large, 1);
    }

    #[test]
    fn delta_z_requires_minimum_samples() {
        let mut tape = TradeTape::new();
        tape.on_trade(trade(1, 100.0, 1.0, Aggressor::Buy));
        assert!(tape.delta_z().is_none());
    }
}
