// =============================================================================
// Regime Metrics — realized vol multi-window, vol-of-vol, micro-ATR, chop
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::indicators::atr::calculate_atr;
use crate::market_data::Candle;
use crate::regime::hurst::calculate_hurst_exponent;

const VOL_OF_VOL_WINDOW: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub realized_vol_1m: Option<f64>,
    pub realized_vol_5m: Option<f64>,
    pub realized_vol_15m: Option<f64>,
    pub vol_of_vol: Option<f64>,
    pub micro_atr: Option<f64>,
    /// Choppiness in [0, 100]; high values mean directionless, range-bound
    /// price action.
    pub chop: Option<f64>,
    /// Trendiness in [0.0, 1.0], derived from the Hurst exponent.
    pub trendiness: Option<f64>,
}

fn realized_vol(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(var.sqrt())
}

fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

fn choppiness(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let atr_sum: f64 = window
        .windows(2)
        .map(|w| (w[1].high - w[1].low).max((w[1].high - w[0].close).abs()).max((w[1].low - w[0].close).abs()))
        .sum();
    let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let range = high - low;
    if range < f64::EPSILON || atr_sum < f64::EPSILON {
        return None;
    }
    Some(100.0 * (atr_sum / range).log10() / (period as f64).log10())
}

/// Tracks realized vol at multiple horizons plus the vol-of-vol of the
/// shortest one.
pub struct RegimeDerivator {
    vol_1m_history: VecDeque<f64>,
}

impl RegimeDerivator {
    pub fn new() -> Self {
        Self { vol_1m_history: VecDeque::with_capacity(VOL_OF_VOL_WINDOW) }
    }

    /// `closes_1m`, `closes_5m`, `closes_15m` are recent closing-price
    /// series at each timeframe (oldest first); `candles_1m` feeds the
    /// micro-ATR and choppiness measures.
    pub fn compute(
        &mut self,
        closes_1m: &[f64],
        closes_5m: &[f64],
        closes_15m: &[f64],
        candles_1m: &[Candle],
    ) -> RegimeMetrics {
        let realized_vol_1m = realized_vol(&log_returns(closes_1m));
        let realized_vol_5m = realized_vol(&log_returns(closes_5m));
        let realized_vol_15m = realized_vol(&log_returns(closes_15m));

        if let Some(v) = realized_vol_1m {
            self.vol_1m_history.push_back(v);
            if self.vol_1m_history.len() > VOL_OF_VOL_WINDOW {
                self.vol_1m_history.pop_front();
            }
        }
        let vol_of_vol = if self.vol_1m_history.len() >= 5 {
            let samples: Vec<f64> = self.vol_1m_history.iter().copied().collect();
            realized_vol(&samples)
        } else {
            None
        };

        let micro_atr = calculate_atr(candles_1m, 14);
        let chop = choppiness(candles_1m, 14);
        let trendiness = calculate_hurst_exponent(closes_1m).map(|h| h.clamp(0.0, 1.0));

        RegimeMetrics {
            realized_vol_1m,
            realized_vol_5m,
            realized_vol_15m,
            vol_of_vol,
            micro_atr,
            chop,
            trendiness,
        }
    }
}

impl Default for RegimeDerivator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_closes_yield_none() {
        let mut d = RegimeDerivator::new();
        let m = d.compute(&[100.0], &[100.0], &[100.0], &[]);
        assert!(m.realized_vol_1m.is_none());
        assert!(m.trendiness.is_none());
    }

    #[test]
    fn constant_prices_yield_zero_realized_vol() {
        let mut d = RegimeDerivator::new();
        let closes = vec![100.0; 10];
        let m = d.compute(&closes, &closes, &closes, &[]);
        assert!((m.realized_vol_1m.unwrap()).abs() < 1e-12);
    }

    #[test]
    fn vol_of_vol_is_none_before_warmup() {
        let mut d = RegimeDerivator::new();
        let closes = vec![100.0, 101.0, 99.0, 102.0];
        let m = d.compute(&closes, &closes, &closes, &[]);
        assert!(m.vol_of_vol.is_none());
    }
}
