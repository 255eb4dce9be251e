// =============================================================================
// Toxicity Metrics — VPIN approximation, signed-volume ratio, impact, bursts
// =============================================================================
//
// Reuses the volume-bucketed VPIN approximation already validated in the
// signal pipeline rather than inventing a second estimator.

use serde::{Deserialize, Serialize};

use crate::market_data::trade_tape::{BurstState, TradeTape};
use crate::signals::vpin::VPINCalculator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToxicityMetrics {
    pub vpin: Option<f64>,
    pub signed_volume_ratio: Option<f64>,
    pub impact_per_signed_notional: Option<f64>,
    pub trade_to_book_ratio: Option<f64>,
    pub burst_persistence: u32,
}

pub struct ToxicityDerivator {
    vpin: VPINCalculator,
}

impl ToxicityDerivator {
    pub fn new() -> Self {
        Self { vpin: VPINCalculator::default() }
    }

    pub fn on_trade(&mut self, qty: f64, is_buy: bool) {
        self.vpin.add_trade(qty, is_buy);
    }

    pub fn compute(&self, tape: &TradeTape, best_depth_qty: Option<f64>) -> ToxicityMetrics {
        let vpin_state = self.vpin.calculate();
        let vpin = if vpin_state.buy_volume + vpin_state.sell_volume > 0.0 {
            Some(vpin_state.vpin)
        } else {
            None
        };

        let total = vpin_state.buy_volume + vpin_state.sell_volume;
        let signed_volume_ratio = if total > f64::EPSILON {
            Some((vpin_state.buy_volume - vpin_state.sell_volume) / total)
        } else {
            None
        };

        let trade_to_book_ratio = match best_depth_qty {
            Some(depth) if depth > f64::EPSILON => Some(total / depth),
            _ => None,
        };

        let impact_per_signed_notional = signed_volume_ratio.map(|r| r * tape.prints_per_second());

        let BurstState { count, .. } = tape.burst();

        ToxicityMetrics {
            vpin,
            signed_volume_ratio,
            impact_per_signed_notional,
            trade_to_book_ratio,
            burst_persistence: count,
        }
    }
}

impl Default for ToxicityDerivator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_trades_yields_null_vpin() {
        let derivator = ToxicityDerivator::new();
        let tape = TradeTape::new();
        let m = derivator.compute(&tape, Some(10.0));
        assert!(m.vpin.is_none());
    }

    #[test]
    fn buy_heavy_flow_yields_positive_signed_ratio() {
        let mut derivator = ToxicityDerivator::new();
        for _ in 0..20 {
            derivator.on_trade(10.0, true);
        }
        let tape = TradeTape::new();
        let m = derivator.compute(&tape, None);
        assert!(m.signed_volume_ratio.unwrap() > 0.0);
    }
}
