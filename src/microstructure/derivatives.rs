// =============================================================================
// Derivatives Metrics — mark/index deviation, perp basis, basis z-score
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

const BASIS_HISTORY_LEN: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativesMetrics {
    pub mark_last_deviation_bps: f64,
    pub index_last_deviation_bps: f64,
    pub perp_basis_bps: f64,
    pub basis_z_score: Option<f64>,
    /// Crude proxy for nearby forced-liquidation pressure: widens with
    /// |basis| and with mark/last divergence, in [0, 1].
    pub liquidation_proxy: f64,
}

pub struct DerivativesDerivator {
    basis_history: VecDeque<f64>,
}

impl DerivativesDerivator {
    pub fn new() -> Self {
        Self { basis_history: VecDeque::with_capacity(BASIS_HISTORY_LEN) }
    }

    pub fn compute(&mut self, last_price: f64, mark_price: f64, index_price: f64) -> DerivativesMetrics {
        let mark_last_deviation_bps = bps(mark_price, last_price);
        let index_last_deviation_bps = bps(index_price, last_price);
        let perp_basis_bps = bps(mark_price, index_price);

        self.basis_history.push_back(perp_basis_bps);
        if self.basis_history.len() > BASIS_HISTORY_LEN {
            self.basis_history.pop_front();
        }

        let basis_z_score = if self.basis_history.len() >= 5 {
            let mean = self.basis_history.iter().sum::<f64>() / self.basis_history.len() as f64;
            let var = self.basis_history.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / self.basis_history.len() as f64;
            let std = var.sqrt();
            if std > f64::EPSILON {
                Some((perp_basis_bps - mean) / std)
            } else {
                Some(0.0)
            }
        } else {
            None
        };

        let liquidation_proxy = ((perp_basis_bps.abs() / 50.0) + (mark_last_deviation_bps.abs() / 50.0))
            .clamp(0.0, 1.0);

        DerivativesMetrics {
            mark_last_deviation_bps,
            index_last_deviation_bps,
            perp_basis_bps,
            basis_z_score,
            liquidation_proxy,
        }
    }
}

impl Default for DerivativesDerivator {
    fn default() -> Self {
        Self::new()
    }
}

fn bps(a: f64, b: f64) -> f64 {
    if b.abs() < f64::EPSILON {
        0.0
    } else {
        ((a - b) / b) * 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_prices_yield_zero_deviation() {
        let mut d = DerivativesDerivator::new();
        let m = d.compute(100.0, 100.0, 100.0);
        assert_eq!(m.mark_last_deviation_bps, 0.0);
        assert_eq!(m.perp_basis_bps, 0.0);
    }

    #[test]
    fn positive_basis_when_mark_above_index() {
        let mut d = DerivativesDerivator::new();
        let m = d.compute(100.0, 100.5, 100.0);
        assert!(m.perp_basis_bps > 0.0);
    }

    #[test]
    fn basis_z_score_is_none_before_warmup() {
        let mut d = DerivativesDerivator::new();
        let m = d.compute(100.0, 100.1, 100.0);
        assert!(m.basis_z_score.is_none());
    }

    #[test]
    fn basis_z_score_appears_after_warmup() {
        let mut d = DerivativesDerivator::new();
        for _ in 0..10 {
            d.compute(100.0, 100.1, 100.0);
        }
        let m = d.compute(100.0, 105.0, 100.0);
        assert!(m.basis_z_score.is_some());
        assert!(m.basis_z_score.unwrap() > 0.0);
    }
}
