// =============================================================================
// Weighted Ensemble Scorer — regime-aware signal display
// =============================================================================
//
// Combines normalized microstructure inputs into a single directional score
// for the client-facing signal display. Each input already lives on
// [-1.0, 1.0]; a missing input is skipped entirely (not treated as zero) so
// a thin tape doesn't silently pull the score toward NEUTRAL.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalTier {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalContribution {
    pub name: String,
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResult {
    pub score: f64,
    pub signal: SignalTier,
    pub contributions: Vec<SignalContribution>,
}

/// Fixed per-input weights. Unlike the thresholds below, these don't change
/// with the detected regime — only which bucket a given score lands in does.
#[derive(Debug, Clone)]
pub struct RegimeWeights {
    pub imbalance: f64,
    pub cvd_slope: f64,
    pub toxicity: f64,
    pub trendiness: f64,
}

impl Default for RegimeWeights {
    fn default() -> Self {
        Self { imbalance: 0.3, cvd_slope: 0.3, toxicity: 0.2, trendiness: 0.2 }
    }
}

struct SignalInput {
    name: &'static str,
    value: Option<f64>,
    weight: f64,
}

pub struct WeightedScorer {
    weights: RegimeWeights,
    buy_threshold: f64,
    strong_threshold: f64,
}

impl WeightedScorer {
    pub fn new(weights: RegimeWeights) -> Self {
        Self { weights, buy_threshold: 0.15, strong_threshold: 0.45 }
    }

    /// `imbalance` and `toxicity` are expected on [-1.0, 1.0] already;
    /// `cvd_slope` is clamped defensively; `trendiness` is rescaled from its
    /// native [0.0, 1.0] Hurst-derived range onto [-1.0, 1.0] so a strongly
    /// trending regime pushes the score in the direction the other inputs
    /// already point, rather than acting as a directional signal itself.
    pub fn score(
        &self,
        imbalance: Option<f64>,
        cvd_slope: Option<f64>,
        toxicity: Option<f64>,
        trendiness: Option<f64>,
    ) -> ScoringResult {
        let inputs = [
            SignalInput { name: "imbalance", value: imbalance, weight: self.weights.imbalance },
            SignalInput {
                name: "cvd_slope",
                value: cvd_slope.map(|v| v.clamp(-1.0, 1.0)),
                weight: self.weights.cvd_slope,
            },
            SignalInput { name: "toxicity", value: toxicity, weight: self.weights.toxicity },
            SignalInput {
                name: "trendiness",
                value: trendiness.map(|t| t.clamp(0.0, 1.0) * 2.0 - 1.0),
                weight: self.weights.trendiness,
            },
        ];

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut contributions = Vec::with_capacity(inputs.len());

        for input in &inputs {
            if let Some(v) = input.value {
                let contribution = v * input.weight;
                weighted_sum += contribution;
                weight_total += input.weight;
                contributions.push(SignalContribution {
                    name: input.name.to_string(),
                    value: v,
                    weight: input.weight,
                    contribution,
                });
            }
        }

        let score = if weight_total > f64::EPSILON { weighted_sum / weight_total } else { 0.0 };

        let signal = if score >= self.strong_threshold {
            SignalTier::StrongBuy
        } else if score >= self.buy_threshold {
            SignalTier::Buy
        } else if score <= -self.strong_threshold {
            SignalTier::StrongSell
        } else if score <= -self.buy_threshold {
            SignalTier::Sell
        } else {
            SignalTier::Neutral
        };

        ScoringResult { score, signal, contributions }
    }
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self::new(RegimeWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_inputs_missing_yields_neutral_zero_score() {
        let scorer = WeightedScorer::default();
        let result = scorer.score(None, None, None, None);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.signal, SignalTier::Neutral);
        assert!(result.contributions.is_empty());
    }

    #[test]
    fn strongly_bullish_inputs_yield_strong_buy() {
        let scorer = WeightedScorer::default();
        let result = scorer.score(Some(0.9), Some(0.9), Some(0.9), Some(1.0));
        assert_eq!(result.signal, SignalTier::StrongBuy);
    }

    #[test]
    fn strongly_bearish_inputs_yield_strong_sell() {
        let scorer = WeightedScorer::default();
        let result = scorer.score(Some(-0.9), Some(-0.9), Some(-0.9), Some(0.0));
        assert_eq!(result.signal, SignalTier::StrongSell);
    }

    #[test]
    fn partial_inputs_still_score_on_present_subset() {
        let scorer = WeightedScorer::default();
        let result = scorer.score(Some(0.5), None, None, None);
        assert_eq!(result.contributions.len(), 1);
        assert!((result.score - 0.5).abs() < 1e-9);
    }
}
