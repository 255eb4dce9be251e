// =============================================================================
// Microstructure Derivators — liquidity, toxicity, passive flow, derivatives,
// regime metrics, HTF structure, session VWAP
// =============================================================================
//
// Each submodule turns raw book/tape state into one facet of the per-symbol
// metrics frame. They are pure functions of the relevant state plus small
// rolling-window derivators that own their own history.

pub mod derivatives;
pub mod htf;
pub mod liquidity;
pub mod passive_flow;
pub mod regime_metrics;
pub mod session_vwap;
pub mod toxicity;

pub use derivatives::{DerivativesDerivator, DerivativesMetrics};
pub use htf::{compute_htf, HtfFrame};
pub use liquidity::{compute_liquidity, LiquidityMetrics};
pub use passive_flow::{PassiveFlowDerivator, PassiveFlowMetrics};
pub use regime_metrics::{RegimeDerivator, RegimeMetrics};
pub use session_vwap::{session_for, SessionName, SessionVwap};
pub use toxicity::{ToxicityDerivator, ToxicityMetrics};

use serde::{Deserialize, Serialize};

/// All derivators for a single symbol, bundled so the session pipeline can
/// own one of these per tracked symbol.
pub struct MicrostructureState {
    pub passive_flow: PassiveFlowDerivator,
    pub toxicity: ToxicityDerivator,
    pub derivatives: DerivativesDerivator,
    pub regime: RegimeDerivator,
    pub session_vwap: SessionVwap,
}

impl MicrostructureState {
    pub fn new() -> Self {
        Self {
            passive_flow: PassiveFlowDerivator::new(),
            toxicity: ToxicityDerivator::new(),
            derivatives: DerivativesDerivator::new(),
            regime: RegimeDerivator::new(),
            session_vwap: SessionVwap::new(),
        }
    }
}

impl Default for MicrostructureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined microstructure section of the per-symbol metrics frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrostructureFrame {
    pub liquidity: LiquidityMetrics,
    pub toxicity: ToxicityMetrics,
    pub passive_flow: PassiveFlowMetrics,
    pub derivatives: DerivativesMetrics,
    pub regime: RegimeMetrics,
    pub htf: Option<HtfFrame>,
    pub session_vwap: SessionVwap,
}
