// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine. Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.
//
// ATR is the only indicator this design still needs (HTF swing/ATR structure
// in `microstructure/regime_metrics.rs`); the RSI/EMA/ADX/BBW/ROC basket was
// folded into the weighted-ensemble scorer's microstructure-native inputs.

pub mod atr;
