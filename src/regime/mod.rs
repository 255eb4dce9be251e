// =============================================================================
// Regime Detection Module
// =============================================================================
//
// Hurst exponent (persistence vs mean-reversion), consumed by the
// microstructure regime derivator.

pub mod hurst;

pub use hurst::calculate_hurst_exponent;
