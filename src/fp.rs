// =============================================================================
// Fixed-Point Math — integer-scaled arithmetic for prices, qty, and cash
// =============================================================================
//
// All matching-engine arithmetic runs on `Fp`, a signed i128 scaled by
// `SCALE` (10^8). Floating point never enters the Dry-Run Engine: two runs
// fed the same event sequence must produce byte-identical wallet balances.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCALE: i128 = 100_000_000;

/// A fixed-point scalar at 10^8 precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fp(pub i128);

/// Arithmetic failures. Division by zero is fatal per the matching engine's
/// error-severity table; callers must not continue the current tick past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FpError {
    DivisionByZero,
    NonFinite,
}

impl fmt::Display for FpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FpError::DivisionByZero => write!(f, "fixed-point division by zero"),
            FpError::NonFinite => write!(f, "non-finite value passed to toFp"),
        }
    }
}

impl std::error::Error for FpError {}

impl Fp {
    pub const ZERO: Fp = Fp(0);
    pub const ONE: Fp = Fp(SCALE);

    pub fn raw(v: i128) -> Fp {
        Fp(v)
    }

    /// Convert a finite real number into fixed-point. Non-finite input
    /// (NaN/Infinity) is a conversion error — the caller's responsibility,
    /// never silently clamped.
    pub fn to_fp(real: f64) -> Result<Fp, FpError> {
        if !real.is_finite() {
            return Err(FpError::NonFinite);
        }
        Ok(Fp((real * SCALE as f64).round() as i128))
    }

    /// Lossy conversion back to `f64`, accurate to within 1 ULP for
    /// `|x| < 10^10`.
    pub fn from_fp(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub fn add(self, other: Fp) -> Fp {
        Fp(self.0 + other.0)
    }

    pub fn sub(self, other: Fp) -> Fp {
        Fp(self.0 - other.0)
    }

    /// `mul(a,b) = (a*b)/SCALE`, truncating toward zero.
    pub fn mul(self, other: Fp) -> Fp {
        Fp((self.0 * other.0) / SCALE)
    }

    /// `div(a,b) = (a*SCALE)/b`. Division by zero is fatal.
    pub fn div(self, other: Fp) -> Result<Fp, FpError> {
        if other.0 == 0 {
            return Err(FpError::DivisionByZero);
        }
        Ok(Fp((self.0 * SCALE) / other.0))
    }

    pub fn min(self, other: Fp) -> Fp {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Fp) -> Fp {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    pub fn cmp_fp(self, other: Fp) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }

    pub fn sign(self) -> i32 {
        match self.0.cmp(&0) {
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
        }
    }

    pub fn abs(self) -> Fp {
        Fp(self.0.abs())
    }

    pub fn neg(self) -> Fp {
        Fp(-self.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round to the nearest multiple of `tick` (e.g. a price tick size).
    pub fn round_to(self, tick: Fp) -> Result<Fp, FpError> {
        if tick.0 == 0 {
            return Err(FpError::DivisionByZero);
        }
        let units = (self.0 as f64 / tick.0 as f64).round() as i128;
        Ok(Fp(units * tick.0))
    }
}

impl fmt::Display for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.from_fp())
    }
}

impl std::ops::Add for Fp {
    type Output = Fp;
    fn add(self, rhs: Fp) -> Fp {
        Fp::add(self, rhs)
    }
}

impl std::ops::Sub for Fp {
    type Output = Fp;
    fn sub(self, rhs: Fp) -> Fp {
        Fp::sub(self, rhs)
    }
}

impl std::ops::Neg for Fp {
    type Output = Fp;
    fn neg(self) -> Fp {
        Fp::neg(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_fp_from_fp_roundtrip() {
        let x = 123.456_789;
        let fp = Fp::to_fp(x).unwrap();
        assert!((fp.from_fp() - x).abs() < 1e-6);
    }

    #[test]
    fn to_fp_rejects_non_finite() {
        assert_eq!(Fp::to_fp(f64::NAN), Err(FpError::NonFinite));
        assert_eq!(Fp::to_fp(f64::INFINITY), Err(FpError::NonFinite));
    }

    #[test]
    fn mul_scales_correctly() {
        let a = Fp::to_fp(2.5).unwrap();
        let b = Fp::to_fp(4.0).unwrap();
        let c = a.mul(b);
        assert!((c.from_fp() - 10.0).abs() < 1e-8);
    }

    #[test]
    fn div_by_zero_is_fatal() {
        let a = Fp::to_fp(10.0).unwrap();
        assert_eq!(a.div(Fp::ZERO), Err(FpError::DivisionByZero));
    }

    #[test]
    fn div_computes_correctly() {
        let a = Fp::to_fp(10.0).unwrap();
        let b = Fp::to_fp(4.0).unwrap();
        let c = a.div(b).unwrap();
        assert!((c.from_fp() - 2.5).abs() < 1e-8);
    }

    #[test]
    fn ordering_and_sign() {
        let neg = Fp::to_fp(-5.0).unwrap();
        let pos = Fp::to_fp(5.0).unwrap();
        assert_eq!(neg.sign(), -1);
        assert_eq!(pos.sign(), 1);
        assert_eq!(Fp::ZERO.sign(), 0);
        assert!(neg < pos);
        assert_eq!(neg.abs(), pos);
    }

    #[test]
    fn round_to_tick() {
        let price = Fp::to_fp(100.037).unwrap();
        let tick = Fp::to_fp(0.05).unwrap();
        let rounded = price.round_to(tick).unwrap();
        assert!((rounded.from_fp() - 100.05).abs() < 1e-8);
    }
}
