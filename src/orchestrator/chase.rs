// =============================================================================
// Entry chase — maker reprice loop with strict cancel-before-replace
// =============================================================================

use serde::Serialize;

use crate::config::DryRunConfig;
use crate::types::Side;

/// A reprice is only warranted once the best price has moved by more than
/// this many tick sizes from the order's current resting price.
const REPRICE_TICK_MULTIPLIER: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaseAction {
    Noop,
    Reprice { new_price_hint: i64 },
    Expired,
    MaxRepricesReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChaseState {
    pub active: bool,
    pub side: Option<Side>,
    pub price: f64,
    pub reprices_used: u32,
    pub started_at_ms: i64,
    pub last_reprice_ms: i64,
    pub expires_at_ms: i64,
    pub timed_out: bool,
    pub filled: bool,
}

impl Default for ChaseState {
    fn default() -> Self {
        Self {
            active: false,
            side: None,
            price: 0.0,
            reprices_used: 0,
            started_at_ms: 0,
            last_reprice_ms: 0,
            expires_at_ms: 0,
            timed_out: false,
            filled: false,
        }
    }
}

impl ChaseState {
    pub fn start(&mut self, side: Side, price: f64, now_ms: i64, cfg: &DryRunConfig) {
        self.active = true;
        self.side = Some(side);
        self.price = price;
        self.reprices_used = 0;
        self.started_at_ms = now_ms;
        self.last_reprice_ms = now_ms;
        self.expires_at_ms = now_ms + cfg.chase_expiry_ms as i64;
        self.timed_out = false;
        self.filled = false;
    }

    pub fn on_fill(&mut self) {
        self.active = false;
        self.filled = true;
    }

    /// Advance the chase by one tick. `new_price_hint` in a `Reprice` action
    /// is a placeholder count (the caller recomputes the actual resting
    /// price from the live book before placing the replacement order).
    pub fn tick(&mut self, now_ms: i64, best_price: f64, tick_size: f64, cfg: &DryRunConfig) -> ChaseAction {
        if !self.active {
            return ChaseAction::Noop;
        }

        if now_ms >= self.expires_at_ms {
            self.active = false;
            self.timed_out = true;
            return ChaseAction::Expired;
        }

        if self.reprices_used >= cfg.max_reprices {
            self.active = false;
            self.timed_out = true;
            return ChaseAction::MaxRepricesReached;
        }

        if now_ms - self.last_reprice_ms < cfg.reprice_ms as i64 {
            return ChaseAction::Noop;
        }

        let moved = (best_price - self.price).abs();
        if moved > tick_size * REPRICE_TICK_MULTIPLIER {
            self.price = best_price;
            self.reprices_used += 1;
            self.last_reprice_ms = now_ms;
            return ChaseAction::Reprice { new_price_hint: self.reprices_used as i64 };
        }

        ChaseAction::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DryRunConfig {
        DryRunConfig { max_reprices: 2, reprice_ms: 1_000, chase_expiry_ms: 10_000, ..DryRunConfig::default() }
    }

    #[test]
    fn idle_chase_is_a_noop() {
        let mut chase = ChaseState::default();
        assert_eq!(chase.tick(0, 100.0, 0.1, &cfg()), ChaseAction::Noop);
    }

    #[test]
    fn reprices_when_price_moves_past_threshold() {
        let mut chase = ChaseState::default();
        let cfg = cfg();
        chase.start(Side::Long, 100.0, 0, &cfg);
        let action = chase.tick(1_000, 100.5, 0.1, &cfg);
        assert_eq!(action, ChaseAction::Reprice { new_price_hint: 1 });
        assert_eq!(chase.reprices_used, 1);
    }

    #[test]
    fn no_reprice_before_interval_elapses() {
        let mut chase = ChaseState::default();
        let cfg = cfg();
        chase.start(Side::Long, 100.0, 0, &cfg);
        assert_eq!(chase.tick(500, 200.0, 0.1, &cfg), ChaseAction::Noop);
    }

    #[test]
    fn expires_after_chase_expiry_ms() {
        let mut chase = ChaseState::default();
        let cfg = cfg();
        chase.start(Side::Long, 100.0, 0, &cfg);
        assert_eq!(chase.tick(10_000, 100.0, 0.1, &cfg), ChaseAction::Expired);
        assert!(chase.timed_out);
        assert!(!chase.active);
    }

    #[test]
    fn stops_after_max_reprices() {
        let mut chase = ChaseState::default();
        let cfg = cfg();
        chase.start(Side::Long, 100.0, 0, &cfg);
        chase.tick(1_000, 101.0, 0.1, &cfg);
        chase.tick(2_000, 102.0, 0.1, &cfg);
        let action = chase.tick(3_000, 103.0, 0.1, &cfg);
        assert_eq!(action, ChaseAction::MaxRepricesReached);
        assert!(chase.timed_out);
    }
}
