// =============================================================================
// Orchestrator State Machine — gates, impulse, chase, fallback, adds, risk exit
// =============================================================================
//
// Decides `intent` for a symbol on every tick from its current telemetry and
// open position, driving the Dry-Run Engine with the orders it emits. The
// gate pipeline short-circuits: the first failing gate determines
// `debug.blockReason` and the tick's intent is HOLD.

pub mod chase;

use serde::Serialize;

use crate::config::{DryRunConfig, GateConfig};
use crate::types::{Intent, IntegrityLevel, Side};

pub use chase::{ChaseAction, ChaseState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    pub verdict: GateVerdict,
    pub reason: Option<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self { verdict: GateVerdict::Pass, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { verdict: GateVerdict::Fail, reason: Some(reason.into()) }
    }

    pub fn passed(&self) -> bool {
        self.verdict == GateVerdict::Pass
    }
}

/// Telemetry the gate pipeline reads. Assembled by the caller (the Session
/// Service) from the symbol's current microstructure frame and tape state —
/// this module never touches a book or a derivator directly.
#[derive(Debug, Clone)]
pub struct OrchestratorInput {
    pub now_ms: i64,
    pub samples_seen: u32,
    pub intended_side: Side,

    pub trendiness: Option<f64>,
    pub chop: Option<f64>,
    pub vol_of_vol: Option<f64>,
    pub spread_bps: f64,
    pub sharp_oi_drop: bool,

    pub cvd_slope_sign: i32,
    pub obi_deep_supports_side: bool,
    pub delta_z: f64,

    pub session_vwap_distance_bps: f64,
    pub realized_vol_1m: Option<f64>,

    pub prints_per_second: f64,
    pub best_price_same_side: f64,
    pub tick_size: f64,

    pub integrity_level: IntegrityLevel,
    pub regime_flip: bool,
    pub flow_flip: bool,

    pub reversal_confirmations: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpulseState {
    pub pass: bool,
    pub prints_per_second: f64,
    pub delta_z: f64,
    pub spread_bps: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AddState {
    pub adds_used: u32,
    pub last_add_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitRiskState {
    pub triggered: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessState {
    pub ready: bool,
    pub samples_seen: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSnapshot {
    pub intent: Intent,
    pub side: Option<Side>,
    pub readiness: ReadinessState,
    pub gate_a: GateResult,
    pub gate_b: GateResult,
    pub gate_c: GateResult,
    pub impulse: ImpulseState,
    pub exit_risk: ExitRiskState,
    pub fallback_triggered_count: u32,
    pub debug: DebugInfo,
}

const MIN_READY_SAMPLES: u32 = 30;

pub struct Orchestrator {
    gates: GateConfig,
    dry_run: DryRunConfig,
    consecutive_confirmations: u32,
    confirmed_side: Option<Side>,
    chase: ChaseState,
    add_state: AddState,
    fallback_triggered_count: u32,
    last_reversal_ts: Option<i64>,
}

impl Orchestrator {
    pub fn new(gates: GateConfig, dry_run: DryRunConfig) -> Self {
        Self {
            gates,
            dry_run,
            consecutive_confirmations: 0,
            confirmed_side: None,
            chase: ChaseState::default(),
            add_state: AddState::default(),
            fallback_triggered_count: 0,
            last_reversal_ts: None,
        }
    }

    pub fn chase_state(&self) -> &ChaseState {
        &self.chase
    }

    pub fn adds_used(&self) -> u32 {
        self.add_state.adds_used
    }

    pub fn start_chase(&mut self, side: Side, price: f64, now_ms: i64) {
        self.chase.start(side, price, now_ms, &self.dry_run);
    }

    pub fn tick_chase(&mut self, now_ms: i64, best_price: f64, tick_size: f64) -> ChaseAction {
        self.chase.tick(now_ms, best_price, tick_size, &self.dry_run)
    }

    pub fn on_chase_fill(&mut self) {
        self.chase.on_fill();
    }

    /// Run the gate pipeline and hysteresis for one tick. Does not itself
    /// emit orders — callers translate `intent` plus `chase`/`fallback`
    /// decisions into `OrderInput`s for the Dry-Run Engine.
    pub fn decide(&mut self, input: &OrchestratorInput, has_open_position: bool) -> OrchestratorSnapshot {
        let readiness = ReadinessState {
            ready: input.samples_seen >= MIN_READY_SAMPLES,
            samples_seen: input.samples_seen,
        };

        if !readiness.ready {
            self.consecutive_confirmations = 0;
            return self.hold_snapshot(readiness, "warmup: insufficient samples");
        }

        let gate_a = self.evaluate_gate_a(input);
        if !gate_a.passed() {
            self.consecutive_confirmations = 0;
            return self.snapshot_with_gates(readiness, gate_a.clone(), GateResult::pass(), GateResult::pass());
        }

        let gate_b = self.evaluate_gate_b(input);
        if !gate_b.passed() {
            self.consecutive_confirmations = 0;
            return self.snapshot_with_gates(readiness, gate_a, gate_b.clone(), GateResult::pass());
        }

        let gate_c = self.evaluate_gate_c(input);
        if !gate_c.passed() {
            self.consecutive_confirmations = 0;
            return self.snapshot_with_gates(readiness, gate_a, gate_b, gate_c.clone());
        }

        // All gates pass for `input.intended_side`. Apply hysteresis before
        // committing to a side change.
        if self.confirmed_side == Some(input.intended_side) {
            self.consecutive_confirmations += 1;
        } else {
            self.confirmed_side = Some(input.intended_side);
            self.consecutive_confirmations = 1;
        }

        let confirmed = self.consecutive_confirmations >= self.gates.consecutive_confirmations;

        let exit_risk = self.evaluate_risk_exit(input, has_open_position);
        let impulse = self.evaluate_impulse(input);

        if exit_risk.triggered {
            return OrchestratorSnapshot {
                intent: Intent::ExitRisk,
                side: Some(input.intended_side),
                readiness,
                gate_a,
                gate_b,
                gate_c,
                impulse,
                exit_risk,
                fallback_triggered_count: self.fallback_triggered_count,
                debug: DebugInfo { block_reason: None },
            };
        }

        if !confirmed {
            return OrchestratorSnapshot {
                intent: Intent::Hold,
                side: Some(input.intended_side),
                readiness,
                gate_a,
                gate_b,
                gate_c,
                impulse,
                exit_risk,
                fallback_triggered_count: self.fallback_triggered_count,
                debug: DebugInfo {
                    block_reason: Some(format!(
                        "hysteresis: {}/{} confirmations",
                        self.consecutive_confirmations, self.gates.consecutive_confirmations
                    )),
                },
            };
        }

        let intent = if has_open_position { Intent::Add } else { Intent::Entry };

        OrchestratorSnapshot {
            intent,
            side: Some(input.intended_side),
            readiness,
            gate_a,
            gate_b,
            gate_c,
            impulse,
            exit_risk,
            fallback_triggered_count: self.fallback_triggered_count,
            debug: DebugInfo { block_reason: None },
        }
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    fn evaluate_gate_a(&self, input: &OrchestratorInput) -> GateResult {
        let Some(trendiness) = input.trendiness else {
            return GateResult::fail("gate A: trendiness unavailable");
        };
        let Some(chop) = input.chop else {
            return GateResult::fail("gate A: choppiness unavailable");
        };
        let Some(vol_of_vol) = input.vol_of_vol else {
            return GateResult::fail("gate A: vol-of-vol unavailable");
        };

        if trendiness < self.gates.trendiness_min {
            return GateResult::fail(format!(
                "gate A: trendiness {trendiness:.3} below minimum {:.3}",
                self.gates.trendiness_min
            ));
        }
        if chop > self.gates.chop_max {
            return GateResult::fail(format!("gate A: choppiness {chop:.3} above maximum {:.3}", self.gates.chop_max));
        }
        if vol_of_vol > self.gates.vol_of_vol_max {
            return GateResult::fail(format!(
                "gate A: vol-of-vol {vol_of_vol:.3} above maximum {:.3}",
                self.gates.vol_of_vol_max
            ));
        }
        if input.spread_bps > self.gates.spread_max_bps {
            return GateResult::fail(format!(
                "gate A: spread {:.2}bps above maximum {:.2}bps",
                input.spread_bps, self.gates.spread_max_bps
            ));
        }
        if input.sharp_oi_drop {
            return GateResult::fail("gate A: sharp open-interest drop detected");
        }

        GateResult::pass()
    }

    fn evaluate_gate_b(&self, input: &OrchestratorInput) -> GateResult {
        if input.cvd_slope_sign != input.intended_side.sign() {
            return GateResult::fail("gate B: CVD slope does not confirm intended side");
        }
        if !input.obi_deep_supports_side {
            return GateResult::fail("gate B: deep order book imbalance does not support intended side");
        }
        if input.delta_z.abs() < self.gates.z_min {
            return GateResult::fail(format!(
                "gate B: |deltaZ| {:.3} below minimum {:.3}",
                input.delta_z.abs(),
                self.gates.z_min
            ));
        }
        GateResult::pass()
    }

    fn evaluate_gate_c(&self, input: &OrchestratorInput) -> GateResult {
        if input.session_vwap_distance_bps.abs() > self.gates.vwap_distance_band_bps {
            return GateResult::fail(format!(
                "gate C: session VWAP distance {:.2}bps outside band {:.2}bps",
                input.session_vwap_distance_bps.abs(),
                self.gates.vwap_distance_band_bps
            ));
        }
        let Some(realized_vol) = input.realized_vol_1m else {
            return GateResult::fail("gate C: realized volatility unavailable");
        };
        let (lo, hi) = self.gates.realized_vol_band;
        if realized_vol < lo || realized_vol > hi {
            return GateResult::fail(format!("gate C: realized vol {realized_vol:.4} outside band [{lo:.4},{hi:.4}]"));
        }
        GateResult::pass()
    }

    fn evaluate_impulse(&self, input: &OrchestratorInput) -> ImpulseState {
        let pass = input.prints_per_second >= self.gates.impulse_pps_min
            && input.delta_z.abs() >= self.gates.impulse_z_min
            && input.spread_bps <= self.gates.impulse_spread_max_bps;
        ImpulseState {
            pass,
            prints_per_second: input.prints_per_second,
            delta_z: input.delta_z,
            spread_bps: input.spread_bps,
        }
    }

    fn evaluate_risk_exit(&self, input: &OrchestratorInput, has_open_position: bool) -> ExitRiskState {
        if !has_open_position {
            return ExitRiskState { triggered: false, reason: None };
        }
        if input.integrity_level == IntegrityLevel::Critical {
            return ExitRiskState { triggered: true, reason: Some("orderbook integrity CRITICAL".to_string()) };
        }
        if input.regime_flip {
            return ExitRiskState { triggered: true, reason: Some("regime flip".to_string()) };
        }
        if input.flow_flip {
            return ExitRiskState { triggered: true, reason: Some("flow flip".to_string()) };
        }
        ExitRiskState { triggered: false, reason: None }
    }

    /// Fallback taker is permitted only once the maker chase has timed out,
    /// the impulse condition holds, and every gate currently passes.
    pub fn fallback_allowed(&self, snapshot: &OrchestratorSnapshot) -> bool {
        self.chase.timed_out
            && snapshot.impulse.pass
            && snapshot.gate_a.passed()
            && snapshot.gate_b.passed()
            && snapshot.gate_c.passed()
    }

    pub fn fallback_notional(&self, target_notional: f64) -> f64 {
        target_notional * self.gates.fallback_notional_fraction.min(0.25)
    }

    pub fn record_fallback_fired(&mut self) {
        self.fallback_triggered_count += 1;
    }

    /// DirectionLock: a reversal is only allowed with at least
    /// `reversal_min_confirmations` of the four tracked confirmations, and
    /// only after the cooldown since the last reversal has elapsed.
    pub fn reversal_allowed(&mut self, confirmations: u32, now_ms: i64) -> bool {
        if confirmations < self.gates.reversal_min_confirmations {
            return false;
        }
        if let Some(last) = self.last_reversal_ts {
            if now_ms - last < self.gates.reversal_cooldown_ms as i64 {
                return false;
            }
        }
        self.last_reversal_ts = Some(now_ms);
        true
    }

    pub fn try_add_rung(
        &mut self,
        rung: u32,
        unrealized_pnl_pct: f64,
        min_unrealized_pnl_pct: f64,
        signal_score: f64,
        min_signal_score: f64,
        spread_bps: f64,
        now_ms: i64,
    ) -> bool {
        if rung > 2 || self.add_state.adds_used >= rung {
            return false;
        }
        if unrealized_pnl_pct < min_unrealized_pnl_pct {
            return false;
        }
        if signal_score < min_signal_score {
            return false;
        }
        if spread_bps > self.gates.spread_max_bps {
            return false;
        }
        if let Some(last) = self.add_state.last_add_ts {
            if now_ms - last < self.dry_run.cooldown_ms as i64 {
                return false;
            }
        }
        self.add_state.adds_used += 1;
        self.add_state.last_add_ts = Some(now_ms);
        true
    }

    pub fn reset_adds(&mut self) {
        self.add_state = AddState::default();
    }

    fn hold_snapshot(&self, readiness: ReadinessState, reason: &str) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            intent: Intent::Hold,
            side: None,
            readiness,
            gate_a: GateResult::pass(),
            gate_b: GateResult::pass(),
            gate_c: GateResult::pass(),
            impulse: ImpulseState { pass: false, prints_per_second: 0.0, delta_z: 0.0, spread_bps: 0.0 },
            exit_risk: ExitRiskState { triggered: false, reason: None },
            fallback_triggered_count: self.fallback_triggered_count,
            debug: DebugInfo { block_reason: Some(reason.to_string()) },
        }
    }

    fn snapshot_with_gates(
        &self,
        readiness: ReadinessState,
        gate_a: GateResult,
        gate_b: GateResult,
        gate_c: GateResult,
    ) -> OrchestratorSnapshot {
        let block_reason = [&gate_a, &gate_b, &gate_c]
            .into_iter()
            .find(|g| !g.passed())
            .and_then(|g| g.reason.clone());

        OrchestratorSnapshot {
            intent: Intent::Hold,
            side: None,
            readiness,
            gate_a,
            gate_b,
            gate_c,
            impulse: ImpulseState { pass: false, prints_per_second: 0.0, delta_z: 0.0, spread_bps: 0.0 },
            exit_risk: ExitRiskState { triggered: false, reason: None },
            fallback_triggered_count: self.fallback_triggered_count,
            debug: DebugInfo { block_reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(GateConfig::default(), DryRunConfig::default())
    }

    fn passing_input() -> OrchestratorInput {
        OrchestratorInput {
            now_ms: 1,
            samples_seen: 100,
            intended_side: Side::Long,
            trendiness: Some(0.8),
            chop: Some(0.1),
            vol_of_vol: Some(0.1),
            spread_bps: 1.0,
            sharp_oi_drop: false,
            cvd_slope_sign: 1,
            obi_deep_supports_side: true,
            delta_z: 2.0,
            session_vwap_distance_bps: 5.0,
            realized_vol_1m: Some(1.0),
            prints_per_second: 5.0,
            best_price_same_side: 100.0,
            tick_size: 0.1,
            integrity_level: IntegrityLevel::Ok,
            regime_flip: false,
            flow_flip: false,
            reversal_confirmations: 0,
        }
    }

    #[test]
    fn warmup_holds_with_block_reason() {
        let mut o = orchestrator();
        let mut input = passing_input();
        input.samples_seen = 1;
        let snap = o.decide(&input, false);
        assert_eq!(snap.intent, Intent::Hold);
        assert!(snap.debug.block_reason.unwrap().contains("warmup"));
    }

    #[test]
    fn failing_gate_a_holds_and_names_the_gate() {
        let mut o = orchestrator();
        let mut input = passing_input();
        input.trendiness = Some(0.0);
        let snap = o.decide(&input, false);
        assert_eq!(snap.intent, Intent::Hold);
        assert!(!snap.gate_a.passed());
        assert!(snap.debug.block_reason.unwrap().contains("gate A"));
    }

    #[test]
    fn entry_requires_consecutive_confirmations() {
        let mut o = orchestrator();
        let input = passing_input();

        let first = o.decide(&input, false);
        assert_eq!(first.intent, Intent::Hold);

        let second = o.decide(&input, false);
        assert_eq!(second.intent, Intent::Hold);

        let third = o.decide(&input, false);
        assert_eq!(third.intent, Intent::Entry);
    }

    #[test]
    fn open_position_with_all_gates_passing_yields_add_intent() {
        let mut o = orchestrator();
        let input = passing_input();
        o.decide(&input, true);
        o.decide(&input, true);
        let snap = o.decide(&input, true);
        assert_eq!(snap.intent, Intent::Add);
    }

    #[test]
    fn critical_integrity_triggers_risk_exit_even_while_confirmed() {
        let mut o = orchestrator();
        let mut input = passing_input();
        o.decide(&input, true);
        o.decide(&input, true);
        input.integrity_level = IntegrityLevel::Critical;
        let snap = o.decide(&input, true);
        assert_eq!(snap.intent, Intent::ExitRisk);
        assert!(snap.exit_risk.triggered);
    }

    #[test]
    fn reversal_requires_three_of_four_confirmations() {
        let mut o = orchestrator();
        assert!(!o.reversal_allowed(2, 0));
        assert!(o.reversal_allowed(3, 0));
    }

    #[test]
    fn reversal_respects_cooldown() {
        let mut o = orchestrator();
        assert!(o.reversal_allowed(4, 1_000));
        assert!(!o.reversal_allowed(4, 1_500));
        assert!(o.reversal_allowed(4, 1_000 + o.gates.reversal_cooldown_ms as i64));
    }

    #[test]
    fn add_rung_respects_cooldown_between_rungs() {
        let mut o = orchestrator();
        assert!(o.try_add_rung(1, 1.0, 0.5, 2.0, 1.0, 1.0, 0));
        assert!(!o.try_add_rung(2, 1.0, 0.5, 2.0, 1.0, 1.0, 0));
        assert!(o.try_add_rung(2, 1.0, 0.5, 2.0, 1.0, 1.0, o.dry_run.cooldown_ms as i64));
    }
}
