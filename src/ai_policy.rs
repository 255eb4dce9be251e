// =============================================================================
// AI Policy Contract — external decision plans for the ai-dry-run surface
// =============================================================================
//
// The `/api/ai-dry-run/*` family mirrors the built-in orchestrator's session
// plumbing but is driven by an externally-supplied policy instead of the
// gate pipeline. That policy submits a decision plan as JSON; this module
// is the only place that plan is trusted to cross into a domain `OrderInput`.
//
// A plan that fails schema or semantic validation never reaches the Dry-Run
// Engine — it becomes a HOLD and bumps `AppState::invalid_ai_responses` so a
// misbehaving policy source is visible to operators, never silently ignored
// and never silently auto-entered.

use serde::Deserialize;

use crate::dry_run::OrderInput;
use crate::fp::Fp;
use crate::types::{OrderType, Side};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanAction {
    Hold,
    Enter,
    Exit,
}

/// The wire contract an external policy must satisfy. `deny_unknown_fields`
/// turns an unrecognized field shape into a parse error instead of silently
/// ignoring it — that error is a HOLD, same as any other malformed plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiDecisionPlan {
    pub action: PlanAction,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub notional: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    /// Free-text rationale surfaced back to operators; never parsed.
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug)]
pub enum PlanError {
    Malformed(serde_json::Error),
    MissingSide,
    InvalidNotional,
    ExitMustReduceOnly,
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "failed to parse decision plan: {e}"),
            Self::MissingSide => write!(f, "ENTER action requires a side"),
            Self::InvalidNotional => write!(f, "ENTER action requires a positive notional"),
            Self::ExitMustReduceOnly => write!(f, "EXIT action cannot set reduce_only=false"),
        }
    }
}

impl std::error::Error for PlanError {}

impl From<serde_json::Error> for PlanError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e)
    }
}

/// Parse and validate a raw decision plan. A HOLD plan, or any plan that
/// fails validation, never produces an order.
pub fn parse_decision(raw: &str) -> Result<AiDecisionPlan, PlanError> {
    let plan: AiDecisionPlan = serde_json::from_str(raw)?;
    validate(&plan)?;
    Ok(plan)
}

fn validate(plan: &AiDecisionPlan) -> Result<(), PlanError> {
    match plan.action {
        PlanAction::Hold => Ok(()),
        PlanAction::Enter => {
            if plan.side.is_none() {
                return Err(PlanError::MissingSide);
            }
            if plan.notional.unwrap_or(0.0) <= 0.0 {
                return Err(PlanError::InvalidNotional);
            }
            Ok(())
        }
        PlanAction::Exit => {
            if !plan.reduce_only {
                return Err(PlanError::ExitMustReduceOnly);
            }
            Ok(())
        }
    }
}

/// Translate a validated plan into an order at the given reference price.
/// Returns `None` for HOLD — there is nothing to submit.
pub fn plan_to_order(plan: &AiDecisionPlan, reference_price: f64) -> Option<OrderInput> {
    match plan.action {
        PlanAction::Hold => None,
        PlanAction::Enter => {
            let side = plan.side?;
            let notional = plan.notional?;
            if reference_price <= 0.0 {
                return None;
            }
            let qty = Fp::to_fp(notional / reference_price).ok()?;
            Some(OrderInput { order_id: None, side, order_type: OrderType::MarketIoc, qty, price: None, post_only: false, reduce_only: plan.reduce_only })
        }
        PlanAction::Exit => {
            let side = plan.side?;
            let qty = Fp::to_fp(plan.notional.unwrap_or(0.0) / reference_price.max(1e-9)).ok()?;
            Some(OrderInput { order_id: None, side, order_type: OrderType::MarketIoc, qty, price: None, post_only: false, reduce_only: true })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_requires_nothing() {
        let plan = parse_decision(r#"{"action":"HOLD"}"#).unwrap();
        assert_eq!(plan.action, PlanAction::Hold);
        assert!(plan_to_order(&plan, 100.0).is_none());
    }

    #[test]
    fn enter_without_side_is_rejected() {
        let err = parse_decision(r#"{"action":"ENTER","notional":100}"#).unwrap_err();
        assert!(matches!(err, PlanError::MissingSide));
    }

    #[test]
    fn enter_with_nonpositive_notional_is_rejected() {
        let err = parse_decision(r#"{"action":"ENTER","side":"LONG","notional":0}"#).unwrap_err();
        assert!(matches!(err, PlanError::InvalidNotional));
    }

    #[test]
    fn exit_without_reduce_only_is_rejected() {
        let err = parse_decision(r#"{"action":"EXIT","side":"LONG"}"#).unwrap_err();
        assert!(matches!(err, PlanError::ExitMustReduceOnly));
    }

    #[test]
    fn valid_enter_produces_market_order() {
        let plan = parse_decision(r#"{"action":"ENTER","side":"LONG","notional":1000}"#).unwrap();
        let order = plan_to_order(&plan, 100.0).unwrap();
        assert_eq!(order.side, Side::Long);
        assert_eq!(order.order_type, OrderType::MarketIoc);
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse_decision("not json").is_err());
    }
}
