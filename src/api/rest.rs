// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All routes live directly under `/api/` (no version prefix). GET endpoints
// accept either a bearer or a viewer token; mutating endpoints require a
// bearer token. The `/api/ai-dry-run/*` surface mirrors `/api/dry-run/*`
// exactly, operating on a separate session table whose entries are driven by
// an external policy instead of the orchestrator.
//
// CORS is permissive for development; tighten `allowed_origins` in
// production deployments.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::ai_policy::{self, AiDecisionPlan};
use crate::api::auth::AuthContext;
use crate::app_state::AppState;
use crate::dry_run::OrderInput;
use crate::fp::Fp;
use crate::session::{Session, SessionError, SessionStatus};
use crate::types::{OrderType, Side, SessionState};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/dry-run/symbols", get(dryrun_symbols))
        .route("/api/dry-run/status", get(dryrun_status))
        .route("/api/dry-run/start", post(dryrun_start))
        .route("/api/dry-run/stop", post(dryrun_stop))
        .route("/api/dry-run/reset", post(dryrun_reset))
        .route("/api/dry-run/test-order", post(dryrun_test_order))
        .route("/api/ai-dry-run/symbols", get(dryrun_symbols))
        .route("/api/ai-dry-run/status", get(ai_status))
        .route("/api/ai-dry-run/start", post(ai_start))
        .route("/api/ai-dry-run/stop", post(ai_stop))
        .route("/api/ai-dry-run/reset", post(ai_reset))
        .route("/api/ai-dry-run/test-order", post(ai_test_order))
        .route("/api/ai-dry-run/decision", post(ai_decision))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Clone, Copy)]
enum SessionFamily {
    DryRun,
    Ai,
}

fn table<'a>(state: &'a AppState, family: SessionFamily) -> &'a parking_lot::RwLock<HashMap<String, Session>> {
    match family {
        SessionFamily::DryRun => &state.dry_run_sessions,
        SessionFamily::Ai => &state.ai_dry_run_sessions,
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(serde_json::json!({ "ok": false, "error": message.into() }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    state_version: u64,
    uptime_seconds: u64,
    decision_mode: String,
    symbols: Vec<String>,
    server_time: i64,
}

async fn health(auth: AuthContext, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = auth;
    Json(HealthResponse {
        ok: true,
        state_version: state.current_state_version(),
        uptime_seconds: state.uptime_seconds(),
        decision_mode: state.config.decision_mode.clone(),
        symbols: state.config.symbols.clone(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Symbols
// =============================================================================

async fn dryrun_symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true, "symbols": state.config.symbols }))
}

// =============================================================================
// Status
// =============================================================================

#[derive(Serialize)]
struct PositionDto {
    side: Side,
    qty: f64,
    entry_price: f64,
}

#[derive(Serialize)]
struct SessionStatusDto {
    symbol: String,
    state: SessionState,
    mark_price: Option<f64>,
    position: Option<PositionDto>,
    wallet_balance: Option<f64>,
    realized_pnl: f64,
    funding_pnl: f64,
    event_count: u64,
    log_tail: Vec<String>,
}

impl From<SessionStatus> for SessionStatusDto {
    fn from(s: SessionStatus) -> Self {
        Self {
            symbol: s.symbol,
            state: s.state,
            mark_price: s.mark_price.map(|p| p.from_fp()),
            position: s.position.map(|p| PositionDto { side: p.side, qty: p.qty.from_fp(), entry_price: p.entry_price.from_fp() }),
            wallet_balance: s.wallet_balance.map(|b| b.from_fp()),
            realized_pnl: s.realized_pnl.from_fp(),
            funding_pnl: s.funding_pnl.from_fp(),
            event_count: s.event_count,
            log_tail: s.log_tail,
        }
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    symbol: Option<String>,
}

fn status_impl(state: &AppState, query: StatusQuery, family: SessionFamily) -> axum::response::Response {
    let sessions = table(state, family).read();

    match query.symbol {
        Some(symbol) => match sessions.get(&symbol) {
            Some(session) => Json(serde_json::json!({ "ok": true, "status": SessionStatusDto::from(session.status()) })).into_response(),
            None => json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{symbol}'")),
        },
        None => {
            let all: Vec<SessionStatusDto> = sessions.values().map(|s| SessionStatusDto::from(s.status())).collect();
            Json(serde_json::json!({ "ok": true, "statuses": all })).into_response()
        }
    }
}

async fn dryrun_status(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> impl IntoResponse {
    status_impl(&state, query, SessionFamily::DryRun)
}

async fn ai_status(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> impl IntoResponse {
    status_impl(&state, query, SessionFamily::Ai)
}

// =============================================================================
// Start
// =============================================================================

#[derive(Deserialize)]
struct StartRequest {
    symbol: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    initial_wallet_balance: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiStartRequest {
    symbol: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    initial_wallet_balance: Option<f64>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    local_only: bool,
}

fn default_run_id(symbol: &str) -> String {
    format!("{symbol}-{}", chrono::Utc::now().timestamp_millis())
}

fn start_impl(
    state: &AppState,
    family: SessionFamily,
    symbol: &str,
    run_id: Option<String>,
    initial_wallet_balance: Option<f64>,
) -> axum::response::Response {
    let mut sessions = table(state, family).write();
    let Some(session) = sessions.get_mut(symbol) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{symbol}'"));
    };

    let run_id = run_id.unwrap_or_else(|| default_run_id(symbol));
    let initial_balance = Fp::to_fp(initial_wallet_balance.unwrap_or(10_000.0)).unwrap_or(Fp::ZERO);
    let params = state.engine_params();

    match session.start(run_id, &state.config.upstream.rest_host, &state.config.upstream.ws_host, initial_balance, params) {
        Ok(()) => {
            state.increment_version();
            info!(symbol, "dry-run session started");
            Json(serde_json::json!({ "ok": true, "status": SessionStatusDto::from(session.status()) })).into_response()
        }
        Err(e) => {
            warn!(symbol, error = %e, "failed to start dry-run session");
            json_error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

async fn dryrun_start(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<StartRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    start_impl(&state, SessionFamily::DryRun, &req.symbol, req.run_id, req.initial_wallet_balance)
}

async fn ai_start(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<AiStartRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    info!(symbol = %req.symbol, model = ?req.model, local_only = req.local_only, has_api_key = req.api_key.is_some(), "ai-dry-run start requested");
    start_impl(&state, SessionFamily::Ai, &req.symbol, req.run_id, req.initial_wallet_balance)
}

// =============================================================================
// Stop / Reset
// =============================================================================

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

fn stop_impl(state: &AppState, family: SessionFamily, symbol: &str) -> axum::response::Response {
    let mut sessions = table(state, family).write();
    let Some(session) = sessions.get_mut(symbol) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{symbol}'"));
    };
    session.stop();
    state.increment_version();
    Json(serde_json::json!({ "ok": true, "status": SessionStatusDto::from(session.status()) })).into_response()
}

fn reset_impl(state: &AppState, family: SessionFamily, symbol: &str) -> axum::response::Response {
    let mut sessions = table(state, family).write();
    let Some(session) = sessions.get_mut(symbol) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{symbol}'"));
    };
    session.reset();
    state.increment_version();
    Json(serde_json::json!({ "ok": true, "status": SessionStatusDto::from(session.status()) })).into_response()
}

async fn dryrun_stop(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<SymbolRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    stop_impl(&state, SessionFamily::DryRun, &req.symbol)
}

async fn ai_stop(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<SymbolRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    stop_impl(&state, SessionFamily::Ai, &req.symbol)
}

async fn dryrun_reset(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<SymbolRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    reset_impl(&state, SessionFamily::DryRun, &req.symbol)
}

async fn ai_reset(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<SymbolRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    reset_impl(&state, SessionFamily::Ai, &req.symbol)
}

// =============================================================================
// Manual test order
// =============================================================================

#[derive(Deserialize)]
struct TestOrderRequest {
    symbol: String,
    side: Side,
    #[serde(default)]
    qty: Option<f64>,
}

fn test_order_impl(state: &AppState, family: SessionFamily, req: TestOrderRequest) -> axum::response::Response {
    let mut sessions = table(state, family).write();
    let Some(session) = sessions.get_mut(&req.symbol) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{}'", req.symbol));
    };
    if session.state() != SessionState::Running {
        return json_error(StatusCode::CONFLICT, SessionError::NotRunning.to_string());
    }

    let qty = Fp::to_fp(req.qty.unwrap_or(0.001)).unwrap_or(Fp::ZERO);
    session.queue_test_order(OrderInput {
        order_id: None,
        side: req.side,
        order_type: OrderType::MarketIoc,
        qty,
        price: None,
        post_only: false,
        reduce_only: false,
    });
    state.increment_version();
    Json(serde_json::json!({ "ok": true, "queued": true })).into_response()
}

async fn dryrun_test_order(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<TestOrderRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    test_order_impl(&state, SessionFamily::DryRun, req)
}

async fn ai_test_order(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<TestOrderRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }
    test_order_impl(&state, SessionFamily::Ai, req)
}

// =============================================================================
// AI decision plan
// =============================================================================
//
// Accepts a raw decision plan body, validates it through `ai_policy`, and
// queues the resulting order on the ai-dry-run session for the next tick.
// A plan that fails validation never reaches the engine: it is recorded as
// an invalid response and the session is left to HOLD.

#[derive(Deserialize)]
struct DecisionRequest {
    symbol: String,
    plan: serde_json::Value,
}

async fn ai_decision(State(state): State<Arc<AppState>>, auth: AuthContext, Json(req): Json<DecisionRequest>) -> impl IntoResponse {
    if let Err(e) = auth.require_bearer() {
        return e.into_response();
    }

    let raw = match serde_json::to_string(&req.plan) {
        Ok(s) => s,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let plan: AiDecisionPlan = match ai_policy::parse_decision(&raw) {
        Ok(plan) => plan,
        Err(e) => {
            let count = state.record_invalid_ai_response();
            warn!(symbol = %req.symbol, error = %e, invalid_count = count, "ai decision plan rejected, holding");
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };

    let mut sessions = state.ai_dry_run_sessions.write();
    let Some(session) = sessions.get_mut(&req.symbol) else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown symbol '{}'", req.symbol));
    };
    if session.state() != SessionState::Running {
        return json_error(StatusCode::CONFLICT, SessionError::NotRunning.to_string());
    }

    let reference_price = session.status().mark_price.map(|p| p.from_fp()).unwrap_or(0.0);
    match ai_policy::plan_to_order(&plan, reference_price) {
        Some(order) => {
            session.queue_test_order(order);
            state.increment_version();
            Json(serde_json::json!({ "ok": true, "queued": true })).into_response()
        }
        None => Json(serde_json::json!({ "ok": true, "queued": false, "reason": "plan held or reference price unavailable" })).into_response(),
    }
}
