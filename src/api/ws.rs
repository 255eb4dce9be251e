// =============================================================================
// WebSocket Handler — per-symbol metrics fan-out
// =============================================================================
//
// Clients connect to `/ws?symbols=X,Y,...` (symbols omitted subscribes to
// every configured symbol) and authenticate via the `Sec-WebSocket-Protocol`
// header: `proxy-auth, bearer.<base64url(key)>` or `proxy-auth,
// viewer.<base64url(token)>`. A loopback peer may skip this when
// `ALLOW_LOCALHOST_NO_AUTH` is set.
//
// Each subscribed symbol is backed by its own `broadcast` channel fed by the
// Symbol Coordinator; a slow client naturally drops intermediate frames
// (tokio's broadcast channel skips ahead on lag) rather than blocking the
// publisher or buffering without bound. One writer task per connection.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::{decode_subprotocol, validate_bearer, validate_viewer, AuthLevel};
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    symbols: Option<String>,
}

fn is_loopback(addr: SocketAddr) -> bool {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.is_loopback(),
        std::net::IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Extract an auth level from the offered subprotocols, if any is valid.
fn authenticate_subprotocols(headers: &HeaderMap) -> Option<AuthLevel> {
    let raw = headers.get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    for proto in raw.split(',').map(|p| p.trim()) {
        if let Some((level, token)) = decode_subprotocol(proto) {
            let valid = match level {
                AuthLevel::Bearer => validate_bearer(&token),
                AuthLevel::Viewer => validate_viewer(&token),
            };
            if valid {
                return Some(level);
            }
        }
    }
    None
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let auth_level = authenticate_subprotocols(&headers).or_else(|| {
        if state.config.auth.allow_localhost_no_auth && is_loopback(addr) {
            Some(AuthLevel::Bearer)
        } else {
            None
        }
    });

    let Some(_level) = auth_level else {
        warn!(%addr, "websocket upgrade rejected: no valid auth subprotocol");
        return (axum::http::StatusCode::FORBIDDEN, "missing or invalid authorization").into_response();
    };

    let requested: Vec<String> = match query.symbols {
        Some(raw) => raw.split(',').map(|s| s.trim().to_ascii_uppercase()).filter(|s| !s.is_empty()).collect(),
        None => state.config.symbols.clone(),
    };
    let subscriptions: Vec<String> = requested.into_iter().filter(|s| state.metrics_tx.contains_key(s)).collect();

    info!(%addr, symbols = ?subscriptions, "websocket connection accepted");
    ws.protocols(["proxy-auth"]).on_upgrade(move |socket| handle_connection(socket, state, subscriptions))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, subscriptions: Vec<String>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (forward_tx, mut forward_rx) = tokio::sync::mpsc::channel::<Arc<String>>(state.config.client_backpressure_limit.max(8));

    let mut forward_tasks = Vec::with_capacity(subscriptions.len());
    for symbol in &subscriptions {
        let Some(tx) = state.metrics_tx.get(symbol) else { continue };
        let mut rx = tx.subscribe();
        let forward_tx = forward_tx.clone();
        forward_tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if forward_tx.try_send(frame).is_err() {
                            debug!("dropping metrics frame: client channel full");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "client lagged, dropped intermediate metrics frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
    drop(forward_tx);

    loop {
        tokio::select! {
            frame = forward_rx.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text((*text).clone().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for task in forward_tasks {
        task.abort();
    }
    info!(symbols = ?subscriptions, "websocket connection closed");
}
