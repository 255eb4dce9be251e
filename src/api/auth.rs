// =============================================================================
// Dual Bearer/Viewer Token Authentication — Axum Middleware
// =============================================================================
//
// Two token levels: a bearer token (`API_KEY_SECRET`) grants full read/write
// access; a viewer token (`READONLY_VIEW_TOKEN`) grants read-only access
// (GET/HEAD/OPTIONS only — enforced by route handlers using `AuthLevel`).
// Tokens arrive either as HTTP headers (`Authorization: Bearer <key>` /
// `X-Viewer-Token: <token>`) or, for WebSocket upgrades, as a subprotocol
// (`bearer.<base64url(key)>` / `viewer.<base64url(token)>`, alongside a
// `proxy-auth` marker subprotocol the server always echoes back).
// Comparison is constant-time to avoid timing side-channels. A loopback peer
// may bypass auth entirely when configured.
// =============================================================================

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use tracing::warn;

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical. Every byte of both slices is examined even after a mismatch is
/// found, so timing does not reveal where the strings first differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    Bearer,
    Viewer,
}

impl AuthLevel {
    pub fn can_write(self) -> bool {
        matches!(self, AuthLevel::Bearer)
    }
}

pub struct AuthContext {
    pub level: AuthLevel,
}

impl AuthContext {
    pub fn require_bearer(&self) -> Result<(), AuthRejection> {
        if self.level.can_write() {
            Ok(())
        } else {
            Err(forbidden("this operation requires a bearer token, not a viewer token"))
        }
    }
}

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "ok": false, "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

fn forbidden(message: &'static str) -> AuthRejection {
    AuthRejection { status: StatusCode::FORBIDDEN, message }
}

fn bearer_secret() -> String {
    std::env::var("API_KEY_SECRET").unwrap_or_default()
}

fn viewer_token() -> String {
    std::env::var("READONLY_VIEW_TOKEN").unwrap_or_default()
}

fn env_flag(key: &str) -> bool {
    matches!(std::env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn allow_localhost_no_auth() -> bool {
    env_flag("ALLOW_LOCALHOST_NO_AUTH")
}

/// When set, unauthenticated requests are granted viewer-level access rather
/// than rejected — for deployments that expose market-data reads publicly
/// while still gating writes behind a bearer token.
fn allow_public_market_data() -> bool {
    env_flag("ALLOW_PUBLIC_MARKET_DATA")
}

/// When set, a valid bearer token is downgraded to viewer level — the
/// deployment never accepts writes regardless of which token is presented.
fn external_readonly_mode() -> bool {
    env_flag("EXTERNAL_READONLY_MODE")
}

pub fn validate_bearer(token: &str) -> bool {
    let expected = bearer_secret();
    !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}

pub fn validate_viewer(token: &str) -> bool {
    let expected = viewer_token();
    !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}

fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Decode a single WebSocket subprotocol value into an auth level and raw
/// token, or `None` if it isn't one of the recognized `bearer.`/`viewer.`
/// prefixes (including the inert `proxy-auth` marker).
pub fn decode_subprotocol(proto: &str) -> Option<(AuthLevel, String)> {
    let (level, encoded) = if let Some(rest) = proto.strip_prefix("bearer.") {
        (AuthLevel::Bearer, rest)
    } else if let Some(rest) = proto.strip_prefix("viewer.") {
        (AuthLevel::Viewer, rest)
    } else {
        return None;
    };

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded).ok()?;
    let token = String::from_utf8(decoded).ok()?;
    Some((level, token))
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if bearer_secret().is_empty() {
            warn!("API_KEY_SECRET is not set — all authenticated requests will be rejected");
            return Err(forbidden("server authentication not configured"));
        }

        if allow_localhost_no_auth() {
            if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
                if is_loopback(addr) {
                    return Ok(AuthContext { level: AuthLevel::Bearer });
                }
            }
        }

        if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if validate_bearer(token) {
                    let level = if external_readonly_mode() { AuthLevel::Viewer } else { AuthLevel::Bearer };
                    return Ok(AuthContext { level });
                }
                warn!("invalid bearer token presented");
                return Err(forbidden("invalid authorization token"));
            }
        }

        if let Some(value) = parts.headers.get("X-Viewer-Token").and_then(|v| v.to_str().ok()) {
            if validate_viewer(value) {
                return Ok(AuthContext { level: AuthLevel::Viewer });
            }
            warn!("invalid viewer token presented");
            return Err(forbidden("invalid viewer token"));
        }

        if allow_public_market_data() {
            return Ok(AuthContext { level: AuthLevel::Viewer });
        }

        warn!("missing authorization");
        Err(forbidden("missing authorization"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn decode_subprotocol_rejects_unknown_prefix() {
        assert!(decode_subprotocol("proxy-auth").is_none());
    }

    #[test]
    fn decode_subprotocol_round_trips_bearer_token() {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("my-secret-key");
        let proto = format!("bearer.{encoded}");
        let (level, token) = decode_subprotocol(&proto).unwrap();
        assert_eq!(level, AuthLevel::Bearer);
        assert_eq!(token, "my-secret-key");
    }

    #[test]
    fn decode_subprotocol_round_trips_viewer_token() {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("view-only");
        let proto = format!("viewer.{encoded}");
        let (level, token) = decode_subprotocol(&proto).unwrap();
        assert_eq!(level, AuthLevel::Viewer);
        assert_eq!(token, "view-only");
    }

    #[test]
    fn viewer_cannot_write() {
        assert!(!AuthLevel::Viewer.can_write());
        assert!(AuthLevel::Bearer.can_write());
    }
}
