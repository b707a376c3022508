use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::Mac;
use sha2::Sha256;

use super::AppState;

type HmacSha256 = hmac::Hmac<Sha256>;

const TOKEN_MAC_KEY: &[u8] = b"vmkeeper-api-token";

pub(crate) fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

/// Constant-time comparison: both tokens are MACed under a fixed key and the tags
/// compared with `verify_slice`.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let tag = |token: &str| {
        <HmacSha256 as Mac>::new_from_slice(TOKEN_MAC_KEY).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (tag(expected), tag(presented)) {
        (Ok(expected), Ok(presented)) => presented
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // No token configured: open access only on loopback
    let Some(expected) = state.api_token.as_deref().filter(|t| !t.is_empty()) else {
        if is_loopback_host(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No API token configured. Set [api] token in config.toml before exposing on a non-loopback address.",
        );
    };

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match presented {
        Some(token) if tokens_match(expected, token) => next.run(req).await,
        Some(_) => unauthorized("Invalid API token"),
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
    }
}
