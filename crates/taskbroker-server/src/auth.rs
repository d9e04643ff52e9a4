//! Admin bearer-token and agent-identity enforcement for the HTTP
//! admission surface.

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

/// Compare two secrets in constant time with respect to their shorter
/// length, so a mismatching request can't be timed to learn the admin
/// token byte-by-byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Reject any request whose `Authorization: Bearer <token>` header does
/// not match the configured admin token.
pub async fn require_admin_token(
    axum::extract::State(expected): axum::extract::State<std::sync::Arc<String>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = bearer_token(request.headers()).unwrap_or("");
    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// Extract the calling agent's id from `X-Agent-ID`, used both to
/// attribute task lifecycle requests and as the rate-limiter key.
pub fn agent_id(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Agent-ID").and_then(|v| v.to_str().ok())
}

/// Reject any request to the agent-facing surface that's missing
/// `X-Agent-ID`. `/health` is mounted outside this layer and never sees it.
pub async fn require_agent_id(request: Request, next: Next) -> Result<Response, StatusCode> {
    if agent_id(request.headers()).is_some_and(|id| !id.is_empty()) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
