//! Pre-shared API key authentication.
//!
//! Every endpoint except `/api/health` requires an
//! `Authorization: Bearer <key>` header matching `[auth] api_key`.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension carrying the expected key, layered onto the router so the
/// middleware does not depend on `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Reject requests without a valid Bearer key.
///
/// - `401 Unauthorized`: header missing or not a Bearer token
/// - `403 Forbidden`: wrong key
/// - `500 Internal Server Error`: [`ApiKey`] extension missing
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Byte comparison whose running time depends only on `expected.len()`.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_keys() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
