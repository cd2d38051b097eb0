//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware.

pub mod events;
pub mod health;
pub mod locations;
pub mod stats;
pub mod tracking;
pub mod trips;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{self, ApiKey};
use crate::store::StoreError;
use crate::AppState;

/// Error half of every fallible handler.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

/// Invalid ranges are the caller's fault; everything else is ours.
pub(crate) fn store_error(e: &StoreError) -> ApiError {
    match e {
        StoreError::InvalidRange { .. } => bad_request(e.to_string()),
        _ => {
            warn!("Store error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// Build the full router: public health probe plus the authenticated API.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route(
            "/api/locations",
            get(locations::list).delete(locations::clear),
        )
        .route("/api/locations/count", get(locations::count))
        .route("/api/locations/changes", get(locations::changes))
        .route("/api/trips", get(trips::trips))
        .route("/api/stats", get(stats::stats))
        .route("/api/tracking", get(tracking::status))
        .route("/api/tracking/background", post(tracking::toggle_background))
        .route("/api/events", get(events::event_stream))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
