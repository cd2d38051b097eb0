//! Ingestion pipeline control.
//!
//! - `GET /api/tracking`: producer states and counters
//! - `POST /api/tracking/background`: flip background tracking

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::tracking::TrackingStatus;
use crate::AppState;

pub async fn status(State(state): State<AppState>) -> Json<TrackingStatus> {
    Json(state.coordinator.status().await)
}

/// Always 200: a refusal (missing permission) shows up as
/// `backgroundEnabled: false` plus the producer status.
pub async fn toggle_background(State(state): State<AppState>) -> Json<Value> {
    let enabled = state.coordinator.toggle_background().await;
    let status = state.coordinator.status().await;
    Json(json!({
        "backgroundEnabled": enabled,
        "background": status.background,
    }))
}
