//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::store::RecordStore;
use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, record count and the tracking summary.
/// A store read failure degrades `status` instead of failing the probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let (status, records) = match state.store.count().await {
        Ok(n) => ("ok", Some(n)),
        Err(_) => ("degraded", None),
    };
    let tracking = state.coordinator.status().await;

    Json(json!({
        "status": status,
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "records": records,
        "revision": state.store.revision(),
        "tracking": {
            "started": tracking.started,
            "foreground": tracking.foreground,
            "background": tracking.background,
            "backgroundEnabled": tracking.background_enabled,
        },
    }))
}
