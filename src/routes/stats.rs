//! `GET /api/stats`: trip analytics in the local time zone.

use axum::extract::State;
use axum::Json;
use chrono::Local;
use serde_json::{json, Value};

use super::{store_error, ApiError};
use crate::query;
use crate::stats::{format_distance, format_duration};
use crate::AppState;

pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = query::summary(
        state.store.as_ref(),
        state.config.trips.options(),
        &Local::now(),
    )
    .await
    .map_err(|e| store_error(&e))?;

    let display = json!({
        "totalDistance": format_distance(summary.total_distance),
        "totalDuration": format_duration(summary.total_duration),
        "avgSpeed": format!("{:.1} km/h", summary.avg_speed),
    });
    Ok(Json(json!({
        "summary": summary,
        "display": display,
    })))
}
