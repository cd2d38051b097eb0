//! `GET /api/trips`: trips segmented from the stored records.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::locations::RangeQuery;
use super::{bad_request, store_error, ApiError};
use crate::query::{self, TimeRange};
use crate::trips::{Segmentation, TripOptions};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TripsQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    /// Overrides `[trips] gap_ms`.
    pub gap_ms: Option<i64>,
    /// Overrides `[trips] min_points`.
    pub min_points: Option<usize>,
}

/// `GET /api/trips?from=&to=&gap_ms=&min_points=`
pub async fn trips(
    State(state): State<AppState>,
    Query(query): Query<TripsQuery>,
) -> Result<Json<Segmentation>, ApiError> {
    let defaults = state.config.trips.options();
    let options = TripOptions {
        gap_ms: query.gap_ms.unwrap_or(defaults.gap_ms),
        min_points: query.min_points.unwrap_or(defaults.min_points),
    }
    .validate()
    .map_err(|e| bad_request(e.to_string()))?;

    let range = RangeQuery {
        from: query.from,
        to: query.to,
    }
    .bounds()?
    .map(|(from_ms, to_ms)| TimeRange { from_ms, to_ms });

    let segmentation = query::trips(state.store.as_ref(), range, options)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(segmentation))
}
