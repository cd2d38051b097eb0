//! Location record endpoints.
//!
//! - `GET /api/locations`: every record, or `?from=&to=` (inclusive, ms)
//! - `GET /api/locations/count`
//! - `GET /api/locations/changes?after=&timeout_ms=`: long-poll until the
//!   store revision moves past `after`
//! - `DELETE /api/locations`: remove all records

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{bad_request, store_error, ApiError};
use crate::query::by_time_range;
use crate::store::RecordStore;
use crate::AppState;

/// Default long-poll wait.
const DEFAULT_CHANGES_TIMEOUT_MS: u64 = 30_000;
/// Upper bound on a single long-poll.
const MAX_CHANGES_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl RangeQuery {
    /// `None` when neither bound is given; both or neither are required.
    pub(crate) fn bounds(&self) -> Result<Option<(i64, i64)>, ApiError> {
        match (self.from, self.to) {
            (None, None) => Ok(None),
            (Some(from), Some(to)) => Ok(Some((from, to))),
            _ => Err(bad_request("'from' and 'to' must be given together")),
        }
    }
}

/// `GET /api/locations`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = match query.bounds()? {
        Some((from, to)) => by_time_range(state.store.as_ref(), from, to).await,
        None => state.store.query_all().await,
    }
    .map_err(|e| store_error(&e))?;

    Ok(Json(json!({
        "count": records.len(),
        "records": records,
    })))
}

/// `GET /api/locations/count`
pub async fn count(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state.store.count().await.map_err(|e| store_error(&e))?;
    Ok(Json(json!({"count": count})))
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Last revision the client has seen. Omitted means "answer now".
    pub after: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// `GET /api/locations/changes`
///
/// Returns `{revision, changed}` as soon as the store revision exceeds
/// `after`, or with `changed: false` once the timeout elapses.
pub async fn changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Json<Value> {
    let mut rx = state.store.subscribe();
    let Some(after) = query.after else {
        return Json(json!({"revision": *rx.borrow(), "changed": true}));
    };

    let timeout = Duration::from_millis(
        query
            .timeout_ms
            .unwrap_or(DEFAULT_CHANGES_TIMEOUT_MS)
            .min(MAX_CHANGES_TIMEOUT_MS),
    );
    // The sender lives as long as the store, so `wait_for` only fails on
    // timeout.
    let _ = tokio::time::timeout(timeout, rx.wait_for(|rev| *rev > after)).await;

    let revision = *rx.borrow();
    Json(json!({"revision": revision, "changed": revision > after}))
}

/// `DELETE /api/locations`
pub async fn clear(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let removed = state.store.count().await.map_err(|e| store_error(&e))?;
    state.store.clear_all().await.map_err(|e| store_error(&e))?;
    info!("Cleared {removed} location records via API");
    let _ = state.events.send(json!({
        "type": "locations.cleared",
        "removed": removed,
    }));
    Ok(Json(json!({"cleared": removed})))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::testing::{self, call};
    use crate::store::{NewRecord, RecordStore};

    async fn seed(state: &crate::AppState, timestamps: &[i64]) {
        for (i, &ts) in timestamps.iter().enumerate() {
            state
                .store
                .append(NewRecord {
                    latitude: 45.0 + 0.001 * i as f64,
                    longitude: -73.0,
                    timestamp_ms: ts,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn lists_all_and_ranges() {
        let state = testing::state();
        seed(&state, &[3_000, 1_000, 2_000]).await;

        let (status, body) = call(&state, "GET", "/api/locations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);
        assert_eq!(body["records"][0]["timestampMs"], 1_000);

        let (status, body) = call(&state, "GET", "/api/locations?from=1000&to=2000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["records"][1]["timestampMs"], 2_000);
    }

    #[tokio::test]
    async fn invalid_ranges_are_bad_requests() {
        let state = testing::state();
        let (status, body) = call(&state, "GET", "/api/locations?from=5&to=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid range"));

        let (status, _) = call(&state, "GET", "/api/locations?from=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn count_and_clear() {
        let state = testing::state();
        seed(&state, &[1_000, 2_000]).await;
        let mut events = state.events.subscribe();

        let (_, body) = call(&state, "GET", "/api/locations/count").await;
        assert_eq!(body["count"], 2);

        let (status, body) = call(&state, "DELETE", "/api/locations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 2);
        assert_eq!(events.recv().await.unwrap()["type"], "locations.cleared");

        let (_, body) = call(&state, "GET", "/api/locations/count").await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn changes_times_out_without_writes() {
        let state = testing::state();
        let (status, body) =
            call(&state, "GET", "/api/locations/changes?after=0&timeout_ms=20").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], false);
        assert_eq!(body["revision"], 0);
    }

    #[tokio::test]
    async fn changes_wakes_on_append() {
        let state = testing::state();
        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            seed(&writer, &[1_000]).await;
        });

        let (_, body) =
            call(&state, "GET", "/api/locations/changes?after=0&timeout_ms=5000").await;
        assert_eq!(body["changed"], true);
        assert_eq!(body["revision"], 1);
    }
}
