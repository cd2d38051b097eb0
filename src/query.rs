//! Read-side helpers shared by the HTTP routes and the CLI.

use chrono::{DateTime, TimeZone};

use crate::stats::{summarize, TripSummary};
use crate::store::{LocationRecord, RecordStore, StoreError};
use crate::trips::{segment, Segmentation, TripOptions};

/// Inclusive time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

/// Records with `from_ms <= timestamp_ms <= to_ms`, ascending.
///
/// `from_ms >= to_ms` is [`StoreError::InvalidRange`].
pub async fn by_time_range<S: RecordStore>(
    store: &S,
    from_ms: i64,
    to_ms: i64,
) -> Result<Vec<LocationRecord>, StoreError> {
    store.query_range(from_ms, to_ms).await
}

/// Segment the whole store, or only the records inside `range`.
pub async fn trips<S: RecordStore>(
    store: &S,
    range: Option<TimeRange>,
    options: TripOptions,
) -> Result<Segmentation, StoreError> {
    let records = match range {
        Some(r) => by_time_range(store, r.from_ms, r.to_ms).await?,
        None => store.query_all().await?,
    };
    Ok(segment(&records, options))
}

/// Analytics over every trip in the store.
pub async fn summary<S: RecordStore, Tz: TimeZone>(
    store: &S,
    options: TripOptions,
    now: &DateTime<Tz>,
) -> Result<TripSummary, StoreError> {
    let segmentation = trips(store, None, options).await?;
    Ok(summarize(&segmentation.trips, now))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::{LocationStore, NewRecord};

    async fn seeded() -> LocationStore {
        let store = LocationStore::ephemeral();
        for (i, ts) in [0, 1_000, 2_000, 700_000, 701_000].into_iter().enumerate() {
            store
                .append(NewRecord {
                    latitude: 45.0 + 0.001 * i as f64,
                    longitude: -73.0,
                    timestamp_ms: ts,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn range_is_inclusive_and_validated() {
        let store = seeded().await;
        let hits = by_time_range(&store, 1_000, 700_000).await.unwrap();
        let ts: Vec<i64> = hits.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![1_000, 2_000, 700_000]);

        let err = by_time_range(&store, 5, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRange { from_ms: 5, to_ms: 5 }));
    }

    #[tokio::test]
    async fn trips_over_all_or_range() {
        let store = seeded().await;
        let all = trips(&store, None, TripOptions::default()).await.unwrap();
        assert_eq!(all.trips.len(), 2);
        assert_eq!(all.dropped_points, 0);

        let range = TimeRange {
            from_ms: 1_500,
            to_ms: 700_500,
        };
        let part = trips(&store, Some(range), TripOptions::default())
            .await
            .unwrap();
        // 2_000 and 700_000 are split by the gap and each left alone.
        assert!(part.trips.is_empty());
        assert_eq!(part.dropped_points, 2);
    }

    #[tokio::test]
    async fn summary_counts_trips() {
        let store = seeded().await;
        let summary = summary(&store, TripOptions::default(), &Utc::now())
            .await
            .unwrap();
        assert_eq!(summary.total_trips, 2);
        assert_eq!(summary.total_duration, 3_000);
    }
}
