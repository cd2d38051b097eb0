//! Trip segmentation: split a time-ordered record stream at long pauses.
//!
//! A single forward pass groups consecutive records; a gap of at least
//! `gap_ms` between two neighbours closes the current group. Groups with
//! fewer than `min_points` records are dropped. Trips are derived on demand
//! and never persisted.

use serde::{Deserialize, Serialize};

use crate::geo::path_length_meters;
use crate::store::LocationRecord;

/// Default pause that splits two trips (10 minutes).
pub const DEFAULT_GAP_MS: i64 = 10 * 60 * 1000;
/// Default minimum number of records in a trip.
pub const DEFAULT_MIN_POINTS: usize = 2;

/// A contiguous run of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: i64,
    /// Sum of the great-circle legs between consecutive points.
    pub distance_meters: f64,
    pub points: Vec<LocationRecord>,
}

impl Trip {
    fn from_points(points: Vec<LocationRecord>) -> Option<Self> {
        let start_time = points.first()?.timestamp_ms;
        let end_time = points.last()?.timestamp_ms;
        Some(Self {
            start_time,
            end_time,
            duration_ms: end_time - start_time,
            distance_meters: path_length_meters(&points),
            points,
        })
    }

    /// Average speed over the whole trip; 0 for a zero-duration trip.
    #[allow(clippy::cast_precision_loss)]
    pub fn average_speed_kmh(&self) -> f64 {
        if self.duration_ms <= 0 {
            return 0.0;
        }
        (self.distance_meters / 1000.0) / (self.duration_ms as f64 / 3_600_000.0)
    }
}

/// Segmentation tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripOptions {
    pub gap_ms: i64,
    pub min_points: usize,
}

/// Rejected [`TripOptions`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TripOptionsError {
    #[error("'gap_ms' must be positive, got {0}")]
    NonPositiveGap(i64),
}

impl TripOptions {
    /// A gap of zero or less would put every point in its own group.
    pub fn validate(self) -> Result<Self, TripOptionsError> {
        if self.gap_ms <= 0 {
            return Err(TripOptionsError::NonPositiveGap(self.gap_ms));
        }
        Ok(self)
    }
}

impl Default for TripOptions {
    fn default() -> Self {
        Self {
            gap_ms: DEFAULT_GAP_MS,
            min_points: DEFAULT_MIN_POINTS,
        }
    }
}

/// Trips plus how many input records ended up in no trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation {
    pub trips: Vec<Trip>,
    pub dropped_points: usize,
}

/// Split `points` (ascending `timestamp_ms`) into trips.
pub fn segment_trips(points: &[LocationRecord], gap_ms: i64, min_points: usize) -> Vec<Trip> {
    segment(points, TripOptions { gap_ms, min_points }).trips
}

/// Like [`segment_trips`], also counting records in dropped groups.
pub fn segment(points: &[LocationRecord], options: TripOptions) -> Segmentation {
    let mut out = Segmentation::default();
    let mut current: Vec<LocationRecord> = Vec::new();

    for point in points {
        if let Some(prev) = current.last() {
            if point.timestamp_ms - prev.timestamp_ms >= options.gap_ms {
                close_group(&mut out, std::mem::take(&mut current), options.min_points);
            }
        }
        current.push(point.clone());
    }
    close_group(&mut out, current, options.min_points);
    out
}

fn close_group(out: &mut Segmentation, group: Vec<LocationRecord>, min_points: usize) {
    if group.is_empty() {
        return;
    }
    if group.len() < min_points {
        out.dropped_points += group.len();
        return;
    }
    if let Some(trip) = Trip::from_points(group) {
        out.trips.push(trip);
    }
}
