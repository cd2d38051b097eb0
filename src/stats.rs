//! Trip analytics for dashboards and the `stats` subcommand.

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeZone};
use serde::Serialize;

use crate::trips::Trip;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const CHART_DAYS: u64 = 7;

/// Aggregate view over a set of trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSummary {
    pub total_trips: usize,
    /// Meters.
    pub total_distance: f64,
    /// Milliseconds.
    pub total_duration: i64,
    /// km/h over all trips; 0 when there is no moving time.
    pub avg_speed: f64,
    /// Trips starting at or after local midnight.
    pub today_trips: usize,
    /// Trips starting in the last 7 × 24 h.
    pub week_trips: usize,
    pub longest_trip: Option<TripDigest>,
    /// Oldest first. Empty when there are no trips.
    pub daily_stats: Vec<DailyStat>,
}

/// A trip without its points.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripDigest {
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: i64,
    pub distance_meters: f64,
    pub point_count: usize,
}

impl From<&Trip> for TripDigest {
    fn from(trip: &Trip) -> Self {
        Self {
            start_time: trip.start_time,
            end_time: trip.end_time,
            duration_ms: trip.duration_ms,
            distance_meters: trip.distance_meters,
            point_count: trip.points.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub date: NaiveDate,
    /// Short weekday name ("Mon").
    pub day: String,
    pub distance_km: f64,
    pub trips: usize,
}

/// Summarize `trips` relative to `now`; "today" and the daily buckets follow
/// the calendar of `now`'s time zone.
#[allow(clippy::cast_precision_loss)]
pub fn summarize<Tz: TimeZone>(trips: &[Trip], now: &DateTime<Tz>) -> TripSummary {
    if trips.is_empty() {
        return TripSummary::default();
    }

    let tz = now.timezone();
    let today = now.date_naive();
    let today_start = local_midnight_ms(&tz, today);
    let week_ago = now.timestamp_millis() - 7 * DAY_MS;

    let total_distance: f64 = trips.iter().map(|t| t.distance_meters).sum();
    let total_duration: i64 = trips.iter().map(|t| t.duration_ms).sum();
    let avg_speed = if total_duration > 0 {
        (total_distance / 1000.0) / (total_duration as f64 / 3_600_000.0)
    } else {
        0.0
    };

    let mut longest: Option<&Trip> = None;
    for trip in trips {
        if longest.map_or(true, |l| trip.distance_meters > l.distance_meters) {
            longest = Some(trip);
        }
    }

    let daily_stats = (0..CHART_DAYS)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .map(|date| {
            let start = local_midnight_ms(&tz, date);
            let end = date
                .checked_add_days(Days::new(1))
                .map_or(start + DAY_MS, |next| local_midnight_ms(&tz, next));
            let (distance, count) = trips
                .iter()
                .filter(|t| t.start_time >= start && t.start_time < end)
                .fold((0.0, 0), |(d, n), t| (d + t.distance_meters, n + 1));
            DailyStat {
                date,
                day: date.format("%a").to_string(),
                distance_km: distance / 1000.0,
                trips: count,
            }
        })
        .collect();

    TripSummary {
        total_trips: trips.len(),
        total_distance,
        total_duration,
        avg_speed,
        today_trips: trips.iter().filter(|t| t.start_time >= today_start).count(),
        week_trips: trips.iter().filter(|t| t.start_time >= week_ago).count(),
        longest_trip: longest.map(TripDigest::from),
        daily_stats,
    }
}

/// Midnight of `date` in `tz`, in epoch milliseconds.
fn local_midnight_ms<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.timestamp_millis(),
        // Midnight skipped by a DST jump.
        LocalResult::None => tz.from_utc_datetime(&midnight).timestamp_millis(),
    }
}

/// "1.2 km" from one kilometer up, "350 m" below.
pub fn format_distance(meters: f64) -> String {
    let km = meters / 1000.0;
    if km >= 1.0 {
        format!("{km:.1} km")
    } else {
        format!("{} m", meters.round())
    }
}

/// "1h 5m" from one hour up, "12 min" below.
pub fn format_duration(ms: i64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes} min")
    }
}
