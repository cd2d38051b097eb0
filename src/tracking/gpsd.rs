//! Position source backed by a local gpsd daemon.
//!
//! Each [`PositionSource::watch`] call spawns its own connection task: it
//! connects to gpsd, enables JSON watch mode, and turns `TPV` reports into
//! [`Fix`]es. Reports without a 2D/3D fix, or whose horizontal error estimate
//! (`eph`) exceeds the requested [`AccuracyTier`](super::capability::AccuracyTier),
//! are skipped. The [`EmitPolicy`] then thins the stream to the requested
//! time/distance cadence.
//!
//! Connection failures are retried with exponential backoff. The task exits
//! as soon as the receiver is dropped.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::capability::{PositionSource, SourceError, SourceOptions};
use crate::config::SourceConfig;
use crate::gate::Fix;
use crate::geo::distance_meters;
use crate::util::now_ms;

/// Enables JSON reports on the connection.
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// Fixes buffered between the connection task and the producer.
const CHANNEL_CAPACITY: usize = 64;

/// Floor for the reconnect backoff.
const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Why a gpsd connection ended.
#[derive(Debug, thiserror::Error)]
pub enum GpsdError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("send WATCH: {0}")]
    Watch(std::io::Error),
    #[error("read: {0}")]
    Read(std::io::Error),
}

/// gpsd-backed [`PositionSource`].
pub struct GpsdSource {
    addr: String,
    reconnect_delay: Duration,
    reconnect_max_delay: Duration,
}

impl GpsdSource {
    /// Delays below one second are raised to one second.
    #[must_use]
    pub fn new(config: &SourceConfig) -> Self {
        let reconnect_delay =
            Duration::from_secs(config.reconnect_delay_secs).max(MIN_RECONNECT_DELAY);
        Self {
            addr: config.gpsd_addr.clone(),
            reconnect_delay,
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs)
                .max(reconnect_delay),
        }
    }
}

impl PositionSource for GpsdSource {
    fn watch(&self, options: SourceOptions) -> Result<mpsc::Receiver<Fix>, SourceError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SourceError::Unavailable(format!("no async runtime: {e}")))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        runtime.spawn(watch_loop(
            self.addr.clone(),
            self.reconnect_delay,
            self.reconnect_max_delay,
            options,
            tx,
        ));
        Ok(rx)
    }
}

/// Reconnect loop for one subscriber.
async fn watch_loop(
    addr: String,
    base_delay: Duration,
    max_delay: Duration,
    options: SourceOptions,
    tx: mpsc::Sender<Fix>,
) {
    let mut policy = EmitPolicy::new(&options);
    let mut delay = base_delay;

    loop {
        info!("gpsd: connecting to {addr}");
        tokio::select! {
            () = tx.closed() => break,
            result = stream_reports(&addr, &options, &mut policy, &tx) => match result {
                Ok(()) => {
                    info!("gpsd: connection to {addr} closed, reconnecting");
                    delay = base_delay;
                }
                Err(e) => {
                    warn!("gpsd: {e}, retrying in {}s", delay.as_secs());
                }
            },
        }

        tokio::select! {
            () = tx.closed() => break,
            () = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, max_delay);
    }
    debug!("gpsd: subscriber gone, closing watch on {addr}");
}

fn next_delay(delay: Duration, max_delay: Duration) -> Duration {
    (delay * 2).max(MIN_RECONNECT_DELAY).min(max_delay)
}

/// Read reports from one connection until it closes or the receiver goes away.
async fn stream_reports(
    addr: &str,
    options: &SourceOptions,
    policy: &mut EmitPolicy,
    tx: &mpsc::Sender<Fix>,
) -> Result<(), GpsdError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| GpsdError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream
        .write_all(WATCH_COMMAND)
        .await
        .map_err(GpsdError::Watch)?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await.map_err(GpsdError::Read)? {
        match parse_report(&line, options.accuracy.max_error_m()) {
            Ok(fix) => {
                if let Some(fix) = policy.offer(fix) {
                    if tx.send(fix).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(Skip::Inaccurate(eph)) => debug!("gpsd: skipping fix with eph {eph:.0}m"),
            Err(Skip::Malformed(e)) => debug!("gpsd: unparseable report: {e}"),
            Err(Skip::NotTpv | Skip::NoFix) => {}
        }
    }
    Ok(())
}

/// Why a gpsd report produced no fix.
#[derive(Debug, Clone, PartialEq)]
pub enum Skip {
    /// Not a `TPV` report (VERSION, DEVICES, SKY, ...).
    NotTpv,
    /// TPV without a 2D/3D fix.
    NoFix,
    /// Horizontal error estimate above the accuracy limit.
    Inaccurate(f64),
    Malformed(String),
}

#[derive(Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    time: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    eph: Option<f64>,
}

/// Parse one gpsd JSON line into a fix.
///
/// ```text
/// {"class":"TPV","mode":3,"time":"2024-06-10T12:00:00.000Z","lat":45.5,"lon":-73.5,"eph":4.1}
/// ```
pub fn parse_report(line: &str, max_error_m: f64) -> Result<Fix, Skip> {
    let report: Report = serde_json::from_str(line).map_err(|e| Skip::Malformed(e.to_string()))?;
    if report.class != "TPV" {
        return Err(Skip::NotTpv);
    }
    if report.mode < 2 {
        return Err(Skip::NoFix);
    }
    let (Some(latitude), Some(longitude)) = (report.lat, report.lon) else {
        return Err(Skip::NoFix);
    };
    if let Some(eph) = report.eph {
        if eph > max_error_m {
            return Err(Skip::Inaccurate(eph));
        }
    }

    let captured_at_ms = report
        .time
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map_or_else(now_ms, |t| t.timestamp_millis());

    Ok(Fix {
        latitude,
        longitude,
        captured_at_ms,
    })
}

/// Time/distance thinning of a fix stream.
///
/// A fix passes if `min_time_interval_ms` has elapsed since the last emitted
/// fix, or the object moved at least `min_distance_interval_m` from it.
#[derive(Debug, Clone)]
pub struct EmitPolicy {
    min_interval_ms: i64,
    min_distance_m: f64,
    last: Option<Fix>,
}

impl EmitPolicy {
    pub fn new(options: &SourceOptions) -> Self {
        Self {
            min_interval_ms: i64::try_from(options.min_time_interval_ms).unwrap_or(i64::MAX),
            min_distance_m: options.min_distance_interval_m,
            last: None,
        }
    }

    pub fn offer(&mut self, fix: Fix) -> Option<Fix> {
        if let Some(last) = &self.last {
            let elapsed = fix.captured_at_ms - last.captured_at_ms;
            let moved = distance_meters(last, &fix);
            if elapsed < self.min_interval_ms && moved < self.min_distance_m {
                return None;
            }
        }
        self.last = Some(fix);
        Some(fix)
    }
}
