//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `WAYTRACK_API_KEY`, `WAYTRACK_LISTEN`,
//!    `WAYTRACK_DATA_DIR`
//! 2. **Config file**: path via `--config <path>`, or `waytrack.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8470"
//! data_dir = "~/.local/share/waytrack"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//!
//! [tracking]
//! move_threshold_m = 50.0
//! watchdog_interval_secs = 900
//! background_on_start = false
//!
//! [tracking.foreground]
//! accuracy = "balanced"
//! time_interval_ms = 5000
//! distance_interval_m = 10.0
//!
//! [tracking.background]
//! accuracy = "balanced"
//! time_interval_ms = 5000
//! distance_interval_m = 10.0
//!
//! [trips]
//! gap_ms = 600000
//! min_points = 2
//!
//! [source]
//! gpsd_addr = "127.0.0.1:2947"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//!
//! [permissions]
//! foreground = true
//! background = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::gate::DEFAULT_MOVE_THRESHOLD_M;
use crate::tracking::capability::{AccuracyTier, SourceOptions};
use crate::trips::{TripOptions, TripOptionsError};
use crate::util::expand_tilde;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "waytrack.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid [trips] section: {0}")]
    Trips(#[from] TripOptionsError),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub trips: TripsConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

/// HTTP server and storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:8470`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding `locations.jsonl`. `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `WAYTRACK_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Ingestion pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum spacing between consecutive records in meters (default 50).
    #[serde(default = "default_move_threshold")]
    pub move_threshold_m: f64,
    /// How often the watchdog checks the background producer (default 900 s).
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Enable background tracking as soon as the daemon starts (default false).
    #[serde(default)]
    pub background_on_start: bool,
    #[serde(default)]
    pub foreground: ProducerConfig,
    #[serde(default)]
    pub background: ProducerConfig,
}

/// Cadence requested from the position source for one producer.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub accuracy: AccuracyTier,
    /// Default 5000 ms.
    #[serde(default = "default_time_interval")]
    pub time_interval_ms: u64,
    /// Default 10 m.
    #[serde(default = "default_distance_interval")]
    pub distance_interval_m: f64,
}

impl ProducerConfig {
    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            accuracy: self.accuracy,
            min_time_interval_ms: self.time_interval_ms,
            min_distance_interval_m: self.distance_interval_m,
        }
    }
}

/// Trip segmentation defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct TripsConfig {
    /// A pause at least this long starts a new trip (default 600 000 ms).
    #[serde(default = "default_gap_ms")]
    pub gap_ms: i64,
    /// Trips with fewer points are dropped (default 2).
    #[serde(default = "default_min_points")]
    pub min_points: usize,
}

impl TripsConfig {
    pub fn options(&self) -> TripOptions {
        TripOptions {
            gap_ms: self.gap_ms,
            min_points: self.min_points,
        }
    }
}

/// gpsd connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Default `127.0.0.1:2947`.
    #[serde(default = "default_gpsd_addr")]
    pub gpsd_addr: String,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Location permissions granted to the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "default_true")]
    pub foreground: bool,
    #[serde(default = "default_true")]
    pub background: bool,
}

fn default_listen() -> String {
    "127.0.0.1:8470".to_string()
}
fn default_data_dir() -> String {
    "~/.local/share/waytrack".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_move_threshold() -> f64 {
    DEFAULT_MOVE_THRESHOLD_M
}
fn default_watchdog_interval() -> u64 {
    15 * 60
}
fn default_time_interval() -> u64 {
    5000
}
fn default_distance_interval() -> f64 {
    10.0
}
fn default_gap_ms() -> i64 {
    10 * 60 * 1000
}
fn default_min_points() -> usize {
    2
}
fn default_gpsd_addr() -> String {
    "127.0.0.1:2947".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            move_threshold_m: default_move_threshold(),
            watchdog_interval_secs: default_watchdog_interval(),
            background_on_start: false,
            foreground: ProducerConfig::default(),
            background: ProducerConfig::default(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            accuracy: AccuracyTier::default(),
            time_interval_ms: default_time_interval(),
            distance_interval_m: default_distance_interval(),
        }
    }
}

impl Default for TripsConfig {
    fn default() -> Self {
        Self {
            gap_ms: default_gap_ms(),
            min_points: default_min_points(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            gpsd_addr: default_gpsd_addr(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            foreground: true,
            background: true,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `waytrack.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        // Env var overrides
        if let Ok(key) = std::env::var("WAYTRACK_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("WAYTRACK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("WAYTRACK_DATA_DIR") {
            config.server.data_dir = dir;
        }

        config.trips.options().validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.server.data_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8470");
        assert!((config.tracking.move_threshold_m - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.tracking.watchdog_interval_secs, 900);
        assert_eq!(config.tracking.foreground.time_interval_ms, 5000);
        assert_eq!(config.tracking.background.accuracy, AccuracyTier::Balanced);
        assert_eq!(config.trips.gap_ms, 600_000);
        assert_eq!(config.trips.min_points, 2);
        assert!(config.permissions.foreground && config.permissions.background);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [tracking]
            move_threshold_m = 25.0

            [tracking.background]
            accuracy = "high"
            time_interval_ms = 30000

            [trips]
            min_points = 5

            [permissions]
            background = false
            "#,
        )
        .unwrap();
        assert!((config.tracking.move_threshold_m - 25.0).abs() < f64::EPSILON);
        assert_eq!(config.tracking.watchdog_interval_secs, 900);
        assert_eq!(config.tracking.background.accuracy, AccuracyTier::High);
        assert_eq!(config.tracking.background.time_interval_ms, 30_000);
        assert!((config.tracking.background.distance_interval_m - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.trips.min_points, 5);
        assert_eq!(config.trips.gap_ms, 600_000);
        assert!(config.permissions.foreground);
        assert!(!config.permissions.background);
    }

    #[test]
    fn unknown_accuracy_is_a_parse_error() {
        let err = Config::parse("[tracking.foreground]\naccuracy = \"psychic\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/waytrack.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn zero_trip_gap_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waytrack.toml");
        std::fs::write(&path, "[trips]\ngap_ms = 0\n").unwrap();
        let err = Config::load(path.to_str()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Trips(TripOptionsError::NonPositiveGap(0))
        ));
    }
}
