#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # waytrack
//!
//! Location recording daemon. Fixes from gpsd pass through a movement gate
//! (one record per 50 m of movement by default), land in a durable JSONL
//! journal, and are served back as raw records, trips and trip statistics.
//!
//! ## Subcommands
//!
//! - `waytrack serve` (default): run the recorder and HTTP API
//! - `waytrack trips`: print trips from the data directory
//! - `waytrack stats`: print trip analytics from the data directory
//!
//! ## API surface
//!
//! | Method | Path                         | Auth | Description                        |
//! |--------|------------------------------|------|------------------------------------|
//! | GET    | `/api/health`                | No   | Liveness probe                     |
//! | GET    | `/api/locations`             | Yes  | Records, optionally `?from=&to=`   |
//! | DELETE | `/api/locations`             | Yes  | Remove all records                 |
//! | GET    | `/api/locations/count`       | Yes  | Record count                       |
//! | GET    | `/api/locations/changes`     | Yes  | Long-poll on store revision        |
//! | GET    | `/api/trips`                 | Yes  | Segmented trips                    |
//! | GET    | `/api/stats`                 | Yes  | Trip analytics                     |
//! | GET    | `/api/tracking`              | Yes  | Producer status and counters       |
//! | POST   | `/api/tracking/background`   | Yes  | Toggle background tracking         |
//! | GET    | `/api/events`                | Yes  | SSE stream of pipeline events      |

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use waytrack::config::Config;
use waytrack::query::{self, TimeRange};
use waytrack::stats::{format_distance, format_duration};
use waytrack::store::{LocationStore, StoreError};
use waytrack::tracking::capability::StaticPermissions;
use waytrack::tracking::gpsd::GpsdSource;
use waytrack::tracking::scheduler::TokioScheduler;
use waytrack::tracking::{Capabilities, Coordinator};
use waytrack::trips::{TripOptions, TripOptionsError};
use waytrack::{routes, AppState};

/// Location recording daemon.
#[derive(Parser)]
#[command(name = "waytrack", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recorder and HTTP API (default when no subcommand given).
    Serve {
        /// Keep records in memory only; nothing is written to the data dir.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print trips recorded in the data directory.
    Trips {
        /// Start of the window, epoch milliseconds (inclusive).
        #[arg(long, requires = "to")]
        from: Option<i64>,
        /// End of the window, epoch milliseconds (inclusive).
        #[arg(long, requires = "from")]
        to: Option<i64>,
        /// Pause that splits two trips, in milliseconds.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        gap_ms: Option<i64>,
        /// Drop trips with fewer points.
        #[arg(long)]
        min_points: Option<usize>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print trip analytics for the data directory.
    Stats {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
    #[error("encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Options(#[from] TripOptionsError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("waytrack: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to stderr so `trips --json` output stays clean.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let command = cli.command.unwrap_or(Commands::Serve { ephemeral: false });
    let result = match command {
        Commands::Serve { ephemeral } => run_server(config, ephemeral).await,
        Commands::Trips {
            from,
            to,
            gap_ms,
            min_points,
            json,
        } => {
            let defaults = config.trips.options();
            let options = TripOptions {
                gap_ms: gap_ms.unwrap_or(defaults.gap_ms),
                min_points: min_points.unwrap_or(defaults.min_points),
            };
            let range = from
                .zip(to)
                .map(|(from_ms, to_ms)| TimeRange { from_ms, to_ms });
            print_trips(&config, range, options, json).await
        }
        Commands::Stats { json } => print_stats(&config, json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config, ephemeral: bool) -> Result<(), RunError> {
    info!("waytrack v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set WAYTRACK_API_KEY or update config");
    }

    let store = if ephemeral {
        warn!("Ephemeral mode: records are kept in memory only");
        Arc::new(LocationStore::ephemeral())
    } else {
        let data_dir = config.data_dir();
        info!("Data directory: {}", data_dir.display());
        Arc::new(LocationStore::open(&data_dir).await?)
    };

    let (events, _) = broadcast::channel(256);
    let coordinator = Coordinator::new(
        config.tracking.clone(),
        Arc::clone(&store),
        Capabilities {
            source: Arc::new(GpsdSource::new(&config.source)),
            permissions: Arc::new(StaticPermissions::new(
                config.permissions.foreground,
                config.permissions.background,
            )),
            scheduler: Arc::new(TokioScheduler::new()),
        },
        events.clone(),
    );

    let listen = config.server.listen.clone();
    let state = AppState::new(config, store, coordinator.clone(), events);
    let app = routes::router(state);

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|source| RunError::Bind {
            addr: listen.clone(),
            source,
        })?;
    info!("Listening on {listen}");

    coordinator.start().await?;
    info!("Server ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Drain producers and close the gate before exiting.
    info!("Shutting down...");
    coordinator.stop().await;
    served.map_err(RunError::Serve)?;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            },
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}

fn local_time(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

async fn print_trips(
    config: &Config,
    range: Option<TimeRange>,
    options: TripOptions,
    json: bool,
) -> Result<(), RunError> {
    let options = options.validate()?;
    let store = LocationStore::snapshot(&config.data_dir()).await?;
    let segmentation = query::trips(&store, range, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&segmentation)?);
        return Ok(());
    }

    println!(
        "{:>4}  {:<16}  {:>8}  {:>9}  {:>9}  {:>6}",
        "#", "start", "duration", "distance", "avg speed", "points"
    );
    for (i, trip) in segmentation.trips.iter().enumerate() {
        println!(
            "{:>4}  {:<16}  {:>8}  {:>9}  {:>4.1} km/h  {:>6}",
            i + 1,
            local_time(trip.start_time),
            format_duration(trip.duration_ms),
            format_distance(trip.distance_meters),
            trip.average_speed_kmh(),
            trip.points.len(),
        );
    }
    if segmentation.dropped_points > 0 {
        println!("({} points outside any trip)", segmentation.dropped_points);
    }
    Ok(())
}

async fn print_stats(config: &Config, json: bool) -> Result<(), RunError> {
    let store = LocationStore::snapshot(&config.data_dir()).await?;
    let summary = query::summary(&store, config.trips.options(), &Local::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "Trips:          {} ({} today, {} this week)",
        summary.total_trips, summary.today_trips, summary.week_trips
    );
    println!("Total distance: {}", format_distance(summary.total_distance));
    println!("Total time:     {}", format_duration(summary.total_duration));
    println!("Avg speed:      {:.1} km/h", summary.avg_speed);
    if let Some(longest) = &summary.longest_trip {
        println!(
            "Longest trip:   {} on {}",
            format_distance(longest.distance_meters),
            local_time(longest.start_time)
        );
    }
    if !summary.daily_stats.is_empty() {
        println!();
        for day in &summary.daily_stats {
            println!(
                "{} {}  {:>6.1} km  {} trips",
                day.day, day.date, day.distance_km, day.trips
            );
        }
    }
    Ok(())
}
