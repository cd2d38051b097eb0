#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! waytrack library: location recording pipeline.
//!
//! - `geo`: great-circle distance and path length
//! - `store`: durable, time-ordered location records (JSONL journal)
//! - `gate`: movement gate enforcing minimum spacing between records
//! - `tracking`: producer lifecycle, watchdog, gpsd source
//! - `trips` / `stats` / `query`: read-side segmentation and analytics
//! - `routes` / `auth`: HTTP API

pub mod auth;
pub mod config;
pub mod gate;
pub mod geo;
pub mod query;
pub mod routes;
pub mod state;
pub mod stats;
pub mod store;
pub mod tracking;
pub mod trips;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use state::AppState;
pub use store::{LocationRecord, LocationStore, RecordStore};
pub use tracking::Coordinator;
