//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::store::LocationStore;
use crate::tracking::Coordinator;

/// Shared application state for the waytrack daemon.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub store: Arc<LocationStore>,
    pub coordinator: Coordinator<LocationStore>,
    /// Pipeline events (`location.recorded`, `locations.cleared`) for SSE clients.
    pub events: broadcast::Sender<Value>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<LocationStore>,
        coordinator: Coordinator<LocationStore>,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            coordinator,
            events,
            sse_connections: Arc::new(AtomicU32::new(0)),
        }
    }
}
