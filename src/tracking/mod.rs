//! Ingestion coordinator: producer lifecycle around one shared gate.
//!
//! Two producers feed fixes into [`Coordinator::ingest`]:
//!
//! - **foreground**: a plain tokio task owned by the coordinator, started by
//!   [`Coordinator::start`] when foreground permission is granted.
//! - **background**: registered with the [`TaskScheduler`] under
//!   [`LOCATION_TRACKING_TASK`], armed by [`Coordinator::toggle_background`]
//!   (or on start when enabled) and re-armed by the watchdog
//!   ([`LOCATION_WATCHDOG_TASK`]) if it silently went away.
//!
//! Both producers go through the same [`MovementGate`], so the spacing
//! guarantee holds no matter which one delivered a fix. Lifecycle calls are
//! serialized by a control mutex; producers never take it.
//!
//! Failures (permission denied, source refused to start, scheduler rejected
//! the task, store write failed) are logged and surfaced through
//! [`Coordinator::status`]. None of them take the daemon down.

pub mod capability;
pub mod gpsd;
pub mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::capability::{PermissionProvider, PermissionScope, PositionSource, TaskScheduler};
use crate::config::TrackingConfig;
use crate::gate::{Decision, Fix, MovementGate};
use crate::store::{LocationRecord, RecordStore, StoreError};

/// Scheduler name of the background producer.
pub const LOCATION_TRACKING_TASK: &str = "location-tracking";
/// Scheduler name of the background watchdog.
pub const LOCATION_WATCHDOG_TASK: &str = "location-watchdog";

/// Which producer delivered a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Foreground,
    Background,
    /// Pushed directly through [`Coordinator::ingest`] (HTTP, CLI, tests).
    External,
}

/// Lifecycle state of one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerStatus {
    Stopped,
    Running,
    /// The required permission was not granted.
    PermissionDenied,
    /// The source or the scheduler refused to start it.
    StartFailed,
}

/// Snapshot returned by [`Coordinator::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub started: bool,
    pub foreground: ProducerStatus,
    pub background: ProducerStatus,
    pub background_enabled: bool,
    pub accepted: u64,
    pub rejected: u64,
    pub persist_errors: u64,
    pub last_accepted: Option<LocationRecord>,
}

/// Capabilities handed to the coordinator at construction.
pub struct Capabilities {
    pub source: Arc<dyn PositionSource>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub scheduler: Arc<dyn TaskScheduler>,
}

struct Producer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owned by the control mutex.
#[derive(Default)]
struct Control {
    foreground: Option<Producer>,
}

/// Readable without the control mutex.
#[derive(Debug, Clone, Copy)]
struct Flags {
    started: bool,
    background_enabled: bool,
    foreground: ProducerStatus,
    background: ProducerStatus,
}

struct Inner<S> {
    config: TrackingConfig,
    store: Arc<S>,
    gate: MovementGate,
    source: Arc<dyn PositionSource>,
    permissions: Arc<dyn PermissionProvider>,
    scheduler: Arc<dyn TaskScheduler>,
    events: broadcast::Sender<Value>,
    control: Mutex<Control>,
    flags: StdMutex<Flags>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    persist_errors: AtomicU64,
}

/// Cheap to clone; all clones drive the same pipeline.
pub struct Coordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RecordStore> Coordinator<S> {
    /// Build a stopped coordinator. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: TrackingConfig,
        store: Arc<S>,
        capabilities: Capabilities,
        events: broadcast::Sender<Value>,
    ) -> Self {
        let gate = MovementGate::closed(config.move_threshold_m);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                gate,
                source: capabilities.source,
                permissions: capabilities.permissions,
                scheduler: capabilities.scheduler,
                events,
                control: Mutex::new(Control::default()),
                flags: StdMutex::new(Flags {
                    started: false,
                    background_enabled: false,
                    foreground: ProducerStatus::Stopped,
                    background: ProducerStatus::Stopped,
                }),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                persist_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Rehydrate the gate and start producers. A second call is a no-op.
    ///
    /// Only a failure to read the latest record is an error; permission and
    /// producer problems end up in [`status`](Self::status).
    pub async fn start(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        if inner.flags().started {
            debug!("Tracking: already started");
            return Ok(());
        }

        let last = inner.store.latest().await?;
        match &last {
            Some(record) => info!(
                "Tracking: resuming after record {} at ({:.5}, {:.5})",
                record.id, record.latitude, record.longitude
            ),
            None => info!("Tracking: no previous record, first fix will be accepted"),
        }
        inner.gate.reopen(last).await;

        let background_enabled = {
            let mut flags = inner.flags();
            flags.started = true;
            flags.background_enabled |= inner.config.background_on_start;
            flags.background_enabled
        };

        self.start_foreground(&mut control);
        self.register_watchdog();
        if background_enabled {
            self.arm_background();
        }
        Ok(())
    }

    /// Stop every producer and close the gate. Safe to call at any time.
    ///
    /// Producers are awaited before the gate closes, so once this returns no
    /// further fix is evaluated.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;

        inner.scheduler.deregister(LOCATION_WATCHDOG_TASK).await;
        if let Some(producer) = control.foreground.take() {
            producer.cancel.cancel();
            if let Err(e) = producer.handle.await {
                warn!("Tracking: foreground producer ended abnormally: {e}");
            }
        }
        inner.scheduler.deregister(LOCATION_TRACKING_TASK).await;
        inner.gate.close().await;

        let mut flags = inner.flags();
        if flags.started {
            info!("Tracking: stopped");
        }
        flags.started = false;
        flags.foreground = ProducerStatus::Stopped;
        flags.background = ProducerStatus::Stopped;
    }

    /// Flip background tracking. Returns whether it is enabled afterwards.
    ///
    /// Turning it on without background permission leaves it off. A start
    /// failure keeps it enabled so the watchdog can retry.
    pub async fn toggle_background(&self) -> bool {
        let inner = &self.inner;
        let _control = inner.control.lock().await;

        if inner.flags().background_enabled {
            inner.scheduler.deregister(LOCATION_TRACKING_TASK).await;
            let mut flags = inner.flags();
            flags.background_enabled = false;
            flags.background = ProducerStatus::Stopped;
            info!("Tracking: background tracking disabled");
            return false;
        }

        if !inner
            .permissions
            .status(PermissionScope::Background)
            .is_granted()
        {
            warn!("Tracking: background permission not granted");
            inner.flags().background = ProducerStatus::PermissionDenied;
            return false;
        }

        let started = {
            let mut flags = inner.flags();
            flags.background_enabled = true;
            flags.started
        };
        info!("Tracking: background tracking enabled");
        if started && !self.arm_background() {
            warn!("Tracking: background producer failed to start, watchdog will retry");
        }
        true
    }

    /// Watchdog body: re-arm the background producer if it should be running
    /// but is not.
    pub async fn ensure_background(&self) {
        let inner = &self.inner;
        let _control = inner.control.lock().await;

        let flags = *inner.flags();
        if !flags.started
            || !flags.background_enabled
            || inner.scheduler.is_registered(LOCATION_TRACKING_TASK)
        {
            return;
        }
        if self.arm_background() {
            info!("Tracking: watchdog re-armed background producer");
        }
    }

    /// Run one fix through the gate.
    pub async fn ingest(&self, fix: Fix, origin: Origin) -> Result<Decision, StoreError> {
        self.inner.ingest(fix, origin).await
    }

    pub async fn status(&self) -> TrackingStatus {
        let inner = &self.inner;
        let flags = *inner.flags();
        TrackingStatus {
            started: flags.started,
            foreground: flags.foreground,
            background: flags.background,
            background_enabled: flags.background_enabled,
            accepted: inner.accepted.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            persist_errors: inner.persist_errors.load(Ordering::Relaxed),
            last_accepted: inner.gate.last_accepted().await,
        }
    }

    fn start_foreground(&self, control: &mut Control) {
        let inner = &self.inner;
        if control
            .foreground
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
        {
            return;
        }
        if !inner
            .permissions
            .status(PermissionScope::Foreground)
            .is_granted()
        {
            warn!("Tracking: foreground permission not granted, not tracking");
            inner.flags().foreground = ProducerStatus::PermissionDenied;
            return;
        }

        match inner.source.watch(inner.config.foreground.source_options()) {
            Ok(rx) => {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_producer(
                    Arc::clone(inner),
                    Origin::Foreground,
                    rx,
                    cancel.clone(),
                ));
                control.foreground = Some(Producer { cancel, handle });
                inner.flags().foreground = ProducerStatus::Running;
                info!("Tracking: foreground producer started");
            }
            Err(e) => {
                warn!("Tracking: foreground producer failed to start: {e}");
                inner.flags().foreground = ProducerStatus::StartFailed;
            }
        }
    }

    /// Check background permission, subscribe to the source and register
    /// the background producer. Caller holds the control mutex.
    fn arm_background(&self) -> bool {
        let inner = &self.inner;
        if !inner
            .permissions
            .status(PermissionScope::Background)
            .is_granted()
        {
            debug!("Tracking: background permission not granted, not arming");
            inner.flags().background = ProducerStatus::PermissionDenied;
            return false;
        }
        let rx = match inner.source.watch(inner.config.background.source_options()) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Tracking: background source failed to start: {e}");
                inner.flags().background = ProducerStatus::StartFailed;
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let task = run_producer(Arc::clone(inner), Origin::Background, rx, cancel.clone()).boxed();
        match inner.scheduler.register(LOCATION_TRACKING_TASK, task, cancel) {
            Ok(()) => {
                inner.flags().background = ProducerStatus::Running;
                info!("Tracking: background producer registered");
                true
            }
            Err(e) => {
                warn!("Tracking: {e}");
                inner.flags().background = ProducerStatus::StartFailed;
                false
            }
        }
    }

    fn register_watchdog(&self) {
        let inner = &self.inner;
        let period = Duration::from_secs(inner.config.watchdog_interval_secs.max(1));
        let cancel = CancellationToken::new();
        let task = watchdog(Arc::downgrade(inner), period, cancel.clone()).boxed();
        if let Err(e) = inner.scheduler.register(LOCATION_WATCHDOG_TASK, task, cancel) {
            warn!("Tracking: watchdog not registered: {e}");
        }
    }
}

impl<S> Inner<S> {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: RecordStore> Inner<S> {
    async fn ingest(&self, fix: Fix, origin: Origin) -> Result<Decision, StoreError> {
        match self.gate.evaluate(&fix, self.store.as_ref()).await {
            Ok(Decision::Accept(record)) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Tracking: recorded #{} ({:.5}, {:.5}) from {origin:?}",
                    record.id, record.latitude, record.longitude
                );
                let _ = self.events.send(json!({
                    "type": "location.recorded",
                    "origin": origin,
                    "record": record,
                }));
                Ok(Decision::Accept(record))
            }
            Ok(Decision::Reject(reason)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Tracking: rejected fix from {origin:?}: {reason}");
                Ok(Decision::Reject(reason))
            }
            Err(e) => {
                self.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Tracking: failed to persist fix from {origin:?}: {e}");
                Err(e)
            }
        }
    }
}

/// Drain one subscription into the gate until cancelled or the source closes.
async fn run_producer<S: RecordStore>(
    inner: Arc<Inner<S>>,
    origin: Origin,
    mut rx: mpsc::Receiver<Fix>,
    cancel: CancellationToken,
) {
    loop {
        let fix = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            fix = rx.recv() => fix,
        };
        let Some(fix) = fix else {
            info!("Tracking: {origin:?} source closed");
            let mut flags = inner.flags();
            match origin {
                Origin::Foreground => flags.foreground = ProducerStatus::Stopped,
                Origin::Background => flags.background = ProducerStatus::Stopped,
                Origin::External => {}
            }
            return;
        };
        // Errors are counted and logged inside; the producer keeps going.
        let _ = inner.ingest(fix, origin).await;
    }
}

/// Periodically re-arm background tracking. Holds only a weak reference so
/// a dropped coordinator is not kept alive by its own watchdog.
async fn watchdog<S: RecordStore>(
    inner: Weak<Inner<S>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = Coordinator { inner };
        // stop() holds the control mutex while it cancels us.
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = coordinator.ensure_background() => {}
        }
    }
    debug!("Tracking: watchdog exited");
}
