//! Movement gate: decides which fixes are worth persisting.
//!
//! One [`MovementGate`] is shared by every producer. Its [`GateState`] sits
//! behind a single async mutex that is held across the whole decision,
//! *including* the store append, so two near-simultaneous fixes from
//! different producers can never both be accepted against the same
//! `last_accepted`.
//!
//! `last_accepted` only advances once the store confirms the write. A failed
//! append leaves the gate exactly as it was.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::geo::{distance_meters, is_valid_coordinate, LatLon};
use crate::store::{LocationRecord, NewRecord, RecordStore, StoreError};

/// Default minimum spacing between consecutive persisted records.
pub const DEFAULT_MOVE_THRESHOLD_M: f64 = 50.0;

/// A raw position reading from a producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: i64,
}

impl LatLon for Fix {
    fn latitude(&self) -> f64 {
        self.latitude
    }
    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Why a fix was not persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// Within the movement threshold of the last accepted record.
    BelowThreshold { distance_m: f64 },
    /// NaN, infinite, or out-of-range coordinates.
    Malformed,
    /// The pipeline is stopped.
    Closed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowThreshold { distance_m } => {
                write!(f, "below threshold ({distance_m:.0}m)")
            }
            Self::Malformed => write!(f, "malformed coordinates"),
            Self::Closed => write!(f, "gate closed"),
        }
    }
}

/// Outcome of [`MovementGate::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Persisted as this record.
    Accept(LocationRecord),
    Reject(Rejection),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Mutable gate state. Only [`MovementGate`] touches it.
#[derive(Debug, Clone, Default)]
pub struct GateState {
    pub last_accepted: Option<LocationRecord>,
    /// Closed gates reject everything; `stop()` closes the gate.
    pub open: bool,
}

impl GateState {
    /// Pure accept/reject rule. `Ok` carries the distance from the last
    /// accepted record (`None` for the very first record).
    pub fn judge(&self, fix: &Fix, threshold_m: f64) -> Result<Option<f64>, Rejection> {
        if !self.open {
            return Err(Rejection::Closed);
        }
        if !is_valid_coordinate(fix.latitude, fix.longitude) {
            return Err(Rejection::Malformed);
        }
        let Some(last) = &self.last_accepted else {
            return Ok(None);
        };
        let distance_m = distance_meters(last, fix);
        if distance_m > threshold_m {
            Ok(Some(distance_m))
        } else {
            Err(Rejection::BelowThreshold { distance_m })
        }
    }
}

/// Shared, serialized accept/reject filter.
pub struct MovementGate {
    threshold_m: f64,
    state: Mutex<GateState>,
}

impl MovementGate {
    /// An open gate with no history.
    #[must_use]
    pub fn new(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            state: Mutex::new(GateState {
                last_accepted: None,
                open: true,
            }),
        }
    }

    /// A closed gate; call [`MovementGate::reopen`] before use.
    #[must_use]
    pub fn closed(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    /// Evaluate `fix`, persisting it through `store` on accept.
    ///
    /// Runs entirely under the gate lock. Returns `Err` only when the store
    /// append fails, in which case the state is not advanced.
    pub async fn evaluate<S: RecordStore>(
        &self,
        fix: &Fix,
        store: &S,
    ) -> Result<Decision, StoreError> {
        let mut state = self.state.lock().await;
        if let Err(rejection) = state.judge(fix, self.threshold_m) {
            return Ok(Decision::Reject(rejection));
        }

        let record = store
            .append(NewRecord {
                latitude: fix.latitude,
                longitude: fix.longitude,
                timestamp_ms: fix.captured_at_ms,
            })
            .await?;
        state.last_accepted = Some(record.clone());
        Ok(Decision::Accept(record))
    }

    /// Open the gate with `last` as the reference point (rehydration).
    pub async fn reopen(&self, last: Option<LocationRecord>) {
        let mut state = self.state.lock().await;
        state.last_accepted = last;
        state.open = true;
    }

    /// Close the gate. Waits for any in-flight evaluation to finish first.
    pub async fn close(&self) {
        self.state.lock().await.open = false;
    }

    pub async fn last_accepted(&self) -> Option<LocationRecord> {
        self.state.lock().await.last_accepted.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::store::LocationStore;

    /// Store that can be told to fail the next appends.
    struct FlakyStore {
        inner: LocationStore,
        fail: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: LocationStore::ephemeral(),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl RecordStore for FlakyStore {
        async fn append(&self, record: NewRecord) -> Result<LocationRecord, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append(record).await
        }
        async fn query_range(&self, from: i64, to: i64) -> Result<Vec<LocationRecord>, StoreError> {
            self.inner.query_range(from, to).await
        }
        async fn query_all(&self) -> Result<Vec<LocationRecord>, StoreError> {
            self.inner.query_all().await
        }
        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
        async fn latest(&self) -> Result<Option<LocationRecord>, StoreError> {
            self.inner.latest().await
        }
        async fn clear_all(&self) -> Result<(), StoreError> {
            self.inner.clear_all().await
        }
    }

    fn fix(lat: f64, lon: f64, ts: i64) -> Fix {
        Fix {
            latitude: lat,
            longitude: lon,
            captured_at_ms: ts,
        }
    }

    // ~0.001° of latitude is ~111 m.
    const STEP_DEG: f64 = 0.001;

    #[tokio::test]
    async fn first_fix_is_always_accepted() {
        let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
        let store = LocationStore::ephemeral();
        let decision = gate.evaluate(&fix(45.0, -73.0, 1), &store).await.unwrap();
        assert!(decision.is_accept());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(gate.last_accepted().await.unwrap().timestamp_ms, 1);
    }

    #[tokio::test]
    async fn accepts_only_beyond_threshold() {
        let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
        let store = LocationStore::ephemeral();
        gate.evaluate(&fix(45.0, -73.0, 1), &store).await.unwrap();

        let near = gate
            .evaluate(&fix(45.0 + STEP_DEG / 10.0, -73.0, 2), &store)
            .await
            .unwrap();
        match near {
            Decision::Reject(Rejection::BelowThreshold { distance_m }) => {
                assert!(distance_m > 10.0 && distance_m < 12.0, "got {distance_m}");
            }
            other => panic!("expected below-threshold rejection, got {other:?}"),
        }

        let far = gate
            .evaluate(&fix(45.0 + STEP_DEG, -73.0, 3), &store)
            .await
            .unwrap();
        assert!(far.is_accept());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejection_does_not_mutate_state() {
        let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
        let store = LocationStore::ephemeral();
        gate.evaluate(&fix(45.0, -73.0, 1), &store).await.unwrap();
        let before = gate.last_accepted().await;

        for i in 0..5 {
            let d = gate
                .evaluate(&fix(45.0 + 0.0001, -73.0, 10 + i), &store)
                .await
                .unwrap();
            assert!(!d.is_accept());
        }
        assert_eq!(gate.last_accepted().await, before);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_fixes_never_reach_the_store() {
        let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
        let store = LocationStore::ephemeral();
        for bad in [
            fix(f64::NAN, 0.0, 1),
            fix(0.0, f64::INFINITY, 1),
            fix(91.0, 0.0, 1),
            fix(0.0, -181.0, 1),
        ] {
            assert_eq!(
                gate.evaluate(&bad, &store).await.unwrap(),
                Decision::Reject(Rejection::Malformed)
            );
        }
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(gate.last_accepted().await.is_none());
    }

    #[tokio::test]
    async fn failed_append_does_not_advance_state() {
        let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
        let store = FlakyStore::new();
        gate.evaluate(&fix(45.0, -73.0, 1), &store).await.unwrap();
        let before = gate.last_accepted().await;

        store.fail.store(true, Ordering::SeqCst);
        let err = gate.evaluate(&fix(45.01, -73.0, 2), &store).await;
        assert!(matches!(err, Err(StoreError::Io(_))));
        assert_eq!(gate.last_accepted().await, before);

        // Once the store recovers, the same movement is accepted.
        store.fail.store(false, Ordering::SeqCst);
        let ok = gate.evaluate(&fix(45.01, -73.0, 3), &store).await.unwrap();
        assert!(ok.is_accept());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn closed_gate_rejects_and_reopen_rehydrates() {
        let gate = MovementGate::closed(DEFAULT_MOVE_THRESHOLD_M);
        let store = LocationStore::ephemeral();
        assert_eq!(
            gate.evaluate(&fix(45.0, -73.0, 1), &store).await.unwrap(),
            Decision::Reject(Rejection::Closed)
        );

        let prior = store
            .append(NewRecord {
                latitude: 45.0,
                longitude: -73.0,
                timestamp_ms: 0,
            })
            .await
            .unwrap();
        gate.reopen(Some(prior)).await;

        // Rehydrated: a fix at the same spot is a duplicate, not a first record.
        let d = gate.evaluate(&fix(45.0, -73.0, 5), &store).await.unwrap();
        assert!(matches!(d, Decision::Reject(Rejection::BelowThreshold { .. })));

        gate.close().await;
        assert!(!gate.is_open().await);
    }

    #[tokio::test]
    async fn interleaved_producers_share_one_threshold() {
        let gate = Arc::new(MovementGate::new(DEFAULT_MOVE_THRESHOLD_M));
        let store = Arc::new(LocationStore::ephemeral());

        // Two producers reporting nearly the same track, slightly offset.
        let mut handles = Vec::new();
        for producer in 0..2 {
            let gate = gate.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..40 {
                    let lat = 45.0 + f64::from(i) * STEP_DEG * 0.3 + f64::from(producer) * 0.00001;
                    let ts = i64::from(i) * 10 + i64::from(producer);
                    gate.evaluate(&fix(lat, -73.0, ts), store.as_ref())
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Accepted records in id (acceptance) order obey the spacing rule.
        let mut accepted = store.query_all().await.unwrap();
        accepted.sort_by_key(|r| r.id);
        for pair in accepted.windows(2) {
            let d = distance_meters(&pair[0], &pair[1]);
            assert!(d > DEFAULT_MOVE_THRESHOLD_M, "spacing violated: {d:.1}m");
        }
    }

    proptest! {
        #[test]
        fn accepted_records_are_spaced(steps in prop::collection::vec((-0.002f64..0.002, -0.002f64..0.002), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let gate = MovementGate::new(DEFAULT_MOVE_THRESHOLD_M);
                let store = LocationStore::ephemeral();
                let (mut lat, mut lon) = (45.0, -73.0);
                for (i, (dlat, dlon)) in steps.iter().enumerate() {
                    lat += dlat;
                    lon += dlon;
                    gate.evaluate(&fix(lat, lon, i as i64), &store).await.unwrap();
                }
                let accepted = store.query_all().await.unwrap();
                prop_assert!(!accepted.is_empty());
                for pair in accepted.windows(2) {
                    prop_assert!(distance_meters(&pair[0], &pair[1]) > DEFAULT_MOVE_THRESHOLD_M);
                }
                Ok(())
            })?;
        }
    }
}
