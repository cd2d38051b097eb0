//! Durable, timestamp-ordered storage of accepted location records.
//!
//! [`RecordStore`] is the contract the pipeline depends on; [`LocationStore`]
//! implements it on top of an append-only JSONL journal (see [`journal`]), or
//! purely in memory via [`LocationStore::ephemeral`].
//!
//! ## Ordering
//!
//! Records are kept sorted by `(timestamp_ms, id)`. Ids are assigned under the
//! write lock and are never reused, so a late-arriving fix with an older
//! timestamp still lands in its timestamp position.
//!
//! ## Concurrency
//!
//! Appends and `clear_all` take the write lock for the whole
//! write-and-fsync, so concurrent appends are serialized and each one yields
//! exactly one record. Queries take the read lock.

pub mod journal;

use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::geo::LatLon;
use journal::JournalFile;

/// File name of the journal inside the data directory.
pub const JOURNAL_FILE: &str = "locations.jsonl";

/// A persisted, accepted fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    /// Store-assigned id, unique and monotonically increasing.
    pub id: u64,
    pub latitude: f64,
    pub longitude: f64,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Reserved for remote sync; always written `false`.
    pub synced: bool,
}

impl LatLon for LocationRecord {
    fn latitude(&self) -> f64 {
        self.latitude
    }
    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A record before the store has assigned it an id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl NewRecord {
    fn with_id(self, id: u64) -> LocationRecord {
        LocationRecord {
            id,
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp_ms: self.timestamp_ms,
            synced: false,
        }
    }
}

/// Errors returned by [`RecordStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `from_ms` was not strictly earlier than `to_ms`.
    #[error("invalid range: from ({from_ms}) must be earlier than to ({to_ms})")]
    InvalidRange { from_ms: i64, to_ms: i64 },
    /// Reading or writing the journal failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded.
    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),
    /// The journal header is unreadable; refusing to overwrite it.
    #[error("corrupt journal {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Append/query contract for location records.
pub trait RecordStore: Send + Sync + 'static {
    /// Persist a record, durable on return.
    fn append(
        &self,
        record: NewRecord,
    ) -> impl Future<Output = Result<LocationRecord, StoreError>> + Send;

    /// Records with `from_ms <= timestamp_ms <= to_ms`, ascending.
    fn query_range(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> impl Future<Output = Result<Vec<LocationRecord>, StoreError>> + Send;

    /// Every record, ascending.
    fn query_all(&self) -> impl Future<Output = Result<Vec<LocationRecord>, StoreError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// The most recent record by timestamp, if any.
    fn latest(&self) -> impl Future<Output = Result<Option<LocationRecord>, StoreError>> + Send;

    /// Delete every record. Irreversible.
    fn clear_all(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

struct StoreInner {
    records: Vec<LocationRecord>,
    next_id: u64,
    journal: Option<JournalFile>,
}

/// Journal-backed [`RecordStore`] with an in-memory sorted index.
pub struct LocationStore {
    inner: RwLock<StoreInner>,
    revision: watch::Sender<u64>,
}

impl LocationStore {
    /// Open (or create) `<data_dir>/locations.jsonl` and load its records.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(JOURNAL_FILE);
        let (journal, recovered) = JournalFile::open(&path).await?;
        info!(
            "Store: loaded {} records from {} (next id {})",
            recovered.records.len(),
            path.display(),
            recovered.next_id
        );
        Ok(Self::from_parts(
            recovered.records,
            recovered.next_id,
            Some(journal),
        ))
    }

    /// Read `<data_dir>/locations.jsonl` into a detached, memory-only store.
    ///
    /// The file is neither created nor repaired, so this is safe while a
    /// daemon owns it. A missing file yields an empty store.
    pub async fn snapshot(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(JOURNAL_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::ephemeral()),
            Err(e) => return Err(e.into()),
        };
        Ok(match journal::parse_journal(&path, &bytes)? {
            Some(recovered) => Self::from_parts(recovered.records, recovered.next_id, None),
            None => Self::ephemeral(),
        })
    }

    /// A memory-only store with the same semantics, lost on drop.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::from_parts(Vec::new(), 1, None)
    }

    fn from_parts(
        records: Vec<LocationRecord>,
        next_id: u64,
        journal: Option<JournalFile>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner {
                records,
                next_id,
                journal,
            }),
            revision,
        }
    }

    /// Follow the store revision, bumped on every append and clear.
    ///
    /// Receivers start at the current revision; callers re-query when it
    /// changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl RecordStore for LocationStore {
    async fn append(&self, record: NewRecord) -> Result<LocationRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = record.with_id(inner.next_id);

        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&record).await?;
        }
        inner.next_id += 1;

        let pos = inner
            .records
            .partition_point(|r| r.timestamp_ms <= record.timestamp_ms);
        inner.records.insert(pos, record.clone());
        drop(inner);

        self.bump();
        Ok(record)
    }

    async fn query_range(&self, from_ms: i64, to_ms: i64) -> Result<Vec<LocationRecord>, StoreError> {
        if from_ms >= to_ms {
            return Err(StoreError::InvalidRange { from_ms, to_ms });
        }
        let inner = self.inner.read().await;
        let lo = inner.records.partition_point(|r| r.timestamp_ms < from_ms);
        let hi = inner.records.partition_point(|r| r.timestamp_ms <= to_ms);
        Ok(inner.records[lo..hi].to_vec())
    }

    async fn query_all(&self) -> Result<Vec<LocationRecord>, StoreError> {
        Ok(self.inner.read().await.records.clone())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().await.records.len() as u64)
    }

    async fn latest(&self) -> Result<Option<LocationRecord>, StoreError> {
        Ok(self.inner.read().await.records.last().cloned())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let base_id = inner.next_id - 1;
        if let Some(journal) = inner.journal.as_mut() {
            journal.reset(base_id).await?;
        }
        let removed = inner.records.len();
        inner.records.clear();
        drop(inner);

        info!("Store: cleared {removed} records");
        self.bump();
        Ok(())
    }
}
