//! Append-only JSONL journal backing [`super::LocationStore`].
//!
//! The first line is a [`JournalHeader`]; every following line is one
//! [`LocationRecord`] in its wire form:
//!
//! ```text
//! {"v":1,"created":1718000000000,"base_id":0}
//! {"id":1,"latitude":45.502,"longitude":-73.567,"timestampMs":1718000001000,"synced":false}
//! ```
//!
//! Appends are written and `fsync`ed before returning. If a write fails part
//! way, the file is truncated back to its previous length so the torn bytes
//! can't merge with the next line. On open, a torn trailing line (no final
//! newline, e.g. after a crash) is cut off and corrupt lines are skipped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{LocationRecord, StoreError};
use crate::util::now_ms;

/// Current journal format version.
pub const JOURNAL_VERSION: u32 = 1;

/// First line of every journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalHeader {
    /// Format version.
    pub v: u32,
    /// Creation time in milliseconds since epoch.
    pub created: i64,
    /// Highest id handed out before the journal was last cleared.
    #[serde(default)]
    pub base_id: u64,
}

/// Result of scanning an existing journal.
#[derive(Debug)]
pub struct Recovered {
    pub header: JournalHeader,
    /// Records sorted by `(timestamp_ms, id)`.
    pub records: Vec<LocationRecord>,
    /// Next id to hand out.
    pub next_id: u64,
    /// Byte length of the intact prefix (everything up to the last newline).
    pub valid_len: u64,
    /// Number of unparseable lines that were skipped.
    pub skipped: usize,
}

/// Parse journal bytes. `None` means there is no intact header yet.
pub fn parse_journal(path: &Path, bytes: &[u8]) -> Result<Option<Recovered>, StoreError> {
    let valid_len = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if valid_len == 0 {
        return Ok(None);
    }

    let mut lines = bytes[..valid_len]
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty());

    let Some(header_line) = lines.next() else {
        return Ok(None);
    };
    let header: JournalHeader =
        serde_json::from_slice(header_line).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("header: {e}"),
        })?;

    let mut records = Vec::new();
    let mut skipped = 0;
    for line in lines {
        match serde_json::from_slice::<LocationRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!("Skipping corrupt journal line in {}: {e}", path.display());
            }
        }
    }

    records.sort_by_key(|r| (r.timestamp_ms, r.id));
    let max_id = records.iter().map(|r| r.id).max().unwrap_or(0);
    let next_id = max_id.max(header.base_id) + 1;

    Ok(Some(Recovered {
        header,
        records,
        next_id,
        valid_len: valid_len as u64,
        skipped,
    }))
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Open journal file, positioned for appends.
pub struct JournalFile {
    file: fs::File,
    path: PathBuf,
    /// Length of the file after the last successful write.
    len: u64,
}

impl JournalFile {
    /// Open or create the journal at `path`, recovering existing records.
    pub async fn open(path: &Path) -> Result<(Self, Recovered), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let recovered = parse_journal(path, &bytes)?;

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut journal = Self {
            file,
            path: path.to_path_buf(),
            len: bytes.len() as u64,
        };

        let recovered = if let Some(recovered) = recovered {
            if recovered.valid_len < journal.len {
                warn!(
                    "Journal {}: truncating {} torn trailing bytes",
                    path.display(),
                    journal.len - recovered.valid_len
                );
                journal.file.set_len(recovered.valid_len).await?;
                journal.len = recovered.valid_len;
            }
            if recovered.skipped > 0 {
                warn!(
                    "Journal {}: skipped {} corrupt lines",
                    path.display(),
                    recovered.skipped
                );
            }
            recovered
        } else {
            let header = journal.reset(0).await?;
            info!("Journal {}: created", path.display());
            Recovered {
                header,
                records: Vec::new(),
                next_id: 1,
                valid_len: journal.len,
                skipped: 0,
            }
        };

        Ok((journal, recovered))
    }

    /// Append one record and fsync.
    pub async fn append(&mut self, record: &LocationRecord) -> Result<(), StoreError> {
        let line = encode_line(record)?;
        if let Err(e) = self.write_durable(&line).await {
            if let Err(te) = self.file.set_len(self.len).await {
                warn!(
                    "Journal {}: failed to roll back torn write: {te}",
                    self.path.display()
                );
            }
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }

    /// Drop every record and start over with a fresh header.
    ///
    /// The header is written and synced to a sibling file which is then
    /// renamed over the journal. On error the old journal is left as it was.
    pub async fn reset(&mut self, base_id: u64) -> Result<JournalHeader, StoreError> {
        let header = JournalHeader {
            v: JOURNAL_VERSION,
            created: now_ms(),
            base_id,
        };
        let line = encode_line(&header)?;
        let tmp = self.tmp_path();

        match fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&tmp)
            .await?;

        let written = async {
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await?;
            fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // The handle follows the renamed inode.
        self.file = file;
        self.len = line.len() as u64;
        Ok(header)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn write_durable(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }
}
