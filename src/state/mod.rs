//! Active state: the latest committed detection with its before/after images.
//!
//! Only the run loop writes. Readers get their own handle from
//! `ActiveStateStore::reader()` and never block the writer. A commit replaces
//! the whole record at once; a reader sees either the old record or the new
//! one, never a mix of the two.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::detect::DetectionResult;
use crate::error::PersistenceError;

mod memory;
mod sqlite;
mod visual;

pub use memory::InMemoryActiveStateStore;
pub use sqlite::{SqliteActiveStateReader, SqliteActiveStateStore};
pub use visual::{export_record, LatestPointer, VisualExporter};

/// The record a successful cycle commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveStateRecord {
    pub result: DetectionResult,
    #[serde(skip)]
    pub before_jpeg: Vec<u8>,
    #[serde(skip)]
    pub after_jpeg: Vec<u8>,
    /// Hex SHA-256 of `before_jpeg`.
    pub before_digest: String,
    /// Hex SHA-256 of `after_jpeg`.
    pub after_digest: String,
    pub run_id: String,
    /// Run loop generation that produced the record.
    pub generation: u64,
    pub last_success_timestamp_ms: u64,
    /// Failures seen since the previous success.
    pub consecutive_failure_count: u32,
    pub committed_at_ms: u64,
}

impl ActiveStateRecord {
    pub fn new(
        result: DetectionResult,
        before_jpeg: Vec<u8>,
        after_jpeg: Vec<u8>,
        run_id: impl Into<String>,
        generation: u64,
        consecutive_failure_count: u32,
    ) -> Self {
        let before_digest = sha256_hex(&before_jpeg);
        let after_digest = sha256_hex(&after_jpeg);
        let last_success_timestamp_ms = result.timestamp_ms;
        Self {
            result,
            before_jpeg,
            after_jpeg,
            before_digest,
            after_digest,
            run_id: run_id.into(),
            generation,
            last_success_timestamp_ms,
            consecutive_failure_count,
            committed_at_ms: crate::now_ms(),
        }
    }

    /// Check both images against their digests.
    pub fn verify(&self) -> Result<(), PersistenceError> {
        if sha256_hex(&self.before_jpeg) != self.before_digest {
            return Err(PersistenceError::Corrupt(format!(
                "before image does not match digest {}",
                self.before_digest
            )));
        }
        if sha256_hex(&self.after_jpeg) != self.after_digest {
            return Err(PersistenceError::Corrupt(format!(
                "after image does not match digest {}",
                self.after_digest
            )));
        }
        Ok(())
    }
}

/// One line of the detection history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub generation: u64,
    pub committed_at_ms: u64,
    pub result: DetectionResult,
}

impl From<&ActiveStateRecord> for HistoryEntry {
    fn from(record: &ActiveStateRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            generation: record.generation,
            committed_at_ms: record.committed_at_ms,
            result: record.result.clone(),
        }
    }
}

/// Read side of the active state.
pub trait ActiveStateReader: Send {
    /// Latest committed record, digests verified.
    fn read(&self) -> Result<Option<ActiveStateRecord>, PersistenceError>;

    /// Most recent history entries, newest first.
    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError>;
}

/// Write side of the active state. Owned by the run loop.
pub trait ActiveStateStore: ActiveStateReader {
    /// Replace the active record and append it to the history, atomically.
    fn commit(&mut self, record: &ActiveStateRecord) -> Result<(), PersistenceError>;

    /// Drop history entries older than `retention`. Returns how many went.
    fn prune_history(&mut self, retention: Duration) -> Result<usize, PersistenceError>;

    /// A reader that does not share the writer's handle.
    fn reader(&self) -> Result<Box<dyn ActiveStateReader>, PersistenceError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) fn retention_cutoff_ms(retention: Duration) -> u64 {
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    crate::now_ms().saturating_sub(retention_ms)
}
