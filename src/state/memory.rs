use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::PersistenceError;

use super::{
    retention_cutoff_ms, ActiveStateReader, ActiveStateRecord, ActiveStateStore, HistoryEntry,
};

const DEFAULT_HISTORY_CAP: usize = 1024;

#[derive(Default)]
struct Inner {
    active: Option<Arc<ActiveStateRecord>>,
    history: VecDeque<HistoryEntry>,
}

/// Process-local store for tests and dry runs. Clones share the same state.
///
/// A commit builds the new record fully, then swaps the `Arc` under the write
/// lock, so readers holding the old `Arc` are unaffected.
#[derive(Clone)]
pub struct InMemoryActiveStateStore {
    inner: Arc<RwLock<Inner>>,
    history_cap: usize,
}

impl InMemoryActiveStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Snapshot of the active record without copying the images.
    pub fn snapshot(&self) -> Result<Option<Arc<ActiveStateRecord>>, PersistenceError> {
        let inner = self.inner.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(inner.active.clone())
    }
}

impl Default for InMemoryActiveStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveStateReader for InMemoryActiveStateStore {
    fn read(&self) -> Result<Option<ActiveStateRecord>, PersistenceError> {
        let Some(record) = self.snapshot()? else {
            return Ok(None);
        };
        record.verify()?;
        Ok(Some(ActiveStateRecord::clone(&record)))
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let inner = self.inner.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(inner.history.iter().rev().take(limit).cloned().collect())
    }
}

impl ActiveStateStore for InMemoryActiveStateStore {
    fn commit(&mut self, record: &ActiveStateRecord) -> Result<(), PersistenceError> {
        let next = Arc::new(record.clone());
        let entry = HistoryEntry::from(record);
        let mut inner = self.inner.write().map_err(|_| PersistenceError::Poisoned)?;
        inner.active = Some(next);
        inner.history.push_back(entry);
        while inner.history.len() > self.history_cap {
            inner.history.pop_front();
        }
        Ok(())
    }

    fn prune_history(&mut self, retention: Duration) -> Result<usize, PersistenceError> {
        let cutoff = retention_cutoff_ms(retention);
        let mut inner = self.inner.write().map_err(|_| PersistenceError::Poisoned)?;
        let before = inner.history.len();
        inner.history.retain(|entry| entry.committed_at_ms >= cutoff);
        Ok(before - inner.history.len())
    }

    fn reader(&self) -> Result<Box<dyn ActiveStateReader>, PersistenceError> {
        Ok(Box::new(self.clone()))
    }
}
