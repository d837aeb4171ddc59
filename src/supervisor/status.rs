use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::state::{CycleCounters, ServiceState};

/// What `status()` reports.
///
/// Only `Failed` (through `last_error`) and rejected catalog loads (through
/// `catalog_error`) surface as messages; every other failure is a counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: ServiceState,
    pub run_id: Option<String>,
    pub generation: u64,
    pub last_success_timestamp_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub restart_count: u32,
    pub current_period_ms: u64,
    pub baseline_period_ms: u64,
    pub counters: CycleCounters,
    pub source: Option<String>,
    pub catalog_entries: usize,
    pub catalog_error: Option<String>,
    /// A record that failed to persist and is waiting for the store.
    pub holding_uncommitted: bool,
    pub last_error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: ServiceState::Idle,
            run_id: None,
            generation: 0,
            last_success_timestamp_ms: None,
            consecutive_failures: 0,
            restart_count: 0,
            current_period_ms: 0,
            baseline_period_ms: 0,
            counters: CycleCounters::default(),
            source: None,
            catalog_entries: 0,
            catalog_error: None,
            holding_uncommitted: false,
            last_error: None,
        }
    }
}

/// Shared status written by the run loop and read by the control surface.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn set_state(&self, state: ServiceState) {
        self.update(|s| s.state = state);
    }

    pub fn state(&self) -> ServiceState {
        self.snapshot().state
    }
}
