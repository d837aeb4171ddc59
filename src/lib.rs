//! Shelf Watch
//!
//! A long-running service that watches one retail shelf through a camera (or
//! a still image), detects products against a hand-maintained catalog of
//! labeled regions, and keeps a persisted "active state" of what is on the
//! shelf and what is missing.
//!
//! # Architecture
//!
//! One supervised run loop per shelf:
//!
//! 1. A frame source produces the newest frame (`ingest`, `frame`).
//! 2. A detection pass scores it against the region catalog on a worker
//!    thread with a deadline (`detect`, `catalog`).
//! 3. The result and its before/after images are committed atomically
//!    (`state`, `annotate`).
//! 4. The supervisor tracks health, backs off and restarts the pipeline, and
//!    gives up into `Failed` when restarts run out (`supervisor`).
//!
//! `service::ShelfService` is the control surface: start, stop, run once,
//! status.
//!
//! # Module Structure
//!
//! - `catalog`: region catalog loading and the load-then-swap store
//! - `frame`: owned frames and the latest-frame slot
//! - `ingest`: frame sources (synthetic, still image, watched file)
//! - `detect`: backends, IoU matching, the timed detection worker
//! - `annotate`: after-image drawing and JPEG encoding
//! - `state`: active state stores (SQLite, in-memory) and visual export
//! - `supervisor`: health policy, cadence, run loop
//! - `service`: control surface
//! - `config`: configuration loading
//! - `error`: error taxonomy

use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod service;
pub mod state;
pub mod supervisor;
pub mod ui;

pub use catalog::{BoundingBox, Catalog, CatalogEntry, CatalogStore};
pub use config::ShelfConfig;
pub use detect::{
    BackendRegistry, DetectionPass, DetectionResult, DetectionWorker, DetectorBackend,
    MatchedProduct, RawDetection, StubBackend,
};
pub use error::{
    CatalogError, CycleError, DetectionError, PersistenceError, SourceError, SupervisorError,
};
pub use frame::{Frame, LatestFrameSlot};
pub use ingest::{source_from_settings, FrameSource, SourceSettings};
pub use service::ShelfService;
pub use state::{
    ActiveStateReader, ActiveStateRecord, ActiveStateStore, InMemoryActiveStateStore,
    SqliteActiveStateStore,
};
pub use supervisor::{Pipeline, ServiceState, StatusSnapshot, SupervisorPolicy};

/// Wall-clock time in milliseconds since the Unix epoch (0 if the clock is
/// before the epoch).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
