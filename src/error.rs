//! Error taxonomy for the shelf service.
//!
//! Every failure a cycle can produce is typed so the supervisor can decide
//! between "count it and back off" and "stop and ask for help". Only
//! `SupervisorError::Exhausted` and catalog load failures are user-visible
//! through `status()`; everything else ends up in the cycle counters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A catalog could not be loaded. The previous catalog stays active.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("catalog entry '{product_id}' is missing field '{field}'")]
    MissingField {
        product_id: String,
        field: &'static str,
    },
    #[error("catalog entry '{product_id}' has an invalid box {coords:?}: {reason}")]
    InvalidBox {
        product_id: String,
        coords: [i64; 4],
        reason: &'static str,
    },
    #[error("duplicate product id '{0}' in catalog")]
    DuplicateId(String),
    #[error("invalid product id '{0}': must match ^[A-Za-z0-9_.-]{{1,64}}$")]
    InvalidId(String),
    #[error("catalog lock poisoned")]
    Poisoned,
}

/// The frame source is broken (as opposed to merely having no new frame).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("frame source '{0}' is not open")]
    NotOpen(String),
    #[error("frame source '{source_name}' disconnected: {reason}")]
    Disconnected { source_name: String, reason: String },
    #[error("failed to decode frame from '{source_name}': {reason}")]
    Decode { source_name: String, reason: String },
    #[error("frame source '{source_name}' i/o error: {source}")]
    Io {
        source_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported frame source '{0}'")]
    Unsupported(String),
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BadFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// The detection pass did not produce a usable result.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detection exceeded its deadline of {0:?}")]
    Timeout(Duration),
    #[error("detector backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },
    #[error("detection worker is gone")]
    WorkerGone,
}

/// The active state store could not persist or read a record.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("active state database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("active state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("active state i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("stored record is inconsistent: {0}")]
    Corrupt(String),
    #[error("active state lock poisoned")]
    Poisoned,
}

/// Control surface errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor exhausted: {restarts} restarts within {window:?}")]
    Exhausted { restarts: u32, window: Duration },
    #[error("service is already running")]
    AlreadyRunning,
    #[error("service is not running")]
    NotRunning,
    #[error("service initialization failed: {0}")]
    Init(String),
    #[error("run loop thread could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("run loop did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("run loop is gone")]
    LoopGone,
}

/// Why a single cycle failed. Each variant maps to one failure counter.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no frame available within {0:?}")]
    Empty(Duration),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("cycle cancelled by stop request")]
    Cancelled,
    #[error("service pipeline is unavailable")]
    Unavailable,
}

impl CycleError {
    /// Short label used for counters and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Empty(_) => "empty",
            CycleError::Source(_) => "source",
            CycleError::Detection(DetectionError::Timeout(_)) => "detection_timeout",
            CycleError::Detection(_) => "detection",
            CycleError::Persistence(_) => "persistence",
            CycleError::Catalog(_) => "catalog",
            CycleError::Cancelled => "cancelled",
            CycleError::Unavailable => "unavailable",
        }
    }
}
