#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shelf_watch::error::{PersistenceError, SourceError};
use shelf_watch::ingest::SourceStats;
use shelf_watch::state::{ActiveStateReader, HistoryEntry};
use shelf_watch::{
    ActiveStateRecord, ActiveStateStore, BoundingBox, Catalog, CatalogEntry, CatalogStore,
    DetectorBackend, Frame, FrameSource, InMemoryActiveStateStore, RawDetection,
};

pub const WIDTH: u32 = 100;
pub const HEIGHT: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub enum SourceMode {
    /// Never has a frame.
    Empty,
    /// A fresh black frame on every call.
    Frames,
    /// `open` always fails.
    Broken,
}

/// Frame source driven by the test. Shares its open flag and call log.
pub struct ScriptedSource {
    mode: SourceMode,
    pub open: Arc<AtomicBool>,
    pub calls: Arc<Mutex<Vec<Instant>>>,
    pub opens: Arc<AtomicUsize>,
    sequence: u64,
}

impl ScriptedSource {
    pub fn new(mode: SourceMode) -> Self {
        Self {
            mode,
            open: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(Mutex::new(Vec::new())),
            opens: Arc::new(AtomicUsize::new(0)),
            sequence: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self) -> Result<(), SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let SourceMode::Broken = self.mode {
            return Err(SourceError::Disconnected {
                source_name: "scripted".into(),
                reason: "camera unplugged".into(),
            });
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SourceError::NotOpen("scripted".into()));
        }
        self.calls.lock().unwrap().push(Instant::now());
        match self.mode {
            SourceMode::Empty | SourceMode::Broken => {
                thread::sleep(timeout);
                Ok(None)
            }
            SourceMode::Frames => {
                self.sequence += 1;
                let pixels = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
                Frame::new(pixels, WIDTH, HEIGHT, self.sequence, shelf_watch::now_ms()).map(Some)
            }
        }
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            name: "scripted".into(),
            frames_captured: self.sequence,
            frames_dropped: 0,
        }
    }
}

/// Backend that sleeps, flags that it started, and reports fixed boxes.
/// Panics once when `panic_next` is set.
pub struct ScriptedBackend {
    pub delay: Duration,
    pub detections: Vec<RawDetection>,
    pub entered: Arc<AtomicBool>,
    pub panic_next: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new(delay: Duration, detections: Vec<RawDetection>) -> Self {
        Self {
            delay,
            detections,
            entered: Arc::new(AtomicBool::new(false)),
            panic_next: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
        self.entered.store(true, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("detector crashed mid-frame");
        }
        thread::sleep(self.delay);
        Ok(self.detections.clone())
    }
}

/// In-memory store whose commits fail while `failing` is set, and for the
/// next `fail_next` commits.
#[derive(Clone)]
pub struct FlakyStore {
    pub inner: InMemoryActiveStateStore,
    pub failing: Arc<AtomicBool>,
    pub fail_next: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryActiveStateStore::new(),
            failing: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_first(commits: usize) -> Self {
        let store = Self::new();
        store.fail_next.store(commits, Ordering::SeqCst);
        store
    }
}

impl ActiveStateReader for FlakyStore {
    fn read(&self) -> Result<Option<ActiveStateRecord>, PersistenceError> {
        self.inner.read()
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
        self.inner.history(limit)
    }
}

impl ActiveStateStore for FlakyStore {
    fn commit(&mut self, record: &ActiveStateRecord) -> Result<(), PersistenceError> {
        let scheduled = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled || self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Corrupt("disk full".into()));
        }
        self.inner.commit(record)
    }

    fn prune_history(&mut self, retention: Duration) -> Result<usize, PersistenceError> {
        self.inner.prune_history(retention)
    }

    fn reader(&self) -> Result<Box<dyn ActiveStateReader>, PersistenceError> {
        Ok(Box::new(self.clone()))
    }
}

pub fn shampoo_catalog() -> Catalog {
    Catalog::from_entries(vec![CatalogEntry {
        product_id: "shampoo".into(),
        display_name: "Shampoo 500ml".into(),
        bounding_box: BoundingBox::new(10, 10, 50, 50),
    }])
    .unwrap()
}

pub fn shampoo_store() -> CatalogStore {
    CatalogStore::from_catalog("memory://catalog", shampoo_catalog())
}

pub fn shampoo_detection() -> RawDetection {
    RawDetection::new(BoundingBox::new(12, 12, 48, 48), 0.9)
}
