//! Control surface: start, stop, run once, status.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rand::RngCore;

use crate::catalog::CatalogStore;
use crate::config::ShelfConfig;
use crate::detect::{BackendRegistry, DetectionPass, DetectionResult, StubBackend};
use crate::error::{CatalogError, CycleError, PersistenceError, SupervisorError};
use crate::ingest::source_from_settings;
use crate::state::{
    ActiveStateReader, ActiveStateRecord, HistoryEntry, SqliteActiveStateStore, VisualExporter,
};
use crate::supervisor::{
    Control, Pipeline, Runner, ServiceState, StatusBoard, StatusSnapshot, SupervisorPolicy,
};

struct LoopHandle {
    control: Sender<Control>,
    /// Disconnects when the loop thread exits.
    done: Receiver<()>,
    join: JoinHandle<Pipeline>,
}

/// One shelf, one service. Owns the pipeline while idle and lends it to the
/// run loop thread while started.
pub struct ShelfService {
    policy: SupervisorPolicy,
    board: Arc<StatusBoard>,
    pipeline: Option<Pipeline>,
    running: Option<LoopHandle>,
    reader: Mutex<Box<dyn ActiveStateReader>>,
}

impl ShelfService {
    pub fn new(pipeline: Pipeline, policy: SupervisorPolicy) -> Result<Self, PersistenceError> {
        let reader = pipeline.store.reader()?;
        Ok(Self {
            policy,
            board: Arc::new(StatusBoard::new()),
            pipeline: Some(pipeline),
            running: None,
            reader: Mutex::new(reader),
        })
    }

    /// Build the whole pipeline from configuration.
    pub fn from_config(cfg: &ShelfConfig) -> Result<Self> {
        let source = source_from_settings(&cfg.source)
            .with_context(|| format!("unusable frame source '{}'", cfg.source.uri))?;
        let registry = build_registry(cfg)?;
        let backend = registry.resolve(Some(cfg.detection.backend.as_str()))?;
        let pass = DetectionPass::new(backend, cfg.detection.iou_threshold);
        let store = SqliteActiveStateStore::open(&cfg.store.db_path)
            .with_context(|| format!("failed to open active state {}", cfg.store.db_path))?;

        let mut pipeline = Pipeline::new(source, pass, Box::new(store), &cfg.catalog_path)
            .with_detection_deadline(cfg.detection.deadline)
            .with_jpeg_quality(cfg.store.jpeg_quality)
            .with_history_retention(cfg.store.history_retention);
        if let Some(dir) = &cfg.store.visual_dir {
            pipeline = pipeline.with_exporter(VisualExporter::new(dir, cfg.store.visual_keep)?);
        }
        Ok(Self::new(pipeline, cfg.supervisor.clone())?)
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Idle (or Failed) -> Starting. Spawns the run loop thread; the loop
    /// opens the source and loads the catalog itself.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        self.reclaim();
        if self.running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| SupervisorError::Init("pipeline unavailable".into()))?;

        let run_id = new_run_id();
        self.board.update(|s| {
            *s = StatusSnapshot {
                state: ServiceState::Starting,
                run_id: Some(run_id.clone()),
                ..StatusSnapshot::default()
            }
        });
        log::info!("starting shelf service {}", run_id);

        let (control_tx, control_rx) = unbounded();
        let (done_tx, done_rx) = bounded::<()>(1);
        let runner = Runner::new(
            pipeline,
            self.policy.clone(),
            Arc::clone(&self.board),
            control_rx,
            run_id,
        );
        let join = thread::Builder::new()
            .name("shelf-supervisor".into())
            .spawn(move || {
                let pipeline = runner.run();
                drop(done_tx);
                pipeline
            })
            .map_err(|e| {
                self.board.set_state(ServiceState::Failed);
                SupervisorError::Spawn(e)
            })?;
        self.running = Some(LoopHandle {
            control: control_tx,
            done: done_rx,
            join,
        });
        Ok(())
    }

    /// Ask the loop to stop and wait up to `grace` (the policy's stop grace
    /// when `None`). The in-flight cycle finishes or is abandoned; a commit in
    /// progress is never interrupted.
    pub fn stop(&mut self, grace: Option<Duration>) -> Result<(), SupervisorError> {
        let grace = grace.unwrap_or(self.policy.stop_grace);
        let Some(handle) = self.running.as_ref() else {
            if self.board.state() == ServiceState::Failed {
                self.board.set_state(ServiceState::Idle);
                return Ok(());
            }
            return Err(SupervisorError::NotRunning);
        };
        if self.board.state() != ServiceState::Failed {
            self.board.set_state(ServiceState::Stopping);
        }
        // A closed channel means the loop already exited.
        let _ = handle.control.send(Control::Stop);
        match handle.done.recv_timeout(grace) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("run loop did not stop within {:?}", grace);
                return Err(SupervisorError::StopTimeout(grace));
            }
        }
        self.reclaim();
        if self.board.state() == ServiceState::Failed {
            self.board.set_state(ServiceState::Idle);
        }
        Ok(())
    }

    /// Run one cycle now. Goes through the run loop when it is running,
    /// otherwise opens the pipeline, runs a single cycle and closes it again.
    pub fn run_once(&mut self) -> Result<DetectionResult, CycleError> {
        self.reclaim();
        if let Some(handle) = self.running.as_ref() {
            let (reply_tx, reply_rx) = bounded(1);
            handle
                .control
                .send(Control::RunOnce(reply_tx))
                .map_err(|_| CycleError::Unavailable)?;
            return reply_rx.recv().unwrap_or(Err(CycleError::Cancelled));
        }

        let pipeline = self.pipeline.take().ok_or(CycleError::Unavailable)?;
        // Keep the sender alive so the runner does not read a closed channel as stop.
        let (_control_tx, control_rx) = unbounded();
        let mut runner = Runner::new(
            pipeline,
            self.policy.clone(),
            Arc::clone(&self.board),
            control_rx,
            new_run_id(),
        );
        let outcome = runner.run_single();
        self.pipeline = Some(runner.shutdown());
        outcome
    }

    /// Reload the catalog. Asynchronous while running: the loop swaps it in
    /// between cycles.
    pub fn reload_catalog(&mut self) -> Result<(), CatalogError> {
        self.reclaim();
        if let Some(handle) = self.running.as_ref() {
            if handle.control.send(Control::ReloadCatalog).is_ok() {
                return Ok(());
            }
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };
        match &pipeline.catalog {
            Some(store) => store.reload().map(|_| ()),
            None => {
                let store = CatalogStore::open(&pipeline.catalog_path)?;
                pipeline.catalog = Some(Arc::new(store));
                Ok(())
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.board.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some() && self.board.state().is_active()
    }

    /// Block until the state satisfies `pred` or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&StatusSnapshot) -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if pred(&self.board.snapshot()) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Latest committed record, through the read-only handle.
    pub fn active_state(&self) -> Result<Option<ActiveStateRecord>, PersistenceError> {
        let reader = self.reader.lock().map_err(|_| PersistenceError::Poisoned)?;
        reader.read()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
        let reader = self.reader.lock().map_err(|_| PersistenceError::Poisoned)?;
        reader.history(limit)
    }

    /// Join a loop thread that has already exited and take the pipeline back.
    fn reclaim(&mut self) {
        let finished = match self.running.as_ref() {
            Some(handle) => matches!(
                handle.done.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            ),
            None => false,
        };
        if !finished {
            return;
        }
        if let Some(handle) = self.running.take() {
            match handle.join.join() {
                Ok(pipeline) => self.pipeline = Some(pipeline),
                Err(_) => {
                    log::error!("run loop thread panicked; pipeline lost");
                    self.board.update(|s| {
                        s.state = ServiceState::Failed;
                        s.last_error = Some("run loop thread panicked".into());
                    });
                }
            }
        }
    }
}

impl Drop for ShelfService {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop(None) {
                log::warn!("shelf service dropped while running: {}", e);
            }
        }
    }
}

fn build_registry(cfg: &ShelfConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::with_detections(
        cfg.detection.stub_detections.clone(),
    ));

    #[cfg(feature = "backend-tract")]
    if let Some(model_path) = &cfg.detection.model_path {
        let backend = crate::detect::TractBackend::new(
            model_path,
            cfg.detection.model_width,
            cfg.detection.model_height,
        )?
        .with_threshold(cfg.detection.confidence_threshold);
        registry.register(backend);
    }

    if registry.get(&cfg.detection.backend).is_none() {
        return Err(anyhow!(
            "detector backend '{}' is not available in this build (have: {:?})",
            cfg.detection.backend,
            registry.list()
        ));
    }
    Ok(registry)
}

fn new_run_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("run-{}", hex::encode(bytes))
}
