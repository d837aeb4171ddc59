//! The run loop: one thread per started service.
//!
//! Each cycle takes the newest frame, runs the detection pass on the worker
//! under its deadline, and commits the result. Between cycles the loop sleeps
//! until the cadence allows the next start. Control messages are honoured
//! before `next_frame`, while waiting on detection, and between detection and
//! commit. A commit that has begun always runs to completion.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::Rng;

use crate::annotate;
use crate::catalog::{Catalog, CatalogStore};
use crate::detect::{DetectionOutput, DetectionPass, DetectionResult, DetectionWorker, PendingDetection};
use crate::error::{CycleError, DetectionError, SupervisorError};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::state::{ActiveStateRecord, ActiveStateStore, VisualExporter};

use super::cadence;
use super::policy::SupervisorPolicy;
use super::state::{CycleCounters, ServiceState, SupervisorState, Verdict};
use super::status::StatusBoard;

/// Longest uninterrupted wait on the source or the worker, so stop requests
/// are noticed promptly.
const CONTROL_POLL_SLICE: Duration = Duration::from_millis(50);
const HISTORY_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DETECTION_DEADLINE: Duration = Duration::from_secs(2);
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Messages from the control surface to the run loop.
pub enum Control {
    Stop,
    RunOnce(Sender<Result<DetectionResult, CycleError>>),
    ReloadCatalog,
}

/// Everything a run loop needs. Handed to the loop thread on start and handed
/// back when it exits.
pub struct Pipeline {
    pub source: Box<dyn FrameSource>,
    pub pass: DetectionPass,
    pub detection_deadline: Duration,
    pub store: Box<dyn ActiveStateStore>,
    pub exporter: Option<VisualExporter>,
    pub catalog_path: PathBuf,
    pub catalog: Option<Arc<CatalogStore>>,
    pub jpeg_quality: u8,
    pub history_retention: Option<Duration>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        pass: DetectionPass,
        store: Box<dyn ActiveStateStore>,
        catalog_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            pass,
            detection_deadline: DEFAULT_DETECTION_DEADLINE,
            store,
            exporter: None,
            catalog_path: catalog_path.into(),
            catalog: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            history_retention: None,
        }
    }

    /// Use an already-loaded catalog instead of loading `catalog_path` on start.
    pub fn with_catalog(mut self, catalog: CatalogStore) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    pub fn with_exporter(mut self, exporter: VisualExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_detection_deadline(mut self, deadline: Duration) -> Self {
        self.detection_deadline = deadline;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn with_history_retention(mut self, retention: Duration) -> Self {
        self.history_retention = Some(retention);
        self
    }
}

pub struct Runner {
    pipeline: Pipeline,
    state: SupervisorState,
    counters: CycleCounters,
    board: Arc<StatusBoard>,
    control: Receiver<Control>,
    run_id: String,
    worker: Option<DetectionWorker>,
    held: Option<ActiveStateRecord>,
    waiters: VecDeque<Sender<Result<DetectionResult, CycleError>>>,
    stop_requested: bool,
    reload_requested: bool,
    last_error: Option<String>,
}

impl Runner {
    pub fn new(
        pipeline: Pipeline,
        policy: SupervisorPolicy,
        board: Arc<StatusBoard>,
        control: Receiver<Control>,
        run_id: String,
    ) -> Self {
        let mut state = SupervisorState::new(policy);
        state.last_success_ms = match pipeline.store.read() {
            Ok(record) => record.map(|r| r.last_success_timestamp_ms),
            Err(e) => {
                log::warn!("active state unreadable at start: {}", e);
                None
            }
        };
        Self {
            pipeline,
            state,
            counters: CycleCounters::default(),
            board,
            control,
            run_id,
            worker: None,
            held: None,
            waiters: VecDeque::new(),
            stop_requested: false,
            reload_requested: false,
            last_error: None,
        }
    }

    /// Supervised run: bring the pipeline up, loop until stopped or failed.
    pub fn run(mut self) -> Pipeline {
        self.publish();
        if self.start_with_retries() {
            self.main_loop();
        }
        self.shutdown()
    }

    /// A single cycle outside the supervised loop. The pipeline is opened
    /// for the cycle and closed again by `shutdown`.
    pub fn run_single(&mut self) -> Result<DetectionResult, CycleError> {
        self.bring_up()?;
        self.state.pipeline_started();
        self.publish();
        let outcome = self.run_cycle();
        self.record_outcome(&outcome);
        outcome
    }

    /// Close the source, release the worker, and return the pipeline.
    pub fn shutdown(mut self) -> Pipeline {
        let failed = self.state.mode() == ServiceState::Failed;
        if !failed {
            self.state.set_mode(ServiceState::Stopping);
            self.publish();
        }
        self.pipeline.source.close();
        self.worker.take();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(CycleError::Cancelled));
        }
        if !failed {
            self.state.set_mode(ServiceState::Idle);
        }
        self.publish();
        log::info!(
            "run loop {} finished: state={} cycles={} successes={}",
            self.run_id,
            self.state.mode(),
            self.counters.cycles,
            self.counters.successes
        );
        self.pipeline
    }

    // ------------------------------------------------------------------------
    // Start-up and restarts
    // ------------------------------------------------------------------------

    fn start_with_retries(&mut self) -> bool {
        loop {
            self.drain_control();
            if self.stop_requested {
                return false;
            }
            match self.bring_up() {
                Ok(()) => {
                    self.state.pipeline_started();
                    log::info!(
                        "shelf service {} running: source={} period={:?}",
                        self.run_id,
                        self.pipeline.source.name(),
                        self.state.current_period
                    );
                    self.publish();
                    return true;
                }
                Err(e) => {
                    self.counters.record_error(&e);
                    log::warn!("start-up failed ({}): {}", e.kind(), e);
                    if self.state.note_restart(Instant::now()) {
                        self.fail(SupervisorError::Exhausted {
                            restarts: self.state.restart_count,
                            window: self.state.policy().restart_window,
                        });
                        return false;
                    }
                    self.counters.restarts += 1;
                    self.publish();
                    let delay = self.state.startup_backoff() + self.jitter();
                    self.sleep_interruptible(delay);
                }
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), CycleError> {
        if self.pipeline.catalog.is_none() {
            let store = CatalogStore::open(&self.pipeline.catalog_path).map_err(|e| {
                let message = e.to_string();
                self.board.update(|s| s.catalog_error = Some(message));
                e
            })?;
            self.pipeline.catalog = Some(Arc::new(store));
        }
        self.pipeline.source.open()?;
        self.ensure_worker()
    }

    /// Spawn the detection worker, replacing one whose thread has exited.
    fn ensure_worker(&mut self) -> Result<(), CycleError> {
        if self.worker.as_ref().is_some_and(DetectionWorker::is_alive) {
            return Ok(());
        }
        if self.worker.take().is_some() {
            log::warn!("detection worker exited; respawning");
        }
        self.pipeline.pass.warm_up()?;
        self.worker = Some(DetectionWorker::spawn(
            self.pipeline.pass.clone(),
            self.pipeline.detection_deadline,
        )?);
        Ok(())
    }

    fn restart_pipeline(&mut self) {
        self.counters.restarts += 1;
        self.reload_catalog();
        self.pipeline.source.close();
        let delay = self.jitter();
        self.sleep_interruptible(delay);
        if self.stop_requested {
            return;
        }
        if let Err(e) = self.ensure_worker() {
            self.counters.detection_errors += 1;
            log::warn!("detection worker restart failed: {}", e);
        }
        match self.pipeline.source.open() {
            Ok(()) => {
                self.state.pipeline_started();
                log::info!(
                    "pipeline restarted: generation={} period={:?}",
                    self.state.generation,
                    self.state.current_period
                );
            }
            Err(e) => {
                self.counters.source_errors += 1;
                log::warn!("source reopen failed: {}", e);
            }
        }
    }

    fn reload_catalog(&mut self) {
        if let Some(catalog) = &self.pipeline.catalog {
            if catalog.reload().is_err() {
                self.counters.catalog_errors += 1;
            }
        }
    }

    fn fail(&mut self, err: SupervisorError) {
        log::error!("shelf service {} failed: {}", self.run_id, err);
        self.state.set_mode(ServiceState::Failed);
        self.last_error = Some(err.to_string());
        self.publish();
    }

    fn jitter(&self) -> Duration {
        let max = self.state.policy().restart_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    // ------------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------------

    fn main_loop(&mut self) {
        let mut last_health_log = Instant::now();
        let mut last_prune = Instant::now();
        loop {
            self.drain_control();
            if self.stop_requested {
                return;
            }
            if self.reload_requested {
                self.reload_requested = false;
                self.reload_catalog();
            }

            let started = Instant::now();
            let outcome = self.run_cycle();
            log::debug!("cycle finished in {:?}", started.elapsed());
            let verdict = self.record_outcome(&outcome);
            if let Some(waiter) = self.waiters.pop_front() {
                let _ = waiter.send(outcome);
            }

            match verdict {
                Verdict::Steady => {}
                Verdict::Recovered => {
                    log::info!(
                        "recovered after {} successes; period back to {:?}",
                        self.state.policy().recovery_successes,
                        self.state.current_period
                    );
                }
                Verdict::Degrade | Verdict::Restart => {
                    log::warn!(
                        "{} consecutive failures: {}; backing off to {:?}",
                        self.state.consecutive_failures,
                        if verdict == Verdict::Degrade { "degraded" } else { "still degraded, restarting" },
                        self.state.current_period
                    );
                    self.publish();
                    self.restart_pipeline();
                }
                Verdict::Exhausted => {
                    self.fail(SupervisorError::Exhausted {
                        restarts: self.state.restart_count,
                        window: self.state.policy().restart_window,
                    });
                    return;
                }
            }
            self.publish();

            if last_health_log.elapsed() >= self.state.policy().health_log_interval {
                let stats = self.pipeline.source.stats();
                log::info!(
                    "shelf health state={} source={} frames={} dropped={} cycles={} successes={} failures={} period={:?}",
                    self.state.mode(),
                    stats.name,
                    stats.frames_captured,
                    stats.frames_dropped,
                    self.counters.cycles,
                    self.counters.successes,
                    self.counters.failures(),
                    self.state.current_period
                );
                last_health_log = Instant::now();
            }

            if let Some(retention) = self.pipeline.history_retention {
                if last_prune.elapsed() >= HISTORY_PRUNE_INTERVAL {
                    match self.pipeline.store.prune_history(retention) {
                        Ok(removed) if removed > 0 => {
                            log::debug!("pruned {} history entries", removed)
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("history prune failed: {}", e),
                    }
                    last_prune = Instant::now();
                }
            }

            if !self.waiters.is_empty() {
                continue;
            }
            let next = cadence::next_start(started, self.state.current_period, Instant::now());
            self.wait_until(next);
        }
    }

    fn record_outcome(&mut self, outcome: &Result<DetectionResult, CycleError>) -> Verdict {
        match outcome {
            Ok(result) => {
                self.counters.record_success();
                log::debug!(
                    "cycle ok: frame={} matched={} missing={} unlabeled={}",
                    result.frame_sequence,
                    result.matched.len(),
                    result.missing.len(),
                    result.unlabeled.len()
                );
                self.state.record_success(result.timestamp_ms)
            }
            Err(e @ (CycleError::Cancelled | CycleError::Unavailable)) => {
                self.counters.record_error(e);
                Verdict::Steady
            }
            Err(e) => {
                self.counters.record_error(e);
                log::warn!("cycle failed ({}): {}", e.kind(), e);
                self.state.record_failure(Instant::now())
            }
        }
    }

    // ------------------------------------------------------------------------
    // One cycle
    // ------------------------------------------------------------------------

    fn run_cycle(&mut self) -> Result<DetectionResult, CycleError> {
        self.retry_held();
        let frame = self.fetch_frame()?;
        let catalog = self
            .pipeline
            .catalog
            .as_ref()
            .ok_or(CycleError::Unavailable)?
            .snapshot()?;
        let pending = self
            .worker
            .as_ref()
            .ok_or(DetectionError::WorkerGone)?
            .submit(frame, Arc::clone(&catalog))?;
        let output = self.await_detection(pending)?;
        let DetectionOutput { frame, result, elapsed } = output;
        let result = result?;
        log::debug!("detection pass took {:?}", elapsed);

        self.drain_control();
        if self.stop_requested {
            return Err(CycleError::Cancelled);
        }
        self.commit(frame, &result, &catalog)?;
        Ok(result)
    }

    fn fetch_frame(&mut self) -> Result<Frame, CycleError> {
        let budget = self.state.policy().frame_timeout;
        let deadline = Instant::now() + budget;
        loop {
            let remaining = cadence::until(deadline, Instant::now());
            if remaining.is_zero() {
                return Err(CycleError::Empty(budget));
            }
            if let Some(frame) = self
                .pipeline
                .source
                .next_frame(remaining.min(CONTROL_POLL_SLICE))?
            {
                return Ok(frame);
            }
            self.drain_control();
            if self.stop_requested {
                return Err(CycleError::Cancelled);
            }
        }
    }

    fn await_detection(&mut self, pending: PendingDetection) -> Result<DetectionOutput, CycleError> {
        loop {
            let remaining = cadence::until(pending.deadline(), Instant::now());
            if remaining.is_zero() {
                return Err(DetectionError::Timeout(pending.budget()).into());
            }
            match pending.receiver().recv_timeout(remaining.min(CONTROL_POLL_SLICE)) {
                Ok(output) => return Ok(output),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DetectionError::WorkerGone.into());
                }
            }
            self.drain_control();
            if self.stop_requested {
                log::info!("stop requested during detection; abandoning the pass");
                return Err(CycleError::Cancelled);
            }
        }
    }

    fn commit(&mut self, frame: Frame, result: &DetectionResult, catalog: &Catalog) -> Result<(), CycleError> {
        let quality = self.pipeline.jpeg_quality;
        let before = annotate::encode_jpeg(&frame.to_image(), quality)?;
        let after = annotate::encode_jpeg(&annotate::annotate(&frame, result, catalog), quality)?;
        drop(frame);

        let record = ActiveStateRecord::new(
            result.clone(),
            before,
            after,
            self.run_id.clone(),
            self.state.generation,
            self.state.consecutive_failures,
        );
        if let Err(e) = self.pipeline.store.commit(&record) {
            self.held = Some(record);
            return Err(e.into());
        }
        if let Some(stale) = self.held.take() {
            log::info!(
                "dropping held record from generation {}; superseded by a newer commit",
                stale.generation
            );
        }
        self.export(&record);
        Ok(())
    }

    fn retry_held(&mut self) {
        let Some(record) = self.held.take() else {
            return;
        };
        match self.pipeline.store.commit(&record) {
            Ok(()) => {
                log::info!("held record from generation {} committed", record.generation);
                self.export(&record);
            }
            Err(e) => {
                log::debug!("store still unavailable: {}", e);
                self.held = Some(record);
            }
        }
    }

    fn export(&mut self, record: &ActiveStateRecord) {
        if let Some(exporter) = self.pipeline.exporter.as_mut() {
            if let Err(e) = exporter.export(record) {
                log::warn!("visual export failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Control and status
    // ------------------------------------------------------------------------

    fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Stop => {
                if !self.stop_requested {
                    log::info!("stop requested");
                }
                self.stop_requested = true;
                self.board.set_state(ServiceState::Stopping);
            }
            Control::RunOnce(reply) => self.waiters.push_back(reply),
            Control::ReloadCatalog => self.reload_requested = true,
        }
    }

    fn drain_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(msg) => self.handle_control(msg),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.stop_requested = true;
                    return;
                }
            }
        }
    }

    /// Sleep until `at`, waking early for stop or run-once requests.
    fn wait_until(&mut self, at: Instant) {
        loop {
            let remaining = cadence::until(at, Instant::now());
            if remaining.is_zero() || self.stop_requested {
                return;
            }
            match self.control.recv_timeout(remaining) {
                Ok(msg) => {
                    self.handle_control(msg);
                    if self.stop_requested || !self.waiters.is_empty() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    self.stop_requested = true;
                    return;
                }
            }
        }
    }

    fn sleep_interruptible(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        self.wait_until(at);
    }

    fn publish(&self) {
        let mode = if self.stop_requested && self.state.mode() != ServiceState::Failed {
            match self.state.mode() {
                ServiceState::Idle => ServiceState::Idle,
                _ => ServiceState::Stopping,
            }
        } else {
            self.state.mode()
        };
        let catalog = self.pipeline.catalog.as_ref();
        let catalog_entries = catalog
            .and_then(|c| c.snapshot().ok())
            .map(|c| c.len())
            .unwrap_or(0);
        let catalog_error = catalog.and_then(|c| c.last_error());
        let source = self.pipeline.source.name().to_string();
        self.board.update(|s| {
            s.state = mode;
            s.run_id = Some(self.run_id.clone());
            s.generation = self.state.generation;
            s.last_success_timestamp_ms = self.state.last_success_ms;
            s.consecutive_failures = self.state.consecutive_failures;
            s.restart_count = self.state.restart_count;
            s.current_period_ms = self.state.current_period.as_millis() as u64;
            s.baseline_period_ms = self.state.baseline_period.as_millis() as u64;
            s.counters = self.counters.clone();
            s.source = Some(source);
            if catalog.is_some() {
                s.catalog_entries = catalog_entries;
                s.catalog_error = catalog_error;
            }
            s.holding_uncommitted = self.held.is_some();
            s.last_error = self.last_error.clone();
        });
    }
}
