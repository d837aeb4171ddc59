//! Detection pass and the timed worker thread that runs it.
//!
//! The run loop hands a frame to the worker by value and waits for it until a
//! deadline. A pass that overruns is abandoned: the loop moves on, and the
//! worker keeps the job until the backend returns. While that abandoned job is
//! still running, `submit` refuses new work with `DetectionError::Timeout`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::catalog::Catalog;
use crate::error::DetectionError;
use crate::frame::Frame;

use super::backend::DetectorBackend;
use super::matching::match_detections;
use super::registry::SharedBackend;
use super::result::DetectionResult;

/// One detection pass: backend boxes matched against a catalog snapshot.
#[derive(Clone)]
pub struct DetectionPass {
    backend: SharedBackend,
    iou_threshold: f64,
}

impl DetectionPass {
    pub fn new(backend: SharedBackend, iou_threshold: f64) -> Self {
        Self {
            backend,
            iou_threshold,
        }
    }

    pub fn iou_threshold(&self) -> f64 {
        self.iou_threshold
    }

    pub fn backend_name(&self) -> String {
        self.lock_backend().name().to_string()
    }

    /// A backend that panicked mid-pass leaves the lock poisoned. The next
    /// pass takes it over anyway; the backend's own state is all it guards.
    fn lock_backend(&self) -> MutexGuard<'_, dyn DetectorBackend + 'static> {
        self.backend.lock().unwrap_or_else(|poisoned| {
            log::warn!("detector backend panicked earlier; reusing it");
            self.backend.clear_poison();
            poisoned.into_inner()
        })
    }

    pub fn warm_up(&self) -> Result<(), DetectionError> {
        let mut backend = self.lock_backend();
        backend.warm_up().map_err(|e| DetectionError::Backend {
            backend: backend.name().to_string(),
            reason: format!("{:#}", e),
        })
    }

    /// Run the backend on `frame` and match its boxes against `catalog`.
    /// Reads nothing but its arguments and the backend.
    pub fn detect(&self, frame: &Frame, catalog: &Catalog) -> Result<DetectionResult, DetectionError> {
        let raw = {
            let mut backend = self.lock_backend();
            backend.detect(frame).map_err(|e| DetectionError::Backend {
                backend: backend.name().to_string(),
                reason: format!("{:#}", e),
            })?
        };
        let mut result = match_detections(&raw, catalog, self.iou_threshold);
        result.frame_sequence = frame.sequence;
        result.captured_at_ms = frame.captured_at_ms;
        result.timestamp_ms = crate::now_ms();
        Ok(result)
    }
}

/// What the worker hands back: the frame it borrowed and the pass outcome.
pub struct DetectionOutput {
    pub frame: Frame,
    pub result: Result<DetectionResult, DetectionError>,
    pub elapsed: Duration,
}

struct Job {
    frame: Frame,
    catalog: Arc<Catalog>,
    reply: Sender<DetectionOutput>,
}

/// A submitted job. Dropping it abandons the result.
pub struct PendingDetection {
    rx: Receiver<DetectionOutput>,
    deadline: Instant,
    budget: Duration,
}

impl PendingDetection {
    /// Channel the output arrives on, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<DetectionOutput> {
        &self.rx
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Block until the output arrives or the deadline passes.
    pub fn wait(self) -> Result<DetectionOutput, DetectionError> {
        match self.rx.recv_deadline(self.deadline) {
            Ok(output) => Ok(output),
            Err(RecvTimeoutError::Timeout) => Err(DetectionError::Timeout(self.budget)),
            Err(RecvTimeoutError::Disconnected) => Err(DetectionError::WorkerGone),
        }
    }
}

/// Dedicated detection thread with a per-job deadline.
pub struct DetectionWorker {
    jobs: Option<Sender<Job>>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    budget: Duration,
}

impl DetectionWorker {
    pub fn spawn(pass: DetectionPass, budget: Duration) -> Result<Self, DetectionError> {
        let (tx, rx) = bounded::<Job>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let thread_busy = Arc::clone(&busy);
        let handle = thread::Builder::new()
            .name("shelf-detect".into())
            .spawn(move || worker_loop(pass, rx, thread_busy))
            .map_err(|e| DetectionError::Backend {
                backend: "worker".to_string(),
                reason: format!("failed to spawn detection thread: {}", e),
            })?;
        Ok(Self {
            jobs: Some(tx),
            busy,
            handle: Some(handle),
            budget,
        })
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// False once the worker thread has exited.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// True while a job (possibly an abandoned one) is still running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hand a frame to the worker. Fails fast with `Timeout` while a previous
    /// job is still running.
    pub fn submit(&self, frame: Frame, catalog: Arc<Catalog>) -> Result<PendingDetection, DetectionError> {
        let jobs = self.jobs.as_ref().ok_or(DetectionError::WorkerGone)?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DetectionError::Timeout(self.budget));
        }
        let (reply, rx) = bounded(1);
        let job = Job {
            frame,
            catalog,
            reply,
        };
        match jobs.try_send(job) {
            Ok(()) => Ok(PendingDetection {
                rx,
                deadline: Instant::now() + self.budget,
                budget: self.budget,
            }),
            Err(TrySendError::Full(_)) => Err(DetectionError::Timeout(self.budget)),
            Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                Err(DetectionError::WorkerGone)
            }
        }
    }

    /// Run one job and wait for it.
    pub fn run(&self, frame: Frame, catalog: Arc<Catalog>) -> Result<DetectionOutput, DetectionError> {
        self.submit(frame, catalog)?.wait()
    }
}

fn worker_loop(pass: DetectionPass, jobs: Receiver<Job>, busy: Arc<AtomicBool>) {
    while let Ok(job) = jobs.recv() {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| pass.detect(&job.frame, &job.catalog)))
            .unwrap_or_else(|payload| {
                Err(DetectionError::Backend {
                    backend: pass.backend_name(),
                    reason: format!("backend panicked: {}", panic_message(payload.as_ref())),
                })
            });
        let elapsed = started.elapsed();
        busy.store(false, Ordering::Release);
        // The receiver is gone when the run loop abandoned this job.
        if job
            .reply
            .send(DetectionOutput {
                frame: job.frame,
                result,
                elapsed,
            })
            .is_err()
        {
            log::debug!("detection result discarded after {:?}", elapsed);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if self.is_busy() {
                // Do not wait on a stuck backend; the thread exits once it returns.
                log::warn!("detection worker still busy at shutdown; detaching");
            } else if handle.join().is_err() {
                log::warn!("detection worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BoundingBox, CatalogEntry};
    use crate::detect::backend::DetectorBackend;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::RawDetection;
    use std::sync::Mutex;

    struct SlowBackend(Duration);

    impl DetectorBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            thread::sleep(self.0);
            Ok(Vec::new())
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            Err(anyhow::anyhow!("model exploded"))
        }
    }

    #[derive(Default)]
    struct PanicsOnceBackend {
        panicked: bool,
    }

    impl DetectorBackend for PanicsOnceBackend {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            if !self.panicked {
                self.panicked = true;
                panic!("tensor shape mismatch");
            }
            Ok(Vec::new())
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0; 100 * 100 * 3], 100, 100, sequence, 1_000).unwrap()
    }

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::from_entries(vec![CatalogEntry {
                product_id: "shampoo".into(),
                display_name: "Shampoo".into(),
                bounding_box: BoundingBox::new(10, 10, 50, 50),
            }])
            .unwrap(),
        )
    }

    #[test]
    fn pass_fills_frame_metadata() {
        let backend = StubBackend::with_detections(vec![RawDetection::new(
            BoundingBox::new(12, 12, 48, 48),
            0.9,
        )]);
        let pass = DetectionPass::new(Arc::new(Mutex::new(backend)), 0.5);
        let result = pass.detect(&frame(7), &catalog()).unwrap();
        assert_eq!(result.frame_sequence, 7);
        assert_eq!(result.captured_at_ms, 1_000);
        assert!(result.timestamp_ms > 0);
        assert_eq!(result.matched[0].product_id, "shampoo");
    }

    #[test]
    fn worker_returns_the_frame_with_the_result() {
        let pass = DetectionPass::new(Arc::new(Mutex::new(StubBackend::new())), 0.5);
        let worker = DetectionWorker::spawn(pass, Duration::from_secs(2)).unwrap();
        let output = worker.run(frame(3), catalog()).unwrap();
        assert_eq!(output.frame.sequence, 3);
        assert_eq!(output.result.unwrap().missing, vec!["shampoo".to_string()]);
        assert!(!worker.is_busy());
    }

    #[test]
    fn overrun_is_a_timeout_and_blocks_new_jobs_until_done() {
        let backend = SlowBackend(Duration::from_millis(300));
        let pass = DetectionPass::new(Arc::new(Mutex::new(backend)), 0.5);
        let worker = DetectionWorker::spawn(pass, Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        let err = worker.run(frame(1), catalog()).err().unwrap();
        assert!(matches!(err, DetectionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(250));

        // The abandoned job is still running: backpressure, not a queue.
        assert!(worker.is_busy());
        let err = worker.submit(frame(2), catalog()).err().unwrap();
        assert!(matches!(err, DetectionError::Timeout(_)));

        thread::sleep(Duration::from_millis(400));
        assert!(!worker.is_busy());
        assert!(worker.submit(frame(3), catalog()).is_ok());
    }

    #[test]
    fn backend_failure_is_reported() {
        let pass = DetectionPass::new(Arc::new(Mutex::new(FailingBackend)), 0.5);
        let worker = DetectionWorker::spawn(pass, Duration::from_secs(2)).unwrap();
        let output = worker.run(frame(1), catalog()).unwrap();
        match output.result {
            Err(DetectionError::Backend { backend, reason }) => {
                assert_eq!(backend, "failing");
                assert!(reason.contains("model exploded"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn backend_panic_is_an_error_and_the_worker_keeps_serving() {
        let pass = DetectionPass::new(Arc::new(Mutex::new(PanicsOnceBackend::default())), 0.5);
        let worker = DetectionWorker::spawn(pass, Duration::from_secs(2)).unwrap();

        let output = worker.run(frame(1), catalog()).unwrap();
        assert_eq!(output.frame.sequence, 1);
        match output.result {
            Err(DetectionError::Backend { backend, reason }) => {
                assert_eq!(backend, "panics-once");
                assert!(reason.contains("panicked"));
                assert!(reason.contains("tensor shape mismatch"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(worker.is_alive());
        assert!(!worker.is_busy());

        // The poisoned backend lock is recovered for the next job.
        let output = worker.run(frame(2), catalog()).unwrap();
        assert_eq!(output.result.unwrap().missing, vec!["shampoo".to_string()]);
    }
}
