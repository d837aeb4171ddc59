mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{
    shampoo_detection, shampoo_store, FlakyStore, ScriptedBackend, ScriptedSource, SourceMode,
};
use shelf_watch::detect::DetectionPass;
use shelf_watch::{
    ActiveStateReader, ActiveStateStore, CycleError, InMemoryActiveStateStore, Pipeline,
    ServiceState, ShelfService, SupervisorError, SupervisorPolicy,
};

fn fast_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        cycle_period: Duration::from_millis(50),
        frame_timeout: Duration::from_millis(20),
        failure_threshold: 3,
        recovery_successes: 2,
        backoff_max: Duration::from_secs(2),
        max_restarts: 10,
        restart_jitter: Duration::ZERO,
        stop_grace: Duration::from_secs(1),
        ..SupervisorPolicy::default()
    }
}

fn service_with(
    source: ScriptedSource,
    backend: ScriptedBackend,
    store: Box<dyn ActiveStateStore>,
    deadline: Duration,
    policy: SupervisorPolicy,
) -> ShelfService {
    let pass = DetectionPass::new(Arc::new(Mutex::new(backend)), 0.5);
    let pipeline = Pipeline::new(Box::new(source), pass, store, "memory://catalog")
        .with_catalog(shampoo_store())
        .with_detection_deadline(deadline);
    ShelfService::new(pipeline, policy).unwrap()
}

#[test]
fn empty_source_degrades_within_k_cycles_without_exceeding_rate() {
    let source = ScriptedSource::new(SourceMode::Empty);
    let calls = Arc::clone(&source.calls);
    let backend = ScriptedBackend::new(Duration::ZERO, Vec::new());
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(1),
        fast_policy(),
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.state == ServiceState::Degraded));
    let status = service.status();
    assert!(status.counters.empty_frames >= 3);
    assert!(status.counters.cycles <= 4, "cycles={}", status.counters.cycles);
    assert!(status.current_period_ms > status.baseline_period_ms);
    service.stop(None).unwrap();

    let calls = calls.lock().unwrap();
    assert!(calls.len() >= 3);
    for pair in calls.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(45), "cycle gap {:?} too short", gap);
    }
}

#[test]
fn stop_during_detection_ends_idle_within_grace_with_source_closed() {
    let source = ScriptedSource::new(SourceMode::Frames);
    let open = Arc::clone(&source.open);
    let backend = ScriptedBackend::new(Duration::from_secs(3), vec![shampoo_detection()]);
    let entered = Arc::clone(&backend.entered);
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(10),
        fast_policy(),
    );

    service.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !entered.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "detection never started");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(open.load(Ordering::SeqCst));

    let grace = Duration::from_secs(1);
    let started = Instant::now();
    service.stop(Some(grace)).unwrap();
    assert!(started.elapsed() < grace);
    assert_eq!(service.status().state, ServiceState::Idle);
    assert!(!open.load(Ordering::SeqCst));
    assert!(service.active_state().unwrap().is_none());
}

#[test]
fn repeated_timeouts_degrade_with_slower_cadence() {
    let source = ScriptedSource::new(SourceMode::Frames);
    let calls = Arc::clone(&source.calls);
    let backend = ScriptedBackend::new(Duration::from_millis(300), Vec::new());
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_millis(30),
        fast_policy(),
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(5), |s| s.counters.detection_timeouts >= 5));
    let status = service.status();
    assert_eq!(status.state, ServiceState::Degraded);
    assert!(status.current_period_ms > status.baseline_period_ms);
    assert_eq!(status.counters.successes, 0);
    service.stop(None).unwrap();

    // After the third timeout the cycles are spaced by the backed-off period.
    let calls = calls.lock().unwrap();
    for pair in calls.windows(2).skip(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(95), "degraded gap {:?} too short", gap);
    }
}

#[test]
fn successes_recover_from_degraded() {
    let source = ScriptedSource::new(SourceMode::Frames);
    let backend = ScriptedBackend::new(Duration::ZERO, vec![shampoo_detection()]);
    let store = FlakyStore::new();
    store.failing.store(true, Ordering::SeqCst);
    let failing = Arc::clone(&store.failing);
    let mut service = service_with(
        source,
        backend,
        Box::new(store),
        Duration::from_secs(1),
        fast_policy(),
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.state == ServiceState::Degraded));
    let status = service.status();
    assert!(status.counters.persistence_errors >= 3);
    assert!(status.holding_uncommitted);
    assert!(service.active_state().unwrap().is_none());

    failing.store(false, Ordering::SeqCst);
    assert!(service.wait_for(Duration::from_secs(5), |s| s.state == ServiceState::Running
        && s.counters.successes >= 2));
    let status = service.status();
    assert_eq!(status.current_period_ms, status.baseline_period_ms);
    assert!(!status.holding_uncommitted);
    let record = service.active_state().unwrap().unwrap();
    assert_eq!(record.result.matched[0].product_id, "shampoo");
    service.stop(None).unwrap();
}

#[test]
fn exhausted_restarts_fail_and_allow_a_manual_restart() {
    let source = ScriptedSource::new(SourceMode::Broken);
    let opens = Arc::clone(&source.opens);
    let backend = ScriptedBackend::new(Duration::ZERO, Vec::new());
    let policy = SupervisorPolicy {
        cycle_period: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        max_restarts: 2,
        ..fast_policy()
    };
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(1),
        policy,
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.state == ServiceState::Failed));
    let status = service.status();
    assert!(status.last_error.unwrap().contains("exhausted"));
    assert_eq!(status.restart_count, 3);
    assert_eq!(opens.load(Ordering::SeqCst), 3);

    service.stop(None).unwrap();
    assert_eq!(service.status().state, ServiceState::Idle);
    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.state == ServiceState::Failed));
    service.stop(None).unwrap();
}

#[test]
fn run_once_goes_through_the_running_loop() {
    let source = ScriptedSource::new(SourceMode::Frames);
    let backend = ScriptedBackend::new(Duration::ZERO, vec![shampoo_detection()]);
    let policy = SupervisorPolicy {
        cycle_period: Duration::from_secs(1),
        backoff_max: Duration::from_secs(5),
        ..fast_policy()
    };
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(1),
        policy,
    );

    service.start().unwrap();
    assert!(matches!(service.start(), Err(SupervisorError::AlreadyRunning)));
    assert!(service.wait_for(Duration::from_secs(2), |s| s.counters.successes >= 1));
    let started = Instant::now();
    let result = service.run_once().unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(result.matched[0].product_id, "shampoo");
    service.stop(None).unwrap();

    assert!(matches!(service.stop(None), Err(SupervisorError::NotRunning)));
}

#[test]
fn standalone_run_once_closes_the_source_again() {
    let source = ScriptedSource::new(SourceMode::Empty);
    let open = Arc::clone(&source.open);
    let backend = ScriptedBackend::new(Duration::ZERO, Vec::new());
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(1),
        fast_policy(),
    );

    let err = service.run_once().unwrap_err();
    assert!(matches!(err, CycleError::Empty(_)));
    assert!(!open.load(Ordering::SeqCst));
    let status = service.status();
    assert_eq!(status.state, ServiceState::Idle);
    assert_eq!(status.counters.empty_frames, 1);
}

#[test]
fn failed_commit_never_lands_after_a_newer_one() {
    let store = FlakyStore::failing_first(2);
    let reader = store.clone();
    let source = ScriptedSource::new(SourceMode::Frames);
    let backend = ScriptedBackend::new(Duration::ZERO, vec![shampoo_detection()]);
    let mut service = service_with(
        source,
        backend,
        Box::new(store),
        Duration::from_secs(1),
        fast_policy(),
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.counters.successes >= 3));
    assert_eq!(service.status().counters.persistence_errors, 1);
    service.stop(None).unwrap();

    let history = reader.history(100).unwrap();
    let mut sequences: Vec<u64> = history.iter().map(|h| h.result.frame_sequence).collect();
    sequences.reverse();
    assert!(sequences.len() >= 3);
    assert!(
        sequences.windows(2).all(|pair| pair[0] < pair[1]),
        "history out of order: {:?}",
        sequences
    );
    let active = reader.read().unwrap().unwrap();
    assert_eq!(Some(&active.result.frame_sequence), sequences.last());
}

#[test]
fn detector_panic_counts_as_an_error_and_scanning_continues() {
    let source = ScriptedSource::new(SourceMode::Frames);
    let backend = ScriptedBackend::new(Duration::ZERO, vec![shampoo_detection()]);
    backend.panic_next.store(true, Ordering::SeqCst);
    let panic_next = Arc::clone(&backend.panic_next);
    let mut service = service_with(
        source,
        backend,
        Box::new(InMemoryActiveStateStore::new()),
        Duration::from_secs(1),
        fast_policy(),
    );

    service.start().unwrap();
    assert!(service.wait_for(Duration::from_secs(3), |s| s.counters.successes >= 2));
    let status = service.status();
    service.stop(None).unwrap();

    assert!(!panic_next.load(Ordering::SeqCst));
    assert_eq!(status.counters.detection_errors, 1);
    assert_eq!(status.counters.detection_timeouts, 0);
    assert_eq!(status.state, ServiceState::Running);
}
