//! Health state machine of the run loop.
//!
//! ```text
//! Idle -> Starting -> Running <-> Degraded -> Stopping -> Idle
//!                                  |
//!                                  +-> Failed
//! ```
//!
//! `SupervisorState` is owned by the run loop thread and reset on every cold
//! start. It only decides; the run loop carries out restarts.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CycleError;

use super::policy::SupervisorPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "idle",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Degraded => "degraded",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
        }
    }

    /// True while a run loop thread exists for this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Running
                | ServiceState::Degraded
                | ServiceState::Stopping
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the run loop should do after an outcome was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going at the current period.
    Steady,
    /// Running -> Degraded. Back off, reload the catalog, reopen the source.
    Degrade,
    /// Still degraded after another `K` failures. Back off further and restart.
    Restart,
    /// Degraded -> Running. Period is back at baseline.
    Recovered,
    /// Too many restarts within the window. Go to `Failed`.
    Exhausted,
}

/// Per-kind cycle counters, cumulative since the last cold start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounters {
    pub cycles: u64,
    pub successes: u64,
    pub empty_frames: u64,
    pub source_errors: u64,
    pub detection_timeouts: u64,
    pub detection_errors: u64,
    pub persistence_errors: u64,
    pub catalog_errors: u64,
    pub cancelled: u64,
    pub restarts: u64,
}

impl CycleCounters {
    pub fn record_error(&mut self, err: &CycleError) {
        self.cycles += 1;
        match err {
            CycleError::Empty(_) => self.empty_frames += 1,
            CycleError::Source(_) => self.source_errors += 1,
            CycleError::Detection(crate::error::DetectionError::Timeout(_)) => {
                self.detection_timeouts += 1
            }
            CycleError::Detection(_) => self.detection_errors += 1,
            CycleError::Persistence(_) => self.persistence_errors += 1,
            CycleError::Catalog(_) => self.catalog_errors += 1,
            CycleError::Cancelled | CycleError::Unavailable => self.cancelled += 1,
        }
    }

    pub fn record_success(&mut self) {
        self.cycles += 1;
        self.successes += 1;
    }

    pub fn failures(&self) -> u64 {
        self.cycles - self.successes - self.cancelled
    }
}

/// Mutable supervisor bookkeeping for one service lifetime.
#[derive(Debug)]
pub struct SupervisorState {
    policy: SupervisorPolicy,
    mode: ServiceState,
    /// Bumped on every (re)start of the pipeline.
    pub generation: u64,
    /// Restarts since the cold start.
    pub restart_count: u32,
    restart_times: VecDeque<Instant>,
    /// Last-known-good cadence.
    pub baseline_period: Duration,
    pub current_period: Duration,
    backoff_level: u32,
    failure_times: VecDeque<Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_ms: Option<u64>,
}

impl SupervisorState {
    pub fn new(policy: SupervisorPolicy) -> Self {
        let period = policy.cycle_period;
        Self {
            policy,
            mode: ServiceState::Starting,
            generation: 0,
            restart_count: 0,
            restart_times: VecDeque::new(),
            baseline_period: period,
            current_period: period,
            backoff_level: 0,
            failure_times: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_ms: None,
        }
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    pub fn mode(&self) -> ServiceState {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ServiceState) {
        self.mode = mode;
    }

    pub fn backoff_level(&self) -> u32 {
        self.backoff_level
    }

    /// Pipeline came up (cold start or restart).
    pub fn pipeline_started(&mut self) {
        self.generation += 1;
        if self.mode == ServiceState::Starting {
            self.mode = ServiceState::Running;
        }
    }

    pub fn record_success(&mut self, timestamp_ms: u64) -> Verdict {
        self.consecutive_failures = 0;
        self.failure_times.clear();
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.last_success_ms = Some(timestamp_ms);

        if self.mode == ServiceState::Degraded
            && self.consecutive_successes >= self.policy.recovery_successes
        {
            self.mode = ServiceState::Running;
            self.backoff_level = 0;
            self.current_period = self.baseline_period;
            return Verdict::Recovered;
        }
        Verdict::Steady
    }

    pub fn record_failure(&mut self, now: Instant) -> Verdict {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failure_times.push_back(now);
        let window = self.policy.failure_window;
        while let Some(first) = self.failure_times.front() {
            if now.duration_since(*first) > window {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
        if (self.failure_times.len() as u32) < self.policy.failure_threshold {
            return Verdict::Steady;
        }

        self.failure_times.clear();
        let verdict = match self.mode {
            ServiceState::Running => {
                self.mode = ServiceState::Degraded;
                Verdict::Degrade
            }
            _ => Verdict::Restart,
        };
        self.backoff_level = self.backoff_level.saturating_add(1);
        self.current_period = self
            .policy
            .backoff_period(self.backoff_level)
            .max(self.current_period);
        if self.note_restart(now) {
            return Verdict::Exhausted;
        }
        verdict
    }

    /// Count a restart. Returns true when the restart budget is exhausted.
    pub fn note_restart(&mut self, now: Instant) -> bool {
        self.restart_count = self.restart_count.saturating_add(1);
        self.restart_times.push_back(now);
        let window = self.policy.restart_window;
        while let Some(first) = self.restart_times.front() {
            if now.duration_since(*first) > window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }
        if self.restart_times.len() as u32 > self.policy.max_restarts {
            self.mode = ServiceState::Failed;
            return true;
        }
        false
    }

    /// Delay before the next start attempt after a failed bring-up.
    pub fn startup_backoff(&self) -> Duration {
        self.policy.backoff_period(self.restart_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SupervisorPolicy {
        SupervisorPolicy {
            cycle_period: Duration::from_millis(100),
            failure_threshold: 3,
            recovery_successes: 2,
            backoff_max: Duration::from_secs(5),
            max_restarts: 2,
            restart_window: Duration::from_secs(60),
            ..SupervisorPolicy::default()
        }
    }

    fn running() -> SupervisorState {
        let mut state = SupervisorState::new(policy());
        state.pipeline_started();
        assert_eq!(state.mode(), ServiceState::Running);
        state
    }

    #[test]
    fn k_consecutive_failures_degrade_with_slower_period() {
        let mut state = running();
        let now = Instant::now();
        assert_eq!(state.record_failure(now), Verdict::Steady);
        assert_eq!(state.record_failure(now), Verdict::Steady);
        assert_eq!(state.current_period, Duration::from_millis(100));
        assert_eq!(state.record_failure(now), Verdict::Degrade);
        assert_eq!(state.mode(), ServiceState::Degraded);
        assert_eq!(state.current_period, Duration::from_millis(200));
        assert_eq!(state.restart_count, 1);
    }

    #[test]
    fn a_success_resets_the_failure_run() {
        let mut state = running();
        let now = Instant::now();
        state.record_failure(now);
        state.record_failure(now);
        assert_eq!(state.record_success(1), Verdict::Steady);
        assert_eq!(state.record_failure(now), Verdict::Steady);
        assert_eq!(state.mode(), ServiceState::Running);
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let mut state = SupervisorState::new(SupervisorPolicy {
            failure_window: Duration::from_millis(10),
            ..policy()
        });
        state.pipeline_started();
        let start = Instant::now();
        state.record_failure(start);
        state.record_failure(start);
        let later = start + Duration::from_millis(50);
        assert_eq!(state.record_failure(later), Verdict::Steady);
        assert_eq!(state.mode(), ServiceState::Running);
    }

    #[test]
    fn m_successes_recover_to_baseline() {
        let mut state = running();
        let now = Instant::now();
        for _ in 0..3 {
            state.record_failure(now);
        }
        assert_eq!(state.mode(), ServiceState::Degraded);
        assert_eq!(state.record_success(10), Verdict::Steady);
        assert_eq!(state.record_success(11), Verdict::Recovered);
        assert_eq!(state.mode(), ServiceState::Running);
        assert_eq!(state.current_period, state.baseline_period);
        assert_eq!(state.last_success_ms, Some(11));
    }

    #[test]
    fn degraded_period_never_gets_hotter_until_recovery() {
        let mut state = running();
        let now = Instant::now();
        let mut last = state.current_period;
        for _ in 0..6 {
            state.record_failure(now);
            assert!(state.current_period >= last);
            last = state.current_period;
        }
        assert_eq!(state.current_period, Duration::from_millis(400));
    }

    #[test]
    fn restarts_beyond_budget_exhaust() {
        let mut state = running();
        let now = Instant::now();
        let mut verdicts = Vec::new();
        for _ in 0..9 {
            verdicts.push(state.record_failure(now));
        }
        assert_eq!(verdicts[2], Verdict::Degrade);
        assert_eq!(verdicts[5], Verdict::Restart);
        assert_eq!(verdicts[8], Verdict::Exhausted);
        assert_eq!(state.mode(), ServiceState::Failed);
    }

    #[test]
    fn counters_split_by_kind() {
        let mut counters = CycleCounters::default();
        counters.record_error(&CycleError::Empty(Duration::from_millis(1)));
        counters.record_error(&CycleError::Detection(
            crate::error::DetectionError::Timeout(Duration::from_millis(1)),
        ));
        counters.record_error(&CycleError::Cancelled);
        counters.record_success();
        assert_eq!(counters.cycles, 4);
        assert_eq!(counters.empty_frames, 1);
        assert_eq!(counters.detection_timeouts, 1);
        assert_eq!(counters.failures(), 2);
    }
}
