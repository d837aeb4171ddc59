use std::time::Duration;

pub const DEFAULT_CYCLE_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_RECOVERY_SUCCESSES: u32 = 3;
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESTARTS: u32 = 5;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(600);
pub const DEFAULT_RESTART_JITTER: Duration = Duration::from_millis(250);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Tunables for the run loop and its health state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorPolicy {
    /// Target time between cycle starts while healthy.
    pub cycle_period: Duration,
    /// How long a cycle waits for a frame before counting it as empty.
    pub frame_timeout: Duration,
    /// `K`: consecutive failures within `failure_window` that degrade the service.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// `M`: consecutive successes that bring a degraded service back.
    pub recovery_successes: u32,
    /// Upper bound for the backed-off cycle period.
    pub backoff_max: Duration,
    /// Restarts tolerated within `restart_window` before giving up.
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Upper bound of the random delay added before a restart.
    pub restart_jitter: Duration,
    /// How long `stop` waits for the in-flight cycle.
    pub stop_grace: Duration,
    pub health_log_interval: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            cycle_period: DEFAULT_CYCLE_PERIOD,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            recovery_successes: DEFAULT_RECOVERY_SUCCESSES,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_window: DEFAULT_RESTART_WINDOW,
            restart_jitter: DEFAULT_RESTART_JITTER,
            stop_grace: DEFAULT_STOP_GRACE,
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
        }
    }
}

impl SupervisorPolicy {
    /// Cycle period after `level` backoff steps: `period * 2^level`, capped at
    /// `backoff_max` but never below the base period.
    pub fn backoff_period(&self, level: u32) -> Duration {
        let factor = 1u32.checked_shl(level.min(31)).unwrap_or(u32::MAX);
        let scaled = self
            .cycle_period
            .checked_mul(factor)
            .unwrap_or(self.backoff_max);
        scaled.min(self.backoff_max).max(self.cycle_period)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cycle_period.is_zero() {
            return Err("cycle period must be greater than zero".into());
        }
        if self.frame_timeout.is_zero() {
            return Err("frame timeout must be greater than zero".into());
        }
        if self.failure_threshold == 0 {
            return Err("failure threshold must be at least 1".into());
        }
        if self.recovery_successes == 0 {
            return Err("recovery successes must be at least 1".into());
        }
        if self.failure_window.is_zero() || self.restart_window.is_zero() {
            return Err("failure and restart windows must be greater than zero".into());
        }
        if self.backoff_max <= self.cycle_period {
            return Err(format!(
                "backoff max ({:?}) must exceed the cycle period ({:?})",
                self.backoff_max, self.cycle_period
            ));
        }
        Ok(())
    }
}
