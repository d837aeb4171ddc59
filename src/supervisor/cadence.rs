use std::time::{Duration, Instant};

/// When the next cycle may start.
///
/// An overrun cycle starts the next one immediately; missed slots are not
/// made up.
pub fn next_start(prev_start: Instant, period: Duration, now: Instant) -> Instant {
    (prev_start + period).max(now)
}

/// Time left until `at`, zero when already past.
pub fn until(at: Instant, now: Instant) -> Duration {
    at.saturating_duration_since(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_cycle_waits_for_the_period() {
        let start = Instant::now();
        let now = start + Duration::from_millis(30);
        let next = next_start(start, Duration::from_millis(100), now);
        assert_eq!(next, start + Duration::from_millis(100));
        assert_eq!(until(next, now), Duration::from_millis(70));
    }

    #[test]
    fn overrun_starts_immediately_without_catch_up() {
        let start = Instant::now();
        let now = start + Duration::from_millis(350);
        let next = next_start(start, Duration::from_millis(100), now);
        assert_eq!(next, now);
        assert_eq!(until(next, now), Duration::ZERO);
    }
}
