//! Exponential backoff bookkeeping
//!
//! Tracks error streaks and tells the caller how long to wait before the
//! next attempt. Purely passive: the caller owns the timer.

use std::time::{Duration, Instant};

/// Exponential backoff between a configurable initial and maximum delay
///
/// Each reported error doubles the wait, capped at the maximum. A reported
/// success resets the streak.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    last_error_at: Option<Instant>,
}

impl ExponentialBackoff {
    /// Create a backoff tracker; `initial` must not exceed `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        debug_assert!(initial <= max);
        Self {
            initial,
            max,
            current: Duration::ZERO,
            last_error_at: None,
        }
    }

    /// Record a failed attempt, extending the backoff window
    pub fn report_error(&mut self) {
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            std::cmp::min(self.current * 2, self.max)
        };
        self.last_error_at = Some(Instant::now());
    }

    /// Record a successful attempt, clearing the backoff window
    pub fn report_success(&mut self) {
        self.current = Duration::ZERO;
        self.last_error_at = None;
    }

    /// Are we currently inside the backoff window?
    pub fn can_try_now(&self) -> bool {
        self.time_remaining_until_retry().is_zero()
    }

    /// Time left until the next attempt is allowed; zero if allowed now
    pub fn time_remaining_until_retry(&self) -> Duration {
        match self.last_error_at {
            None => Duration::ZERO,
            Some(at) => self.current.saturating_sub(at.elapsed()),
        }
    }

    /// The full length of the current backoff window
    pub fn current_backoff(&self) -> Duration {
        self.current
    }

    /// Has at least one error been reported since the last success?
    pub fn has_error(&self) -> bool {
        self.last_error_at.is_some()
    }

    /// Time since the most recent error, if any
    pub fn time_since_last_error(&self) -> Option<Duration> {
        self.last_error_at.map(|at| at.elapsed())
    }

    /// The configured maximum window
    pub fn max_backoff(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_allows_try() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(64), Duration::from_secs(8));
        assert!(backoff.can_try_now());
        assert_eq!(backoff.current_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_doubling_and_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        backoff.report_error();
        assert_eq!(backoff.current_backoff(), Duration::from_millis(100));
        backoff.report_error();
        assert_eq!(backoff.current_backoff(), Duration::from_millis(200));
        backoff.report_error();
        // capped
        assert_eq!(backoff.current_backoff(), Duration::from_millis(350));
        backoff.report_error();
        assert_eq!(backoff.current_backoff(), Duration::from_millis(350));
    }

    #[test]
    fn test_success_resets() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.report_error();
        assert!(!backoff.can_try_now());
        backoff.report_success();
        assert!(backoff.can_try_now());
        assert_eq!(backoff.current_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_time_remaining_decreases() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1));
        backoff.report_error();
        let remaining = backoff.time_remaining_until_retry();
        assert!(remaining <= Duration::from_millis(200));
        assert!(remaining > Duration::ZERO);
    }
}
