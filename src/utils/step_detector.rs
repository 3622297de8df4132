//! Step detection for noisy measurements
//!
//! Smooths a stream of samples (RTT, in practice) and reports a new level
//! only when the windowed average moves beyond a relative threshold. This
//! keeps jitter from churning adjacency metrics.

use std::time::Duration;

/// Detects sustained level shifts in a sample stream
///
/// Samples are accumulated into fixed windows; when a window closes, its
/// mean is compared to the currently reported level. A change larger than
/// `threshold_pct` percent (with an absolute floor to avoid flapping near
/// zero) is reported as the new level.
#[derive(Debug)]
pub struct StepDetector {
    window: Duration,
    threshold_pct: f64,
    abs_threshold: f64,
    reported: Option<f64>,
    window_sum: f64,
    window_count: u64,
    window_elapsed: Duration,
}

impl StepDetector {
    /// Create a detector with the given sampling window and percentage
    /// threshold (e.g. 10.0 for 10%)
    pub fn new(window: Duration, threshold_pct: f64, abs_threshold: f64) -> Self {
        Self {
            window,
            threshold_pct,
            abs_threshold,
            reported: None,
            window_sum: 0.0,
            window_count: 0,
            window_elapsed: Duration::ZERO,
        }
    }

    /// Feed one sample taken `since_last` after the previous one
    ///
    /// Returns `Some(new_level)` when a step is detected (always on the
    /// very first closed window).
    pub fn add_sample(&mut self, sample: f64, since_last: Duration) -> Option<f64> {
        self.window_sum += sample;
        self.window_count += 1;
        self.window_elapsed += since_last;

        if self.window_elapsed < self.window {
            return None;
        }

        let mean = self.window_sum / self.window_count as f64;
        self.window_sum = 0.0;
        self.window_count = 0;
        self.window_elapsed = Duration::ZERO;

        match self.reported {
            None => {
                self.reported = Some(mean);
                Some(mean)
            }
            Some(current) => {
                let delta = (mean - current).abs();
                let rel_limit = current.abs() * self.threshold_pct / 100.0;
                if delta > rel_limit.max(self.abs_threshold) {
                    self.reported = Some(mean);
                    Some(mean)
                } else {
                    None
                }
            }
        }
    }

    /// The most recently reported level, if any
    pub fn reported(&self) -> Option<f64> {
        self.reported
    }
}
