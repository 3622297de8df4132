//! Shared utilities
//!
//! Small building blocks used across components: exponential backoff for
//! retry pacing, a schedule-once-within-window throttle, a step detector
//! for RTT smoothing, and a snapshotable counter map.

mod backoff;
mod counters;
mod step_detector;
mod throttle;

pub use backoff::ExponentialBackoff;
pub use counters::Counters;
pub use step_detector::StepDetector;
pub use throttle::Throttle;
