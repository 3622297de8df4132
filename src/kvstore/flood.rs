//! Flood rate limiting
//!
//! A token bucket paces outbound flooding; when it runs dry, updates are
//! parked in a per-flood-root buffer that a short timer drains as one
//! coalesced publication per root.

use crate::config::FloodRate;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Classic token bucket: `rate` tokens/second, capacity `burst`
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate: f64, burst: usize) -> Self {
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token; false when the bucket is empty
    pub fn consume(&mut self) -> bool {
        self.consume_at(Instant::now())
    }

    /// Token take with an injectable clock, for tests
    pub fn consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter plus the buffer of keys blocked behind it
///
/// Buffered keys are remembered per flood-root so the drain can rebuild
/// one publication per root with current values from the store.
#[derive(Debug)]
pub struct FloodLimiter {
    bucket: Option<TokenBucket>,
    // flood-root -> pending key names; None root = default (all-peers) flood
    buffer: HashMap<Option<String>, HashSet<String>>,
}

impl FloodLimiter {
    /// Create a limiter; `None` disables rate limiting entirely
    pub fn new(rate: Option<FloodRate>) -> Self {
        Self {
            bucket: rate.map(|(rate, burst)| TokenBucket::new(rate, burst)),
            buffer: HashMap::new(),
        }
    }

    /// May one publication go out right now?
    pub fn allow(&mut self) -> bool {
        match &mut self.bucket {
            None => true,
            Some(bucket) => bucket.consume(),
        }
    }

    /// Park keys for a later coalesced flood under `root`
    pub fn buffer_keys(&mut self, root: Option<String>, keys: impl IntoIterator<Item = String>) {
        self.buffer.entry(root).or_default().extend(keys);
    }

    /// Any publications waiting behind the limiter?
    pub fn has_buffered(&self) -> bool {
        self.buffer.values().any(|keys| !keys.is_empty())
    }

    /// Take everything buffered, grouped by flood-root
    pub fn drain(&mut self) -> Vec<(Option<String>, HashSet<String>)> {
        self.buffer.drain().filter(|(_, keys)| !keys.is_empty()).collect()
    }
}
