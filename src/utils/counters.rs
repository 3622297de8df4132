//! Component counters
//!
//! Every component owns a `Counters` handle and bumps named integers as it
//! works; a monitor poller (or a test) takes an atomic snapshot through the
//! same handle. Cloning shares the underlying map.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A shared, snapshotable map of named int64 counters
#[derive(Debug, Clone, Default)]
pub struct Counters {
    values: Arc<DashMap<String, i64>>,
}

impl Counters {
    /// Create an empty counter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to a counter, creating it at zero first if absent
    pub fn bump(&self, name: &str, delta: i64) {
        *self.values.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Increment a counter by one
    pub fn incr(&self, name: &str) {
        self.bump(name, 1);
    }

    /// Overwrite a counter with an absolute value (for gauges)
    pub fn set(&self, name: &str, value: i64) {
        self.values.insert(name.to_string(), value);
    }

    /// Read a single counter; zero if it was never touched
    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Snapshot all counters, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
