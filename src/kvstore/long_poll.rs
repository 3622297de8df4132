//! Adjacency long-poll registry
//!
//! Control-plane clients submit a snapshot of their known `adj:*` hashes
//! and block until the server observes any adjacency change or a fixed
//! hold expires. Pending requests are completed in one sweep whenever a
//! publication carries an adjacency entry with a value (a pure TTL refresh
//! does not count as a change).

use crate::config::{ADJ_DB_MARKER, LONG_POLL_HOLD};
use crate::protocol::{Publication, Value};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

struct Pending {
    submitted_at: Instant,
    resp: oneshot::Sender<bool>,
}

/// Registry of blocked long-poll requests
#[derive(Default)]
pub struct LongPollRegistry {
    pending: Vec<Pending>,
}

impl LongPollRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently blocked
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register a request against the current adjacency state
    ///
    /// If the caller's snapshot already differs from `current`, the
    /// request completes immediately with `true`; otherwise it blocks
    /// until [`LongPollRegistry::on_publication`] sees an adjacency change
    /// or [`LongPollRegistry::expire`] times it out with `false`.
    pub fn register(
        &mut self,
        snapshot: &HashMap<String, i64>,
        current: &HashMap<String, Value>,
        resp: oneshot::Sender<bool>,
    ) {
        if Self::differs(snapshot, current) {
            let _ = resp.send(true);
            return;
        }
        self.pending.push(Pending {
            submitted_at: Instant::now(),
            resp,
        });
    }

    fn differs(snapshot: &HashMap<String, i64>, current: &HashMap<String, Value>) -> bool {
        let mut adj_count = 0usize;
        for (key, value) in current {
            if !key.starts_with(ADJ_DB_MARKER) {
                continue;
            }
            adj_count += 1;
            match snapshot.get(key) {
                None => return true,
                Some(hash) => {
                    if value.hash != Some(*hash) {
                        return true;
                    }
                }
            }
        }
        // keys the caller knows that we no longer hold
        snapshot.len() != adj_count
    }

    /// Complete all pending requests if the publication changes any
    /// adjacency (an entry under the adj marker carrying a value)
    pub fn on_publication(&mut self, publication: &Publication) {
        let adj_changed = publication
            .key_vals
            .iter()
            .any(|(key, value)| key.starts_with(ADJ_DB_MARKER) && value.value.is_some())
            || publication
                .expired_keys
                .iter()
                .any(|key| key.starts_with(ADJ_DB_MARKER));
        if !adj_changed {
            return;
        }
        for pending in self.pending.drain(..) {
            let _ = pending.resp.send(true);
        }
    }

    /// Complete requests older than the hold with `false`
    pub fn expire(&mut self, now: Instant) {
        let hold = LONG_POLL_HOLD;
        let mut kept = Vec::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if now.saturating_duration_since(pending.submitted_at) >= hold {
                let _ = pending.resp.send(false);
            } else {
                kept.push(pending);
            }
        }
        self.pending = kept;
    }
}
