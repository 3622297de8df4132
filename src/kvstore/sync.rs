//! Full-sync scheduling
//!
//! Tracks which peers still owe us an initial full sync, paces retries
//! with per-peer exponential backoff, and bounds the number of syncs in
//! flight. The window starts small and doubles on every successful
//! response, so a cold start does not stampede the mesh.

use crate::utils::ExponentialBackoff;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::time::Duration;

/// Initial cap on parallel full-syncs
const INITIAL_PARALLEL_SYNCS: usize = 2;

/// Upper bound the cap may grow to
const MAX_PARALLEL_SYNCS: usize = 32;

/// Retry pacing per peer
const SYNC_RETRY_INITIAL: Duration = Duration::from_millis(64);
const SYNC_RETRY_MAX: Duration = Duration::from_millis(8192);

#[derive(Debug)]
struct PendingPeer {
    backoff: ExponentialBackoff,
    in_flight: bool,
}

/// Sync bookkeeping for one area
pub struct SyncScheduler {
    pending: HashMap<String, PendingPeer>,
    parallel_limit: usize,
    in_flight: usize,
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncScheduler {
    /// Create an idle scheduler
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            parallel_limit: INITIAL_PARALLEL_SYNCS,
            in_flight: 0,
        }
    }

    /// A peer needs a full sync (just added, or periodic refresh)
    pub fn mark_peer(&mut self, peer: &str) {
        self.pending.entry(peer.to_string()).or_insert(PendingPeer {
            backoff: ExponentialBackoff::new(SYNC_RETRY_INITIAL, SYNC_RETRY_MAX),
            in_flight: false,
        });
    }

    /// Forget a removed peer entirely
    pub fn drop_peer(&mut self, peer: &str) {
        if let Some(pending) = self.pending.remove(peer) {
            if pending.in_flight {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }

    /// Peers whose sync should be launched right now
    ///
    /// Respects the parallel cap and per-peer backoff; launched peers are
    /// marked in-flight until [`SyncScheduler::sync_succeeded`] or
    /// [`SyncScheduler::sync_failed`].
    pub fn due_peers(&mut self) -> Vec<String> {
        let mut due = Vec::new();
        for (peer, pending) in self.pending.iter_mut() {
            if self.in_flight + due.len() >= self.parallel_limit {
                break;
            }
            if pending.in_flight || !pending.backoff.can_try_now() {
                continue;
            }
            pending.in_flight = true;
            due.push(peer.clone());
        }
        self.in_flight += due.len();
        due
    }

    /// A sync response arrived; the peer is done and the window widens
    pub fn sync_succeeded(&mut self, peer: &str) {
        if let Some(pending) = self.pending.remove(peer) {
            if pending.in_flight {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
        self.parallel_limit = (self.parallel_limit * 2).min(MAX_PARALLEL_SYNCS);
    }

    /// A sync attempt failed; retry later with backoff
    pub fn sync_failed(&mut self, peer: &str) {
        if let Some(pending) = self.pending.get_mut(peer) {
            if pending.in_flight {
                pending.in_flight = false;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            pending.backoff.report_error();
        }
    }

    /// Earliest time a backed-off peer becomes due, if any are waiting
    pub fn next_retry_in(&self) -> Option<Duration> {
        self.pending
            .values()
            .filter(|p| !p.in_flight)
            .map(|p| p.backoff.time_remaining_until_retry())
            .min()
    }

    /// Any peers still owing us a sync?
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pick one random peer for the periodic anti-entropy sync
    pub fn random_peer<'a, I>(peers: I) -> Option<String>
    where
        I: Iterator<Item = &'a String>,
    {
        peers.choose(&mut rand::thread_rng()).cloned()
    }
}
