//! Distributed range allocator
//!
//! Elects a unique integer out of a known range using the KvStore as the
//! arbiter: a claim is a `<marker><index>` key advertised at version 1;
//! when two nodes claim the same index, value comparison (originator id at
//! equal version) decides deterministically, the loser yields and probes
//! the next index. Used for SR node labels and prefix-allocator indices.

use crate::error::{PrefixError, Result};
use crate::kvstore::{KvStoreClient, KvStoreHandle};
use crate::protocol::{serialize_message, AllocPrefix};
use prost::Message;
use std::time::Duration;
use tracing::{debug, info};

/// TTL on election keys; the owner's client refreshes them
pub const RANGE_ALLOC_TTL_MS: i64 = 5 * 60 * 1000;

/// Bound on probes before declaring the space exhausted
const MAX_PROBES: u64 = 1024;

/// One election over `[low, high]` under a key marker
pub struct RangeAllocator {
    node_name: String,
    area: String,
    marker: String,
    range: (u32, u32),
    store: KvStoreHandle,
    client: KvStoreClient,
    settle_time: Duration,
}

impl RangeAllocator {
    /// Build an allocator; `marker` is the key prefix, e.g. `nodeLabel:`
    pub fn new(
        node_name: impl Into<String>,
        area: impl Into<String>,
        marker: impl Into<String>,
        range: (u32, u32),
        store: KvStoreHandle,
        client: KvStoreClient,
        settle_time: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            area: area.into(),
            marker: marker.into(),
            range,
            store,
            client,
            settle_time,
        }
    }

    /// Number of allocatable values
    pub fn space(&self) -> u64 {
        (self.range.1 as u64).saturating_sub(self.range.0 as u64) + 1
    }

    /// Deterministic starting index hashed from the node name
    pub fn initial_candidate(&self) -> u32 {
        let digest = blake3::hash(self.node_name.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest.as_bytes()[..8]);
        let offset = u64::from_be_bytes(first) % self.space();
        self.range.0 + offset as u32
    }

    fn key_for(&self, candidate: u32) -> String {
        format!("{}{}", self.marker, candidate)
    }

    fn next_candidate(&self, candidate: u32) -> u32 {
        if candidate >= self.range.1 {
            self.range.0
        } else {
            candidate + 1
        }
    }

    /// Elect a value, preferring `preferred` (a persisted prior election)
    ///
    /// Claims a candidate, waits a settle period, and keeps the index only
    /// if the store still shows us as the owner; otherwise yields and
    /// probes onward. `is_forbidden` skips indices owned network-wide
    /// (e.g. static allocations).
    pub async fn allocate<F>(&self, preferred: Option<u32>, is_forbidden: F) -> Result<u32>
    where
        F: Fn(u32) -> bool,
    {
        let mut candidate = preferred
            .filter(|c| *c >= self.range.0 && *c <= self.range.1)
            .unwrap_or_else(|| self.initial_candidate());

        let probes = self.space().min(MAX_PROBES);
        for _ in 0..probes {
            if is_forbidden(candidate) {
                candidate = self.next_candidate(candidate);
                continue;
            }
            let key = self.key_for(candidate);

            // skip indices already visibly owned by someone else
            let existing = self
                .store
                .get_key_vals(self.area.clone(), vec![key.clone()])
                .await?;
            if let Some(value) = existing.key_vals.get(&key) {
                if value.originator_id != self.node_name {
                    debug!(
                        "{}{} taken by {}, probing on",
                        self.marker, candidate, value.originator_id
                    );
                    candidate = self.next_candidate(candidate);
                    continue;
                }
            }

            // claim, give the mesh time to object, then check ownership
            let claim = serialize_message(&AllocPrefix {
                alloc_prefix_index: candidate as i64,
            })?;
            self.client
                .persist_key_yielding(
                    self.area.clone(),
                    key.clone(),
                    claim,
                    RANGE_ALLOC_TTL_MS,
                )
                .await?;
            tokio::time::sleep(self.settle_time).await;

            let current = self
                .store
                .get_key_vals(self.area.clone(), vec![key.clone()])
                .await?;
            let owned = current
                .key_vals
                .get(&key)
                .map(|value| value.originator_id == self.node_name)
                .unwrap_or(false);
            if owned {
                info!("allocated {}{}", self.marker, candidate);
                return Ok(candidate);
            }
            debug!("lost election for {}{}, probing on", self.marker, candidate);
            self.client.forget_key(self.area.clone(), key).await?;
            candidate = self.next_candidate(candidate);
        }
        Err(PrefixError::SpaceExhausted {
            space: self.space().min(u32::MAX as u64) as u32,
        }
        .into())
    }

    /// Release an elected value so another node may claim it
    pub async fn release(&self, value: u32) -> Result<()> {
        let key = self.key_for(value);
        self.client.forget_key(self.area.clone(), key).await
    }

    /// Decode the index carried by an election key's payload
    pub fn decode_claim(bytes: &[u8]) -> Option<u32> {
        AllocPrefix::decode(bytes)
            .ok()
            .and_then(|claim| u32::try_from(claim.alloc_prefix_index).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_AREA};
    use crate::network::PeerListener;
    use crate::protocol::Value;
    use std::collections::HashMap;

    async fn spawn_store(name: &str) -> KvStoreHandle {
        let config = Config {
            node_name: name.to_string(),
            kvstore_sync_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let listener = PeerListener::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        crate::kvstore::KvStore::new(&config, None)
            .spawn(listener)
            .unwrap()
    }

    fn allocator(name: &str, store: &KvStoreHandle) -> RangeAllocator {
        let client = KvStoreClient::spawn(name, store.clone());
        RangeAllocator::new(
            name,
            DEFAULT_AREA,
            "allocprefix:",
            (0, 15),
            store.clone(),
            client,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_allocates_hashed_candidate_unopposed() {
        let store = spawn_store("node1").await;
        let alloc = allocator("node1", &store);
        let expected = alloc.initial_candidate();
        let index = alloc.allocate(None, |_| false).await.unwrap();
        assert_eq!(index, expected);

        // the claim is visible in the store
        let key = format!("allocprefix:{}", index);
        let publication = store
            .get_key_vals(DEFAULT_AREA, vec![key.clone()])
            .await
            .unwrap();
        let value = publication.key_vals.get(&key).unwrap();
        assert_eq!(value.originator_id, "node1");
        assert_eq!(
            RangeAllocator::decode_claim(value.value.as_deref().unwrap()),
            Some(index)
        );
    }

    #[tokio::test]
    async fn test_preferred_index_wins_over_hash() {
        let store = spawn_store("node1").await;
        let alloc = allocator("node1", &store);
        let index = alloc.allocate(Some(7), |_| false).await.unwrap();
        assert_eq!(index, 7);
    }

    #[tokio::test]
    async fn test_taken_index_is_skipped() {
        let store = spawn_store("node1").await;
        // another node's claim occupies index 7
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "allocprefix:7".to_string(),
            Value::new(
                1,
                "node9",
                serialize_message(&AllocPrefix {
                    alloc_prefix_index: 7,
                })
                .unwrap(),
                RANGE_ALLOC_TTL_MS,
            ),
        );
        store.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        let alloc = allocator("node1", &store);
        let index = alloc.allocate(Some(7), |_| false).await.unwrap();
        assert_eq!(index, 8);
    }

    #[tokio::test]
    async fn test_forbidden_indices_are_skipped() {
        let store = spawn_store("node1").await;
        let alloc = allocator("node1", &store);
        let index = alloc.allocate(Some(3), |c| c < 10).await.unwrap();
        assert_eq!(index, 10);
    }

    #[tokio::test]
    async fn test_exhausted_space_errors() {
        let store = spawn_store("node1").await;
        let alloc = allocator("node1", &store);
        let result = alloc.allocate(None, |_| true).await;
        assert!(result.is_err());
    }
}
