//! KvStore client helper
//!
//! Components that own keys (adjacency databases, prefix databases,
//! allocation claims) use this helper to keep them alive: it advertises a
//! key, refreshes its TTL ahead of expiry, and re-claims it with a higher
//! version whenever a publication shows the key overridden by someone
//! else. Unsetting a key advertises a tombstone at a higher version and
//! lets the TTL collect it everywhere.

use crate::config::TTL_INFINITY;
use crate::error::{Result, StoreError, TrellisError};
use crate::kvstore::KvStoreHandle;
use crate::protocol::{hash_value, Publication, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pace of the TTL-refresh sweep
const REFRESH_SWEEP: Duration = Duration::from_millis(500);

/// Refresh a key once this fraction of its TTL remains
const REFRESH_FRACTION: u32 = 4;

enum ClientCmd {
    Persist {
        area: String,
        key: String,
        value: Vec<u8>,
        ttl: i64,
        reclaim: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    Forget {
        area: String,
        key: String,
        resp: oneshot::Sender<Result<()>>,
    },
    SetOnce {
        area: String,
        key: String,
        value: Value,
        resp: oneshot::Sender<Result<()>>,
    },
    Unset {
        area: String,
        key: String,
        tombstone: Vec<u8>,
        ttl: i64,
        resp: oneshot::Sender<Result<()>>,
    },
}

struct PersistedEntry {
    value: Vec<u8>,
    version: u64,
    ttl_version: i64,
    ttl: i64,
    refresh_in: Duration,
    // re-claim when overridden; election keys yield instead
    reclaim: bool,
}

/// Handle to the client task
#[derive(Clone)]
pub struct KvStoreClient {
    tx: mpsc::UnboundedSender<ClientCmd>,
}

impl KvStoreClient {
    /// Spawn a client bound to `store`, originating keys as `node_name`
    pub fn spawn(node_name: impl Into<String>, store: KvStoreHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ClientActor {
            node_name: node_name.into(),
            store,
            persisted: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn send(&self, cmd: ClientCmd, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| TrellisError::from(StoreError::NotRunning))?;
        rx.await
            .map_err(|_| TrellisError::from(StoreError::NotRunning))?
    }

    /// Advertise a key and keep it alive until unset
    ///
    /// Re-persisting with the same bytes refreshes; with different bytes
    /// it bumps the version. An override by another originator is
    /// re-claimed at a higher version.
    pub async fn persist_key(
        &self,
        area: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: i64,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            ClientCmd::Persist {
                area: area.into(),
                key: key.into(),
                value,
                ttl,
                reclaim: true,
                resp,
            },
            rx,
        )
        .await
    }

    /// Like [`KvStoreClient::persist_key`], but an override makes us stop
    /// owning the key instead of fighting for it (election semantics)
    pub async fn persist_key_yielding(
        &self,
        area: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: i64,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            ClientCmd::Persist {
                area: area.into(),
                key: key.into(),
                value,
                ttl,
                reclaim: false,
                resp,
            },
            rx,
        )
        .await
    }

    /// Stop refreshing a key without advertising anything
    pub async fn forget_key(
        &self,
        area: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            ClientCmd::Forget {
                area: area.into(),
                key: key.into(),
                resp,
            },
            rx,
        )
        .await
    }

    /// Advertise a fully-specified value once, without ownership tracking
    pub async fn set_key(
        &self,
        area: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            ClientCmd::SetOnce {
                area: area.into(),
                key: key.into(),
                value,
                resp,
            },
            rx,
        )
        .await
    }

    /// Stop owning a key: advertise `tombstone` at a higher version with a
    /// short TTL so every holder collects it
    pub async fn unset_key(
        &self,
        area: impl Into<String>,
        key: impl Into<String>,
        tombstone: Vec<u8>,
        ttl: i64,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            ClientCmd::Unset {
                area: area.into(),
                key: key.into(),
                tombstone,
                ttl,
                resp,
            },
            rx,
        )
        .await
    }
}

struct ClientActor {
    node_name: String,
    store: KvStoreHandle,
    persisted: HashMap<(String, String), PersistedEntry>,
}

impl ClientActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClientCmd>) {
        let mut updates = self.store.subscribe();
        let mut sweep = tokio::time::interval(REFRESH_SWEEP);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None => return,
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                publication = updates.recv() => {
                    match publication {
                        Err(_) => return,
                        Ok(publication) => self.handle_publication(publication).await,
                    }
                }
                _ = sweep.tick() => {
                    self.refresh_due_keys().await;
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: ClientCmd) {
        match cmd {
            ClientCmd::Persist {
                area,
                key,
                value,
                ttl,
                reclaim,
                resp,
            } => {
                let result = self.persist(area, key, value, ttl, reclaim).await;
                let _ = resp.send(result);
            }
            ClientCmd::Forget { area, key, resp } => {
                self.persisted.remove(&(area, key));
                let _ = resp.send(Ok(()));
            }
            ClientCmd::SetOnce {
                area,
                key,
                value,
                resp,
            } => {
                let mut key_vals = HashMap::new();
                key_vals.insert(key, value);
                let result = self.store.set_key_vals(area, key_vals).await;
                let _ = resp.send(result);
            }
            ClientCmd::Unset {
                area,
                key,
                tombstone,
                ttl,
                resp,
            } => {
                let result = self.unset(area, key, tombstone, ttl).await;
                let _ = resp.send(result);
            }
        }
    }

    async fn persist(
        &mut self,
        area: String,
        key: String,
        value: Vec<u8>,
        ttl: i64,
        reclaim: bool,
    ) -> Result<()> {
        let slot = (area.clone(), key.clone());
        let version = match self.persisted.get(&slot) {
            Some(entry) if entry.value == value => {
                // same bytes; nothing to advertise beyond the refresh cycle
                return Ok(());
            }
            Some(entry) => entry.version + 1,
            None => {
                // start above whatever the store already holds for this key
                let existing = self
                    .store
                    .get_key_vals(area.clone(), vec![key.clone()])
                    .await?;
                existing
                    .key_vals
                    .get(&key)
                    .map(|v| v.version + 1)
                    .unwrap_or(1)
            }
        };
        self.advertise(&area, &key, &value, version, 0, ttl).await?;
        self.persisted.insert(
            slot,
            PersistedEntry {
                value,
                version,
                ttl_version: 0,
                ttl,
                refresh_in: refresh_interval(ttl),
                reclaim,
            },
        );
        Ok(())
    }

    async fn unset(&mut self, area: String, key: String, tombstone: Vec<u8>, ttl: i64) -> Result<()> {
        let slot = (area.clone(), key.clone());
        let version = match self.persisted.remove(&slot) {
            Some(entry) => entry.version + 1,
            None => {
                let existing = self
                    .store
                    .get_key_vals(area.clone(), vec![key.clone()])
                    .await?;
                existing
                    .key_vals
                    .get(&key)
                    .map(|v| v.version + 1)
                    .unwrap_or(1)
            }
        };
        self.advertise(&area, &key, &tombstone, version, 0, ttl).await
    }

    async fn advertise(
        &self,
        area: &str,
        key: &str,
        value: &[u8],
        version: u64,
        ttl_version: i64,
        ttl: i64,
    ) -> Result<()> {
        let mut key_vals = HashMap::new();
        key_vals.insert(
            key.to_string(),
            Value {
                version,
                originator_id: self.node_name.clone(),
                value: Some(value.to_vec()),
                ttl,
                ttl_version,
                hash: Some(hash_value(version, &self.node_name, Some(value))),
            },
        );
        self.store.set_key_vals(area.to_string(), key_vals).await
    }

    async fn handle_publication(&mut self, publication: Publication) {
        // re-claim (or yield) any persisted key someone else has overridden
        let mut reclaims = Vec::new();
        let mut yielded = Vec::new();
        for ((area, key), entry) in self.persisted.iter_mut() {
            if *area != publication.area {
                continue;
            }
            let theirs = match publication.key_vals.get(key) {
                Some(value) => value,
                None => continue,
            };
            if theirs.originator_id == self.node_name && theirs.version <= entry.version {
                continue;
            }
            if !entry.reclaim {
                debug!("yielding {} in area {} to {}", key, area, theirs.originator_id);
                yielded.push((area.clone(), key.clone()));
                continue;
            }
            let new_version = theirs.version.max(entry.version) + 1;
            debug!(
                "re-claiming {} in area {} at version {}",
                key, area, new_version
            );
            entry.version = new_version;
            entry.ttl_version = 0;
            reclaims.push((
                area.clone(),
                key.clone(),
                entry.value.clone(),
                new_version,
                entry.ttl,
            ));
        }
        for slot in yielded {
            self.persisted.remove(&slot);
        }
        for (area, key, value, version, ttl) in reclaims {
            if let Err(e) = self.advertise(&area, &key, &value, version, 0, ttl).await {
                warn!("failed to re-claim {}: {}", key, e);
            }
        }
    }

    async fn refresh_due_keys(&mut self) {
        let mut refreshes = Vec::new();
        for ((area, key), entry) in self.persisted.iter_mut() {
            if entry.ttl == TTL_INFINITY {
                continue;
            }
            match entry.refresh_in.checked_sub(REFRESH_SWEEP) {
                Some(remaining) => entry.refresh_in = remaining,
                None => {
                    entry.ttl_version += 1;
                    entry.refresh_in = refresh_interval(entry.ttl);
                    refreshes.push((
                        area.clone(),
                        key.clone(),
                        entry.value.clone(),
                        entry.version,
                        entry.ttl_version,
                        entry.ttl,
                    ));
                }
            }
        }
        for (area, key, value, version, ttl_version, ttl) in refreshes {
            // refresh carries no body; the hash lets receivers match it
            let mut key_vals = HashMap::new();
            key_vals.insert(
                key.clone(),
                Value {
                    version,
                    originator_id: self.node_name.clone(),
                    value: None,
                    ttl,
                    ttl_version,
                    hash: Some(hash_value(version, &self.node_name, Some(&value))),
                },
            );
            if let Err(e) = self.store.set_key_vals(area, key_vals).await {
                warn!("ttl refresh of {} failed: {}", key, e);
            }
        }
    }
}

fn refresh_interval(ttl: i64) -> Duration {
    if ttl == TTL_INFINITY {
        return Duration::from_secs(3600);
    }
    Duration::from_millis((ttl.max(0) as u64) / u64::from(REFRESH_FRACTION).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_AREA};
    use crate::network::PeerListener;

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

    #[tokio::test]
    async fn test_persist_key_lands_in_store() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        client
            .persist_key(DEFAULT_AREA, "adj:node1", b"adjs".to_vec(), TTL_INFINITY)
            .await
            .unwrap();

        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["adj:node1".to_string()])
            .await
            .unwrap();
        let value = publication.key_vals.get("adj:node1").unwrap();
        assert_eq!(value.version, 1);
        assert_eq!(value.originator_id, "node1");
    }

    #[tokio::test]
    async fn test_repersist_same_bytes_is_noop() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        client
            .persist_key(DEFAULT_AREA, "k", b"same".to_vec(), TTL_INFINITY)
            .await
            .unwrap();
        client
            .persist_key(DEFAULT_AREA, "k", b"same".to_vec(), TTL_INFINITY)
            .await
            .unwrap();
        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
            .await
            .unwrap();
        assert_eq!(publication.key_vals.get("k").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_new_bytes_bump_version() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        client
            .persist_key(DEFAULT_AREA, "k", b"one".to_vec(), TTL_INFINITY)
            .await
            .unwrap();
        client
            .persist_key(DEFAULT_AREA, "k", b"two".to_vec(), TTL_INFINITY)
            .await
            .unwrap();
        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
            .await
            .unwrap();
        let value = publication.key_vals.get("k").unwrap();
        assert_eq!(value.version, 2);
        assert_eq!(value.value.as_deref(), Some(b"two".as_slice()));
    }

    #[tokio::test]
    async fn test_override_is_reclaimed() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        client
            .persist_key(DEFAULT_AREA, "k", b"ours".to_vec(), TTL_INFINITY)
            .await
            .unwrap();

        // an impostor overrides at a higher version
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "k".to_string(),
            Value::new(5, "node9", b"theirs".to_vec(), TTL_INFINITY),
        );
        store.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        // the client re-claims above the impostor's version
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let publication = store
                .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
                .await
                .unwrap();
            let value = publication.key_vals.get("k").unwrap();
            if value.originator_id == "node1" && value.version > 5 {
                assert_eq!(value.value.as_deref(), Some(b"ours".as_slice()));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "never re-claimed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_ttl_refresh_keeps_key_alive() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        // ttl of 2s; the refresh sweep runs every 500ms at ttl/4
        client
            .persist_key(DEFAULT_AREA, "k", b"alive".to_vec(), 2_000)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
            .await
            .unwrap();
        let value = publication.key_vals.get("k").unwrap();
        assert!(value.ttl_version > 0);
    }

    #[tokio::test]
    async fn test_unset_advertises_tombstone() {
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        client
            .persist_key(DEFAULT_AREA, "k", b"live".to_vec(), TTL_INFINITY)
            .await
            .unwrap();
        client
            .unset_key(DEFAULT_AREA, "k", b"gone".to_vec(), 600)
            .await
            .unwrap();

        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
            .await
            .unwrap();
        let value = publication.key_vals.get("k").unwrap();
        assert_eq!(value.version, 2);
        assert_eq!(value.value.as_deref(), Some(b"gone".as_slice()));
        // the tombstone collects itself
        tokio::time::sleep(Duration::from_millis(900)).await;
        let publication = store
            .get_key_vals(DEFAULT_AREA, vec!["k".to_string()])
            .await
            .unwrap();
        assert!(publication.key_vals.is_empty());
    }
}
