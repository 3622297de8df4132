//! Prefix manager
//!
//! Holds the node's advertised prefixes grouped by origin type, persists
//! the non-ephemeral ones, and publishes the outbound prefix database to
//! the KvStore with a batching window. Supports both the monolithic
//! `prefix:<node>` key and per-prefix keys with tombstoned withdrawals;
//! the mode is fixed at construction.

use crate::config::{Config, PREFIX_DB_MARKER};
use crate::error::{PrefixError, Result, TrellisError};
use crate::kvstore::KvStoreClient;
use crate::messaging::RQueue;
use crate::prefix::PrefixUpdateRequest;
use crate::protocol::{serialize_message, IpPrefix, PrefixDatabase, PrefixEntry, PrefixType};
use crate::storage::ConfigStore;
use crate::utils::Counters;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Persistent-store key holding the non-ephemeral prefix database
const CONFIG_KEY: &str = "prefix-manager-config";

enum Cmd {
    Update {
        request: PrefixUpdateRequest,
        resp: oneshot::Sender<Result<bool>>,
    },
    GetPrefixes {
        prefix_type: Option<PrefixType>,
        resp: oneshot::Sender<Vec<PrefixEntry>>,
    },
}

/// Handle to the prefix manager task
#[derive(Clone)]
pub struct PrefixManagerHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl PrefixManagerHandle {
    async fn update(&self, request: PrefixUpdateRequest) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Update { request, resp })
            .map_err(|_| PrefixError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(PrefixError::NotRunning))?
    }

    /// Add or update prefix entries; true when anything changed
    pub async fn advertise(&self, entries: Vec<PrefixEntry>) -> Result<bool> {
        self.update(PrefixUpdateRequest::Advertise(entries)).await
    }

    /// Withdraw specific prefix entries
    pub async fn withdraw(&self, entries: Vec<PrefixEntry>) -> Result<bool> {
        self.update(PrefixUpdateRequest::Withdraw(entries)).await
    }

    /// Withdraw every entry of a type
    pub async fn withdraw_by_type(&self, prefix_type: PrefixType) -> Result<bool> {
        self.update(PrefixUpdateRequest::WithdrawByType(prefix_type))
            .await
    }

    /// Replace a type's entries wholesale
    pub async fn sync_by_type(
        &self,
        prefix_type: PrefixType,
        entries: Vec<PrefixEntry>,
    ) -> Result<bool> {
        self.update(PrefixUpdateRequest::SyncByType(prefix_type, entries))
            .await
    }

    /// Dump advertised entries, optionally restricted to one type
    pub async fn get_prefixes(&self, prefix_type: Option<PrefixType>) -> Result<Vec<PrefixEntry>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetPrefixes { prefix_type, resp })
            .map_err(|_| PrefixError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(PrefixError::NotRunning))
    }
}

/// The prefix manager; construct then [`PrefixManager::spawn`]
pub struct PrefixManager {
    config: Arc<Config>,
    client: KvStoreClient,
    config_store: ConfigStore,
    counters: Counters,
}

impl PrefixManager {
    /// Build the manager over the KvStore client and persistent store
    pub fn new(config: Arc<Config>, client: KvStoreClient, config_store: ConfigStore) -> Self {
        Self {
            config,
            client,
            config_store,
            counters: Counters::new(),
        }
    }

    /// Spawn the task consuming `requests`
    pub fn spawn(self, requests: RQueue<PrefixUpdateRequest>) -> PrefixManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config: self.config,
            client: self.client,
            config_store: self.config_store,
            counters: self.counters,
            prefix_map: BTreeMap::new(),
            advertised_keys: HashSet::new(),
        };
        tokio::spawn(actor.run(requests, rx));
        PrefixManagerHandle { tx }
    }
}

struct Actor {
    config: Arc<Config>,
    client: KvStoreClient,
    config_store: ConfigStore,
    counters: Counters,
    // origin type -> prefix -> entry; BTreeMap keeps output deterministic
    prefix_map: BTreeMap<i32, HashMap<IpPrefix, PrefixEntry>>,
    // per-prefix keys currently advertised, for withdrawal tombstones
    advertised_keys: HashSet<String>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: RQueue<PrefixUpdateRequest>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        self.restore_from_disk().await;

        let throttle = self.config.prefix_throttle;
        let mut flush_deadline: Option<tokio::time::Instant> = None;
        loop {
            let sleep_until = flush_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Err(_) => {
                            info!("prefix request stream closed; shutting down");
                            return;
                        }
                        Ok(request) => {
                            if self.apply(request) && flush_deadline.is_none() {
                                flush_deadline =
                                    Some(tokio::time::Instant::now() + throttle);
                            }
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => return,
                        Some(Cmd::Update { request, resp }) => {
                            let changed = self.apply(request);
                            if changed && flush_deadline.is_none() {
                                flush_deadline =
                                    Some(tokio::time::Instant::now() + throttle);
                            }
                            let _ = resp.send(Ok(changed));
                        }
                        Some(Cmd::GetPrefixes { prefix_type, resp }) => {
                            let _ = resp.send(self.dump(prefix_type));
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if flush_deadline.is_some() => {
                    flush_deadline = None;
                    self.output_state().await;
                }
            }
        }
    }

    fn dump(&self, prefix_type: Option<PrefixType>) -> Vec<PrefixEntry> {
        self.prefix_map
            .iter()
            .filter(|(t, _)| prefix_type.map(|want| **t == want as i32).unwrap_or(true))
            .flat_map(|(_, entries)| entries.values().cloned())
            .collect()
    }

    fn apply(&mut self, request: PrefixUpdateRequest) -> bool {
        let changed = match request {
            PrefixUpdateRequest::Advertise(entries) => self.add_entries(entries),
            PrefixUpdateRequest::Withdraw(entries) => self.remove_entries(&entries),
            PrefixUpdateRequest::WithdrawByType(prefix_type) => self
                .prefix_map
                .remove(&(prefix_type as i32))
                .map(|m| !m.is_empty())
                .unwrap_or(false),
            PrefixUpdateRequest::SyncByType(prefix_type, entries) => {
                let new_map: HashMap<IpPrefix, PrefixEntry> = entries
                    .into_iter()
                    .filter_map(|mut entry| {
                        entry.prefix_type = prefix_type as i32;
                        entry.prefix.clone().map(|p| (p, entry))
                    })
                    .collect();
                let old = self.prefix_map.get(&(prefix_type as i32));
                let changed = old.map(|m| *m != new_map).unwrap_or(!new_map.is_empty());
                if new_map.is_empty() {
                    self.prefix_map.remove(&(prefix_type as i32));
                } else {
                    self.prefix_map.insert(prefix_type as i32, new_map);
                }
                changed
            }
        };
        if changed {
            self.counters.incr("prefix_manager.updates");
        }
        changed
    }

    fn add_entries(&mut self, entries: Vec<PrefixEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            let prefix = match &entry.prefix {
                Some(prefix) => prefix.clone(),
                None => {
                    warn!("ignoring prefix entry without a prefix");
                    continue;
                }
            };
            let type_map = self.prefix_map.entry(entry.prefix_type).or_default();
            match type_map.insert(prefix, entry.clone()) {
                None => changed = true,
                Some(previous) => changed |= previous != entry,
            }
        }
        changed
    }

    fn remove_entries(&mut self, entries: &[PrefixEntry]) -> bool {
        let mut changed = false;
        for entry in entries {
            if let Some(prefix) = &entry.prefix {
                if let Some(type_map) = self.prefix_map.get_mut(&entry.prefix_type) {
                    changed |= type_map.remove(prefix).is_some();
                    if type_map.is_empty() {
                        self.prefix_map.remove(&entry.prefix_type);
                    }
                }
            }
        }
        changed
    }

    async fn restore_from_disk(&mut self) {
        match self
            .config_store
            .load_obj::<PrefixDatabase>(CONFIG_KEY)
            .await
        {
            Ok(db) => {
                info!(
                    "restored {} persisted prefix entries",
                    db.prefix_entries.len()
                );
                if self.add_entries(db.prefix_entries) {
                    self.output_state().await;
                }
            }
            Err(TrellisError::Storage(crate::error::StorageError::NotFound { .. })) => {}
            Err(e) => warn!("failed to restore prefix database: {}", e),
        }
    }

    /// Persist non-ephemeral entries and publish everything to the KvStore
    async fn output_state(&mut self) {
        let all_entries = self.dump(None);

        // only non-ephemeral entries survive restarts
        let persisted = PrefixDatabase {
            this_node_name: self.config.node_name.clone(),
            prefix_entries: all_entries
                .iter()
                .filter(|entry| !entry.ephemeral)
                .cloned()
                .collect(),
            delete_prefix: false,
            area: String::new(),
            perf_events: None,
        };
        if let Err(e) = self.config_store.store_obj(CONFIG_KEY, &persisted).await {
            warn!("failed to persist prefix database: {}", e);
        }

        let ttl = self.config.key_ttl_ms();
        for area in self.config.areas.clone() {
            if self.config.per_prefix_keys {
                self.publish_per_prefix(&area, &all_entries, ttl).await;
            } else {
                self.publish_monolithic(&area, &all_entries, ttl).await;
            }
        }
        self.counters
            .set("prefix_manager.advertised", all_entries.len() as i64);
    }

    async fn publish_monolithic(&self, area: &str, entries: &[PrefixEntry], ttl: i64) {
        let db = PrefixDatabase {
            this_node_name: self.config.node_name.clone(),
            prefix_entries: entries.to_vec(),
            delete_prefix: false,
            area: area.to_string(),
            perf_events: None,
        };
        let key = format!("{}{}", PREFIX_DB_MARKER, self.config.node_name);
        let bytes = match serialize_message(&db) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to serialize prefix database: {}", e);
                return;
            }
        };
        if let Err(e) = self.client.persist_key(area, key, bytes, ttl).await {
            warn!("failed to advertise prefix database: {}", e);
        }
    }

    async fn publish_per_prefix(&mut self, area: &str, entries: &[PrefixEntry], ttl: i64) {
        let mut live_keys = HashSet::new();
        for entry in entries {
            let prefix = match &entry.prefix {
                Some(prefix) => prefix,
                None => continue,
            };
            let key = per_prefix_key(&self.config.node_name, area, prefix);
            live_keys.insert(key.clone());
            let db = PrefixDatabase {
                this_node_name: self.config.node_name.clone(),
                prefix_entries: vec![entry.clone()],
                delete_prefix: false,
                area: area.to_string(),
                perf_events: None,
            };
            let bytes = match serialize_message(&db) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to serialize prefix entry: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.client.persist_key(area, key, bytes, ttl).await {
                warn!("failed to advertise prefix key: {}", e);
            }
        }

        // withdraw keys that fell out of the set: bump version with
        // delete_prefix so neighbors learn before the tombstone's TTL
        // collects it
        let stale: Vec<String> = self
            .advertised_keys
            .iter()
            .filter(|key| key.contains(&format!(":{}:", area)) && !live_keys.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            debug!("withdrawing per-prefix key {}", key);
            let tombstone = PrefixDatabase {
                this_node_name: self.config.node_name.clone(),
                prefix_entries: Vec::new(),
                delete_prefix: true,
                area: area.to_string(),
                perf_events: None,
            };
            match serialize_message(&tombstone) {
                Ok(bytes) => {
                    if let Err(e) = self.client.unset_key(area, key.clone(), bytes, ttl).await {
                        warn!("failed to withdraw prefix key {}: {}", key, e);
                    }
                }
                Err(e) => warn!("failed to serialize tombstone: {}", e),
            }
            self.advertised_keys.remove(&key);
        }
        self.advertised_keys.extend(live_keys);
    }
}

/// Key name for one prefix in per-prefix-key mode
pub fn per_prefix_key(node: &str, area: &str, prefix: &IpPrefix) -> String {
    format!("{}{}:{}:{}", PREFIX_DB_MARKER, node, area, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_AREA;
    use crate::kvstore::{KvStoreFilters, KvStoreHandle};
    use crate::messaging::ReplicateQueue;
    use crate::network::PeerListener;
    use crate::protocol::net::parse_prefix;
    use crate::storage::PersistentStore;
    use prost::Message;
    use tempfile::TempDir;

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

    fn entry(prefix: &str, prefix_type: PrefixType, ephemeral: bool) -> PrefixEntry {
        PrefixEntry {
            prefix: Some(parse_prefix(prefix).unwrap()),
            prefix_type: prefix_type as i32,
            data: Vec::new(),
            forwarding_type: crate::protocol::ForwardingType::Ip as i32,
            forwarding_algorithm: crate::protocol::ForwardingAlgorithm::SpEcmp as i32,
            ephemeral,
            mv: None,
        }
    }

    struct Setup {
        store: KvStoreHandle,
        handle: PrefixManagerHandle,
        requests: ReplicateQueue<PrefixUpdateRequest>,
        config: Arc<Config>,
        _dir: TempDir,
    }

    async fn setup(per_prefix_keys: bool) -> Setup {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config {
            node_name: "node1".to_string(),
            per_prefix_keys,
            prefix_throttle: Duration::from_millis(20),
            config_store_path: dir.path().join("store"),
            ..Default::default()
        });
        let store = spawn_store("node1").await;
        let client = KvStoreClient::spawn("node1", store.clone());
        let config_store = PersistentStore::new(
            &config.config_store_path,
            Duration::from_millis(5),
            Duration::from_millis(50),
            false,
        )
        .unwrap()
        .spawn();
        let requests = ReplicateQueue::new();
        let handle = PrefixManager::new(Arc::clone(&config), client, config_store)
            .spawn(requests.get_reader());
        Setup {
            store,
            handle,
            requests,
            config,
            _dir: dir,
        }
    }

    async fn await_prefix_db(store: &KvStoreHandle, key: &str) -> Option<PrefixDatabase> {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let publication = store
                .get_key_vals(DEFAULT_AREA, vec![key.to_string()])
                .await
                .unwrap();
            if let Some(value) = publication.key_vals.get(key) {
                if let Some(bytes) = &value.value {
                    return PrefixDatabase::decode(bytes.as_slice()).ok();
                }
            }
            if std::time::Instant::now() > deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_advertise_publishes_monolithic_key() {
        let setup = setup(false).await;
        let changed = setup
            .handle
            .advertise(vec![entry("2001:db8::/64", PrefixType::Default, false)])
            .await
            .unwrap();
        assert!(changed);

        let db = await_prefix_db(&setup.store, "prefix:node1").await.unwrap();
        assert_eq!(db.prefix_entries.len(), 1);
        assert_eq!(db.this_node_name, "node1");
    }

    #[tokio::test]
    async fn test_queue_source_feeds_manager() {
        let setup = setup(false).await;
        setup
            .requests
            .push(PrefixUpdateRequest::SyncByType(
                PrefixType::Loopback,
                vec![entry("2001:db8:1::/64", PrefixType::Loopback, false)],
            ))
            .unwrap();
        let db = await_prefix_db(&setup.store, "prefix:node1").await.unwrap();
        assert_eq!(db.prefix_entries.len(), 1);
        assert_eq!(
            db.prefix_entries[0].prefix_type,
            PrefixType::Loopback as i32
        );
    }

    #[tokio::test]
    async fn test_types_are_isolated() {
        let setup = setup(false).await;
        setup
            .handle
            .advertise(vec![
                entry("2001:db8:1::/64", PrefixType::Loopback, false),
                entry("2001:db8:2::/64", PrefixType::Default, false),
            ])
            .await
            .unwrap();
        setup
            .handle
            .withdraw_by_type(PrefixType::Default)
            .await
            .unwrap();

        let loopbacks = setup
            .handle
            .get_prefixes(Some(PrefixType::Loopback))
            .await
            .unwrap();
        assert_eq!(loopbacks.len(), 1);
        let defaults = setup
            .handle
            .get_prefixes(Some(PrefixType::Default))
            .await
            .unwrap();
        assert!(defaults.is_empty());
    }

    #[tokio::test]
    async fn test_per_prefix_withdraw_publishes_tombstone() {
        let setup = setup(true).await;
        let the_entry = entry("2001:db8::/64", PrefixType::Default, false);
        setup.handle.advertise(vec![the_entry.clone()]).await.unwrap();

        let key = per_prefix_key(
            "node1",
            DEFAULT_AREA,
            the_entry.prefix.as_ref().unwrap(),
        );
        let db = await_prefix_db(&setup.store, &key).await.unwrap();
        assert!(!db.delete_prefix);

        setup.handle.withdraw(vec![the_entry]).await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(db) = await_prefix_db(&setup.store, &key).await {
                if db.delete_prefix {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "no tombstone seen");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = &setup.config;
    }

    #[tokio::test]
    async fn test_non_ephemeral_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config {
            node_name: "node1".to_string(),
            prefix_throttle: Duration::from_millis(10),
            config_store_path: dir.path().join("store"),
            ..Default::default()
        });
        let store = spawn_store("node1").await;

        {
            let client = KvStoreClient::spawn("node1", store.clone());
            let config_store = PersistentStore::new(
                &config.config_store_path,
                Duration::from_millis(5),
                Duration::from_millis(50),
                false,
            )
            .unwrap()
            .spawn();
            let requests: ReplicateQueue<PrefixUpdateRequest> = ReplicateQueue::new();
            let handle = PrefixManager::new(Arc::clone(&config), client, config_store)
                .spawn(requests.get_reader());
            handle
                .advertise(vec![
                    entry("2001:db8:1::/64", PrefixType::Default, false),
                    entry("2001:db8:2::/64", PrefixType::Breeze, true),
                ])
                .await
                .unwrap();
            // let the throttle fire and the store flush
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        // a fresh manager over the same config store restores only the
        // non-ephemeral entry
        let client = KvStoreClient::spawn("node1", store.clone());
        let config_store = PersistentStore::new(
            &config.config_store_path,
            Duration::from_millis(5),
            Duration::from_millis(50),
            false,
        )
        .unwrap()
        .spawn();
        let requests: ReplicateQueue<PrefixUpdateRequest> = ReplicateQueue::new();
        let handle = PrefixManager::new(Arc::clone(&config), client, config_store)
            .spawn(requests.get_reader());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let entries = handle.get_prefixes(None).await.unwrap();
            if entries.len() == 1 {
                assert_eq!(
                    entries[0].prefix.as_ref().unwrap().to_string(),
                    "2001:db8:1::/64"
                );
                break;
            }
            assert!(std::time::Instant::now() < deadline, "nothing restored");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_dump_via_kvstore_filters() {
        let setup = setup(false).await;
        setup
            .handle
            .advertise(vec![entry("2001:db8::/64", PrefixType::Default, false)])
            .await
            .unwrap();
        await_prefix_db(&setup.store, "prefix:node1").await.unwrap();

        let dump = setup
            .store
            .dump_all(
                DEFAULT_AREA,
                KvStoreFilters {
                    key_prefixes: vec![PREFIX_DB_MARKER.to_string()],
                    originator_ids: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(dump.key_vals.len(), 1);
    }
}
