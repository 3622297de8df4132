//! Prefix allocator
//!
//! Elects a unique subprefix of a shared seed for this node. Allocation
//! parameters come from construction (`Params`), from the
//! `e2e-network-prefix` key (`Seeded`), or the prefix is read directly
//! from the static `e2e-network-allocations` map (`Static`). The elected
//! prefix is handed to the prefix manager and optionally programmed onto
//! the loopback interface through the system agent. Losing the seed
//! withdraws and deprograms.

use crate::config::{
    Config, PrefixAllocationMode, ALLOC_PREFIX_MARKER, DEFAULT_AREA,
    SEED_PREFIX_ALLOC_PARAM_KEY, STATIC_PREFIX_ALLOC_PARAM_KEY,
};
use crate::error::{PrefixError, Result};
use crate::kvstore::{KvStoreClient, KvStoreFilters, KvStoreHandle};
use crate::messaging::ReplicateQueue;
use crate::prefix::{PrefixUpdateRequest, RangeAllocator};
use crate::protocol::net::{loopback_address_of, subprefix_at_index};
use crate::protocol::{
    ForwardingAlgorithm, ForwardingType, IpPrefix, PrefixEntry, PrefixType, StaticAllocation,
    Value,
};
use crate::storage::ConfigStore;
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use prost::Message;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Persistent-store key remembering the elected index
const INDEX_CONFIG_KEY: &str = "prefix-allocator-index";

/// Interface-address programming done by the platform
#[async_trait]
pub trait SystemAgent: Send + Sync {
    /// Add an address to an interface
    async fn add_interface_address(&self, if_name: &str, addr: &IpNet) -> Result<()>;

    /// Remove an address from an interface
    async fn remove_interface_address(&self, if_name: &str, addr: &IpNet) -> Result<()>;
}

/// Recording system agent used in tests and dry runs
#[derive(Default)]
pub struct MockSystemAgent {
    addresses: Mutex<HashSet<(String, IpNet)>>,
}

impl MockSystemAgent {
    /// Create an empty agent
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses currently programmed
    pub fn addresses(&self) -> Vec<(String, IpNet)> {
        self.addresses.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl SystemAgent for MockSystemAgent {
    async fn add_interface_address(&self, if_name: &str, addr: &IpNet) -> Result<()> {
        self.addresses.lock().insert((if_name.to_string(), *addr));
        Ok(())
    }

    async fn remove_interface_address(&self, if_name: &str, addr: &IpNet) -> Result<()> {
        self.addresses.lock().remove(&(if_name.to_string(), *addr));
        Ok(())
    }
}

/// Parse `<seed-prefix>,<alloc-len>` as carried in `e2e-network-prefix`
pub fn parse_alloc_params(raw: &str) -> Result<(IpNet, u8)> {
    let (prefix, len) = raw
        .split_once(',')
        .ok_or_else(|| PrefixError::InvalidAllocParams {
            params: raw.to_string(),
            reason: "expected '<prefix>,<alloc_len>'".to_string(),
        })?;
    let alloc_len: u8 = len
        .trim()
        .parse()
        .map_err(|_| PrefixError::InvalidAllocParams {
            params: raw.to_string(),
            reason: "allocation length is not a number".to_string(),
        })?;
    let seed = crate::config::validate_seed_prefix(prefix.trim(), alloc_len)?;
    Ok((seed, alloc_len))
}

enum Cmd {
    GetIndex {
        resp: oneshot::Sender<Option<u32>>,
    },
}

/// Handle to the allocator task
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl AllocatorHandle {
    /// The currently-elected index, if any (tests and the control surface)
    pub async fn get_index(&self) -> Option<u32> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Cmd::GetIndex { resp }).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }
}

/// The allocator; construct then [`PrefixAllocator::spawn`]
pub struct PrefixAllocator {
    config: Arc<Config>,
    store: KvStoreHandle,
    client: KvStoreClient,
    config_store: ConfigStore,
    system_agent: Arc<dyn SystemAgent>,
    prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
}

impl PrefixAllocator {
    /// Build the allocator
    pub fn new(
        config: Arc<Config>,
        store: KvStoreHandle,
        client: KvStoreClient,
        config_store: ConfigStore,
        system_agent: Arc<dyn SystemAgent>,
        prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            config_store,
            system_agent,
            prefix_updates,
        }
    }

    /// Spawn the allocator task
    pub fn spawn(self) -> AllocatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config: self.config,
            store: self.store,
            client: self.client,
            config_store: self.config_store,
            system_agent: self.system_agent,
            prefix_updates: self.prefix_updates,
            alloc_params: None,
            my_index: None,
            my_prefix: None,
            applied_address: None,
            forbidden_indices: HashSet::new(),
        };
        tokio::spawn(actor.run(rx));
        AllocatorHandle { tx }
    }
}

struct Actor {
    config: Arc<Config>,
    store: KvStoreHandle,
    client: KvStoreClient,
    config_store: ConfigStore,
    system_agent: Arc<dyn SystemAgent>,
    prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
    alloc_params: Option<(IpNet, u8)>,
    my_index: Option<u32>,
    my_prefix: Option<IpNet>,
    applied_address: Option<IpNet>,
    forbidden_indices: HashSet<u32>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        let mut updates = self.store.subscribe();

        // params mode starts immediately; the others learn from the store
        match self.config.prefix_allocation_mode.clone() {
            PrefixAllocationMode::Params {
                seed_prefix,
                alloc_prefix_len,
            } => match crate::config::validate_seed_prefix(&seed_prefix, alloc_prefix_len) {
                Ok(seed) => self.start_allocation(seed, alloc_prefix_len).await,
                Err(e) => warn!("unusable allocation params: {}", e),
            },
            PrefixAllocationMode::Seeded | PrefixAllocationMode::Static => {
                self.read_params_from_store().await;
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => return,
                        Some(Cmd::GetIndex { resp }) => {
                            let _ = resp.send(self.my_index);
                        }
                    }
                }
                publication = updates.recv() => {
                    match publication {
                        Err(_) => return,
                        Ok(publication) => {
                            if publication.area != DEFAULT_AREA {
                                continue;
                            }
                            self.process_publication_keys(&publication.key_vals).await;
                            for expired in &publication.expired_keys {
                                self.process_expired_key(expired).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn read_params_from_store(&mut self) {
        let dump = match self
            .store
            .dump_all(DEFAULT_AREA, KvStoreFilters::default())
            .await
        {
            Ok(dump) => dump,
            Err(e) => {
                warn!("failed to read allocation params: {}", e);
                return;
            }
        };
        self.process_publication_keys(&dump.key_vals).await;
    }

    async fn process_publication_keys(
        &mut self,
        key_vals: &std::collections::HashMap<String, Value>,
    ) {
        if let Some(value) = key_vals.get(STATIC_PREFIX_ALLOC_PARAM_KEY) {
            if let Some(bytes) = &value.value {
                self.process_static_allocation(bytes).await;
            }
        }
        if self.config.prefix_allocation_mode == PrefixAllocationMode::Seeded {
            if let Some(value) = key_vals.get(SEED_PREFIX_ALLOC_PARAM_KEY) {
                if let Some(bytes) = &value.value {
                    let raw = String::from_utf8_lossy(bytes).to_string();
                    match parse_alloc_params(&raw) {
                        Ok((seed, alloc_len)) => {
                            if self.alloc_params != Some((seed, alloc_len)) {
                                self.start_allocation(seed, alloc_len).await;
                            }
                        }
                        Err(e) => warn!("ignoring bad allocation params '{}': {}", raw, e),
                    }
                }
            }
        }
    }

    async fn process_expired_key(&mut self, key: &str) {
        if key == SEED_PREFIX_ALLOC_PARAM_KEY
            && self.config.prefix_allocation_mode == PrefixAllocationMode::Seeded
            && self.alloc_params.is_some()
        {
            info!("seed prefix revoked; withdrawing allocated prefix");
            self.withdraw_prefix().await;
            self.alloc_params = None;
        }
    }

    async fn process_static_allocation(&mut self, bytes: &[u8]) {
        let allocation = match StaticAllocation::decode(bytes) {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!("undecodable static allocation map: {}", e);
                return;
            }
        };

        // indices other nodes own statically are off limits to election
        if let Some((seed, alloc_len)) = self.alloc_params {
            self.forbidden_indices =
                forbidden_from_static(&allocation, &seed, alloc_len, &self.config.node_name);
        }

        if self.config.prefix_allocation_mode == PrefixAllocationMode::Static {
            match allocation.node_prefixes.get(&self.config.node_name) {
                Some(prefix) => {
                    if let Some(net) = prefix.to_ipnet() {
                        if self.my_prefix != Some(net) {
                            info!("static allocation assigns {}", net);
                            self.my_index = None;
                            self.apply_prefix(net).await;
                        }
                    }
                }
                None => {
                    if self.my_prefix.is_some() {
                        info!("static allocation no longer covers this node");
                        self.withdraw_prefix().await;
                    }
                }
            }
        }
    }

    async fn start_allocation(&mut self, seed: IpNet, alloc_len: u8) {
        self.alloc_params = Some((seed, alloc_len));
        let space_bits = alloc_len - seed.prefix_len();
        let high = if space_bits >= 31 {
            u32::MAX - 1
        } else {
            (1u32 << space_bits) - 1
        };

        // a previously elected index survives restarts when possible
        let preferred = match self.config_store.load_obj::<crate::protocol::AllocPrefix>(INDEX_CONFIG_KEY).await {
            Ok(claim) => u32::try_from(claim.alloc_prefix_index).ok(),
            Err(_) => None,
        };

        let allocator = RangeAllocator::new(
            self.config.node_name.clone(),
            DEFAULT_AREA,
            ALLOC_PREFIX_MARKER,
            (0, high),
            self.store.clone(),
            self.client.clone(),
            self.config.prefix_alloc_sync_interval,
        );
        let forbidden = self.forbidden_indices.clone();
        match allocator.allocate(preferred, |c| forbidden.contains(&c)).await {
            Ok(index) => {
                info!("elected prefix index {} of {}/{}", index, seed, alloc_len);
                self.my_index = Some(index);
                if let Err(e) = self
                    .config_store
                    .store_obj(
                        INDEX_CONFIG_KEY,
                        &crate::protocol::AllocPrefix {
                            alloc_prefix_index: index as i64,
                        },
                    )
                    .await
                {
                    warn!("failed to persist elected index: {}", e);
                }
                match subprefix_at_index(&seed, index, alloc_len) {
                    Some(prefix) => self.apply_prefix(prefix).await,
                    None => warn!("elected index {} does not fit the seed", index),
                }
            }
            Err(e) => warn!("prefix election failed: {}", e),
        }
    }

    async fn apply_prefix(&mut self, prefix: IpNet) {
        self.my_prefix = Some(prefix);
        let entry = PrefixEntry {
            prefix: Some(IpPrefix::from_ipnet(&prefix)),
            prefix_type: PrefixType::PrefixAllocator as i32,
            data: Vec::new(),
            forwarding_type: ForwardingType::Ip as i32,
            forwarding_algorithm: ForwardingAlgorithm::SpEcmp as i32,
            ephemeral: false,
            mv: None,
        };
        if self
            .prefix_updates
            .push(PrefixUpdateRequest::SyncByType(
                PrefixType::PrefixAllocator,
                vec![entry],
            ))
            .is_err()
        {
            warn!("prefix manager queue closed");
        }

        if self.config.set_loopback_address {
            let address = loopback_address_of(&prefix);
            if let Some(previous) = self.applied_address.take() {
                if previous != address {
                    let _ = self
                        .system_agent
                        .remove_interface_address(&self.config.loopback_interface, &previous)
                        .await;
                }
            }
            match self
                .system_agent
                .add_interface_address(&self.config.loopback_interface, &address)
                .await
            {
                Ok(()) => {
                    debug!("programmed {} on {}", address, self.config.loopback_interface);
                    self.applied_address = Some(address);
                }
                Err(e) => warn!("failed to program loopback address: {}", e),
            }
        }
    }

    async fn withdraw_prefix(&mut self) {
        self.my_prefix = None;
        self.my_index = None;
        if self
            .prefix_updates
            .push(PrefixUpdateRequest::WithdrawByType(
                PrefixType::PrefixAllocator,
            ))
            .is_err()
        {
            warn!("prefix manager queue closed");
        }
        if let Some(address) = self.applied_address.take() {
            let _ = self
                .system_agent
                .remove_interface_address(&self.config.loopback_interface, &address)
                .await;
        }
    }
}

fn forbidden_from_static(
    allocation: &StaticAllocation,
    seed: &IpNet,
    alloc_len: u8,
    my_node: &str,
) -> HashSet<u32> {
    let mut forbidden = HashSet::new();
    for (node, prefix) in &allocation.node_prefixes {
        if node == my_node {
            continue;
        }
        let net = match prefix.to_ipnet() {
            Some(net) => net,
            None => continue,
        };
        if net.prefix_len() != alloc_len || !seed.contains(&net.addr()) {
            continue;
        }
        // recover the index from the subprefix position
        let space_bits = alloc_len - seed.prefix_len();
        let index = match (seed, &net) {
            (IpNet::V6(seed6), IpNet::V6(sub6)) => {
                let offset = u128::from(sub6.network()) - u128::from(seed6.network());
                (offset >> (128 - alloc_len)) as u64
            }
            (IpNet::V4(seed4), IpNet::V4(sub4)) => {
                let offset = u64::from(u32::from(sub4.network()))
                    - u64::from(u32::from(seed4.network()));
                offset >> (32 - alloc_len)
            }
            _ => continue,
        };
        if space_bits >= 32 || index < (1u64 << space_bits) {
            if let Ok(index) = u32::try_from(index) {
                forbidden.insert(index);
            }
        }
    }
    forbidden
}
