//! Link monitor
//!
//! Glue between discovery and the store: consumes Spark neighbor events
//! and platform link/address events, manages KvStore peerings, and
//! publishes this node's adjacency database, interface database, and
//! redistributed prefixes. Operator overrides (overload bits, metric
//! overrides) are applied as the adjacency database is assembled and are
//! persisted across restarts.

mod interface;

pub use interface::InterfaceEntry;

use crate::config::{
    Config, InterfaceMatchers, ADJ_DB_MARKER, DEFAULT_ADJ_METRIC, NODE_LABEL_MARKER,
    SR_GLOBAL_RANGE,
};
use crate::error::{LinkMonitorError, Result, TrellisError};
use crate::kvstore::{KvStoreClient, KvStoreHandle};
use crate::messaging::{RQueue, ReplicateQueue};
use crate::prefix::{PrefixUpdateRequest, RangeAllocator};
use crate::protocol::net::parse_prefix;
use crate::protocol::{
    serialize_message, Adjacency, AdjacencyDatabase, AdjMetricOverride, BinaryAddress,
    InterfaceDatabase, InterfaceInfo, IpPrefix, LinkMonitorState, PeerSpec, PrefixEntry,
    PrefixType,
};
use crate::spark::{SparkNeighborEvent, SparkNeighborEventType};
use crate::storage::ConfigStore;
use crate::utils::Counters;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Persistent-store key for the operator overrides
const CONFIG_KEY: &str = "link-monitor-config";

/// Persistent-store key for the allocated SR node label
const NODE_LABEL_KEY: &str = "node-label";

/// Tagged event from the platform event stream
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// Link state change
    Link {
        /// Interface name
        if_name: String,
        /// Kernel interface index
        if_index: i32,
        /// Kernel up/down state
        is_up: bool,
        /// ECMP weight
        weight: u64,
    },
    /// Address added or removed
    Address {
        /// Interface name
        if_name: String,
        /// The address (with prefix length)
        prefix: IpPrefix,
        /// True when added, false when removed
        is_valid: bool,
    },
}

/// Transform a measured RTT (microseconds) into a link metric
fn rtt_metric(rtt_us: i64) -> u64 {
    std::cmp::max(rtt_us / 100, 1) as u64
}

type AdjacencyKey = (String, String); // (remote node, local interface)

struct AdjacencyValue {
    peer_spec: PeerSpec,
    adjacency: Adjacency,
    is_restarting: bool,
    area: String,
}

enum Cmd {
    SetNodeOverload {
        overloaded: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    SetInterfaceOverload {
        if_name: String,
        overloaded: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    SetLinkMetric {
        if_name: String,
        metric: Option<i64>,
        resp: oneshot::Sender<Result<()>>,
    },
    SetAdjacencyMetric {
        if_name: String,
        node_name: String,
        metric: Option<i64>,
        resp: oneshot::Sender<Result<()>>,
    },
    GetInterfaces {
        resp: oneshot::Sender<Vec<InterfaceInfo>>,
    },
    GetAdjacencies {
        resp: oneshot::Sender<AdjacencyDatabase>,
    },
}

/// Handle to the link monitor task
#[derive(Clone)]
pub struct LinkMonitorHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl LinkMonitorHandle {
    async fn send<T>(&self, cmd: Cmd, rx: oneshot::Receiver<T>) -> Result<T> {
        self.tx
            .send(cmd)
            .map_err(|_| LinkMonitorError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(LinkMonitorError::NotRunning))
    }

    /// Set or clear the node overload bit
    pub async fn set_node_overload(&self, overloaded: bool) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Cmd::SetNodeOverload { overloaded, resp }, rx)
            .await?
    }

    /// Set or clear an interface's overload bit
    pub async fn set_interface_overload(
        &self,
        if_name: impl Into<String>,
        overloaded: bool,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Cmd::SetInterfaceOverload {
                if_name: if_name.into(),
                overloaded,
                resp,
            },
            rx,
        )
        .await?
    }

    /// Override (or restore) an interface's link metric
    pub async fn set_link_metric(
        &self,
        if_name: impl Into<String>,
        metric: Option<i64>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Cmd::SetLinkMetric {
                if_name: if_name.into(),
                metric,
                resp,
            },
            rx,
        )
        .await?
    }

    /// Override (or restore) one adjacency's metric
    pub async fn set_adjacency_metric(
        &self,
        if_name: impl Into<String>,
        node_name: impl Into<String>,
        metric: Option<i64>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Cmd::SetAdjacencyMetric {
                if_name: if_name.into(),
                node_name: node_name.into(),
                metric,
                resp,
            },
            rx,
        )
        .await?
    }

    /// Dump tracked interfaces (dampened state)
    pub async fn get_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let (resp, rx) = oneshot::channel();
        self.send(Cmd::GetInterfaces { resp }, rx).await
    }

    /// The adjacency database as currently assembled
    pub async fn get_adjacencies(&self) -> Result<AdjacencyDatabase> {
        let (resp, rx) = oneshot::channel();
        self.send(Cmd::GetAdjacencies { resp }, rx).await
    }
}

/// The link monitor; construct then [`LinkMonitor::spawn`]
pub struct LinkMonitor {
    config: Arc<Config>,
    matchers: InterfaceMatchers,
    store: KvStoreHandle,
    client: KvStoreClient,
    config_store: ConfigStore,
    interface_updates: ReplicateQueue<InterfaceDatabase>,
    prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
    counters: Counters,
}

impl LinkMonitor {
    /// Build the link monitor
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        matchers: InterfaceMatchers,
        store: KvStoreHandle,
        client: KvStoreClient,
        config_store: ConfigStore,
        interface_updates: ReplicateQueue<InterfaceDatabase>,
        prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
    ) -> Self {
        Self {
            config,
            matchers,
            store,
            client,
            config_store,
            interface_updates,
            prefix_updates,
            counters: Counters::new(),
        }
    }

    /// Spawn the task consuming Spark and platform events
    pub fn spawn(
        self,
        spark_events: RQueue<SparkNeighborEvent>,
        platform_events: RQueue<PlatformEvent>,
    ) -> LinkMonitorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config: self.config,
            matchers: self.matchers,
            store: self.store,
            client: self.client,
            config_store: self.config_store,
            interface_updates: self.interface_updates,
            prefix_updates: self.prefix_updates,
            counters: self.counters,
            interfaces: HashMap::new(),
            adjacencies: HashMap::new(),
            announced_peers: HashMap::new(),
            state: LinkMonitorState::default(),
            node_label: 0,
        };
        tokio::spawn(actor.run(spark_events, platform_events, rx));
        LinkMonitorHandle { tx }
    }
}

struct Actor {
    config: Arc<Config>,
    matchers: InterfaceMatchers,
    store: KvStoreHandle,
    client: KvStoreClient,
    config_store: ConfigStore,
    interface_updates: ReplicateQueue<InterfaceDatabase>,
    prefix_updates: ReplicateQueue<PrefixUpdateRequest>,
    counters: Counters,
    interfaces: HashMap<String, InterfaceEntry>,
    adjacencies: HashMap<AdjacencyKey, AdjacencyValue>,
    announced_peers: HashMap<String, HashMap<String, PeerSpec>>,
    state: LinkMonitorState,
    node_label: i32,
}

impl Actor {
    async fn run(
        mut self,
        mut spark_events: RQueue<SparkNeighborEvent>,
        mut platform_events: RQueue<PlatformEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        self.restore_state().await;
        self.advertise_static_prefixes();

        // SR node label election runs off-task; the result comes back here
        let (label_tx, mut label_rx) = mpsc::unbounded_channel::<i32>();
        if self.config.enable_segment_routing {
            self.start_label_allocation(label_tx.clone());
        }

        let adj_hold_until =
            tokio::time::Instant::now() + self.config.adjacency_hold_time;
        let mut held_advertisement = false;
        let mut adj_deadline: Option<tokio::time::Instant> = None;
        let mut iface_deadline: Option<tokio::time::Instant> = None;
        let far_future = || tokio::time::Instant::now() + Duration::from_secs(3600);

        loop {
            let adj_sleep = adj_deadline.unwrap_or_else(far_future);
            let iface_sleep = iface_deadline.unwrap_or_else(far_future);
            tokio::select! {
                event = spark_events.recv() => {
                    match event {
                        Err(_) => {
                            info!("spark event stream closed; link monitor shutting down");
                            self.interface_updates.close();
                            self.prefix_updates.close();
                            return;
                        }
                        Ok(event) => {
                            if self.process_neighbor_event(event).await {
                                let earliest = std::cmp::max(
                                    tokio::time::Instant::now() +
                                        self.config.adjacency_throttle,
                                    adj_hold_until,
                                );
                                if adj_deadline.map(|d| earliest < d).unwrap_or(true) {
                                    adj_deadline = Some(earliest);
                                }
                            }
                        }
                    }
                }
                event = platform_events.recv() => {
                    match event {
                        Err(_) => {
                            info!("platform event stream closed; link monitor shutting down");
                            self.interface_updates.close();
                            self.prefix_updates.close();
                            return;
                        }
                        Ok(event) => {
                            if let Some(immediate) = self.process_platform_event(event) {
                                let when = if immediate {
                                    tokio::time::Instant::now()
                                } else {
                                    tokio::time::Instant::now() +
                                        self.config.adjacency_throttle
                                };
                                if iface_deadline.map(|d| when < d).unwrap_or(true) {
                                    iface_deadline = Some(when);
                                }
                            }
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => return,
                        Some(cmd) => {
                            if self.handle_cmd(cmd).await {
                                adj_deadline.get_or_insert(
                                    tokio::time::Instant::now() +
                                        self.config.adjacency_throttle,
                                );
                            }
                        }
                    }
                }
                Some(label) = label_rx.recv() => {
                    info!("allocated SR node label {}", label);
                    self.node_label = label;
                    adj_deadline.get_or_insert(
                        tokio::time::Instant::now() + self.config.adjacency_throttle,
                    );
                }
                _ = tokio::time::sleep_until(adj_sleep), if adj_deadline.is_some() => {
                    adj_deadline = None;
                    self.advertise_peers().await;
                    self.advertise_adjacencies().await;
                }
                _ = tokio::time::sleep_until(iface_sleep), if iface_deadline.is_some() => {
                    iface_deadline = None;
                    self.advertise_interfaces();
                    self.advertise_redistributed();
                    // dampened interfaces need a re-advertisement when the
                    // backoff clears
                    if let Some(retry) = self.min_backoff_remaining() {
                        iface_deadline =
                            Some(tokio::time::Instant::now() + retry);
                    }
                }
                _ = tokio::time::sleep_until(adj_hold_until), if !held_advertisement => {
                    held_advertisement = true;
                    self.advertise_peers().await;
                    self.advertise_adjacencies().await;
                }
            }
        }
    }

    async fn restore_state(&mut self) {
        match self.config_store.load_obj::<LinkMonitorState>(CONFIG_KEY).await {
            Ok(state) => {
                info!("restored link-monitor overrides");
                self.state = state;
            }
            Err(TrellisError::Storage(crate::error::StorageError::NotFound { .. })) => {}
            Err(e) => warn!("failed to restore link-monitor overrides: {}", e),
        }
    }

    async fn persist_state(&self) {
        if let Err(e) = self.config_store.store_obj(CONFIG_KEY, &self.state).await {
            warn!("failed to persist link-monitor overrides: {}", e);
        }
    }

    fn start_label_allocation(&self, label_tx: mpsc::UnboundedSender<i32>) {
        let store = self.store.clone();
        let client = self.client.clone();
        let config_store = self.config_store.clone();
        let node_name = self.config.node_name.clone();
        let settle = self.config.prefix_alloc_sync_interval;
        let area = self
            .config
            .areas
            .first()
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_AREA.to_string());
        tokio::spawn(async move {
            let preferred = match config_store
                .load_obj::<crate::protocol::AllocPrefix>(NODE_LABEL_KEY)
                .await
            {
                Ok(claim) => u32::try_from(claim.alloc_prefix_index).ok(),
                Err(_) => None,
            };
            let allocator = RangeAllocator::new(
                node_name,
                area,
                NODE_LABEL_MARKER,
                (SR_GLOBAL_RANGE.0 as u32, SR_GLOBAL_RANGE.1 as u32),
                store,
                client,
                settle,
            );
            match allocator.allocate(preferred, |_| false).await {
                Ok(label) => {
                    let _ = config_store
                        .store_obj(
                            NODE_LABEL_KEY,
                            &crate::protocol::AllocPrefix {
                                alloc_prefix_index: label as i64,
                            },
                        )
                        .await;
                    let _ = label_tx.send(label as i32);
                }
                Err(e) => warn!("node label election failed: {}", e),
            }
        });
    }

    /// Returns true when the adjacency database needs re-advertisement
    async fn process_neighbor_event(&mut self, event: SparkNeighborEvent) -> bool {
        let key = (event.info.node_name.clone(), event.if_name.clone());
        match event.event_type {
            SparkNeighborEventType::Up | SparkNeighborEventType::Restarted => {
                self.counters.incr("link_monitor.neighbor_up");
                let weight = self
                    .interfaces
                    .get(&event.if_name)
                    .map(|e| e.weight())
                    .unwrap_or(1);
                let if_index = self
                    .interfaces
                    .get(&event.if_name)
                    .map(|e| e.if_index())
                    .unwrap_or(0);
                let metric = if self.config.use_rtt_metric && event.rtt_us > 0 {
                    rtt_metric(event.rtt_us)
                } else {
                    DEFAULT_ADJ_METRIC
                };
                let adjacency = Adjacency {
                    other_node_name: event.info.node_name.clone(),
                    if_name: event.if_name.clone(),
                    other_if_name: event.info.remote_if_name.clone(),
                    next_hop_v6: event
                        .info
                        .transport_address_v6
                        .map(|a| BinaryAddress::from_addr(a, Some(event.if_name.clone()))),
                    next_hop_v4: event
                        .info
                        .transport_address_v4
                        .map(|a| BinaryAddress::from_addr(a, None)),
                    metric,
                    adj_label: event.info.label,
                    is_overloaded: false,
                    rtt_us: event.rtt_us,
                    timestamp_ms: unix_ts_ms(),
                    weight,
                };
                let peer_spec = PeerSpec {
                    addr: peer_addr_string(&event, if_index),
                    supports_flood_optimization: event.info.supports_flood_optimization,
                };
                info!(
                    "neighbor {} up on {} (metric {})",
                    event.info.node_name, event.if_name, metric
                );
                self.adjacencies.insert(
                    key,
                    AdjacencyValue {
                        peer_spec,
                        adjacency,
                        is_restarting: false,
                        area: event.info.area.clone(),
                    },
                );
                // peerings react immediately; the adjacency itself batches
                self.advertise_peers().await;
                true
            }
            SparkNeighborEventType::Down => {
                self.counters.incr("link_monitor.neighbor_down");
                info!("neighbor {} down on {}", event.info.node_name, event.if_name);
                let removed = self.adjacencies.remove(&key).is_some();
                if removed {
                    self.advertise_peers().await;
                }
                removed
            }
            SparkNeighborEventType::Restarting => {
                self.counters.incr("link_monitor.neighbor_restarting");
                if let Some(value) = self.adjacencies.get_mut(&key) {
                    // suppressed from the peer list, kept in the adjacency
                    // database until the restart hold runs out
                    value.is_restarting = true;
                    self.advertise_peers().await;
                }
                false
            }
            SparkNeighborEventType::RttChange => {
                if !self.config.use_rtt_metric {
                    return false;
                }
                if let Some(value) = self.adjacencies.get_mut(&key) {
                    let new_metric = rtt_metric(event.rtt_us);
                    debug!(
                        "metric for {} via {}: {} -> {}",
                        key.0, key.1, value.adjacency.metric, new_metric
                    );
                    value.adjacency.rtt_us = event.rtt_us;
                    if value.adjacency.metric != new_metric {
                        value.adjacency.metric = new_metric;
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Returns `Some(immediate)` when interfaces changed; `immediate`
    /// requests an un-throttled advertisement (down events)
    fn process_platform_event(&mut self, event: PlatformEvent) -> Option<bool> {
        match event {
            PlatformEvent::Link {
                if_name,
                if_index,
                is_up,
                weight,
            } => {
                if !self.is_tracked(&if_name) {
                    return None;
                }
                let entry = self.get_or_create_interface(&if_name);
                let was_active = entry.is_active();
                let changed = entry.update_attrs(if_index, is_up, weight);
                let now_active = entry.is_active();
                if !changed {
                    return None;
                }
                // a down transition propagates immediately
                Some(was_active && !now_active)
            }
            PlatformEvent::Address {
                if_name,
                prefix,
                is_valid,
            } => {
                if !self.is_tracked(&if_name) {
                    return None;
                }
                let network = prefix.to_ipnet()?;
                let entry = self.get_or_create_interface(&if_name);
                entry.update_addr(network, is_valid).then_some(false)
            }
        }
    }

    fn is_tracked(&self, if_name: &str) -> bool {
        self.matchers.is_monitored(if_name) || self.matchers.is_redistributed(if_name)
    }

    fn get_or_create_interface(&mut self, if_name: &str) -> &mut InterfaceEntry {
        let config = &self.config;
        self.interfaces
            .entry(if_name.to_string())
            .or_insert_with(|| {
                InterfaceEntry::new(
                    if_name,
                    config.link_flap_initial_backoff,
                    config.link_flap_max_backoff,
                )
            })
    }

    fn min_backoff_remaining(&self) -> Option<Duration> {
        self.interfaces
            .values()
            .map(|e| e.backoff_remaining())
            .filter(|d| !d.is_zero())
            .min()
    }

    /// Returns true when the adjacency database needs re-advertisement
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::SetNodeOverload { overloaded, resp } => {
                let changed = self.state.is_overloaded != overloaded;
                self.state.is_overloaded = overloaded;
                self.persist_state().await;
                let _ = resp.send(Ok(()));
                changed
            }
            Cmd::SetInterfaceOverload {
                if_name,
                overloaded,
                resp,
            } => {
                let had = self.state.overloaded_links.contains(&if_name);
                if overloaded && !had {
                    self.state.overloaded_links.push(if_name);
                } else if !overloaded && had {
                    self.state.overloaded_links.retain(|l| *l != if_name);
                }
                self.persist_state().await;
                let _ = resp.send(Ok(()));
                had != overloaded
            }
            Cmd::SetLinkMetric {
                if_name,
                metric,
                resp,
            } => {
                let changed = match metric {
                    Some(metric) => {
                        self.state.link_metric_overrides.insert(if_name, metric)
                            != Some(metric)
                    }
                    None => self.state.link_metric_overrides.remove(&if_name).is_some(),
                };
                self.persist_state().await;
                let _ = resp.send(Ok(()));
                changed
            }
            Cmd::SetAdjacencyMetric {
                if_name,
                node_name,
                metric,
                resp,
            } => {
                self.state
                    .adj_metric_overrides
                    .retain(|o| !(o.if_name == if_name && o.node_name == node_name));
                if let Some(metric) = metric {
                    self.state.adj_metric_overrides.push(AdjMetricOverride {
                        if_name,
                        node_name,
                        metric,
                    });
                }
                self.persist_state().await;
                let _ = resp.send(Ok(()));
                true
            }
            Cmd::GetInterfaces { resp } => {
                let infos = self
                    .interfaces
                    .values_mut()
                    .map(|e| e.interface_info())
                    .collect();
                let _ = resp.send(infos);
                false
            }
            Cmd::GetAdjacencies { resp } => {
                let area = self
                    .config
                    .areas
                    .first()
                    .cloned()
                    .unwrap_or_else(|| crate::config::DEFAULT_AREA.to_string());
                let _ = resp.send(self.build_adjacency_db(&area));
                false
            }
        }
    }

    /// Required peer set per area: one peering per neighbor over the
    /// lexicographically smallest interface, restarting neighbors excluded
    fn peers_from_adjacencies(&self, area: &str) -> HashMap<String, PeerSpec> {
        let mut chosen: HashMap<String, (String, PeerSpec)> = HashMap::new();
        for ((node, if_name), value) in &self.adjacencies {
            if value.is_restarting || value.area != area {
                continue;
            }
            match chosen.get(node) {
                Some((existing_if, _)) if existing_if <= if_name => {}
                _ => {
                    chosen.insert(node.clone(), (if_name.clone(), value.peer_spec.clone()));
                }
            }
        }
        chosen
            .into_iter()
            .map(|(node, (_, spec))| (node, spec))
            .collect()
    }

    async fn advertise_peers(&mut self) {
        for area in self.config.areas.clone() {
            let desired = self.peers_from_adjacencies(&area);
            let announced = self.announced_peers.entry(area.clone()).or_default();

            let to_del: Vec<String> = announced
                .keys()
                .filter(|node| !desired.contains_key(*node))
                .cloned()
                .collect();
            let to_add: HashMap<String, PeerSpec> = desired
                .iter()
                .filter(|(node, spec)| announced.get(*node) != Some(spec))
                .map(|(node, spec)| (node.clone(), spec.clone()))
                .collect();
            *announced = desired;

            if !to_del.is_empty() {
                if let Err(e) = self.store.del_peers(area.clone(), to_del).await {
                    warn!("failed to remove peers: {}", e);
                }
            }
            if !to_add.is_empty() {
                if let Err(e) = self.store.add_peers(area.clone(), to_add).await {
                    warn!("failed to add peers: {}", e);
                }
            }
        }
    }

    fn build_adjacency_db(&self, area: &str) -> AdjacencyDatabase {
        let mut adjacencies: Vec<Adjacency> = Vec::new();
        for ((node, if_name), value) in &self.adjacencies {
            if value.area != area {
                continue;
            }
            let mut adjacency = value.adjacency.clone();
            // interface overload
            adjacency.is_overloaded = self.state.overloaded_links.contains(if_name);
            // link metric override, then adjacency metric override
            if let Some(metric) = self.state.link_metric_overrides.get(if_name) {
                adjacency.metric = (*metric).max(1) as u64;
            }
            if let Some(o) = self
                .state
                .adj_metric_overrides
                .iter()
                .find(|o| o.if_name == *if_name && o.node_name == *node)
            {
                adjacency.metric = o.metric.max(1) as u64;
            }
            adjacencies.push(adjacency);
        }
        adjacencies.sort_by(|a, b| {
            (&a.other_node_name, &a.if_name).cmp(&(&b.other_node_name, &b.if_name))
        });
        AdjacencyDatabase {
            this_node_name: self.config.node_name.clone(),
            is_overloaded: self.state.is_overloaded,
            adjacencies,
            node_label: self.node_label,
            area: area.to_string(),
            perf_events: None,
        }
    }

    async fn advertise_adjacencies(&mut self) {
        self.counters.incr("link_monitor.adjacency_advertisements");
        for area in self.config.areas.clone() {
            let db = self.build_adjacency_db(&area);
            let key = format!("{}{}", ADJ_DB_MARKER, self.config.node_name);
            let bytes = match serialize_message(&db) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to serialize adjacency database: {}", e);
                    continue;
                }
            };
            if let Err(e) = self
                .client
                .persist_key(area, key, bytes, self.config.key_ttl_ms())
                .await
            {
                warn!("failed to advertise adjacency database: {}", e);
            }
        }
    }

    fn advertise_interfaces(&mut self) {
        let mut interfaces = HashMap::new();
        for (name, entry) in self.interfaces.iter_mut() {
            interfaces.insert(name.clone(), entry.interface_info());
        }
        let db = InterfaceDatabase {
            this_node_name: self.config.node_name.clone(),
            interfaces,
        };
        if self.interface_updates.push(db).is_err() {
            debug!("interface update queue closed");
        }
    }

    fn advertise_redistributed(&mut self) {
        let mut entries: Vec<PrefixEntry> = Vec::new();
        let enable_v4 = self.config.enable_v4;
        for (name, entry) in self.interfaces.iter_mut() {
            if !self.matchers.is_redistributed(name) || !entry.is_active() {
                continue;
            }
            entries.extend(entry.global_unicast_prefixes(enable_v4));
        }
        if self
            .prefix_updates
            .push(PrefixUpdateRequest::SyncByType(
                PrefixType::Loopback,
                entries,
            ))
            .is_err()
        {
            debug!("prefix update queue closed");
        }
    }

    fn advertise_static_prefixes(&mut self) {
        if self.config.static_prefixes.is_empty() {
            return;
        }
        let entries: Vec<PrefixEntry> = self
            .config
            .static_prefixes
            .iter()
            .filter_map(|s| parse_prefix(s))
            .map(|prefix| PrefixEntry {
                prefix: Some(prefix),
                prefix_type: PrefixType::Default as i32,
                data: Vec::new(),
                forwarding_type: crate::protocol::ForwardingType::Ip as i32,
                forwarding_algorithm: crate::protocol::ForwardingAlgorithm::SpEcmp as i32,
                ephemeral: false,
                mv: None,
            })
            .collect();
        if self
            .prefix_updates
            .push(PrefixUpdateRequest::SyncByType(PrefixType::Default, entries))
            .is_err()
        {
            debug!("prefix update queue closed");
        }
    }
}

fn peer_addr_string(event: &SparkNeighborEvent, local_if_index: i32) -> String {
    let port = event.info.kvstore_port;
    match event.info.transport_address_v6 {
        Some(IpAddr::V6(v6)) => {
            // link-locals need the local egress interface as scope
            let scope = if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                local_if_index.max(0) as u32
            } else {
                0
            };
            SocketAddr::V6(SocketAddrV6::new(v6, port, 0, scope)).to_string()
        }
        Some(addr) => SocketAddr::new(addr, port).to_string(),
        None => match event.info.transport_address_v4 {
            Some(addr) => SocketAddr::new(addr, port).to_string(),
            None => String::new(),
        },
    }
}

fn unix_ts_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_AREA;
    use crate::network::PeerListener;
    use crate::spark::NeighborInfo;
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

    struct Setup {
        store: KvStoreHandle,
        handle: LinkMonitorHandle,
        spark_events: ReplicateQueue<SparkNeighborEvent>,
        platform_events: ReplicateQueue<PlatformEvent>,
        prefix_reader: RQueue<PrefixUpdateRequest>,
        iface_reader: RQueue<InterfaceDatabase>,
        _dir: TempDir,
    }

    async fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config {
            node_name: "node1".to_string(),
            include_interface_regexes: vec!["iface.*".to_string(), "eth.*".to_string()],
            redistribute_interface_regexes: vec!["lo1".to_string()],
            adjacency_hold_time: Duration::from_millis(50),
            adjacency_throttle: Duration::from_millis(20),
            link_flap_initial_backoff: Duration::from_millis(60),
            link_flap_max_backoff: Duration::from_millis(300),
            config_store_path: dir.path().join("store"),
            ..Default::default()
        });
        let matchers = config.validate().unwrap();
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
        let interface_updates = ReplicateQueue::new();
        let prefix_updates = ReplicateQueue::new();
        let iface_reader = interface_updates.get_reader();
        let prefix_reader = prefix_updates.get_reader();
        let spark_events = ReplicateQueue::new();
        let platform_events = ReplicateQueue::new();
        let handle = LinkMonitor::new(
            config,
            matchers,
            store.clone(),
            client,
            config_store,
            interface_updates,
            prefix_updates,
        )
        .spawn(spark_events.get_reader(), platform_events.get_reader());
        Setup {
            store,
            handle,
            spark_events,
            platform_events,
            prefix_reader,
            iface_reader,
            _dir: dir,
        }
    }

    fn up_event(node: &str, if_name: &str, rtt_us: i64) -> SparkNeighborEvent {
        SparkNeighborEvent {
            event_type: SparkNeighborEventType::Up,
            if_name: if_name.to_string(),
            info: NeighborInfo {
                node_name: node.to_string(),
                remote_if_name: format!("{}-remote", if_name),
                transport_address_v6: Some("fe80::2".parse().unwrap()),
                transport_address_v4: None,
                kvstore_port: 60002,
                ctrl_port: 2018,
                area: DEFAULT_AREA.to_string(),
                gr_hold_time: Duration::from_secs(30),
                supports_flood_optimization: false,
                label: 50001,
            },
            rtt_us,
        }
    }

    fn event_of(base: &SparkNeighborEvent, event_type: SparkNeighborEventType) -> SparkNeighborEvent {
        SparkNeighborEvent {
            event_type,
            ..base.clone()
        }
    }

    async fn await_adj_db(store: &KvStoreHandle) -> AdjacencyDatabase {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let publication = store
                .get_key_vals(DEFAULT_AREA, vec!["adj:node1".to_string()])
                .await
                .unwrap();
            if let Some(value) = publication.key_vals.get("adj:node1") {
                if let Some(bytes) = &value.value {
                    return AdjacencyDatabase::decode(bytes.as_slice()).unwrap();
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no adjacency database advertised"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_neighbor_up_advertises_adjacency_and_peer() {
        let setup = setup().await;
        setup.spark_events.push(up_event("node2", "iface12", 1500)).unwrap();

        let db = await_adj_db(&setup.store).await;
        assert_eq!(db.adjacencies.len(), 1);
        let adj = &db.adjacencies[0];
        assert_eq!(adj.other_node_name, "node2");
        assert_eq!(adj.if_name, "iface12");
        // rtt 1500us -> metric 15
        assert_eq!(adj.metric, 15);

        let peers = setup.store.dump_peers(DEFAULT_AREA).await.unwrap();
        assert!(peers.contains_key("node2"));
    }

    #[tokio::test]
    async fn test_neighbor_down_withdraws() {
        let setup = setup().await;
        let up = up_event("node2", "iface12", 1000);
        setup.spark_events.push(up.clone()).unwrap();
        await_adj_db(&setup.store).await;

        setup
            .spark_events
            .push(event_of(&up, SparkNeighborEventType::Down))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let db = await_adj_db(&setup.store).await;
            if db.adjacencies.is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "adjacency not removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let peers = setup.store.dump_peers(DEFAULT_AREA).await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_restarting_suppresses_peer_keeps_adjacency() {
        let setup = setup().await;
        let up = up_event("node2", "iface12", 1000);
        setup.spark_events.push(up.clone()).unwrap();
        await_adj_db(&setup.store).await;

        setup
            .spark_events
            .push(event_of(&up, SparkNeighborEventType::Restarting))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let peers = setup.store.dump_peers(DEFAULT_AREA).await.unwrap();
            if peers.is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "peer not suppressed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // the adjacency survives the restart hold
        let db = setup.handle.get_adjacencies().await.unwrap();
        assert_eq!(db.adjacencies.len(), 1);
    }

    #[tokio::test]
    async fn test_min_interface_tiebreak_for_peering() {
        let setup = setup().await;
        setup.spark_events.push(up_event("node2", "iface19", 1000)).unwrap();
        setup.spark_events.push(up_event("node2", "iface11", 1000)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let db = setup.handle.get_adjacencies().await.unwrap();
            if db.adjacencies.len() == 2 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "adjacencies missing");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // both adjacencies exist, but exactly one peering over iface11
        let peers = setup.store.dump_peers(DEFAULT_AREA).await.unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn test_node_overload_override() {
        let setup = setup().await;
        setup.spark_events.push(up_event("node2", "iface12", 1000)).unwrap();
        await_adj_db(&setup.store).await;

        setup.handle.set_node_overload(true).await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let db = await_adj_db(&setup.store).await;
            if db.is_overloaded {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "overload not advertised");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_link_metric_override() {
        let setup = setup().await;
        setup.spark_events.push(up_event("node2", "iface12", 1000)).unwrap();
        await_adj_db(&setup.store).await;

        setup
            .handle
            .set_link_metric("iface12", Some(777))
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let db = await_adj_db(&setup.store).await;
            if db.adjacencies[0].metric == 777 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "override not applied");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_platform_events_publish_interface_db() {
        let mut setup = setup().await;
        setup
            .platform_events
            .push(PlatformEvent::Link {
                if_name: "eth0".to_string(),
                if_index: 3,
                is_up: true,
                weight: 1,
            })
            .unwrap();
        setup
            .platform_events
            .push(PlatformEvent::Address {
                if_name: "eth0".to_string(),
                prefix: parse_prefix("fe80::1/64").unwrap(),
                is_valid: true,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(db) = setup.iface_reader.try_recv() {
                if let Some(info) = db.interfaces.get("eth0") {
                    if info.is_up && !info.networks.is_empty() {
                        break;
                    }
                }
            }
            assert!(std::time::Instant::now() < deadline, "no interface db");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_flap_dampening_reports_down() {
        let mut setup = setup().await;
        let link = |is_up| PlatformEvent::Link {
            if_name: "eth0".to_string(),
            if_index: 3,
            is_up,
            weight: 1,
        };
        setup.platform_events.push(link(true)).unwrap();
        // flap
        setup.platform_events.push(link(false)).unwrap();
        setup.platform_events.push(link(true)).unwrap();

        // while dampened the interface reports down despite being up
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut saw_dampened = false;
        while std::time::Instant::now() < deadline {
            if let Some(db) = setup.iface_reader.try_recv() {
                if let Some(info) = db.interfaces.get("eth0") {
                    if !info.is_up {
                        saw_dampened = true;
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_dampened, "dampened state never reported");

        // after the backoff clears it comes back up
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        let mut recovered = false;
        while std::time::Instant::now() < deadline {
            if let Some(db) = setup.iface_reader.try_recv() {
                if let Some(info) = db.interfaces.get("eth0") {
                    if info.is_up {
                        recovered = true;
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recovered, "interface never recovered from dampening");
    }

    #[tokio::test]
    async fn test_redistributed_prefixes_reach_prefix_manager() {
        let mut setup = setup().await;
        setup
            .platform_events
            .push(PlatformEvent::Link {
                if_name: "lo1".to_string(),
                if_index: 9,
                is_up: true,
                weight: 1,
            })
            .unwrap();
        setup
            .platform_events
            .push(PlatformEvent::Address {
                if_name: "lo1".to_string(),
                prefix: parse_prefix("2001:db8:42::1/128").unwrap(),
                is_valid: true,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(PrefixUpdateRequest::SyncByType(prefix_type, entries)) =
                setup.prefix_reader.try_recv()
            {
                if prefix_type == PrefixType::Loopback && !entries.is_empty() {
                    assert_eq!(
                        entries[0].prefix.as_ref().unwrap().to_string(),
                        "2001:db8:42::1/128"
                    );
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "no redistributed prefix");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
