//! Replicated key-value store
//!
//! One task owns every area's map; all other components interact through
//! a [`KvStoreHandle`] whose operations are routed to the owning task.
//! Peers exchange framed requests over the peer transport: flooded
//! `KeySet`s, point `KeyGet`s, and `KeyDump`s implementing the three-way
//! full sync. Local subscribers observe every merge through a replicate
//! queue.

mod client;
mod dual;
mod flood;
mod long_poll;
mod store;
mod sync;

pub use client::KvStoreClient;
pub use dual::{DualAction, FloodOptimizer};
pub use flood::{FloodLimiter, TokenBucket};
pub use store::{compare_values, merge_key_values, KvStoreDb, KvStoreFilters, MergeResult, ValueCmp};
pub use sync::SyncScheduler;

use crate::config::Config;
use crate::error::{NetworkError, Result, StoreError, TrellisError};
use crate::messaging::{RQueue, ReplicateQueue};
use crate::network::{PeerChannel, PeerListener};
use crate::protocol::{
    store_request, DualMessages, FloodTopoSetParams, HashDump, KeyDumpParams, KeyGetParams,
    KeySetParams, PeerSpec, Publication, SptInfos, StoreRequest, StoreResponse, Value,
};
use crate::utils::Counters;
use long_poll::LongPollRegistry;
use rustls::ClientConfig;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Outbound message to one peer's sender task
struct Outbound {
    request: StoreRequest,
    resp: Option<oneshot::Sender<Result<StoreResponse>>>,
}

/// Result of an in-flight full sync
struct SyncOutcome {
    area: String,
    peer: String,
    result: Result<StoreResponse>,
}

enum Command {
    SetKeyVals {
        area: String,
        key_vals: HashMap<String, Value>,
        resp: oneshot::Sender<Result<()>>,
    },
    GetKeyVals {
        area: String,
        keys: Vec<String>,
        resp: oneshot::Sender<Result<Publication>>,
    },
    DumpAll {
        area: String,
        filters: KvStoreFilters,
        hashes_only: bool,
        resp: oneshot::Sender<Result<Publication>>,
    },
    AddPeers {
        area: String,
        peers: HashMap<String, PeerSpec>,
        resp: oneshot::Sender<Result<()>>,
    },
    DelPeers {
        area: String,
        peers: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    DumpPeers {
        area: String,
        resp: oneshot::Sender<Result<HashMap<String, PeerSpec>>>,
    },
    ProcessDualMessages {
        area: String,
        msgs: DualMessages,
        resp: oneshot::Sender<Result<()>>,
    },
    ProcessFloodTopoSet {
        area: String,
        params: FloodTopoSetParams,
        resp: oneshot::Sender<Result<()>>,
    },
    GetSptInfos {
        area: String,
        resp: oneshot::Sender<Result<SptInfos>>,
    },
    LongPollAdj {
        area: String,
        snapshot: HashMap<String, i64>,
        resp: oneshot::Sender<bool>,
    },
    GetAreas {
        resp: oneshot::Sender<Vec<String>>,
    },
}

/// Handle for submitting operations to the KvStore task
#[derive(Clone)]
pub struct KvStoreHandle {
    tx: mpsc::UnboundedSender<Command>,
    updates: ReplicateQueue<Publication>,
    local_addr: std::net::SocketAddr,
    counters: Counters,
}

impl KvStoreHandle {
    fn send<'a, T: 'a>(
        &'a self,
        cmd: Command,
        rx: oneshot::Receiver<Result<T>>,
    ) -> impl std::future::Future<Output = Result<T>> + 'a {
        let sent = self.tx.send(cmd).map_err(|_| StoreError::NotRunning);
        async move {
            sent?;
            rx.await.map_err(|_| StoreError::NotRunning)?
        }
    }

    /// Merge key-values into an area and flood the winners
    pub async fn set_key_vals(
        &self,
        area: impl Into<String>,
        key_vals: HashMap<String, Value>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::SetKeyVals {
                area: area.into(),
                key_vals,
                resp,
            },
            rx,
        )
        .await
    }

    /// Point lookup of keys in an area
    pub async fn get_key_vals(
        &self,
        area: impl Into<String>,
        keys: Vec<String>,
    ) -> Result<Publication> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::GetKeyVals {
                area: area.into(),
                keys,
                resp,
            },
            rx,
        )
        .await
    }

    /// Dump all matching entries with bodies
    pub async fn dump_all(
        &self,
        area: impl Into<String>,
        filters: KvStoreFilters,
    ) -> Result<Publication> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::DumpAll {
                area: area.into(),
                filters,
                hashes_only: false,
                resp,
            },
            rx,
        )
        .await
    }

    /// Dump all matching entries, hashes only
    pub async fn dump_hashes(
        &self,
        area: impl Into<String>,
        filters: KvStoreFilters,
    ) -> Result<Publication> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::DumpAll {
                area: area.into(),
                filters,
                hashes_only: true,
                resp,
            },
            rx,
        )
        .await
    }

    /// Add (or update) peers in an area; new peers get a full sync
    pub async fn add_peers(
        &self,
        area: impl Into<String>,
        peers: HashMap<String, PeerSpec>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::AddPeers {
                area: area.into(),
                peers,
                resp,
            },
            rx,
        )
        .await
    }

    /// Remove peers from an area; idempotent
    pub async fn del_peers(&self, area: impl Into<String>, peers: Vec<String>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::DelPeers {
                area: area.into(),
                peers,
                resp,
            },
            rx,
        )
        .await
    }

    /// List an area's peers
    pub async fn dump_peers(&self, area: impl Into<String>) -> Result<HashMap<String, PeerSpec>> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::DumpPeers {
                area: area.into(),
                resp,
            },
            rx,
        )
        .await
    }

    /// Feed flood-overlay distance reports into an area
    pub async fn process_dual_messages(
        &self,
        area: impl Into<String>,
        msgs: DualMessages,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::ProcessDualMessages {
                area: area.into(),
                msgs,
                resp,
            },
            rx,
        )
        .await
    }

    /// Apply a flood-overlay child command to an area
    pub async fn process_flood_topo_set(
        &self,
        area: impl Into<String>,
        params: FloodTopoSetParams,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::ProcessFloodTopoSet {
                area: area.into(),
                params,
                resp,
            },
            rx,
        )
        .await
    }

    /// Snapshot the flood-overlay spanning trees of an area
    pub async fn get_spt_infos(&self, area: impl Into<String>) -> Result<SptInfos> {
        let (resp, rx) = oneshot::channel();
        self.send(
            Command::GetSptInfos {
                area: area.into(),
                resp,
            },
            rx,
        )
        .await
    }

    /// Block until the area's adjacency keys differ from `snapshot`, or
    /// the hold expires; returns whether anything changed
    pub async fn long_poll_adj(
        &self,
        area: impl Into<String>,
        snapshot: HashMap<String, i64>,
    ) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::LongPollAdj {
                area: area.into(),
                snapshot,
                resp,
            })
            .map_err(|_| StoreError::NotRunning)?;
        rx.await.map_err(|_| TrellisError::from(StoreError::NotRunning))
    }

    /// Areas this store participates in
    pub async fn get_areas(&self) -> Result<Vec<String>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetAreas { resp })
            .map_err(|_| StoreError::NotRunning)?;
        rx.await.map_err(|_| TrellisError::from(StoreError::NotRunning))
    }

    /// Open a subscription observing every publication (all areas)
    pub fn subscribe(&self) -> RQueue<Publication> {
        self.updates.get_reader()
    }

    /// Address the peer listener is bound to
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Snapshot of the store's counters
    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.counters.snapshot()
    }
}

struct AreaState {
    db: KvStoreDb,
    peers: HashMap<String, PeerSpec>,
    senders: HashMap<String, mpsc::UnboundedSender<Outbound>>,
    sync: SyncScheduler,
    limiter: FloodLimiter,
    dual: Option<FloodOptimizer>,
    long_poll: LongPollRegistry,
}

/// The replicated store; construct with [`KvStore::new`], then
/// [`KvStore::spawn`]
pub struct KvStore {
    node_name: String,
    areas: HashMap<String, AreaState>,
    updates: ReplicateQueue<Publication>,
    counters: Counters,
    tls_client: Option<Arc<ClientConfig>>,
    sync_interval: Duration,
    flood_buffer_interval: Duration,
    enable_flood_optimization: bool,
}

impl KvStore {
    /// Build the store from configuration
    pub fn new(config: &Config, tls_client: Option<Arc<ClientConfig>>) -> Self {
        let counters = Counters::new();
        let mut areas = HashMap::new();
        for area in &config.areas {
            let dual = if config.enable_flood_optimization {
                Some(FloodOptimizer::new(
                    config.node_name.clone(),
                    config.is_flood_root,
                ))
            } else {
                None
            };
            areas.insert(
                area.clone(),
                AreaState {
                    db: KvStoreDb::new(
                        area.clone(),
                        None,
                        Duration::from_millis(crate::config::TTL_DECREMENT_MS as u64),
                        counters.clone(),
                    ),
                    peers: HashMap::new(),
                    senders: HashMap::new(),
                    sync: SyncScheduler::new(),
                    limiter: FloodLimiter::new(config.kvstore_flood_rate),
                    dual,
                    long_poll: LongPollRegistry::new(),
                },
            );
        }
        Self {
            node_name: config.node_name.clone(),
            areas,
            updates: ReplicateQueue::new(),
            counters,
            tls_client,
            sync_interval: config.kvstore_sync_interval,
            flood_buffer_interval: config.kvstore_flood_buffer_interval,
            enable_flood_optimization: config.enable_flood_optimization,
        }
    }

    /// Spawn the store task serving `listener`; returns the handle
    pub fn spawn(self, listener: PeerListener) -> Result<KvStoreHandle> {
        let local_addr = listener.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = KvStoreHandle {
            tx: cmd_tx,
            updates: self.updates.clone(),
            local_addr,
            counters: self.counters.clone(),
        };
        tokio::spawn(self.run(listener, cmd_rx));
        Ok(handle)
    }

    async fn run(mut self, listener: PeerListener, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let (server_tx, mut server_rx) =
            mpsc::unbounded_channel::<(StoreRequest, oneshot::Sender<StoreResponse>)>();
        let (sync_tx, mut sync_rx) = mpsc::unbounded_channel::<SyncOutcome>();

        let mut sync_tick = tokio::time::interval(self.sync_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retry_tick = tokio::time::interval(Duration::from_millis(200));
        retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut drain_tick = tokio::time::interval(self.flood_buffer_interval);
        drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut long_poll_tick = tokio::time::interval(Duration::from_secs(1));
        long_poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let ttl_deadline = self
                .next_expiry()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => {
                            info!("kvstore handle dropped; shutting down");
                            self.updates.close();
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(mut conn) => {
                            let server_tx = server_tx.clone();
                            tokio::spawn(async move {
                                loop {
                                    let request = match conn.read_request().await {
                                        Ok(request) => request,
                                        Err(_) => break,
                                    };
                                    let (resp_tx, resp_rx) = oneshot::channel();
                                    if server_tx.send((request, resp_tx)).is_err() {
                                        break;
                                    }
                                    match resp_rx.await {
                                        Ok(response) => {
                                            if conn.send_response(&response).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(_) => break,
                                    }
                                }
                            });
                        }
                        Err(e) => warn!("peer accept failed: {}", e),
                    }
                }
                Some((request, resp_tx)) = server_rx.recv() => {
                    let response = self.handle_peer_request(request);
                    let _ = resp_tx.send(response);
                }
                Some(outcome) = sync_rx.recv() => {
                    self.handle_sync_outcome(outcome);
                }
                _ = sync_tick.tick() => {
                    self.schedule_periodic_sync();
                }
                _ = retry_tick.tick() => {
                    self.launch_due_syncs(&sync_tx);
                }
                _ = drain_tick.tick() => {
                    self.drain_flood_buffers();
                }
                _ = long_poll_tick.tick() => {
                    let now = Instant::now();
                    for area in self.areas.values_mut() {
                        area.long_poll.expire(now);
                    }
                }
                _ = tokio::time::sleep_until(ttl_deadline) => {
                    self.expire_ttls();
                }
            }
        }
    }

    fn area_mut(&mut self, area: &str) -> std::result::Result<&mut AreaState, StoreError> {
        self.areas.get_mut(area).ok_or_else(|| StoreError::UnknownArea {
            area: area.to_string(),
        })
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetKeyVals { area, key_vals, resp } => {
                let result = self.local_set(&area, key_vals);
                let _ = resp.send(result);
            }
            Command::GetKeyVals { area, keys, resp } => {
                let result = self
                    .area_mut(&area)
                    .map(|state| state.db.get_keys(&keys))
                    .map_err(Into::into);
                let _ = resp.send(result);
            }
            Command::DumpAll {
                area,
                filters,
                hashes_only,
                resp,
            } => {
                let result = self
                    .area_mut(&area)
                    .map(|state| {
                        let mut publication = if hashes_only {
                            state.db.dump_hashes(&filters)
                        } else {
                            state.db.dump_all(&filters)
                        };
                        state.db.update_publication_ttl(&mut publication, false);
                        publication
                    })
                    .map_err(Into::into);
                let _ = resp.send(result);
            }
            Command::AddPeers { area, peers, resp } => {
                let result = self.add_peers(&area, peers);
                let _ = resp.send(result);
            }
            Command::DelPeers { area, peers, resp } => {
                let result = self.del_peers(&area, &peers);
                let _ = resp.send(result);
            }
            Command::DumpPeers { area, resp } => {
                let result = self
                    .area_mut(&area)
                    .map(|state| state.peers.clone())
                    .map_err(Into::into);
                let _ = resp.send(result);
            }
            Command::ProcessDualMessages { area, msgs, resp } => {
                let result = self.process_dual(&area, &msgs);
                let _ = resp.send(result);
            }
            Command::ProcessFloodTopoSet { area, params, resp } => {
                let result = self.area_mut(&area).map_err(TrellisError::from).map(|state| {
                    if let Some(dual) = &mut state.dual {
                        dual.process_flood_topo_set(&params);
                    }
                });
                let _ = resp.send(result);
            }
            Command::GetSptInfos { area, resp } => {
                let result = self
                    .area_mut(&area)
                    .map_err(TrellisError::from)
                    .map(|state| match &state.dual {
                        Some(dual) => dual.spt_infos(),
                        None => SptInfos::default(),
                    });
                let _ = resp.send(result);
            }
            Command::LongPollAdj { area, snapshot, resp } => {
                match self.areas.get_mut(&area) {
                    Some(state) => {
                        let AreaState { db, long_poll, .. } = state;
                        long_poll.register(&snapshot, db.key_vals(), resp);
                    }
                    None => {
                        let _ = resp.send(false);
                    }
                }
            }
            Command::GetAreas { resp } => {
                let mut areas: Vec<String> = self.areas.keys().cloned().collect();
                areas.sort();
                let _ = resp.send(areas);
            }
        }
    }

    fn local_set(&mut self, area: &str, key_vals: HashMap<String, Value>) -> Result<()> {
        let own_root = if self.enable_flood_optimization {
            Some(self.node_name.clone())
        } else {
            None
        };
        let state = self.area_mut(area)?;
        let result = state.db.merge(&key_vals);
        let flood_root = if state.dual.is_some() { own_root } else { None };
        if !result.key_vals.is_empty() {
            self.flood(area, result.key_vals, Vec::new(), flood_root, None);
        }
        Ok(())
    }

    fn add_peers(&mut self, area: &str, peers: HashMap<String, PeerSpec>) -> Result<()> {
        let tls = self.tls_client.clone();
        let state = self.area_mut(area)?;
        let mut dual_actions = Vec::new();
        for (name, spec) in peers {
            let known = state.peers.get(&name) == Some(&spec);
            if known {
                continue;
            }
            info!("area {}: peer {} at {}", area, name, spec.addr);
            // replace any existing sender so a changed address reconnects
            let sender = spawn_peer_sender(&name, &spec.addr, tls.clone());
            state.senders.insert(name.clone(), sender);
            state.sync.mark_peer(&name);
            if let (Some(dual), true) = (&mut state.dual, spec.supports_flood_optimization) {
                dual_actions.extend(dual.peer_up(&name));
            }
            state.peers.insert(name, spec);
        }
        self.counters
            .set("kvstore.flood_peers", self.flood_peer_count() as i64);
        self.execute_dual_actions(area, dual_actions);
        Ok(())
    }

    fn del_peers(&mut self, area: &str, peers: &[String]) -> Result<()> {
        let state = self.area_mut(area)?;
        let mut dual_actions = Vec::new();
        for name in peers {
            if state.peers.remove(name).is_some() {
                info!("area {}: removed peer {}", area, name);
            }
            state.senders.remove(name);
            state.sync.drop_peer(name);
            if let Some(dual) = &mut state.dual {
                dual_actions.extend(dual.peer_down(name));
            }
        }
        self.counters
            .set("kvstore.flood_peers", self.flood_peer_count() as i64);
        self.execute_dual_actions(area, dual_actions);
        Ok(())
    }

    fn flood_peer_count(&self) -> usize {
        self.areas.values().map(|a| a.peers.len()).sum()
    }

    fn process_dual(&mut self, area: &str, msgs: &DualMessages) -> Result<()> {
        let state = self.area_mut(area)?;
        let actions = match &mut state.dual {
            Some(dual) => dual.process_dual_messages(msgs),
            None => Vec::new(),
        };
        self.execute_dual_actions(area, actions);
        Ok(())
    }

    fn execute_dual_actions(&mut self, area: &str, actions: Vec<DualAction>) {
        if actions.is_empty() {
            return;
        }
        let state = match self.areas.get_mut(area) {
            Some(state) => state,
            None => return,
        };
        for action in actions {
            match action {
                DualAction::SendDual { peer, messages } => {
                    let request = StoreRequest {
                        area: area.to_string(),
                        command: Some(store_request::Command::Dual(messages)),
                    };
                    let targets: Vec<String> = match peer {
                        Some(peer) => vec![peer],
                        None => state
                            .peers
                            .iter()
                            .filter(|(_, spec)| spec.supports_flood_optimization)
                            .map(|(name, _)| name.clone())
                            .collect(),
                    };
                    for target in targets {
                        if let Some(sender) = state.senders.get(&target) {
                            let _ = sender.send(Outbound {
                                request: request.clone(),
                                resp: None,
                            });
                        }
                    }
                }
                DualAction::SendTopoSet { peer, params } => {
                    if let Some(sender) = state.senders.get(&peer) {
                        let _ = sender.send(Outbound {
                            request: StoreRequest {
                                area: area.to_string(),
                                command: Some(store_request::Command::FloodTopoSet(params)),
                            },
                            resp: None,
                        });
                    }
                }
            }
        }
    }

    fn handle_peer_request(&mut self, request: StoreRequest) -> StoreResponse {
        let area = request.area.clone();
        if !self.areas.contains_key(&area) {
            return fail(format!("unknown area: {}", area));
        }
        match request.command {
            None => fail("empty request".to_string()),
            Some(store_request::Command::KeySet(params)) => {
                self.counters.incr("kvstore.received_publications");
                let state = match self.areas.get_mut(&area) {
                    Some(state) => state,
                    None => return fail("unknown area".to_string()),
                };
                let result = state.db.merge(&params.key_vals);
                // hash-only winners need bodies; the next sync round with
                // the sender fetches them
                if !result.unknown_keys.is_empty() {
                    if let Some(sender) = &params.sender_id {
                        if state.peers.contains_key(sender) {
                            state.sync.mark_peer(sender);
                        }
                    }
                }
                if !result.key_vals.is_empty() {
                    self.flood(
                        &area,
                        result.key_vals,
                        Vec::new(),
                        params.flood_root_id.clone(),
                        params.sender_id.as_deref(),
                    );
                }
                ok()
            }
            Some(store_request::Command::KeyGet(KeyGetParams { keys })) => {
                let state = match self.areas.get_mut(&area) {
                    Some(state) => state,
                    None => return fail("unknown area".to_string()),
                };
                let mut publication = state.db.get_keys(&keys);
                state.db.update_publication_ttl(&mut publication, false);
                ok_with(publication)
            }
            Some(store_request::Command::KeyDump(params)) => {
                self.handle_key_dump(&area, &params)
            }
            Some(store_request::Command::FloodTopoSet(params)) => {
                if let Some(state) = self.areas.get_mut(&area) {
                    if let Some(dual) = &mut state.dual {
                        dual.process_flood_topo_set(&params);
                    }
                }
                ok()
            }
            Some(store_request::Command::Dual(msgs)) => {
                if self.process_dual(&area, &msgs).is_err() {
                    return fail("unknown area".to_string());
                }
                ok()
            }
        }
    }

    fn handle_key_dump(&mut self, area: &str, params: &KeyDumpParams) -> StoreResponse {
        let state = match self.areas.get_mut(area) {
            Some(state) => state,
            None => return fail("unknown area".to_string()),
        };
        let filters = KvStoreFilters::from(params);
        let mut publication = match (&params.key_val_hashes, params.hashes_only) {
            (_, true) => state.db.dump_hashes(&filters),
            (Some(theirs), false) => state.db.dump_difference(&filters, theirs),
            (None, false) => state.db.dump_all(&filters),
        };
        let syncing = params.key_val_hashes.is_some();
        state
            .db
            .update_publication_ttl(&mut publication, syncing);
        ok_with(publication)
    }

    fn handle_sync_outcome(&mut self, outcome: SyncOutcome) {
        let SyncOutcome { area, peer, result } = outcome;
        let node_name = self.node_name.clone();
        match result {
            Err(e) => {
                warn!("area {}: full sync with {} failed: {}", area, peer, e);
                self.counters.incr("kvstore.sync_failure");
                if let Ok(state) = self.area_mut(&area) {
                    state.sync.sync_failed(&peer);
                }
            }
            Ok(response) if !response.success => {
                warn!(
                    "area {}: full sync with {} rejected: {}",
                    area, peer, response.message
                );
                self.counters.incr("kvstore.sync_failure");
                if let Ok(state) = self.area_mut(&area) {
                    state.sync.sync_failed(&peer);
                }
            }
            Ok(response) => {
                self.counters.incr("kvstore.sync_success");
                let publication = response.publication.unwrap_or_default();
                let to_be_updated = publication.to_be_updated_keys.clone();
                let state = match self.area_mut(&area) {
                    Ok(state) => state,
                    Err(_) => return,
                };
                state.sync.sync_succeeded(&peer);
                let result = state.db.merge(&publication.key_vals);
                debug!(
                    "area {}: full sync with {} merged {} keys",
                    area,
                    peer,
                    result.key_vals.len()
                );
                // third leg: hand back full bodies the responder asked for
                if !to_be_updated.is_empty() {
                    let reply = state.db.get_keys(&to_be_updated);
                    if !reply.key_vals.is_empty() {
                        if let Some(sender) = state.senders.get(&peer) {
                            let _ = sender.send(Outbound {
                                request: StoreRequest {
                                    area: area.clone(),
                                    command: Some(store_request::Command::KeySet(KeySetParams {
                                        key_vals: reply.key_vals,
                                        sender_id: Some(node_name.clone()),
                                        flood_root_id: None,
                                        timestamp_ms: unix_ts_ms(),
                                    })),
                                },
                                resp: None,
                            });
                        }
                    }
                }
                if !result.key_vals.is_empty() {
                    self.flood(&area, result.key_vals, Vec::new(), None, Some(&peer));
                }
            }
        }
    }

    fn schedule_periodic_sync(&mut self) {
        for (area, state) in self.areas.iter_mut() {
            if let Some(peer) = SyncScheduler::random_peer(state.peers.keys()) {
                debug!("area {}: periodic sync with {}", area, peer);
                state.sync.mark_peer(&peer);
            }
        }
    }

    fn launch_due_syncs(&mut self, sync_tx: &mpsc::UnboundedSender<SyncOutcome>) {
        let node_name = self.node_name.clone();
        for (area, state) in self.areas.iter_mut() {
            for peer in state.sync.due_peers() {
                let hashes = state.db.dump_hashes(&KvStoreFilters::default());
                let request = StoreRequest {
                    area: area.clone(),
                    command: Some(store_request::Command::KeyDump(KeyDumpParams {
                        prefixes: Vec::new(),
                        originator_ids: Vec::new(),
                        key_val_hashes: Some(HashDump {
                            hashes: hashes.key_vals,
                        }),
                        hashes_only: false,
                        sender_id: Some(node_name.clone()),
                    })),
                };
                let sender = match state.senders.get(&peer) {
                    Some(sender) => sender.clone(),
                    None => continue,
                };
                let (resp_tx, resp_rx) = oneshot::channel();
                if sender
                    .send(Outbound {
                        request,
                        resp: Some(resp_tx),
                    })
                    .is_err()
                {
                    state.sync.sync_failed(&peer);
                    continue;
                }
                let results = sync_tx.clone();
                let area = area.clone();
                tokio::spawn(async move {
                    let result = match resp_rx.await {
                        Ok(result) => result,
                        Err(_) => Err(NetworkError::ConnectionClosed { peer: peer.clone() }.into()),
                    };
                    let _ = results.send(SyncOutcome { area, peer, result });
                });
            }
        }
    }

    /// Push a delta to subscribers and flood it to peers
    fn flood(
        &mut self,
        area: &str,
        key_vals: HashMap<String, Value>,
        expired_keys: Vec<String>,
        flood_root: Option<String>,
        exclude_peer: Option<&str>,
    ) {
        let node_name = self.node_name.clone();
        let state = match self.areas.get_mut(area) {
            Some(state) => state,
            None => return,
        };

        let publication = Publication {
            key_vals: key_vals.clone(),
            expired_keys,
            to_be_updated_keys: Vec::new(),
            flood_root_id: flood_root.clone(),
            area: area.to_string(),
            node_id: Some(node_name.clone()),
        };
        state.long_poll.on_publication(&publication);
        if self.updates.push(publication).is_err() {
            debug!("subscriber queue closed, dropping publication");
        }

        if key_vals.is_empty() {
            return;
        }
        let state = match self.areas.get_mut(area) {
            Some(state) => state,
            None => return,
        };
        if !state.limiter.allow() {
            self.counters.incr("kvstore.rate_limit_buffered");
            state
                .limiter
                .buffer_keys(flood_root, key_vals.into_keys());
            return;
        }
        Self::flood_to_peers(
            &node_name,
            state,
            area,
            key_vals,
            flood_root,
            exclude_peer,
        );
    }

    fn flood_to_peers(
        node_name: &str,
        state: &mut AreaState,
        area: &str,
        key_vals: HashMap<String, Value>,
        flood_root: Option<String>,
        exclude_peer: Option<&str>,
    ) {
        let overlay_peers: Option<HashSet<String>> = state
            .dual
            .as_ref()
            .and_then(|dual| dual.flood_peers(flood_root.as_deref()));
        let targets: Vec<String> = match overlay_peers {
            Some(peers) => peers.into_iter().collect(),
            None => state.peers.keys().cloned().collect(),
        };

        let mut publication = Publication {
            key_vals,
            area: area.to_string(),
            ..Default::default()
        };
        state.db.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }

        let params = KeySetParams {
            key_vals: publication.key_vals,
            sender_id: Some(node_name.to_string()),
            flood_root_id: flood_root,
            timestamp_ms: unix_ts_ms(),
        };
        for target in targets {
            if Some(target.as_str()) == exclude_peer {
                continue;
            }
            if let Some(sender) = state.senders.get(&target) {
                let _ = sender.send(Outbound {
                    request: StoreRequest {
                        area: area.to_string(),
                        command: Some(store_request::Command::KeySet(params.clone())),
                    },
                    resp: None,
                });
            }
        }
    }

    fn drain_flood_buffers(&mut self) {
        let node_name = self.node_name.clone();
        for (area_name, state) in self.areas.iter_mut() {
            if !state.limiter.has_buffered() {
                continue;
            }
            for (root, keys) in state.limiter.drain() {
                let keys: Vec<String> = keys.into_iter().collect();
                let publication = state.db.get_keys(&keys);
                if publication.key_vals.is_empty() {
                    continue;
                }
                Self::flood_to_peers(
                    &node_name,
                    state,
                    area_name,
                    publication.key_vals,
                    root,
                    None,
                );
            }
        }
    }

    fn next_expiry(&mut self) -> Option<Instant> {
        self.areas
            .values_mut()
            .filter_map(|state| state.db.next_expiry())
            .min()
    }

    fn expire_ttls(&mut self) {
        let now = Instant::now();
        let areas: Vec<String> = self.areas.keys().cloned().collect();
        for area in areas {
            let expired = match self.areas.get_mut(&area) {
                Some(state) => state.db.expire_keys(now),
                None => Vec::new(),
            };
            if !expired.is_empty() {
                debug!("area {}: expired {:?}", area, expired);
                self.flood(&area, HashMap::new(), expired, None, None);
            }
        }
    }
}

fn spawn_peer_sender(
    peer_name: &str,
    addr: &str,
    tls: Option<Arc<ClientConfig>>,
) -> mpsc::UnboundedSender<Outbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut channel = PeerChannel::new(peer_name, addr, tls);
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = channel.request(&outbound.request).await;
            if let Err(e) = &result {
                debug!("send to {} failed: {}", channel.peer_name(), e);
            }
            if let Some(resp) = outbound.resp {
                let _ = resp.send(result);
            }
        }
    });
    tx
}

fn ok() -> StoreResponse {
    StoreResponse {
        success: true,
        message: String::new(),
        publication: None,
    }
}

fn ok_with(publication: Publication) -> StoreResponse {
    StoreResponse {
        success: true,
        message: String::new(),
        publication: Some(publication),
    }
}

fn fail(message: String) -> StoreResponse {
    StoreResponse {
        success: false,
        message,
        publication: None,
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
    use crate::config::{Config, DEFAULT_AREA, TTL_INFINITY};

    async fn spawn_store(name: &str) -> KvStoreHandle {
        let config = Config {
            node_name: name.to_string(),
            kvstore_sync_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let listener = PeerListener::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        KvStore::new(&config, None).spawn(listener).unwrap()
    }

    fn peer_spec(handle: &KvStoreHandle) -> PeerSpec {
        PeerSpec {
            addr: handle.local_addr().to_string(),
            supports_flood_optimization: false,
        }
    }

    async fn await_key(handle: &KvStoreHandle, key: &str, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let publication = handle
                .get_key_vals(DEFAULT_AREA, vec![key.to_string()])
                .await
                .unwrap();
            if let Some(value) = publication.key_vals.get(key) {
                return Some(value.clone());
            }
            if Instant::now() > deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_local_set_and_get() {
        let handle = spawn_store("node1").await;
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "k1".to_string(),
            Value::new(1, "node1", b"v1".to_vec(), TTL_INFINITY),
        );
        handle.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        let publication = handle
            .get_key_vals(DEFAULT_AREA, vec!["k1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            publication.key_vals.get("k1").unwrap().value.as_deref(),
            Some(b"v1".as_slice())
        );
    }

    #[tokio::test]
    async fn test_unknown_area_rejected() {
        let handle = spawn_store("node1").await;
        let result = handle.set_key_vals("backbone", HashMap::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_flood_between_two_stores() {
        let n1 = spawn_store("node1").await;
        let n2 = spawn_store("node2").await;

        let mut peers = HashMap::new();
        peers.insert("node2".to_string(), peer_spec(&n2));
        n1.add_peers(DEFAULT_AREA, peers).await.unwrap();

        let mut key_vals = HashMap::new();
        key_vals.insert(
            "prefix:node1".to_string(),
            Value::new(1, "node1", b"prefixes".to_vec(), TTL_INFINITY),
        );
        n1.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        let value = await_key(&n2, "prefix:node1", Duration::from_secs(2)).await;
        assert_eq!(value.unwrap().value.as_deref(), Some(b"prefixes".as_slice()));
    }

    #[tokio::test]
    async fn test_full_sync_on_peer_add() {
        let n1 = spawn_store("node1").await;
        let n2 = spawn_store("node2").await;

        // n2 has pre-existing state
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "adj:node2".to_string(),
            Value::new(3, "node2", b"adjs".to_vec(), TTL_INFINITY),
        );
        n2.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        // n1 peers with n2 and pulls its state via full sync
        let mut peers = HashMap::new();
        peers.insert("node2".to_string(), peer_spec(&n2));
        n1.add_peers(DEFAULT_AREA, peers).await.unwrap();

        let value = await_key(&n1, "adj:node2", Duration::from_secs(3)).await;
        assert_eq!(value.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_three_way_sync_pushes_back_newer_keys() {
        let n1 = spawn_store("node1").await;
        let n2 = spawn_store("node2").await;

        // n1 (the initiator) holds a key n2 lacks
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "prefix:node1".to_string(),
            Value::new(2, "node1", b"mine".to_vec(), TTL_INFINITY),
        );
        n1.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        // peering both ways lets the third sync leg deliver
        let mut peers = HashMap::new();
        peers.insert("node2".to_string(), peer_spec(&n2));
        n1.add_peers(DEFAULT_AREA, peers).await.unwrap();

        let value = await_key(&n2, "prefix:node1", Duration::from_secs(3)).await;
        assert_eq!(value.unwrap().value.as_deref(), Some(b"mine".as_slice()));
    }

    #[tokio::test]
    async fn test_subscription_sees_merges() {
        let handle = spawn_store("node1").await;
        let mut reader = handle.subscribe();
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "k".to_string(),
            Value::new(1, "node1", b"v".to_vec(), TTL_INFINITY),
        );
        handle.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        let publication = reader.recv().await.unwrap();
        assert!(publication.key_vals.contains_key("k"));
        assert_eq!(publication.area, DEFAULT_AREA);
    }

    #[tokio::test]
    async fn test_ttl_expiry_publishes_expired_keys() {
        let handle = spawn_store("node1").await;
        let mut reader = handle.subscribe();
        let mut key_vals = HashMap::new();
        key_vals.insert(
            "ephemeral".to_string(),
            Value::new(1, "node1", b"v".to_vec(), 600),
        );
        handle.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        // first publication: the merge itself
        let first = reader.recv().await.unwrap();
        assert!(first.key_vals.contains_key("ephemeral"));

        // second publication: the expiry
        let second = tokio::time::timeout(Duration::from_secs(3), reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.expired_keys, vec!["ephemeral".to_string()]);
        assert!(await_key(&handle, "ephemeral", Duration::from_millis(50))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_peer_listed_and_removed() {
        let n1 = spawn_store("node1").await;
        let n2 = spawn_store("node2").await;
        let mut peers = HashMap::new();
        peers.insert("node2".to_string(), peer_spec(&n2));
        n1.add_peers(DEFAULT_AREA, peers).await.unwrap();
        assert_eq!(n1.dump_peers(DEFAULT_AREA).await.unwrap().len(), 1);

        n1.del_peers(DEFAULT_AREA, vec!["node2".to_string()])
            .await
            .unwrap();
        assert!(n1.dump_peers(DEFAULT_AREA).await.unwrap().is_empty());
        // idempotent
        n1.del_peers(DEFAULT_AREA, vec!["node2".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_long_poll_completes_on_adj_change() {
        let handle = spawn_store("node1").await;
        let poll_handle = handle.clone();
        let poll = tokio::spawn(async move {
            poll_handle
                .long_poll_adj(DEFAULT_AREA, HashMap::new())
                .await
        });
        // empty snapshot matches empty store, so the poll blocks
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!poll.is_finished());

        let mut key_vals = HashMap::new();
        key_vals.insert(
            "adj:node1".to_string(),
            Value::new(1, "node1", b"adjs".to_vec(), TTL_INFINITY),
        );
        handle.set_key_vals(DEFAULT_AREA, key_vals).await.unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(changed);
    }
}
