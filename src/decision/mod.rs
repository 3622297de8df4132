//! Decision — SPF route computation
//!
//! Subscribes to KvStore publications, assembles the link-state graph and
//! the network-wide prefix state, and emits route-database deltas after a
//! debounced batch recomputation. Ordered-FIB holds are decremented on a
//! periodic tick; a released hold re-runs SPF.

mod link_state;
mod spf;

pub use link_state::{BringsUp, HoldableValue, Link, LinkId, LinkState, LinkStateMetric, UpdateResult};
pub use spf::{run_spf, select_best_paths, BestPaths, SpfNode, SpfOptions, SpfSolver};

use crate::config::{Config, ADJ_DB_MARKER, FIB_TIME_MARKER, PREFIX_DB_MARKER};
use crate::error::{DecisionError, Result, TrellisError};
use crate::messaging::{RQueue, ReplicateQueue};
use crate::protocol::{
    AdjacencyDatabase, FibProgrammingTime, IpPrefix, PerfEvent, PerfEvents, PrefixDatabase,
    PrefixEntry, Publication, RouteDatabase, RouteDatabaseDelta, UnicastRoute, Value,
};
use crate::utils::Counters;
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum Cmd {
    GetRouteDb {
        node: Option<String>,
        resp: oneshot::Sender<Result<RouteDatabase>>,
    },
    GetAdjacencyDbs {
        resp: oneshot::Sender<HashMap<String, AdjacencyDatabase>>,
    },
    GetPrefixDbs {
        resp: oneshot::Sender<HashMap<String, PrefixDatabase>>,
    },
}

/// Handle to the decision task
#[derive(Clone)]
pub struct DecisionHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl DecisionHandle {
    /// Route database from this node's perspective, or another node's
    /// when `node` is given
    pub async fn get_route_db(&self, node: Option<String>) -> Result<RouteDatabase> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetRouteDb { node, resp })
            .map_err(|_| DecisionError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(DecisionError::NotRunning))?
    }

    /// Every adjacency database currently in the link-state graph
    pub async fn get_adjacency_dbs(&self) -> Result<HashMap<String, AdjacencyDatabase>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetAdjacencyDbs { resp })
            .map_err(|_| DecisionError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(DecisionError::NotRunning))
    }

    /// Every node's assembled prefix database
    pub async fn get_prefix_dbs(&self) -> Result<HashMap<String, PrefixDatabase>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetPrefixDbs { resp })
            .map_err(|_| DecisionError::NotRunning)?;
        rx.await
            .map_err(|_| TrellisError::from(DecisionError::NotRunning))
    }
}

/// The decision engine; construct then [`Decision::spawn`]
pub struct Decision {
    config: Arc<Config>,
    route_updates: ReplicateQueue<RouteDatabaseDelta>,
    counters: Counters,
}

impl Decision {
    /// Build the engine
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            route_updates: ReplicateQueue::new(),
            counters: Counters::new(),
        }
    }

    /// Writer side of the route-delta stream (readers via `get_reader`)
    pub fn route_update_queue(&self) -> ReplicateQueue<RouteDatabaseDelta> {
        self.route_updates.clone()
    }

    /// Snapshot of the engine's counters
    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }

    /// Spawn the task consuming KvStore publications
    pub fn spawn(self, kvstore_updates: RQueue<Publication>) -> DecisionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let area = self
            .config
            .areas
            .first()
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_AREA.to_string());
        let actor = Actor {
            config: self.config,
            area,
            route_updates: self.route_updates,
            counters: self.counters,
            link_state: LinkState::new(),
            full_db_entries: HashMap::new(),
            per_prefix_entries: HashMap::new(),
            fib_times: HashMap::new(),
            route_db: RouteDatabase::default(),
            published_once: false,
            pending: Pending::default(),
        };
        tokio::spawn(actor.run(kvstore_updates, rx));
        DecisionHandle { tx }
    }
}

#[derive(Default)]
struct Pending {
    adj_changed: bool,
    prefixes_changed: bool,
    first_at: Option<tokio::time::Instant>,
    last_at: Option<tokio::time::Instant>,
    perf_events: Option<PerfEvents>,
    min_ts: Option<i64>,
}

impl Pending {
    fn record(&mut self, node: &str, incoming: Option<&PerfEvents>) {
        let now = tokio::time::Instant::now();
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        // keep the oldest trace so convergence is measured pessimistically
        let incoming_ts = incoming
            .and_then(|p| p.events.first())
            .map(|e| e.unix_ts_ms);
        let replace = match (incoming_ts, self.min_ts) {
            (Some(ts), Some(min)) => ts < min,
            (Some(_), None) => true,
            (None, _) => self.perf_events.is_none(),
        };
        if replace {
            let mut events = incoming.cloned().unwrap_or_default();
            events.events.push(PerfEvent {
                node_name: node.to_string(),
                event_name: "DECISION_RECEIVED".to_string(),
                unix_ts_ms: unix_ts_ms(),
            });
            self.min_ts = incoming_ts.or(Some(unix_ts_ms()));
            self.perf_events = Some(events);
        }
    }

    fn is_empty(&self) -> bool {
        !self.adj_changed && !self.prefixes_changed
    }

    fn clear(&mut self) {
        *self = Pending::default();
    }
}

struct Actor {
    config: Arc<Config>,
    area: String,
    route_updates: ReplicateQueue<RouteDatabaseDelta>,
    counters: Counters,
    link_state: LinkState,
    // monolithic prefix databases, by node
    full_db_entries: HashMap<String, HashMap<IpPrefix, PrefixEntry>>,
    // per-prefix-key advertisements, by node; these win on overlap
    per_prefix_entries: HashMap<String, HashMap<IpPrefix, PrefixEntry>>,
    fib_times: HashMap<String, i64>,
    route_db: RouteDatabase,
    published_once: bool,
    pending: Pending,
}

impl Actor {
    async fn run(
        mut self,
        mut kvstore_updates: RQueue<Publication>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        let cold_start_until =
            tokio::time::Instant::now() + self.config.decision_graceful_restart_window;
        let mut ordered_fib_tick = tokio::time::interval(self.config.ordered_fib_tick);
        ordered_fib_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let process_deadline = match (self.pending.first_at, self.pending.last_at) {
                (Some(first), Some(last)) => {
                    let deadline = std::cmp::min(
                        first + self.config.decision_debounce_max,
                        last + self.config.decision_debounce_min,
                    );
                    Some(std::cmp::max(deadline, cold_start_until))
                }
                _ => None,
            };
            let process_sleep = process_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                publication = kvstore_updates.recv() => {
                    match publication {
                        Err(_) => {
                            info!("kvstore stream closed; decision shutting down");
                            self.route_updates.close();
                            return;
                        }
                        Ok(publication) => self.process_publication(publication),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.route_updates.close();
                            return;
                        }
                        Some(cmd) => self.handle_cmd(cmd),
                    }
                }
                _ = tokio::time::sleep_until(process_sleep), if process_deadline.is_some() => {
                    self.process_pending_updates();
                }
                _ = ordered_fib_tick.tick(), if self.config.enable_ordered_fib => {
                    if self.link_state.has_holds() && self.link_state.decrement_holds() {
                        debug!("ordered-fib hold released; recomputing");
                        self.pending.adj_changed = true;
                        self.pending.record(&self.config.node_name.clone(), None);
                    }
                }
            }
        }
    }

    fn process_publication(&mut self, publication: Publication) {
        if publication.area != self.area {
            return;
        }
        for (key, value) in &publication.key_vals {
            // TTL refreshes carry no body and change nothing here
            if value.value.is_none() {
                continue;
            }
            self.process_key(key, value);
        }
        for key in &publication.expired_keys {
            self.process_expired_key(key);
        }
    }

    fn process_key(&mut self, key: &str, value: &Value) {
        let bytes = match &value.value {
            Some(bytes) => bytes,
            None => return,
        };
        if let Some(node) = key.strip_prefix(ADJ_DB_MARKER) {
            match AdjacencyDatabase::decode(bytes.as_slice()) {
                Ok(db) => {
                    if db.this_node_name != node {
                        warn!("adjacency key {} carries database for {}", key, db.this_node_name);
                        self.counters.incr("decision.invalid_keys");
                        return;
                    }
                    let (hold_up, hold_down) = self.hold_ttls();
                    let perf = db.perf_events.clone();
                    let result =
                        self.link_state
                            .update_adjacency_database(db, hold_up, hold_down);
                    self.counters.incr("decision.adj_db_updates");
                    if result.topology_changed || result.route_attrs_changed {
                        self.pending.adj_changed = true;
                        self.pending.record(&node.to_string(), perf.as_ref());
                    }
                }
                Err(e) => {
                    warn!("undecodable adjacency database under {}: {}", key, e);
                    self.counters.incr("decision.invalid_keys");
                }
            }
        } else if let Some(rest) = key.strip_prefix(PREFIX_DB_MARKER) {
            match PrefixDatabase::decode(bytes.as_slice()) {
                Ok(db) => {
                    self.counters.incr("decision.prefix_db_updates");
                    let perf = db.perf_events.clone();
                    let changed = if rest.contains(':') {
                        self.apply_per_prefix_key(rest, &db)
                    } else {
                        self.apply_full_db(&db)
                    };
                    if changed {
                        self.pending.prefixes_changed = true;
                        self.pending
                            .record(&db.this_node_name.clone(), perf.as_ref());
                    }
                }
                Err(e) => {
                    warn!("undecodable prefix database under {}: {}", key, e);
                    self.counters.incr("decision.invalid_keys");
                }
            }
        } else if let Some(node) = key.strip_prefix(FIB_TIME_MARKER) {
            if let Ok(report) = FibProgrammingTime::decode(bytes.as_slice()) {
                self.fib_times.insert(node.to_string(), report.duration_ms);
            }
        }
    }

    fn apply_full_db(&mut self, db: &PrefixDatabase) -> bool {
        let entries: HashMap<IpPrefix, PrefixEntry> = db
            .prefix_entries
            .iter()
            .filter_map(|entry| entry.prefix.clone().map(|p| (p, entry.clone())))
            .collect();
        let previous = self
            .full_db_entries
            .insert(db.this_node_name.clone(), entries);
        previous != self.full_db_entries.get(&db.this_node_name).cloned()
    }

    /// `rest` is the key past the marker: `<node>:<area>:<prefix>`
    fn apply_per_prefix_key(&mut self, rest: &str, db: &PrefixDatabase) -> bool {
        let node_entries = self
            .per_prefix_entries
            .entry(db.this_node_name.clone())
            .or_default();
        let mut changed = false;
        if db.delete_prefix {
            // a tombstone withdraws what the key carried; the prefix is in
            // the key name even when the tombstone body is empty
            for entry in &db.prefix_entries {
                if let Some(prefix) = &entry.prefix {
                    changed |= node_entries.remove(prefix).is_some();
                }
            }
            if let Some(prefix) = prefix_from_key(rest) {
                changed |= node_entries.remove(&prefix).is_some();
            }
        } else {
            for entry in &db.prefix_entries {
                if let Some(prefix) = &entry.prefix {
                    let previous = node_entries.insert(prefix.clone(), entry.clone());
                    changed |= previous.as_ref() != Some(entry);
                }
            }
        }
        changed
    }

    fn process_expired_key(&mut self, key: &str) {
        if let Some(node) = key.strip_prefix(ADJ_DB_MARKER) {
            if self.link_state.delete_adjacency_database(node) {
                self.pending.adj_changed = true;
                self.pending.record(&node.to_string(), None);
            }
        } else if let Some(rest) = key.strip_prefix(PREFIX_DB_MARKER) {
            match rest.split_once(':') {
                None => {
                    // monolithic key expired: the node's prefixes are gone
                    if self.full_db_entries.remove(rest).is_some() {
                        self.pending.prefixes_changed = true;
                        self.pending.record(&rest.to_string(), None);
                    }
                }
                Some((node, _)) => {
                    // per-prefix key: recover the prefix from the key name
                    let prefix = prefix_from_key(rest);
                    if let (Some(prefix), Some(entries)) =
                        (prefix, self.per_prefix_entries.get_mut(node))
                    {
                        if entries.remove(&prefix).is_some() {
                            self.pending.prefixes_changed = true;
                            self.pending.record(&node.to_string(), None);
                        }
                    }
                }
            }
        }
    }

    fn hold_ttls(&self) -> (u64, u64) {
        if !self.config.enable_ordered_fib {
            return (0, 0);
        }
        // scale the hold to the slowest FIB in the domain when known
        let tick_ms = self.config.ordered_fib_tick.as_millis().max(1) as i64;
        let max_fib_ticks = self
            .fib_times
            .values()
            .max()
            .map(|ms| ((*ms + tick_ms - 1) / tick_ms) as u64)
            .unwrap_or(0);
        let ticks = self.config.ordered_fib_hold_ticks.max(max_fib_ticks);
        (ticks, ticks)
    }

    fn merged_prefix_entries(&self) -> HashMap<String, HashMap<IpPrefix, PrefixEntry>> {
        let mut merged = self.full_db_entries.clone();
        for (node, entries) in &self.per_prefix_entries {
            let node_map = merged.entry(node.clone()).or_default();
            for (prefix, entry) in entries {
                node_map.insert(prefix.clone(), entry.clone());
            }
        }
        merged
    }

    fn spf_options(&self) -> SpfOptions {
        SpfOptions {
            enable_v4: self.config.enable_v4,
            enable_lfa: self.config.enable_lfa,
            enable_segment_routing: self.config.enable_segment_routing,
        }
    }

    fn process_pending_updates(&mut self) {
        if self.pending.is_empty() {
            self.pending.clear();
            return;
        }
        let perf_events = self.pending.perf_events.take();
        self.pending.clear();
        self.counters.incr("decision.spf_runs");

        let prefix_entries = self.merged_prefix_entries();
        let mut solver = SpfSolver::new(&self.link_state, self.spf_options());
        let mut new_db = solver.build_route_db(&self.config.node_name, &prefix_entries);

        let mut delta = compute_delta(&self.route_db, &new_db);
        if delta_is_empty(&delta) && self.published_once {
            self.route_db = new_db;
            return;
        }
        if let Some(mut events) = perf_events {
            events.events.push(PerfEvent {
                node_name: self.config.node_name.clone(),
                event_name: "ROUTE_UPDATE".to_string(),
                unix_ts_ms: unix_ts_ms(),
            });
            delta.perf_events = Some(events.clone());
            new_db.perf_events = Some(events);
        }
        debug!(
            "route update: {} unicast up, {} down, {} mpls up, {} down",
            delta.unicast_routes_to_update.len(),
            delta.unicast_routes_to_delete.len(),
            delta.mpls_routes_to_update.len(),
            delta.mpls_routes_to_delete.len()
        );
        self.counters
            .set("decision.num_routes", new_db.unicast_routes.len() as i64);
        self.route_db = new_db;
        self.published_once = true;
        if self.route_updates.push(delta).is_err() {
            debug!("route update queue closed");
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::GetRouteDb { node, resp } => {
                let result = match node {
                    None => Ok(self.route_db.clone()),
                    Some(node) => {
                        if self.link_state.has_node(&node) {
                            let prefix_entries = self.merged_prefix_entries();
                            let mut solver =
                                SpfSolver::new(&self.link_state, self.spf_options());
                            Ok(solver.build_route_db(&node, &prefix_entries))
                        } else {
                            Err(DecisionError::UnknownNode { node }.into())
                        }
                    }
                };
                let _ = resp.send(result);
            }
            Cmd::GetAdjacencyDbs { resp } => {
                let _ = resp.send(self.link_state.adjacency_databases().clone());
            }
            Cmd::GetPrefixDbs { resp } => {
                let dbs = self
                    .merged_prefix_entries()
                    .into_iter()
                    .map(|(node, entries)| {
                        let db = PrefixDatabase {
                            this_node_name: node.clone(),
                            prefix_entries: entries.into_values().collect(),
                            delete_prefix: false,
                            area: self.area.clone(),
                            perf_events: None,
                        };
                        (node, db)
                    })
                    .collect();
                let _ = resp.send(dbs);
            }
        }
    }
}

/// Difference between two route databases
pub fn compute_delta(old: &RouteDatabase, new: &RouteDatabase) -> RouteDatabaseDelta {
    let mut delta = RouteDatabaseDelta::default();

    let old_unicast: HashMap<&IpPrefix, &UnicastRoute> = old
        .unicast_routes
        .iter()
        .filter_map(|r| r.dest.as_ref().map(|d| (d, r)))
        .collect();
    let new_dests: HashSet<&IpPrefix> = new
        .unicast_routes
        .iter()
        .filter_map(|r| r.dest.as_ref())
        .collect();
    for route in &new.unicast_routes {
        let dest = match &route.dest {
            Some(dest) => dest,
            None => continue,
        };
        match old_unicast.get(dest) {
            Some(previous) if *previous == route => {}
            _ => delta.unicast_routes_to_update.push(route.clone()),
        }
    }
    for (dest, _) in old_unicast {
        if !new_dests.contains(dest) {
            delta.unicast_routes_to_delete.push(dest.clone());
        }
    }

    let old_mpls: HashMap<i32, &crate::protocol::MplsRoute> =
        old.mpls_routes.iter().map(|r| (r.top_label, r)).collect();
    let new_labels: HashSet<i32> = new.mpls_routes.iter().map(|r| r.top_label).collect();
    for route in &new.mpls_routes {
        match old_mpls.get(&route.top_label) {
            Some(previous) if *previous == route => {}
            _ => delta.mpls_routes_to_update.push(route.clone()),
        }
    }
    for (label, _) in old_mpls {
        if !new_labels.contains(&label) {
            delta.mpls_routes_to_delete.push(label);
        }
    }
    delta
}

/// Recover the prefix from `<node>:<area>:<prefix>` (the part of a
/// per-prefix key past the marker)
fn prefix_from_key(rest: &str) -> Option<IpPrefix> {
    let (_node, area_and_prefix) = rest.split_once(':')?;
    let (_area, prefix) = area_and_prefix.split_once(':')?;
    crate::protocol::net::parse_prefix(prefix)
}

fn delta_is_empty(delta: &RouteDatabaseDelta) -> bool {
    delta.unicast_routes_to_update.is_empty()
        && delta.unicast_routes_to_delete.is_empty()
        && delta.mpls_routes_to_update.is_empty()
        && delta.mpls_routes_to_delete.is_empty()
}

fn unix_ts_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
