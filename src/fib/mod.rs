//! FIB programmer
//!
//! Applies Decision's route deltas to the forwarding agent. Incremental
//! programming while clean; any agent failure marks the route database
//! dirty and schedules a debounced full resync with exponential backoff.
//! Interface-down events prune or shrink affected routes immediately; an
//! agent restart (detected through `aliveSince`) forces a full resync of
//! the last known-good state.

mod agent;

pub use agent::{FibAgent, MockFibAgent};

use crate::config::{Config, FIB_CLIENT_ID, FIB_TIME_MARKER};
use crate::error::{FibError, Result, TrellisError};
use crate::kvstore::KvStoreClient;
use crate::messaging::RQueue;
use crate::protocol::{
    serialize_message, FibProgrammingTime, InterfaceDatabase, IpPrefix, MplsRoute, NextHop,
    RouteDatabase, RouteDatabaseDelta, UnicastRoute,
};
use crate::utils::{Counters, ExponentialBackoff};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Find the longest prefix covering `addr` among the programmed routes
pub fn longest_prefix_match<'a>(
    addr: &IpAddr,
    unicast_routes: &'a HashMap<IpPrefix, UnicastRoute>,
) -> Option<&'a IpPrefix> {
    unicast_routes
        .keys()
        .filter(|prefix| prefix.contains(addr))
        .max_by_key(|prefix| prefix.prefix_length)
}

enum Cmd {
    GetRouteDb {
        resp: oneshot::Sender<RouteDatabase>,
    },
    GetUnicastRoutes {
        filter: Vec<String>,
        resp: oneshot::Sender<Vec<UnicastRoute>>,
    },
    GetMplsRoutes {
        filter: Vec<i32>,
        resp: oneshot::Sender<Vec<MplsRoute>>,
    },
}

/// Handle to the FIB task
#[derive(Clone)]
pub struct FibHandle {
    tx: mpsc::UnboundedSender<Cmd>,
    counters: Counters,
}

impl FibHandle {
    /// The last route database handed to the agent (or pending for it)
    pub async fn get_route_db(&self) -> Result<RouteDatabase> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetRouteDb { resp })
            .map_err(|_| FibError::NotRunning)?;
        rx.await.map_err(|_| TrellisError::from(FibError::NotRunning))
    }

    /// Unicast routes, optionally filtered by destination prefix strings
    pub async fn get_unicast_routes(&self, filter: Vec<String>) -> Result<Vec<UnicastRoute>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetUnicastRoutes { filter, resp })
            .map_err(|_| FibError::NotRunning)?;
        rx.await.map_err(|_| TrellisError::from(FibError::NotRunning))
    }

    /// MPLS routes, optionally filtered by label
    pub async fn get_mpls_routes(&self, filter: Vec<i32>) -> Result<Vec<MplsRoute>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Cmd::GetMplsRoutes { filter, resp })
            .map_err(|_| FibError::NotRunning)?;
        rx.await.map_err(|_| TrellisError::from(FibError::NotRunning))
    }

    /// Snapshot of the FIB's counters
    pub fn counters(&self) -> std::collections::BTreeMap<String, i64> {
        self.counters.snapshot()
    }
}

/// Route state mirrored from Decision plus programming bookkeeping
#[derive(Default)]
struct RouteState {
    // unmodified copies of what Decision computed
    unicast: HashMap<IpPrefix, UnicastRoute>,
    mpls: HashMap<i32, MplsRoute>,
    // prefixes/labels whose programmed form was shrunk on link failure
    dirty_prefixes: HashSet<IpPrefix>,
    dirty_labels: HashSet<i32>,
    // a failed agent operation leaves the device state unknown
    dirty_route_db: bool,
    has_routes_from_decision: bool,
}

/// The FIB programmer; construct then [`Fib::spawn`]
pub struct Fib {
    config: Arc<Config>,
    agent: Arc<dyn FibAgent>,
    kvstore_client: Option<KvStoreClient>,
    counters: Counters,
}

impl Fib {
    /// Build the programmer; `kvstore_client` enables ordered-FIB
    /// programming-time reports
    pub fn new(
        config: Arc<Config>,
        agent: Arc<dyn FibAgent>,
        kvstore_client: Option<KvStoreClient>,
    ) -> Self {
        Self {
            config,
            agent,
            kvstore_client,
            counters: Counters::new(),
        }
    }

    /// Spawn the task consuming route deltas and interface updates
    pub fn spawn(
        self,
        route_updates: RQueue<RouteDatabaseDelta>,
        interface_updates: RQueue<InterfaceDatabase>,
    ) -> FibHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = FibHandle {
            tx,
            counters: self.counters.clone(),
        };
        let backoff = ExponentialBackoff::new(
            self.config.fib_sync_initial_backoff,
            self.config.fib_sync_max_backoff,
        );
        let actor = Actor {
            config: self.config,
            agent: self.agent,
            kvstore_client: self.kvstore_client,
            counters: self.counters,
            state: RouteState::default(),
            interface_status: HashMap::new(),
            latest_alive_since: None,
            backoff,
        };
        tokio::spawn(actor.run(route_updates, interface_updates, rx));
        handle
    }
}

struct Actor {
    config: Arc<Config>,
    agent: Arc<dyn FibAgent>,
    kvstore_client: Option<KvStoreClient>,
    counters: Counters,
    state: RouteState,
    interface_status: HashMap<String, bool>,
    latest_alive_since: Option<i64>,
    backoff: ExponentialBackoff,
}

impl Actor {
    async fn run(
        mut self,
        mut route_updates: RQueue<RouteDatabaseDelta>,
        mut interface_updates: RQueue<InterfaceDatabase>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        let cold_start_until =
            tokio::time::Instant::now() + self.config.fib_cold_start_duration;
        let mut keepalive = tokio::time::interval(self.config.fib_keep_alive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sync_deadline: Option<tokio::time::Instant> = None;

        loop {
            let sync_sleep = sync_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                delta = route_updates.recv() => {
                    match delta {
                        Err(_) => {
                            info!("route stream closed; fib shutting down");
                            return;
                        }
                        Ok(delta) => {
                            let needs_sync = self.process_route_update(delta).await;
                            if needs_sync {
                                let when = self.next_sync_instant(cold_start_until);
                                sync_deadline = Some(match sync_deadline {
                                    Some(existing) => existing.min(when),
                                    None => when,
                                });
                            }
                        }
                    }
                }
                update = interface_updates.recv() => {
                    match update {
                        Err(_) => {
                            info!("interface stream closed; fib shutting down");
                            return;
                        }
                        Ok(update) => {
                            if self.process_interface_db(update).await {
                                let when = self.next_sync_instant(cold_start_until);
                                sync_deadline = Some(match sync_deadline {
                                    Some(existing) => existing.min(when),
                                    None => when,
                                });
                            }
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => return,
                        Some(cmd) => self.handle_cmd(cmd),
                    }
                }
                _ = keepalive.tick() => {
                    if self.keep_alive_check().await {
                        let when = self.next_sync_instant(cold_start_until);
                        sync_deadline = Some(match sync_deadline {
                            Some(existing) => existing.min(when),
                            None => when,
                        });
                    }
                }
                _ = tokio::time::sleep_until(sync_sleep), if sync_deadline.is_some() => {
                    sync_deadline = None;
                    if !self.sync_route_db().await {
                        // failed again; back off and retry
                        sync_deadline = Some(
                            tokio::time::Instant::now() + self.backoff.current_backoff(),
                        );
                    }
                }
            }
        }
    }

    fn next_sync_instant(&self, cold_start_until: tokio::time::Instant) -> tokio::time::Instant {
        let wait = self.backoff.time_remaining_until_retry();
        (tokio::time::Instant::now() + wait).max(cold_start_until)
    }

    /// Apply a delta; returns true when a full resync became necessary
    async fn process_route_update(&mut self, delta: RouteDatabaseDelta) -> bool {
        self.counters.incr("fib.route_updates");
        // keep the canonical copy current regardless of programming
        for route in &delta.unicast_routes_to_update {
            if let Some(dest) = route.dest.clone() {
                self.state.dirty_prefixes.remove(&dest);
                self.state.unicast.insert(dest, route.clone());
            }
        }
        for dest in &delta.unicast_routes_to_delete {
            self.state.unicast.remove(dest);
            self.state.dirty_prefixes.remove(dest);
        }
        for route in &delta.mpls_routes_to_update {
            self.state.dirty_labels.remove(&route.top_label);
            self.state.mpls.insert(route.top_label, route.clone());
        }
        for label in &delta.mpls_routes_to_delete {
            self.state.mpls.remove(label);
            self.state.dirty_labels.remove(label);
        }
        let first_routes = !self.state.has_routes_from_decision;
        self.state.has_routes_from_decision = true;

        if first_routes || self.state.dirty_route_db {
            // everything goes out in one full sync
            return true;
        }
        if self.config.dryrun {
            return false;
        }

        let started = std::time::Instant::now();
        let result = self.apply_incremental(&delta).await;
        match result {
            Ok(()) => {
                self.counters.incr("fib.incremental_applies");
                self.report_programming_time(started.elapsed()).await;
                false
            }
            Err(e) => {
                warn!("incremental route programming failed: {}", e);
                self.counters.incr("fib.agent_failures");
                self.state.dirty_route_db = true;
                self.backoff.report_error();
                true
            }
        }
    }

    async fn apply_incremental(&self, delta: &RouteDatabaseDelta) -> Result<()> {
        if !delta.unicast_routes_to_update.is_empty() {
            self.agent
                .add_unicast_routes(FIB_CLIENT_ID, delta.unicast_routes_to_update.clone())
                .await?;
        }
        if !delta.unicast_routes_to_delete.is_empty() {
            self.agent
                .delete_unicast_routes(FIB_CLIENT_ID, delta.unicast_routes_to_delete.clone())
                .await?;
        }
        if self.config.enable_segment_routing {
            if !delta.mpls_routes_to_update.is_empty() {
                self.agent
                    .add_mpls_routes(FIB_CLIENT_ID, delta.mpls_routes_to_update.clone())
                    .await?;
            }
            if !delta.mpls_routes_to_delete.is_empty() {
                self.agent
                    .delete_mpls_routes(FIB_CLIENT_ID, delta.mpls_routes_to_delete.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Interface transitions prune or shrink routes; true schedules a
    /// resync (to restore shrunk routes after recovery)
    async fn process_interface_db(&mut self, update: InterfaceDatabase) -> bool {
        let mut went_down: Vec<String> = Vec::new();
        let mut came_up: Vec<String> = Vec::new();
        for (if_name, info) in &update.interfaces {
            let previous = self.interface_status.insert(if_name.clone(), info.is_up);
            match (previous, info.is_up) {
                (Some(true), false) | (None, false) => went_down.push(if_name.clone()),
                (Some(false), true) => came_up.push(if_name.clone()),
                _ => {}
            }
        }
        // interfaces absent from the update no longer exist
        let known: HashSet<&String> = update.interfaces.keys().collect();
        let gone: Vec<String> = self
            .interface_status
            .keys()
            .filter(|name| !known.contains(name))
            .cloned()
            .collect();
        for name in gone {
            self.interface_status.remove(&name);
            went_down.push(name);
        }

        let mut needs_sync = false;
        if !went_down.is_empty() {
            self.handle_interfaces_down(&went_down).await;
        }
        if !came_up.is_empty() {
            // shrunk routes can be restored now
            let restorable = !self.state.dirty_prefixes.is_empty()
                || !self.state.dirty_labels.is_empty();
            if restorable {
                debug!("interfaces {:?} recovered; scheduling resync", came_up);
                needs_sync = true;
            }
        }
        needs_sync
    }

    async fn handle_interfaces_down(&mut self, down: &[String]) {
        let is_dead = |hop: &NextHop| {
            hop.address
                .as_ref()
                .and_then(|a| a.if_name.as_ref())
                .map(|name| down.contains(name))
                .unwrap_or(false)
        };

        let mut to_delete: Vec<IpPrefix> = Vec::new();
        let mut to_shrink: Vec<UnicastRoute> = Vec::new();
        for (dest, route) in &self.state.unicast {
            let survivors: Vec<NextHop> = route
                .next_hops
                .iter()
                .filter(|hop| !is_dead(hop))
                .cloned()
                .collect();
            if survivors.len() == route.next_hops.len() {
                continue;
            }
            if survivors.is_empty() {
                to_delete.push(dest.clone());
            } else {
                to_shrink.push(UnicastRoute {
                    dest: Some(dest.clone()),
                    next_hops: survivors,
                });
            }
        }
        let mut label_deletes: Vec<i32> = Vec::new();
        let mut label_shrinks: Vec<MplsRoute> = Vec::new();
        for (label, route) in &self.state.mpls {
            let survivors: Vec<NextHop> = route
                .next_hops
                .iter()
                .filter(|hop| !is_dead(hop))
                .cloned()
                .collect();
            if survivors.len() == route.next_hops.len() {
                continue;
            }
            if survivors.is_empty() {
                label_deletes.push(*label);
            } else {
                label_shrinks.push(MplsRoute {
                    top_label: *label,
                    next_hops: survivors,
                });
            }
        }

        if to_delete.is_empty()
            && to_shrink.is_empty()
            && label_deletes.is_empty()
            && label_shrinks.is_empty()
        {
            return;
        }
        info!(
            "interfaces {:?} down: removing {} routes, shrinking {}",
            down,
            to_delete.len() + label_deletes.len(),
            to_shrink.len() + label_shrinks.len()
        );

        // canonical copies stay intact; the dirty sets mark what the
        // device now diverges on, to be restored by the next sync
        for dest in &to_delete {
            self.state.unicast.remove(dest);
        }
        for route in &to_shrink {
            if let Some(dest) = &route.dest {
                self.state.dirty_prefixes.insert(dest.clone());
            }
        }
        for label in &label_deletes {
            self.state.mpls.remove(label);
        }
        for route in &label_shrinks {
            self.state.dirty_labels.insert(route.top_label);
        }

        if self.config.dryrun {
            return;
        }
        let result: Result<()> = async {
            if !to_delete.is_empty() {
                self.agent
                    .delete_unicast_routes(FIB_CLIENT_ID, to_delete.clone())
                    .await?;
            }
            if !to_shrink.is_empty() {
                self.agent
                    .add_unicast_routes(FIB_CLIENT_ID, to_shrink.clone())
                    .await?;
            }
            if self.config.enable_segment_routing {
                if !label_deletes.is_empty() {
                    self.agent
                        .delete_mpls_routes(FIB_CLIENT_ID, label_deletes.clone())
                        .await?;
                }
                if !label_shrinks.is_empty() {
                    self.agent
                        .add_mpls_routes(FIB_CLIENT_ID, label_shrinks.clone())
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("pruning after interface-down failed: {}", e);
            self.counters.incr("fib.agent_failures");
            self.state.dirty_route_db = true;
            self.backoff.report_error();
        }
    }

    /// Poll the agent epoch; true when a restart demands a resync
    async fn keep_alive_check(&mut self) -> bool {
        if self.config.dryrun {
            return false;
        }
        let epoch = match self.agent.alive_since().await {
            Ok(epoch) => epoch,
            Err(e) => {
                debug!("aliveSince poll failed: {}", e);
                return false;
            }
        };
        match self.latest_alive_since.replace(epoch) {
            Some(previous) if previous != epoch => {
                info!(
                    "agent restarted (aliveSince {} -> {}); forcing full sync",
                    previous, epoch
                );
                self.counters.incr("fib.agent_restarts");
                self.state.dirty_route_db = true;
                true
            }
            _ => false,
        }
    }

    /// Full resync of the canonical state; true on success
    async fn sync_route_db(&mut self) -> bool {
        if !self.state.has_routes_from_decision {
            return true;
        }
        let started = std::time::Instant::now();
        if !self.config.dryrun {
            let routes: Vec<UnicastRoute> = self.state.unicast.values().cloned().collect();
            if let Err(e) = self.agent.sync_fib(FIB_CLIENT_ID, routes).await {
                warn!("full fib sync failed: {}", e);
                self.counters.incr("fib.sync_failures");
                self.backoff.report_error();
                return false;
            }
            if self.config.enable_segment_routing {
                let routes: Vec<MplsRoute> = self.state.mpls.values().cloned().collect();
                if let Err(e) = self.agent.sync_mpls_fib(FIB_CLIENT_ID, routes).await {
                    warn!("full mpls sync failed: {}", e);
                    self.counters.incr("fib.sync_failures");
                    self.backoff.report_error();
                    return false;
                }
            }
        }
        info!(
            "fib synced: {} unicast, {} mpls routes",
            self.state.unicast.len(),
            self.state.mpls.len()
        );
        self.counters.incr("fib.syncs");
        self.state.dirty_route_db = false;
        self.state.dirty_prefixes.clear();
        self.state.dirty_labels.clear();
        self.backoff.report_success();
        self.report_programming_time(started.elapsed()).await;
        true
    }

    async fn report_programming_time(&self, elapsed: Duration) {
        if !self.config.enable_ordered_fib {
            return;
        }
        let client = match &self.kvstore_client {
            Some(client) => client,
            None => return,
        };
        let report = FibProgrammingTime {
            node_name: self.config.node_name.clone(),
            duration_ms: elapsed.as_millis().max(1) as i64,
        };
        let key = format!("{}{}", FIB_TIME_MARKER, self.config.node_name);
        let area = self
            .config
            .areas
            .first()
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_AREA.to_string());
        match serialize_message(&report) {
            Ok(bytes) => {
                if let Err(e) = client
                    .persist_key(area, key, bytes, self.config.key_ttl_ms())
                    .await
                {
                    debug!("failed to publish programming time: {}", e);
                }
            }
            Err(e) => debug!("failed to serialize programming time: {}", e),
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::GetRouteDb { resp } => {
                let db = RouteDatabase {
                    this_node_name: self.config.node_name.clone(),
                    unicast_routes: self.state.unicast.values().cloned().collect(),
                    mpls_routes: self.state.mpls.values().cloned().collect(),
                    perf_events: None,
                };
                let _ = resp.send(db);
            }
            Cmd::GetUnicastRoutes { filter, resp } => {
                let routes = if filter.is_empty() {
                    self.state.unicast.values().cloned().collect()
                } else {
                    let wanted: HashSet<String> = filter.into_iter().collect();
                    self.state
                        .unicast
                        .iter()
                        .filter(|(dest, _)| wanted.contains(&dest.to_string()))
                        .map(|(_, route)| route.clone())
                        .collect()
                };
                let _ = resp.send(routes);
            }
            Cmd::GetMplsRoutes { filter, resp } => {
                let routes = if filter.is_empty() {
                    self.state.mpls.values().cloned().collect()
                } else {
                    let wanted: HashSet<i32> = filter.into_iter().collect();
                    self.state
                        .mpls
                        .iter()
                        .filter(|(label, _)| wanted.contains(label))
                        .map(|(_, route)| route.clone())
                        .collect()
                };
                let _ = resp.send(routes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ReplicateQueue;
    use crate::protocol::net::parse_prefix;
    use crate::protocol::{BinaryAddress, InterfaceInfo};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            node_name: "n1".to_string(),
            fib_keep_alive_interval: Duration::from_millis(50),
            fib_sync_initial_backoff: Duration::from_millis(20),
            fib_sync_max_backoff: Duration::from_millis(100),
            ..Default::default()
        })
    }

    fn next_hop(if_name: &str, host: u16) -> NextHop {
        NextHop {
            address: Some(BinaryAddress {
                addr: std::net::Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, host)
                    .octets()
                    .to_vec(),
                if_name: Some(if_name.to_string()),
            }),
            metric: 1,
            mpls_action: None,
        }
    }

    fn route(prefix: &str, hops: Vec<NextHop>) -> UnicastRoute {
        UnicastRoute {
            dest: Some(parse_prefix(prefix).unwrap()),
            next_hops: hops,
        }
    }

    fn delta_with(routes: Vec<UnicastRoute>) -> RouteDatabaseDelta {
        RouteDatabaseDelta {
            unicast_routes_to_update: routes,
            ..Default::default()
        }
    }

    fn iface_db(states: &[(&str, bool)]) -> InterfaceDatabase {
        InterfaceDatabase {
            this_node_name: "n1".to_string(),
            interfaces: states
                .iter()
                .map(|(name, is_up)| {
                    (
                        name.to_string(),
                        InterfaceInfo {
                            if_name: name.to_string(),
                            is_up: *is_up,
                            if_index: 1,
                            weight: 1,
                            networks: vec![],
                        },
                    )
                })
                .collect(),
        }
    }

    struct Setup {
        agent: Arc<MockFibAgent>,
        routes: ReplicateQueue<RouteDatabaseDelta>,
        ifaces: ReplicateQueue<InterfaceDatabase>,
        handle: FibHandle,
    }

    fn setup_with(config: Arc<Config>) -> Setup {
        let agent = Arc::new(MockFibAgent::new());
        let routes = ReplicateQueue::new();
        let ifaces = ReplicateQueue::new();
        let handle = Fib::new(config, Arc::clone(&agent) as Arc<dyn FibAgent>, None)
            .spawn(routes.get_reader(), ifaces.get_reader());
        Setup {
            agent,
            routes,
            ifaces,
            handle,
        }
    }

    async fn await_agent_routes(agent: &MockFibAgent, count: usize, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if agent.unicast_routes().len() == count {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "agent never reached {} routes (has {})",
                count,
                agent.unicast_routes().len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_first_delta_triggers_full_sync() {
        let setup = setup_with(test_config());
        setup
            .routes
            .push(delta_with(vec![route("2001:db8::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        await_agent_routes(&setup.agent, 1, Duration::from_secs(2)).await;
        assert!(setup.agent.sync_count() >= 1);
    }

    #[tokio::test]
    async fn test_incremental_after_first_sync() {
        let setup = setup_with(test_config());
        setup
            .routes
            .push(delta_with(vec![route("2001:db8:1::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        await_agent_routes(&setup.agent, 1, Duration::from_secs(2)).await;
        let syncs = setup.agent.sync_count();

        setup
            .routes
            .push(delta_with(vec![route("2001:db8:2::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        await_agent_routes(&setup.agent, 2, Duration::from_secs(2)).await;
        // the second route went in incrementally
        assert_eq!(setup.agent.sync_count(), syncs);
    }

    #[tokio::test]
    async fn test_agent_restart_forces_resync() {
        let setup = setup_with(test_config());
        setup
            .routes
            .push(delta_with(vec![route("2001:db8::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        await_agent_routes(&setup.agent, 1, Duration::from_secs(2)).await;

        // restart wipes the agent table; aliveSince changes
        setup.agent.restart();
        assert_eq!(setup.agent.unicast_routes().len(), 0);

        // without any new Decision delta, the route comes back
        await_agent_routes(&setup.agent, 1, Duration::from_secs(3)).await;
    }

    #[tokio::test]
    async fn test_failure_marks_dirty_then_resyncs() {
        let setup = setup_with(test_config());
        setup
            .routes
            .push(delta_with(vec![route("2001:db8:1::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        await_agent_routes(&setup.agent, 1, Duration::from_secs(2)).await;

        setup.agent.set_failing(true);
        setup
            .routes
            .push(delta_with(vec![route("2001:db8:2::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        setup.agent.set_failing(false);

        // the resync restores the full set
        await_agent_routes(&setup.agent, 2, Duration::from_secs(3)).await;
    }

    #[tokio::test]
    async fn test_interface_down_prunes_and_shrinks() {
        let setup = setup_with(test_config());
        setup.ifaces.push(iface_db(&[("ethA", true), ("ethB", true)])).unwrap();
        setup
            .routes
            .push(delta_with(vec![
                // only via ethA: removed when ethA dies
                route("2001:db8:a::/64", vec![next_hop("ethA", 2)]),
                // via both: shrunk to ethB
                route("2001:db8:b::/64", vec![next_hop("ethA", 2), next_hop("ethB", 3)]),
            ]))
            .unwrap();
        await_agent_routes(&setup.agent, 2, Duration::from_secs(2)).await;

        setup.ifaces.push(iface_db(&[("ethA", false), ("ethB", true)])).unwrap();
        await_agent_routes(&setup.agent, 1, Duration::from_secs(2)).await;
        let programmed = setup.agent.unicast_routes();
        let survivor = programmed
            .get(&parse_prefix("2001:db8:b::/64").unwrap())
            .expect("shrunk route missing");
        assert_eq!(survivor.next_hops.len(), 1);
        assert_eq!(
            survivor.next_hops[0]
                .address
                .as_ref()
                .unwrap()
                .if_name
                .as_deref(),
            Some("ethB")
        );
    }

    #[tokio::test]
    async fn test_dryrun_programs_nothing() {
        let config = Arc::new(Config {
            dryrun: true,
            ..(*test_config()).clone()
        });
        let setup = setup_with(config);
        setup
            .routes
            .push(delta_with(vec![route("2001:db8::/64", vec![next_hop("eth0", 2)])]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // state tracked, agent untouched (keepalive is also disabled)
        assert_eq!(setup.agent.op_count(), 0);
        let db = setup.handle.get_route_db().await.unwrap();
        assert_eq!(db.unicast_routes.len(), 1);
    }

    #[tokio::test]
    async fn test_route_queries() {
        let setup = setup_with(test_config());
        setup
            .routes
            .push(delta_with(vec![
                route("2001:db8:1::/64", vec![next_hop("eth0", 2)]),
                route("2001:db8:2::/64", vec![next_hop("eth0", 2)]),
            ]))
            .unwrap();
        await_agent_routes(&setup.agent, 2, Duration::from_secs(2)).await;

        let all = setup.handle.get_unicast_routes(vec![]).await.unwrap();
        assert_eq!(all.len(), 2);
        let one = setup
            .handle
            .get_unicast_routes(vec!["2001:db8:1::/64".to_string()])
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut unicast = HashMap::new();
        for prefix in ["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24"] {
            unicast.insert(
                parse_prefix(prefix).unwrap(),
                UnicastRoute {
                    dest: Some(parse_prefix(prefix).unwrap()),
                    next_hops: vec![],
                },
            );
        }
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(
            longest_prefix_match(&addr, &unicast).unwrap().to_string(),
            "10.1.2.0/24"
        );
        let addr: IpAddr = "10.1.9.9".parse().unwrap();
        assert_eq!(
            longest_prefix_match(&addr, &unicast).unwrap().to_string(),
            "10.1.0.0/16"
        );
        let addr: IpAddr = "192.168.0.1".parse().unwrap();
        assert!(longest_prefix_match(&addr, &unicast).is_none());
    }
}
