//! Spark — neighbor discovery
//!
//! For every monitored interface Spark multicasts hellos, walks each
//! (interface, neighbor) pair through the negotiation state machine, and
//! publishes Up/Down/Restarting/Restarted/RttChange events to a single
//! replicate queue consumed by the link monitor. Sockets sit behind
//! [`SparkIoProvider`]; timers are driven by one coarse tick so the whole
//! protocol stays on the Spark task.

pub mod io;
mod neighbor;

pub use io::{SparkDatagram, SparkIoProvider, TestIoHub, TestIoProvider, UdpIoProvider};
pub use neighbor::{next_state, SparkNeighbor, SparkNeighborState};
pub use neighbor::SparkNeighborEvent as SparkFsmEvent;

use crate::config::{Config, SR_LOCAL_RANGE, TRELLIS_SUPPORTED_VERSION, TRELLIS_VERSION};
use crate::error::{Result, SparkError, TrellisError};
use crate::kvstore::TokenBucket;
use crate::messaging::{RQueue, ReplicateQueue};
use crate::protocol::{
    deserialize_message, serialize_message, BinaryAddress, InterfaceDatabase, ReflectedNeighborInfo,
    SparkHandshakeMsg, SparkHelloMsg, SparkHeartbeatMsg, SparkPacket,
};
use crate::utils::Counters;
use io::now_us;
use neighbor::SparkNeighborEvent as FsmEvent;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Packets per second tolerated from one (interface, source) pair
const MAX_ALLOWED_PPS: f64 = 50.0;

/// Kind of neighbor event published to the link monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparkNeighborEventType {
    /// Adjacency established
    Up,
    /// Adjacency lost
    Down,
    /// Peer announced a graceful restart
    Restarting,
    /// Peer finished its graceful restart
    Restarted,
    /// Measured RTT shifted beyond the jitter threshold
    RttChange,
}

/// What Spark knows about an adjacent neighbor
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    /// Neighbor node name
    pub node_name: String,
    /// Neighbor's interface on the far end
    pub remote_if_name: String,
    /// Neighbor's IPv6 link-local transport address
    pub transport_address_v6: Option<IpAddr>,
    /// Neighbor's IPv4 transport address
    pub transport_address_v4: Option<IpAddr>,
    /// Neighbor's KvStore listener port
    pub kvstore_port: u16,
    /// Neighbor's control-plane port
    pub ctrl_port: u16,
    /// Area the adjacency forms in
    pub area: String,
    /// Neighbor's graceful-restart hold time
    pub gr_hold_time: Duration,
    /// Neighbor participates in the flood-optimization overlay
    pub supports_flood_optimization: bool,
    /// SR adjacency label toward this neighbor
    pub label: i32,
}

/// One neighbor event
#[derive(Debug, Clone)]
pub struct SparkNeighborEvent {
    /// What happened
    pub event_type: SparkNeighborEventType,
    /// Local interface the adjacency lives on
    pub if_name: String,
    /// Neighbor details
    pub info: NeighborInfo,
    /// Smoothed RTT in microseconds
    pub rtt_us: i64,
}

enum SparkCmd {
    GetNeighborState {
        if_name: String,
        node_name: String,
        resp: oneshot::Sender<Option<SparkNeighborState>>,
    },
    GracefulShutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to the Spark task
#[derive(Clone)]
pub struct SparkHandle {
    tx: mpsc::UnboundedSender<SparkCmd>,
    events: ReplicateQueue<SparkNeighborEvent>,
    counters: Counters,
}

impl SparkHandle {
    /// Current FSM state for (interface, neighbor); used by tests and the
    /// control surface
    pub async fn get_neighbor_state(
        &self,
        if_name: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Result<Option<SparkNeighborState>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(SparkCmd::GetNeighborState {
                if_name: if_name.into(),
                node_name: node_name.into(),
                resp,
            })
            .map_err(|_| SparkError::UnknownInterface {
                if_name: "spark stopped".to_string(),
            })?;
        rx.await.map_err(|_| {
            TrellisError::from(SparkError::UnknownInterface {
                if_name: "spark stopped".to_string(),
            })
        })
    }

    /// Announce a graceful restart on every interface, then return
    pub async fn graceful_shutdown(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(SparkCmd::GracefulShutdown { resp }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Open a reader on the neighbor-event stream
    pub fn event_reader(&self) -> RQueue<SparkNeighborEvent> {
        self.events.get_reader()
    }

    /// Snapshot of Spark's counters
    pub fn counters(&self) -> std::collections::BTreeMap<String, i64> {
        self.counters.snapshot()
    }
}

struct IfState {
    if_index: i32,
    v6_ll_addr: Option<IpAddr>,
    v4_addr: Option<IpAddr>,
    v4_net: Option<ipnet::IpNet>,
    next_hello: Instant,
    next_heartbeat: Instant,
    fast_init_until: Instant,
}

/// The discovery engine; construct with [`Spark::new`], then
/// [`Spark::spawn`]
pub struct Spark {
    config: Arc<Config>,
    io: Arc<dyn SparkIoProvider>,
    events: ReplicateQueue<SparkNeighborEvent>,
    counters: Counters,
}

impl Spark {
    /// Build Spark over an I/O provider
    pub fn new(config: Arc<Config>, io: Arc<dyn SparkIoProvider>) -> Self {
        Self {
            config,
            io,
            events: ReplicateQueue::new(),
            counters: Counters::new(),
        }
    }

    /// Spawn the Spark task consuming `interface_updates`
    pub fn spawn(self, interface_updates: RQueue<InterfaceDatabase>) -> SparkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SparkHandle {
            tx,
            events: self.events.clone(),
            counters: self.counters.clone(),
        };
        let actor = SparkActor {
            config: self.config,
            io: self.io,
            events: self.events,
            counters: self.counters,
            interfaces: HashMap::new(),
            neighbors: HashMap::new(),
            handshake_due: HashMap::new(),
            pps: HashMap::new(),
            seq_num: 0,
        };
        tokio::spawn(actor.run(interface_updates, rx));
        handle
    }
}

struct SparkActor {
    config: Arc<Config>,
    io: Arc<dyn SparkIoProvider>,
    events: ReplicateQueue<SparkNeighborEvent>,
    counters: Counters,
    interfaces: HashMap<String, IfState>,
    neighbors: HashMap<String, HashMap<String, SparkNeighbor>>,
    // (if_name, node) -> next handshake retransmit
    handshake_due: HashMap<(String, String), Instant>,
    pps: HashMap<(String, IpAddr), TokenBucket>,
    seq_num: u64,
}

impl SparkActor {
    async fn run(
        mut self,
        mut interface_updates: RQueue<InterfaceDatabase>,
        mut cmd_rx: mpsc::UnboundedReceiver<SparkCmd>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let io = Arc::clone(&self.io);
            tokio::select! {
                update = interface_updates.recv() => {
                    match update {
                        Err(_) => {
                            info!("interface stream closed; spark shutting down");
                            self.events.close();
                            return;
                        }
                        Ok(db) => self.process_interface_updates(db).await,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.events.close();
                            return;
                        }
                        Some(SparkCmd::GetNeighborState { if_name, node_name, resp }) => {
                            let state = self
                                .neighbors
                                .get(&if_name)
                                .and_then(|m| m.get(&node_name))
                                .map(|n| n.state);
                            let _ = resp.send(state);
                        }
                        Some(SparkCmd::GracefulShutdown { resp }) => {
                            self.send_restarting_hellos().await;
                            let _ = resp.send(());
                        }
                    }
                }
                datagram = io.recv() => {
                    match datagram {
                        Err(e) => {
                            warn!("spark io receive failed: {}", e);
                            self.events.close();
                            return;
                        }
                        Ok(datagram) => self.process_datagram(datagram).await,
                    }
                }
                _ = tick.tick() => {
                    self.run_timers().await;
                }
            }
        }
    }

    async fn process_interface_updates(&mut self, db: InterfaceDatabase) {
        let incoming: HashSet<String> = db
            .interfaces
            .iter()
            .filter(|(_, info)| info.is_up)
            .map(|(name, _)| name.clone())
            .collect();
        let current: HashSet<String> = self.interfaces.keys().cloned().collect();

        for if_name in current.difference(&incoming) {
            info!("spark: interface {} removed", if_name);
            if let Err(e) = self.io.remove_interface(if_name).await {
                warn!("failed to leave {}: {}", if_name, e);
            }
            if let Some(neighbors) = self.neighbors.remove(if_name) {
                for (_, neighbor) in neighbors {
                    if neighbor.state == SparkNeighborState::Established {
                        self.emit(SparkNeighborEventType::Down, if_name, &neighbor);
                    }
                }
            }
            self.interfaces.remove(if_name);
            self.handshake_due.retain(|(iface, _), _| iface != if_name);
        }

        let now = Instant::now();
        for (if_name, info) in &db.interfaces {
            if !info.is_up {
                continue;
            }
            let (v6_ll_addr, v4_addr, v4_net) = extract_addrs(info);
            match self.interfaces.get_mut(if_name) {
                Some(state) => {
                    state.if_index = info.if_index;
                    state.v6_ll_addr = v6_ll_addr;
                    state.v4_addr = v4_addr;
                    state.v4_net = v4_net;
                }
                None => {
                    info!("spark: interface {} up (ifindex {})", if_name, info.if_index);
                    if let Err(e) = self.io.add_interface(if_name, info.if_index).await {
                        warn!("failed to join {}: {}", if_name, e);
                        continue;
                    }
                    self.interfaces.insert(
                        if_name.clone(),
                        IfState {
                            if_index: info.if_index,
                            v6_ll_addr,
                            v4_addr,
                            v4_net,
                            next_hello: now,
                            next_heartbeat: now + self.config.spark_heartbeat_time,
                            fast_init_until: now + self.config.spark_heartbeat_hold_time,
                        },
                    );
                }
            }
        }
    }

    async fn run_timers(&mut self) {
        let now = Instant::now();

        // hellos (fast-init pace while fresh)
        let due_hellos: Vec<String> = self
            .interfaces
            .iter()
            .filter(|(_, state)| now >= state.next_hello)
            .map(|(name, _)| name.clone())
            .collect();
        for if_name in due_hellos {
            self.send_hello(&if_name, false).await;
            if let Some(state) = self.interfaces.get_mut(&if_name) {
                let interval = if now < state.fast_init_until {
                    self.config.spark_fast_init_hello_time
                } else {
                    self.config.spark_hello_time
                };
                state.next_hello = now + interval;
            }
        }

        // heartbeats on interfaces carrying an established adjacency
        let due_heartbeats: Vec<String> = self
            .interfaces
            .iter()
            .filter(|(name, state)| {
                now >= state.next_heartbeat
                    && self
                        .neighbors
                        .get(name.as_str())
                        .map(|m| {
                            m.values()
                                .any(|n| n.state == SparkNeighborState::Established)
                        })
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for if_name in due_heartbeats {
            self.send_heartbeat(&if_name).await;
            if let Some(state) = self.interfaces.get_mut(&if_name) {
                state.next_heartbeat = now + self.config.spark_heartbeat_time;
            }
        }

        // handshake retransmits while negotiating
        let due_handshakes: Vec<(String, String)> = self
            .handshake_due
            .iter()
            .filter(|(_, due)| now >= **due)
            .map(|(key, _)| key.clone())
            .collect();
        for (if_name, node_name) in due_handshakes {
            let negotiating = self
                .neighbors
                .get(&if_name)
                .and_then(|m| m.get(&node_name))
                .map(|n| n.state == SparkNeighborState::Negotiate)
                .unwrap_or(false);
            if negotiating {
                self.send_handshake(&if_name, &node_name, false).await;
                self.handshake_due.insert(
                    (if_name, node_name),
                    now + self.config.spark_handshake_time,
                );
            } else {
                self.handshake_due.remove(&(if_name, node_name));
            }
        }

        // neighbor deadlines
        let mut expirations: Vec<(String, String, FsmEvent)> = Vec::new();
        for (if_name, neighbors) in &self.neighbors {
            for (node_name, neighbor) in neighbors {
                if let Some(deadline) = neighbor.negotiate_deadline {
                    if now >= deadline && neighbor.state == SparkNeighborState::Negotiate {
                        expirations.push((
                            if_name.clone(),
                            node_name.clone(),
                            FsmEvent::NegotiateTimerExpire,
                        ));
                        continue;
                    }
                }
                if let Some(deadline) = neighbor.heartbeat_deadline {
                    if now >= deadline && neighbor.state == SparkNeighborState::Established {
                        expirations.push((
                            if_name.clone(),
                            node_name.clone(),
                            FsmEvent::HeartbeatTimerExpire,
                        ));
                        continue;
                    }
                }
                if let Some(deadline) = neighbor.gr_deadline {
                    if now >= deadline && neighbor.state == SparkNeighborState::Restart {
                        expirations.push((
                            if_name.clone(),
                            node_name.clone(),
                            FsmEvent::GrTimerExpire,
                        ));
                    }
                }
            }
        }
        for (if_name, node_name, event) in expirations {
            self.apply_fsm_event(&if_name, &node_name, event).await;
        }
    }

    async fn process_datagram(&mut self, datagram: SparkDatagram) {
        // per-(interface, source) packet-rate guard
        let bucket = self
            .pps
            .entry((datagram.if_name.clone(), datagram.src))
            .or_insert_with(|| TokenBucket::new(MAX_ALLOWED_PPS, MAX_ALLOWED_PPS as usize));
        if !bucket.consume() {
            self.counters.incr("spark.pps_dropped");
            return;
        }

        let packet: SparkPacket = match deserialize_message(&datagram.payload) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.incr("spark.invalid_packets");
                return;
            }
        };
        if !self.interfaces.contains_key(&datagram.if_name) {
            return;
        }
        if let Some(hello) = packet.hello {
            self.process_hello(&datagram.if_name, hello, datagram.recv_ts_us)
                .await;
        }
        if let Some(heartbeat) = packet.heartbeat {
            self.process_heartbeat(&datagram.if_name, heartbeat).await;
        }
        if let Some(handshake) = packet.handshake {
            self.process_handshake(&datagram.if_name, handshake).await;
        }
    }

    async fn process_hello(&mut self, if_name: &str, hello: SparkHelloMsg, recv_ts_us: i64) {
        self.counters.incr("spark.hello_received");
        // validation chain; first failure rejects
        if hello.node_name == self.config.node_name {
            self.counters.incr("spark.skipped_looped_self");
            return;
        }
        if hello.domain_name != self.config.domain {
            self.counters.incr("spark.domain_mismatch");
            debug!(
                "dropping hello from {}: domain {} != {}",
                hello.node_name, hello.domain_name, self.config.domain
            );
            return;
        }
        if hello.version < TRELLIS_SUPPORTED_VERSION {
            self.counters.incr("spark.version_mismatch");
            return;
        }

        let if_index = match self.interfaces.get(if_name) {
            Some(state) => state.if_index,
            None => return,
        };

        let node_name = hello.node_name.clone();
        let my_node_name = self.config.node_name.clone();
        let (event, established_refresh, rtt_changed) = {
            let neighbors = self.neighbors.entry(if_name.to_string()).or_default();
            let neighbor = neighbors.entry(node_name.clone()).or_insert_with(|| {
                debug!("spark: new neighbor {} on {}", node_name, if_name);
                SparkNeighbor::new(
                    node_name.clone(),
                    hello.domain_name.clone(),
                    hello.if_name.clone(),
                    hello.seq_num,
                    SR_LOCAL_RANGE.0 + if_index,
                )
            });

            // a sequence regression is a restart hint
            let seq_regressed = hello.seq_num < neighbor.seq_num;
            neighbor.seq_num = hello.seq_num;
            neighbor.remote_if_name = hello.if_name.clone();
            neighbor.neighbor_timestamp_us = hello.sent_ts_us;
            neighbor.local_timestamp_us = recv_ts_us;

            // RTT from the reflected timestamps
            let mut rtt_changed = None;
            if let Some(reflected) = hello.neighbor_infos.get(&my_node_name) {
                if reflected.last_nbr_msg_sent_ts_us > 0 && reflected.last_my_msg_rcvd_ts_us > 0 {
                    let rtt = (recv_ts_us - reflected.last_nbr_msg_sent_ts_us)
                        - (hello.sent_ts_us - reflected.last_my_msg_rcvd_ts_us);
                    if rtt > 0 {
                        let since_last = neighbor.since_last_rtt_sample();
                        rtt_changed = neighbor.sample_rtt(rtt, since_last);
                    }
                }
            }

            let heard_us = hello.neighbor_infos.contains_key(&my_node_name);
            let event = if hello.restarting || seq_regressed {
                FsmEvent::HelloRcvdRestart
            } else if heard_us {
                FsmEvent::HelloRcvdInfo
            } else {
                FsmEvent::HelloRcvdNoInfo
            };

            // hellos keep an established adjacency alive
            let established_refresh = neighbor.state == SparkNeighborState::Established
                && event == FsmEvent::HelloRcvdInfo;
            if established_refresh {
                neighbor.arm_heartbeat(Instant::now());
            }
            (event, established_refresh, rtt_changed)
        };

        if established_refresh {
            if let Some(rtt) = rtt_changed {
                if let Some(neighbor) = self
                    .neighbors
                    .get(if_name)
                    .and_then(|m| m.get(&node_name))
                {
                    let mut change =
                        self.make_event(SparkNeighborEventType::RttChange, if_name, neighbor);
                    change.rtt_us = rtt;
                    let _ = self.events.push(change);
                }
            }
        } else {
            self.apply_fsm_event(if_name, &node_name, event).await;
        }
        if hello.solicit_response {
            self.send_hello(if_name, true).await;
        }
    }

    async fn process_heartbeat(&mut self, if_name: &str, heartbeat: SparkHeartbeatMsg) {
        if heartbeat.node_name == self.config.node_name {
            return;
        }
        if let Some(neighbor) = self
            .neighbors
            .get_mut(if_name)
            .and_then(|m| m.get_mut(&heartbeat.node_name))
        {
            if neighbor.state == SparkNeighborState::Established {
                neighbor.arm_heartbeat(Instant::now());
            }
        }
    }

    async fn process_handshake(&mut self, if_name: &str, handshake: SparkHandshakeMsg) {
        if handshake.node_name == self.config.node_name {
            return;
        }
        if !handshake.neighbor_node_name.is_empty()
            && handshake.neighbor_node_name != self.config.node_name
        {
            return;
        }
        // exactly one common area must exist
        if !self.config.areas.contains(&handshake.area) {
            self.counters.incr("spark.invalid_area");
            debug!(
                "dropping handshake from {}: no common area {}",
                handshake.node_name, handshake.area
            );
            return;
        }
        // v4 subnet validation
        if self.config.enable_v4 && self.config.enable_subnet_validation {
            let v4_addr = BinaryAddress {
                addr: handshake.transport_address_v4.clone(),
                if_name: None,
            };
            if let Some(addr) = v4_addr.to_addr() {
                let in_subnet = self
                    .interfaces
                    .get(if_name)
                    .and_then(|state| state.v4_net)
                    .map(|net| net.contains(&addr))
                    .unwrap_or(false);
                if !in_subnet {
                    self.counters.incr("spark.subnet_mismatch");
                    return;
                }
            }
        }

        let node_name = handshake.node_name.clone();
        let solicit_reply = !handshake.is_adj_established;
        {
            let neighbor = match self
                .neighbors
                .get_mut(if_name)
                .and_then(|m| m.get_mut(&node_name))
            {
                Some(neighbor) => neighbor,
                None => return,
            };
            neighbor.transport_address_v6 = BinaryAddress {
                addr: handshake.transport_address_v6.clone(),
                if_name: None,
            }
            .to_addr();
            neighbor.transport_address_v4 = BinaryAddress {
                addr: handshake.transport_address_v4.clone(),
                if_name: None,
            }
            .to_addr();
            neighbor.kvstore_port = handshake.kvstore_port as u16;
            neighbor.ctrl_port = handshake.ctrl_port as u16;
            neighbor.heartbeat_hold_time =
                Duration::from_millis(handshake.hold_time_ms.max(0) as u64);
            neighbor.gr_hold_time =
                Duration::from_millis(handshake.gr_hold_time_ms.max(0) as u64);
            neighbor.area = handshake.area.clone();
        }

        if solicit_reply {
            self.send_handshake(if_name, &node_name, true).await;
        }
        self.apply_fsm_event(if_name, &node_name, FsmEvent::HandshakeRcvd)
            .await;
    }

    /// Drive the FSM and perform the side effects of the transition
    async fn apply_fsm_event(&mut self, if_name: &str, node_name: &str, event: FsmEvent) {
        use SparkNeighborState::*;
        let old_state = match self
            .neighbors
            .get(if_name)
            .and_then(|m| m.get(node_name))
        {
            Some(neighbor) => neighbor.state,
            None => return,
        };
        let new_state = match next_state(old_state, event) {
            Some(state) => state,
            None => {
                debug!(
                    "spark: ignoring {:?} in state {:?} for {} on {}",
                    event, old_state, node_name, if_name
                );
                return;
            }
        };
        if old_state != new_state {
            info!(
                "spark: {} on {}: {:?} -> {:?} ({:?})",
                node_name, if_name, old_state, new_state, event
            );
        }

        let now = Instant::now();
        let negotiate_hold = self.config.spark_negotiate_hold_time;
        {
            let neighbor = match self
                .neighbors
                .get_mut(if_name)
                .and_then(|m| m.get_mut(node_name))
            {
                Some(neighbor) => neighbor,
                None => return,
            };
            neighbor.state = new_state;
            match (old_state, new_state) {
                (Warm, Negotiate) | (Idle, Negotiate) => {
                    neighbor.negotiate_deadline = Some(now + negotiate_hold);
                }
                (Negotiate, Established) | (Restart, Established) => {
                    neighbor.negotiate_deadline = None;
                    neighbor.gr_deadline = None;
                    neighbor.arm_heartbeat(now);
                }
                (Established, Restart) => {
                    neighbor.heartbeat_deadline = None;
                    let hold = if neighbor.gr_hold_time.is_zero() {
                        self.config.spark_gr_hold_time
                    } else {
                        neighbor.gr_hold_time
                    };
                    neighbor.gr_deadline = Some(now + hold);
                }
                (Negotiate, Warm) => {
                    neighbor.negotiate_deadline = None;
                }
                (_, Idle) => {
                    neighbor.clear_deadlines();
                }
                _ => {}
            }
        }

        match (old_state, new_state) {
            (Warm, Negotiate) | (Idle, Negotiate) => {
                self.send_handshake(if_name, node_name, false).await;
                self.handshake_due.insert(
                    (if_name.to_string(), node_name.to_string()),
                    now + self.config.spark_handshake_time,
                );
            }
            (Negotiate, Established) => {
                let neighbor = &self.neighbors[if_name][node_name];
                self.emit(SparkNeighborEventType::Up, if_name, neighbor);
            }
            (Restart, Established) => {
                let neighbor = &self.neighbors[if_name][node_name];
                self.emit(SparkNeighborEventType::Restarted, if_name, neighbor);
            }
            (Established, Restart) => {
                let neighbor = &self.neighbors[if_name][node_name];
                self.emit(SparkNeighborEventType::Restarting, if_name, neighbor);
            }
            (Established, Idle) | (Restart, Idle) => {
                let neighbor = &self.neighbors[if_name][node_name];
                self.emit(SparkNeighborEventType::Down, if_name, neighbor);
                // drop state; hellos will re-discover from scratch
                if let Some(map) = self.neighbors.get_mut(if_name) {
                    map.remove(node_name);
                }
                self.handshake_due
                    .remove(&(if_name.to_string(), node_name.to_string()));
            }
            _ => {}
        }
    }

    fn make_event(
        &self,
        event_type: SparkNeighborEventType,
        if_name: &str,
        neighbor: &SparkNeighbor,
    ) -> SparkNeighborEvent {
        SparkNeighborEvent {
            event_type,
            if_name: if_name.to_string(),
            info: NeighborInfo {
                node_name: neighbor.node_name.clone(),
                remote_if_name: neighbor.remote_if_name.clone(),
                transport_address_v6: neighbor.transport_address_v6,
                transport_address_v4: neighbor.transport_address_v4,
                kvstore_port: neighbor.kvstore_port,
                ctrl_port: neighbor.ctrl_port,
                area: if neighbor.area.is_empty() {
                    crate::config::DEFAULT_AREA.to_string()
                } else {
                    neighbor.area.clone()
                },
                gr_hold_time: neighbor.gr_hold_time,
                supports_flood_optimization: neighbor.supports_flood_optimization,
                label: neighbor.label,
            },
            rtt_us: neighbor.rtt_us,
        }
    }

    fn emit(&self, event_type: SparkNeighborEventType, if_name: &str, neighbor: &SparkNeighbor) {
        let event = self.make_event(event_type, if_name, neighbor);
        if self.events.push(event).is_err() {
            debug!("neighbor event queue closed");
        }
    }

    async fn send_hello(&mut self, if_name: &str, is_reply: bool) {
        self.seq_num += 1;
        // solicited replies never solicit back, or two fresh nodes would
        // ping-pong inside the fast-init window
        let in_fast_init = !is_reply
            && self
                .interfaces
                .get(if_name)
                .map(|state| Instant::now() < state.fast_init_until)
                .unwrap_or(false);
        let neighbor_infos: HashMap<String, ReflectedNeighborInfo> = self
            .neighbors
            .get(if_name)
            .map(|m| {
                m.iter()
                    .map(|(name, neighbor)| {
                        (
                            name.clone(),
                            ReflectedNeighborInfo {
                                last_nbr_msg_sent_ts_us: neighbor.neighbor_timestamp_us,
                                last_my_msg_rcvd_ts_us: neighbor.local_timestamp_us,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        let packet = SparkPacket {
            hello: Some(SparkHelloMsg {
                domain_name: self.config.domain.clone(),
                node_name: self.config.node_name.clone(),
                if_name: if_name.to_string(),
                seq_num: self.seq_num,
                neighbor_infos,
                version: TRELLIS_VERSION,
                solicit_response: in_fast_init,
                restarting: false,
                sent_ts_us: now_us(),
            }),
            heartbeat: None,
            handshake: None,
        };
        self.send_packet(if_name, &packet).await;
        self.counters.incr("spark.hello_sent");
    }

    async fn send_heartbeat(&mut self, if_name: &str) {
        self.seq_num += 1;
        let packet = SparkPacket {
            hello: None,
            heartbeat: Some(SparkHeartbeatMsg {
                node_name: self.config.node_name.clone(),
                seq_num: self.seq_num,
            }),
            handshake: None,
        };
        self.send_packet(if_name, &packet).await;
    }

    async fn send_handshake(&mut self, if_name: &str, target: &str, is_adj_established: bool) {
        let (v6, v4) = match self.interfaces.get(if_name) {
            Some(state) => (
                state
                    .v6_ll_addr
                    .map(|addr| BinaryAddress::from_addr(addr, None).addr)
                    .unwrap_or_default(),
                if self.config.enable_v4 {
                    state
                        .v4_addr
                        .map(|addr| BinaryAddress::from_addr(addr, None).addr)
                        .unwrap_or_default()
                } else {
                    Vec::new()
                },
            ),
            None => return,
        };
        let area = self
            .config
            .areas
            .first()
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_AREA.to_string());
        let packet = SparkPacket {
            hello: None,
            heartbeat: None,
            handshake: Some(SparkHandshakeMsg {
                node_name: self.config.node_name.clone(),
                is_adj_established,
                hold_time_ms: self.config.spark_heartbeat_hold_time.as_millis() as i64,
                gr_hold_time_ms: self.config.spark_gr_hold_time.as_millis() as i64,
                transport_address_v6: v6,
                transport_address_v4: v4,
                kvstore_port: self.config.kvstore_port as u32,
                ctrl_port: self.config.ctrl_port as u32,
                area,
                neighbor_node_name: target.to_string(),
            }),
        };
        self.send_packet(if_name, &packet).await;
    }

    async fn send_restarting_hellos(&mut self) {
        let if_names: Vec<String> = self.interfaces.keys().cloned().collect();
        for if_name in if_names {
            self.seq_num += 1;
            let packet = SparkPacket {
                hello: Some(SparkHelloMsg {
                    domain_name: self.config.domain.clone(),
                    node_name: self.config.node_name.clone(),
                    if_name: if_name.clone(),
                    seq_num: self.seq_num,
                    neighbor_infos: HashMap::new(),
                    version: TRELLIS_VERSION,
                    solicit_response: false,
                    restarting: true,
                    sent_ts_us: now_us(),
                }),
                heartbeat: None,
                handshake: None,
            };
            self.send_packet(&if_name, &packet).await;
        }
    }

    async fn send_packet(&self, if_name: &str, packet: &SparkPacket) {
        let bytes = match serialize_message(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to serialize spark packet: {}", e);
                return;
            }
        };
        if let Err(e) = self.io.send(if_name, bytes).await {
            debug!("spark send on {} failed: {}", if_name, e);
        }
    }
}

fn extract_addrs(
    info: &crate::protocol::InterfaceInfo,
) -> (Option<IpAddr>, Option<IpAddr>, Option<ipnet::IpNet>) {
    let mut v6_ll = None;
    let mut v6_global = None;
    let mut v4 = None;
    let mut v4_net = None;
    for prefix in &info.networks {
        match prefix.to_ipnet() {
            Some(ipnet::IpNet::V6(net)) => {
                if (net.addr().segments()[0] & 0xffc0) == 0xfe80 {
                    if v6_ll.is_none() {
                        v6_ll = Some(IpAddr::V6(net.addr()));
                    }
                } else if v6_global.is_none() {
                    v6_global = Some(IpAddr::V6(net.addr()));
                }
            }
            Some(ipnet::IpNet::V4(net)) => {
                if v4.is_none() {
                    v4 = Some(IpAddr::V4(net.addr()));
                    v4_net = Some(ipnet::IpNet::V4(net));
                }
            }
            None => {}
        }
    }
    // link-locals are the canonical transport; fall back to a global v6
    // for fabrics that number interfaces globally
    (v6_ll.or(v6_global), v4, v4_net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::ReplicateQueue;
    use crate::protocol::{InterfaceInfo, IpPrefix};

    fn test_config(name: &str) -> Arc<Config> {
        Arc::new(Config {
            node_name: name.to_string(),
            spark_hello_time: Duration::from_millis(200),
            spark_fast_init_hello_time: Duration::from_millis(60),
            spark_handshake_time: Duration::from_millis(60),
            spark_heartbeat_time: Duration::from_millis(60),
            spark_negotiate_hold_time: Duration::from_millis(600),
            spark_heartbeat_hold_time: Duration::from_millis(400),
            spark_gr_hold_time: Duration::from_millis(500),
            ..Default::default()
        })
    }

    fn iface_db(node: &str, if_name: &str, if_index: i32) -> InterfaceDatabase {
        let mut interfaces = HashMap::new();
        let addr_net = format!("fe80::{}/64", if_index);
        interfaces.insert(
            if_name.to_string(),
            InterfaceInfo {
                if_name: if_name.to_string(),
                is_up: true,
                if_index,
                weight: 1,
                networks: vec![crate::protocol::net::parse_prefix(&addr_net).unwrap()],
            },
        );
        InterfaceDatabase {
            this_node_name: node.to_string(),
            interfaces,
        }
    }

    struct TwoNodes {
        hub: TestIoHub,
        h1: SparkHandle,
        h2: SparkHandle,
        if1: ReplicateQueue<InterfaceDatabase>,
        if2: ReplicateQueue<InterfaceDatabase>,
    }

    async fn bring_up_pair() -> TwoNodes {
        let hub = TestIoHub::new();
        let io1 = hub.provider("node1");
        let io2 = hub.provider("node2");
        hub.link(("node1", "iface12"), ("node2", "iface21"));

        let if1 = ReplicateQueue::new();
        let if2 = ReplicateQueue::new();
        let h1 = Spark::new(test_config("node1"), io1).spawn(if1.get_reader());
        let h2 = Spark::new(test_config("node2"), io2).spawn(if2.get_reader());

        if1.push(iface_db("node1", "iface12", 1)).unwrap();
        if2.push(iface_db("node2", "iface21", 2)).unwrap();
        TwoNodes { hub, h1, h2, if1, if2 }
    }

    async fn await_event(
        reader: &mut RQueue<SparkNeighborEvent>,
        wanted: SparkNeighborEventType,
        timeout: Duration,
    ) -> SparkNeighborEvent {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = tokio::time::timeout(remaining, reader.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if event.event_type == wanted {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_two_nodes_establish() {
        let nodes = bring_up_pair().await;
        let mut r1 = nodes.h1.event_reader();
        let mut r2 = nodes.h2.event_reader();

        let up1 = await_event(&mut r1, SparkNeighborEventType::Up, Duration::from_secs(5)).await;
        assert_eq!(up1.info.node_name, "node2");
        assert_eq!(up1.if_name, "iface12");
        assert_eq!(up1.info.remote_if_name, "iface21");

        let up2 = await_event(&mut r2, SparkNeighborEventType::Up, Duration::from_secs(5)).await;
        assert_eq!(up2.info.node_name, "node1");

        let state = nodes
            .h1
            .get_neighbor_state("iface12", "node2")
            .await
            .unwrap();
        assert_eq!(state, Some(SparkNeighborState::Established));
    }

    #[tokio::test]
    async fn test_neighbor_down_on_partition() {
        let nodes = bring_up_pair().await;
        let mut r1 = nodes.h1.event_reader();
        await_event(&mut r1, SparkNeighborEventType::Up, Duration::from_secs(5)).await;

        // cut node2's transmissions; node1's heartbeat hold expires
        nodes.hub.set_partitioned("node2", "iface21", true);
        let down =
            await_event(&mut r1, SparkNeighborEventType::Down, Duration::from_secs(5)).await;
        assert_eq!(down.info.node_name, "node2");
    }

    #[tokio::test]
    async fn test_domain_mismatch_forms_no_adjacency() {
        let hub = TestIoHub::new();
        let io1 = hub.provider("node1");
        let io2 = hub.provider("node2");
        hub.link(("node1", "a"), ("node2", "b"));

        let mut other_domain = test_config("node2");
        Arc::get_mut(&mut other_domain).unwrap().domain = "elsewhere".to_string();

        let if1 = ReplicateQueue::new();
        let if2 = ReplicateQueue::new();
        let h1 = Spark::new(test_config("node1"), io1).spawn(if1.get_reader());
        let _h2 = Spark::new(other_domain, io2).spawn(if2.get_reader());
        if1.push(iface_db("node1", "a", 1)).unwrap();
        if2.push(iface_db("node2", "b", 2)).unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let state = h1.get_neighbor_state("a", "node2").await.unwrap();
        assert_eq!(state, None);
        assert!(h1.counters().get("spark.domain_mismatch").copied().unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_graceful_restart_cycle() {
        let nodes = bring_up_pair().await;
        let mut r2 = nodes.h2.event_reader();
        await_event(&mut r2, SparkNeighborEventType::Up, Duration::from_secs(5)).await;

        // node1 announces a graceful restart
        nodes.h1.graceful_shutdown().await.unwrap();
        let restarting = await_event(
            &mut r2,
            SparkNeighborEventType::Restarting,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(restarting.info.node_name, "node1");

        // node1 keeps sending ordinary hellos; node2 sees it come back
        let restarted = await_event(
            &mut r2,
            SparkNeighborEventType::Restarted,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(restarted.info.node_name, "node1");
    }

    #[tokio::test]
    async fn test_interface_removal_downs_neighbors() {
        let nodes = bring_up_pair().await;
        let mut r1 = nodes.h1.event_reader();
        await_event(&mut r1, SparkNeighborEventType::Up, Duration::from_secs(5)).await;

        // withdraw the interface
        let empty = InterfaceDatabase {
            this_node_name: "node1".to_string(),
            interfaces: HashMap::new(),
        };
        nodes.if1.push(empty).unwrap();
        let down =
            await_event(&mut r1, SparkNeighborEventType::Down, Duration::from_secs(5)).await;
        assert_eq!(down.if_name, "iface12");
        let _ = &nodes.if2;
    }

    #[tokio::test]
    async fn test_up_event_carries_transport_info() {
        let nodes = bring_up_pair().await;
        let mut r1 = nodes.h1.event_reader();
        let up = await_event(&mut r1, SparkNeighborEventType::Up, Duration::from_secs(5)).await;
        assert_eq!(up.info.kvstore_port, 60002);
        assert_eq!(up.info.ctrl_port, 2018);
        assert_eq!(up.info.area, crate::config::DEFAULT_AREA);
        assert!(up.info.gr_hold_time > Duration::ZERO);
    }

    #[test]
    fn test_extract_addrs() {
        let info = InterfaceInfo {
            if_name: "eth0".to_string(),
            is_up: true,
            if_index: 3,
            weight: 1,
            networks: vec![
                crate::protocol::net::parse_prefix("10.1.0.5/24").unwrap(),
                crate::protocol::net::parse_prefix("fe80::3/64").unwrap(),
                crate::protocol::net::parse_prefix("2001:db8::3/64").unwrap(),
            ],
        };
        let (v6_ll, v4, v4_net) = extract_addrs(&info);
        assert_eq!(v6_ll, Some("fe80::3".parse().unwrap()));
        assert_eq!(v4, Some("10.1.0.5".parse().unwrap()));
        assert!(v4_net.unwrap().contains(&"10.1.0.9".parse::<IpAddr>().unwrap()));
    }
}
