//! Wire message definitions
//!
//! Hand-derived prost messages for the KvStore replication protocol, Spark
//! neighbor discovery, the link-state data model, route databases and the
//! persistent store. Field tags are frozen; only append.

use std::collections::HashMap;

//
// KvStore replication
//

/// The unit of replication in the KvStore
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    /// Monotonically increasing under the originator's control; 0 is
    /// reserved for hash-only entries
    #[prost(uint64, tag = "1")]
    pub version: u64,
    /// Node that created this value
    #[prost(string, tag = "2")]
    pub originator_id: String,
    /// Payload; absent when the entry carries only a hash
    #[prost(bytes = "vec", optional, tag = "3")]
    pub value: Option<Vec<u8>>,
    /// Time-to-live in milliseconds at the moment of transmission;
    /// `TTL_INFINITY` disables expiry
    #[prost(int64, tag = "4")]
    pub ttl: i64,
    /// Bumped by the originator on every TTL refresh that leaves the
    /// payload untouched
    #[prost(int64, tag = "5")]
    pub ttl_version: i64,
    /// Deterministic hash over (version, originator_id, value)
    #[prost(int64, optional, tag = "6")]
    pub hash: Option<i64>,
}

/// A batch pushed over the flood mesh
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publication {
    /// Keys to set/update
    #[prost(map = "string, message", tag = "1")]
    pub key_vals: HashMap<String, Value>,
    /// Keys whose TTL ran out at the sender
    #[prost(string, repeated, tag = "2")]
    pub expired_keys: Vec<String>,
    /// Keys the sender wants back with full bodies (3-way sync)
    #[prost(string, repeated, tag = "3")]
    pub to_be_updated_keys: Vec<String>,
    /// Flood-root this publication propagates under, when the flood
    /// optimization overlay is active
    #[prost(string, optional, tag = "4")]
    pub flood_root_id: Option<String>,
    /// Area this publication belongs to
    #[prost(string, tag = "5")]
    pub area: String,
    /// Node that emitted this publication
    #[prost(string, optional, tag = "6")]
    pub node_id: Option<String>,
}

/// Parameters of a KEY_SET request (flooded updates and 3-way finalize)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeySetParams {
    /// Keys to merge at the receiver
    #[prost(map = "string, message", tag = "1")]
    pub key_vals: HashMap<String, Value>,
    /// Sender identity, enabling the receiver to request bodies back
    #[prost(string, optional, tag = "2")]
    pub sender_id: Option<String>,
    /// Flood-root these keys propagate under
    #[prost(string, optional, tag = "3")]
    pub flood_root_id: Option<String>,
    /// Send time, for convergence tracing
    #[prost(int64, tag = "4")]
    pub timestamp_ms: i64,
}

/// Parameters of a KEY_GET request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyGetParams {
    /// Keys to look up
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
}

/// Hash snapshot attached to a full-sync request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashDump {
    /// Hash-only values keyed by name
    #[prost(map = "string, message", tag = "1")]
    pub hashes: HashMap<String, Value>,
}

/// Parameters of a KEY_DUMP request (dumps and full syncs)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyDumpParams {
    /// Key-prefix filter; empty matches all keys
    #[prost(string, repeated, tag = "1")]
    pub prefixes: Vec<String>,
    /// Originator filter; empty matches all originators
    #[prost(string, repeated, tag = "2")]
    pub originator_ids: Vec<String>,
    /// When present, the responder computes a diff against these hashes
    /// (full-sync mode) instead of dumping everything
    #[prost(message, optional, tag = "3")]
    pub key_val_hashes: Option<HashDump>,
    /// Return only hashes, not bodies
    #[prost(bool, tag = "4")]
    pub hashes_only: bool,
    /// Requester identity, for the 3-way response leg
    #[prost(string, optional, tag = "5")]
    pub sender_id: Option<String>,
}

/// How to reach a KvStore peer
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct PeerSpec {
    /// host:port of the peer's KvStore listener
    #[prost(string, tag = "1")]
    pub addr: String,
    /// Peer participates in the flood-optimization overlay
    #[prost(bool, tag = "2")]
    pub supports_flood_optimization: bool,
}

/// Spanning-tree child set/unset command for the flood overlay
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloodTopoSetParams {
    /// Flood root the action applies to
    #[prost(string, tag = "1")]
    pub root_id: String,
    /// Node issuing the command
    #[prost(string, tag = "2")]
    pub src_node: String,
    /// True to become a child, false to resign
    #[prost(bool, tag = "3")]
    pub set_child: bool,
    /// Apply to every root instead of `root_id`
    #[prost(bool, tag = "4")]
    pub all_roots: bool,
}

/// One distance report of the flood-overlay computation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DualMessage {
    /// Flood root the distance refers to
    #[prost(string, tag = "1")]
    pub root_id: String,
    /// Sender's distance to the root; negative means unreachable
    #[prost(int64, tag = "2")]
    pub distance: i64,
}

/// A batch of flood-overlay distance reports
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DualMessages {
    /// Reporting node
    #[prost(string, tag = "1")]
    pub src_node: String,
    /// The reports
    #[prost(message, repeated, tag = "2")]
    pub messages: Vec<DualMessage>,
}

/// Snapshot of one flood-overlay spanning tree
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SptInfo {
    /// Root of this tree
    #[prost(string, tag = "1")]
    pub root_id: String,
    /// Upstream peer toward the root, if any
    #[prost(string, optional, tag = "2")]
    pub parent: Option<String>,
    /// Peers that chose us as their upstream
    #[prost(string, repeated, tag = "3")]
    pub children: Vec<String>,
    /// Our distance to the root; negative means unreachable
    #[prost(int64, tag = "4")]
    pub distance: i64,
}

/// Snapshot of all flood-overlay trees in an area
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SptInfos {
    /// Trees keyed by root
    #[prost(message, repeated, tag = "1")]
    pub infos: Vec<SptInfo>,
}

/// A request to a KvStore peer
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreRequest {
    /// Area the command applies to
    #[prost(string, tag = "1")]
    pub area: String,
    /// The command itself
    #[prost(oneof = "store_request::Command", tags = "2, 3, 4, 5, 6")]
    pub command: Option<store_request::Command>,
}

/// Command variants of [`StoreRequest`]
pub mod store_request {
    /// The command carried by a request
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Command {
        /// Merge keys (flooded update or 3-way finalize)
        #[prost(message, tag = "2")]
        KeySet(super::KeySetParams),
        /// Point lookup
        #[prost(message, tag = "3")]
        KeyGet(super::KeyGetParams),
        /// Dump or full-sync
        #[prost(message, tag = "4")]
        KeyDump(super::KeyDumpParams),
        /// Flood-overlay child management
        #[prost(message, tag = "5")]
        FloodTopoSet(super::FloodTopoSetParams),
        /// Flood-overlay distance reports
        #[prost(message, tag = "6")]
        Dual(super::DualMessages),
    }
}

/// Response to a [`StoreRequest`]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreResponse {
    /// Did the command succeed?
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Failure detail when `success` is false
    #[prost(string, tag = "2")]
    pub message: String,
    /// Publication payload for get/dump/sync responses
    #[prost(message, optional, tag = "3")]
    pub publication: Option<Publication>,
}

//
// Spark neighbor discovery
//

/// Reflection of a neighbor's hello, echoed back for RTT measurement
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReflectedNeighborInfo {
    /// Send timestamp of the last hello we received from this neighbor
    #[prost(int64, tag = "1")]
    pub last_nbr_msg_sent_ts_us: i64,
    /// Our receive timestamp of that hello
    #[prost(int64, tag = "2")]
    pub last_my_msg_rcvd_ts_us: i64,
}

/// Periodic multicast hello
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SparkHelloMsg {
    /// Routing domain tag; mismatches are dropped
    #[prost(string, tag = "1")]
    pub domain_name: String,
    /// Sender node name
    #[prost(string, tag = "2")]
    pub node_name: String,
    /// Interface the hello was sent from
    #[prost(string, tag = "3")]
    pub if_name: String,
    /// Sender's hello sequence number; a decrease signals restart
    #[prost(uint64, tag = "4")]
    pub seq_num: u64,
    /// Neighbors seen on this interface, keyed by node name
    #[prost(map = "string, message", tag = "5")]
    pub neighbor_infos: HashMap<String, ReflectedNeighborInfo>,
    /// Sender's protocol version
    #[prost(uint32, tag = "6")]
    pub version: u32,
    /// Ask freshly-seen neighbors to reply at fast-init pace
    #[prost(bool, tag = "7")]
    pub solicit_response: bool,
    /// Sender is restarting gracefully
    #[prost(bool, tag = "8")]
    pub restarting: bool,
    /// Send timestamp (microseconds, sender clock)
    #[prost(int64, tag = "9")]
    pub sent_ts_us: i64,
}

/// Negotiation message establishing an adjacency
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SparkHandshakeMsg {
    /// Sender node name
    #[prost(string, tag = "1")]
    pub node_name: String,
    /// Sender considers the adjacency established
    #[prost(bool, tag = "2")]
    pub is_adj_established: bool,
    /// Sender's heartbeat hold time
    #[prost(int64, tag = "3")]
    pub hold_time_ms: i64,
    /// Sender's graceful-restart hold time
    #[prost(int64, tag = "4")]
    pub gr_hold_time_ms: i64,
    /// Sender's IPv6 link-local transport address (16 bytes)
    #[prost(bytes = "vec", tag = "5")]
    pub transport_address_v6: Vec<u8>,
    /// Sender's IPv4 transport address (4 bytes; empty when v4 disabled)
    #[prost(bytes = "vec", tag = "6")]
    pub transport_address_v4: Vec<u8>,
    /// Sender's KvStore listener port
    #[prost(uint32, tag = "7")]
    pub kvstore_port: u32,
    /// Sender's control-plane port
    #[prost(uint32, tag = "8")]
    pub ctrl_port: u32,
    /// Area the adjacency forms in
    #[prost(string, tag = "9")]
    pub area: String,
    /// Neighbor this handshake is addressed to; others ignore it
    #[prost(string, tag = "10")]
    pub neighbor_node_name: String,
}

/// Fast liveness probe exchanged once an adjacency is established
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SparkHeartbeatMsg {
    /// Sender node name
    #[prost(string, tag = "1")]
    pub node_name: String,
    /// Sender's hello sequence number
    #[prost(uint64, tag = "2")]
    pub seq_num: u64,
}

/// The single datagram type Spark puts on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SparkPacket {
    /// Hello payload
    #[prost(message, optional, tag = "1")]
    pub hello: Option<SparkHelloMsg>,
    /// Heartbeat payload
    #[prost(message, optional, tag = "2")]
    pub heartbeat: Option<SparkHeartbeatMsg>,
    /// Handshake payload
    #[prost(message, optional, tag = "3")]
    pub handshake: Option<SparkHandshakeMsg>,
}

//
// Link-state data model
//

/// An IP prefix in wire form
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct IpPrefix {
    /// Network address bytes: 4 (IPv4) or 16 (IPv6)
    #[prost(bytes = "vec", tag = "1")]
    pub prefix_address: Vec<u8>,
    /// Prefix length in bits
    #[prost(int32, tag = "2")]
    pub prefix_length: i32,
}

/// An address with an optional scoping interface
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct BinaryAddress {
    /// Address bytes: 4 (IPv4) or 16 (IPv6); empty means unset
    #[prost(bytes = "vec", tag = "1")]
    pub addr: Vec<u8>,
    /// Interface scope for link-local addresses
    #[prost(string, optional, tag = "2")]
    pub if_name: Option<String>,
}

/// One half-edge announced by a node toward a neighbor
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Adjacency {
    /// Neighbor node name
    #[prost(string, tag = "1")]
    pub other_node_name: String,
    /// Local interface carrying the adjacency
    #[prost(string, tag = "2")]
    pub if_name: String,
    /// Neighbor's interface on the far end
    #[prost(string, tag = "3")]
    pub other_if_name: String,
    /// IPv6 link-local next-hop toward the neighbor
    #[prost(message, optional, tag = "4")]
    pub next_hop_v6: Option<BinaryAddress>,
    /// IPv4 next-hop toward the neighbor
    #[prost(message, optional, tag = "5")]
    pub next_hop_v4: Option<BinaryAddress>,
    /// Link metric
    #[prost(uint64, tag = "6")]
    pub metric: u64,
    /// Segment-routing adjacency label
    #[prost(int32, tag = "7")]
    pub adj_label: i32,
    /// Half-edge is administratively overloaded
    #[prost(bool, tag = "8")]
    pub is_overloaded: bool,
    /// Last measured round-trip time in microseconds
    #[prost(int64, tag = "9")]
    pub rtt_us: i64,
    /// When the adjacency came up (unix ms)
    #[prost(int64, tag = "10")]
    pub timestamp_ms: i64,
    /// Weight for weighted ECMP
    #[prost(uint64, tag = "11")]
    pub weight: u64,
}

/// The full adjacency set a node advertises (key `adj:<node>`)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdjacencyDatabase {
    /// Advertising node
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    /// Node refuses transit traffic
    #[prost(bool, tag = "2")]
    pub is_overloaded: bool,
    /// Live adjacencies
    #[prost(message, repeated, tag = "3")]
    pub adjacencies: Vec<Adjacency>,
    /// Segment-routing node label; 0 when unset
    #[prost(int32, tag = "4")]
    pub node_label: i32,
    /// Area this database belongs to
    #[prost(string, tag = "5")]
    pub area: String,
    /// Convergence trace
    #[prost(message, optional, tag = "6")]
    pub perf_events: Option<PerfEvents>,
}

/// The origin class of a prefix advertisement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PrefixType {
    /// Node loopback address
    Loopback = 1,
    /// Operator-configured or redistributed prefix
    Default = 2,
    /// Elected by the prefix allocator
    PrefixAllocator = 3,
    /// Injected via the control surface
    Breeze = 4,
    /// Learned from a BGP shim
    Bgp = 5,
}

/// How traffic toward a prefix is forwarded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ForwardingType {
    /// Plain IP forwarding
    Ip = 0,
    /// Segment-routing MPLS
    SrMpls = 1,
}

/// Path-computation algorithm requested for a prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ForwardingAlgorithm {
    /// Shortest path with ECMP
    SpEcmp = 0,
    /// 2-shortest-paths edge-disjoint ECMP
    Ksp2EdEcmp = 1,
}

/// Opaque comparable metric list, highest priority first; compared
/// lexicographically, larger wins
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct MetricVector {
    /// The metric values
    #[prost(int64, repeated, tag = "1")]
    pub metrics: Vec<i64>,
}

/// One advertised prefix
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrefixEntry {
    /// The prefix itself
    #[prost(message, optional, tag = "1")]
    pub prefix: Option<IpPrefix>,
    /// Origin class
    #[prost(enumeration = "PrefixType", tag = "2")]
    pub prefix_type: i32,
    /// Opaque origin data
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    /// Forwarding mechanism
    #[prost(enumeration = "ForwardingType", tag = "4")]
    pub forwarding_type: i32,
    /// Path-computation algorithm
    #[prost(enumeration = "ForwardingAlgorithm", tag = "5")]
    pub forwarding_algorithm: i32,
    /// Entry is not persisted across restarts
    #[prost(bool, tag = "6")]
    pub ephemeral: bool,
    /// Optional best-path tie-break vector
    #[prost(message, optional, tag = "7")]
    pub mv: Option<MetricVector>,
}

/// The prefixes a node advertises (key `prefix:<node>` or per-prefix keys)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrefixDatabase {
    /// Advertising node
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    /// The advertised prefixes
    #[prost(message, repeated, tag = "2")]
    pub prefix_entries: Vec<PrefixEntry>,
    /// Per-prefix-key withdrawal marker
    #[prost(bool, tag = "3")]
    pub delete_prefix: bool,
    /// Area this database belongs to
    #[prost(string, tag = "4")]
    pub area: String,
    /// Convergence trace
    #[prost(message, optional, tag = "5")]
    pub perf_events: Option<PerfEvents>,
}

//
// Routes
//

/// MPLS operations attachable to a next-hop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MplsActionCode {
    /// Push a label stack
    Push = 1,
    /// Swap the top label
    Swap = 2,
    /// Penultimate-hop pop
    PhpPop = 3,
    /// Pop and deliver locally
    Pop = 4,
}

/// MPLS action carried on a next-hop
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct MplsAction {
    /// The operation
    #[prost(enumeration = "MplsActionCode", tag = "1")]
    pub action: i32,
    /// Label to swap to (Swap only)
    #[prost(int32, optional, tag = "2")]
    pub swap_label: Option<i32>,
    /// Labels to push, top of stack last (Push only)
    #[prost(int32, repeated, tag = "3")]
    pub push_labels: Vec<i32>,
}

/// One way to reach a destination
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct NextHop {
    /// Gateway address, scoped to an interface for link-locals
    #[prost(message, optional, tag = "1")]
    pub address: Option<BinaryAddress>,
    /// Path metric via this next-hop
    #[prost(uint64, tag = "2")]
    pub metric: u64,
    /// MPLS operation, for segment-routing routes
    #[prost(message, optional, tag = "3")]
    pub mpls_action: Option<MplsAction>,
}

/// A programmed unicast route
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnicastRoute {
    /// Destination prefix
    #[prost(message, optional, tag = "1")]
    pub dest: Option<IpPrefix>,
    /// Equal-cost (or LFA-extended) next-hop set
    #[prost(message, repeated, tag = "2")]
    pub next_hops: Vec<NextHop>,
}

/// A programmed MPLS route
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MplsRoute {
    /// Incoming top label
    #[prost(int32, tag = "1")]
    pub top_label: i32,
    /// Next-hop set
    #[prost(message, repeated, tag = "2")]
    pub next_hops: Vec<NextHop>,
}

/// Full route state computed by Decision
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteDatabase {
    /// Node this database was computed for
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    /// Unicast routes
    #[prost(message, repeated, tag = "2")]
    pub unicast_routes: Vec<UnicastRoute>,
    /// MPLS routes
    #[prost(message, repeated, tag = "3")]
    pub mpls_routes: Vec<MplsRoute>,
    /// Convergence trace
    #[prost(message, optional, tag = "4")]
    pub perf_events: Option<PerfEvents>,
}

/// Incremental change between two route databases
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteDatabaseDelta {
    /// Unicast routes to add or replace
    #[prost(message, repeated, tag = "1")]
    pub unicast_routes_to_update: Vec<UnicastRoute>,
    /// Unicast destinations to withdraw
    #[prost(message, repeated, tag = "2")]
    pub unicast_routes_to_delete: Vec<IpPrefix>,
    /// MPLS routes to add or replace
    #[prost(message, repeated, tag = "3")]
    pub mpls_routes_to_update: Vec<MplsRoute>,
    /// MPLS labels to withdraw
    #[prost(int32, repeated, tag = "4")]
    pub mpls_routes_to_delete: Vec<i32>,
    /// Convergence trace
    #[prost(message, optional, tag = "5")]
    pub perf_events: Option<PerfEvents>,
}

//
// Interfaces
//

/// Snapshot of one interface's state
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InterfaceInfo {
    /// Interface name
    #[prost(string, tag = "1")]
    pub if_name: String,
    /// Effective up/down state (backoff-dampened)
    #[prost(bool, tag = "2")]
    pub is_up: bool,
    /// Kernel interface index
    #[prost(int32, tag = "3")]
    pub if_index: i32,
    /// Weight for weighted ECMP
    #[prost(uint64, tag = "4")]
    pub weight: u64,
    /// Assigned networks
    #[prost(message, repeated, tag = "5")]
    pub networks: Vec<IpPrefix>,
}

/// The interface set LinkMonitor pushes to Spark and Fib
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InterfaceDatabase {
    /// Reporting node
    #[prost(string, tag = "1")]
    pub this_node_name: String,
    /// Interfaces keyed by name
    #[prost(map = "string, message", tag = "2")]
    pub interfaces: HashMap<String, InterfaceInfo>,
}

//
// Convergence tracing
//

/// One timestamped event in a convergence trace
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerfEvent {
    /// Node the event occurred on
    #[prost(string, tag = "1")]
    pub node_name: String,
    /// Event label, e.g. `DECISION_RECEIVED`
    #[prost(string, tag = "2")]
    pub event_name: String,
    /// Unix timestamp in milliseconds
    #[prost(int64, tag = "3")]
    pub unix_ts_ms: i64,
}

/// An ordered convergence trace carried alongside updates
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerfEvents {
    /// The events, oldest first
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<PerfEvent>,
}

/// Payload of a `fibtime:<node>` key (ordered-FIB coordination)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FibProgrammingTime {
    /// Reporting node
    #[prost(string, tag = "1")]
    pub node_name: String,
    /// Observed route-programming duration in milliseconds
    #[prost(int64, tag = "2")]
    pub duration_ms: i64,
}

//
// Allocator payloads
//

/// Payload of an `allocprefix:<index>` election key
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocPrefix {
    /// The claimed index
    #[prost(int64, tag = "1")]
    pub alloc_prefix_index: i64,
}

/// Payload of the `e2e-network-allocations` key
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StaticAllocation {
    /// Statically assigned prefixes keyed by node name
    #[prost(map = "string, message", tag = "1")]
    pub node_prefixes: HashMap<String, IpPrefix>,
}

//
// Link-monitor persisted overrides
//

/// One per-adjacency metric override
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdjMetricOverride {
    /// Local interface of the adjacency
    #[prost(string, tag = "1")]
    pub if_name: String,
    /// Remote node of the adjacency
    #[prost(string, tag = "2")]
    pub node_name: String,
    /// Metric forced onto the adjacency
    #[prost(int64, tag = "3")]
    pub metric: i64,
}

/// Operator overrides surviving restarts
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkMonitorState {
    /// Node refuses transit traffic
    #[prost(bool, tag = "1")]
    pub is_overloaded: bool,
    /// Interfaces whose adjacencies are marked overloaded
    #[prost(string, repeated, tag = "2")]
    pub overloaded_links: Vec<String>,
    /// Metric overrides per interface
    #[prost(map = "string, int64", tag = "3")]
    pub link_metric_overrides: HashMap<String, i64>,
    /// Metric overrides per adjacency
    #[prost(message, repeated, tag = "4")]
    pub adj_metric_overrides: Vec<AdjMetricOverride>,
}

//
// Persistent store records
//

/// Action recorded in a persistent-store journal entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum StoreRecordAction {
    /// Key added or updated
    Add = 1,
    /// Key erased
    Del = 2,
}

/// One journal entry of the persistent store
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreRecord {
    /// What happened to the key
    #[prost(enumeration = "StoreRecordAction", tag = "1")]
    pub action: i32,
    /// The key
    #[prost(string, tag = "2")]
    pub key: String,
    /// Serialized value for Add records
    #[prost(bytes = "vec", optional, tag = "3")]
    pub data: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{deserialize_message, serialize_message};

    #[test]
    fn test_adjacency_database_round_trip() {
        let db = AdjacencyDatabase {
            this_node_name: "node1".to_string(),
            is_overloaded: false,
            adjacencies: vec![Adjacency {
                other_node_name: "node2".to_string(),
                if_name: "iface12".to_string(),
                other_if_name: "iface21".to_string(),
                next_hop_v6: Some(BinaryAddress {
                    addr: vec![0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                    if_name: Some("iface12".to_string()),
                }),
                next_hop_v4: None,
                metric: 10,
                adj_label: 50001,
                is_overloaded: false,
                rtt_us: 1200,
                timestamp_ms: 1_700_000_000_000,
                weight: 1,
            }],
            node_label: 101,
            area: "0".to_string(),
            perf_events: None,
        };
        let bytes = serialize_message(&db).unwrap();
        let decoded: AdjacencyDatabase = deserialize_message(&bytes).unwrap();
        assert_eq!(decoded, db);
    }

    #[test]
    fn test_prefix_type_enum_values() {
        assert_eq!(PrefixType::Loopback as i32, 1);
        assert_eq!(PrefixType::Default as i32, 2);
        assert_eq!(PrefixType::PrefixAllocator as i32, 3);
        assert_eq!(PrefixType::Breeze as i32, 4);
        assert_eq!(PrefixType::Bgp as i32, 5);
        assert_eq!(PrefixType::try_from(5).unwrap(), PrefixType::Bgp);
        assert!(PrefixType::try_from(99).is_err());
    }

    #[test]
    fn test_spark_packet_round_trip() {
        let mut neighbor_infos = HashMap::new();
        neighbor_infos.insert(
            "node2".to_string(),
            ReflectedNeighborInfo {
                last_nbr_msg_sent_ts_us: 111,
                last_my_msg_rcvd_ts_us: 222,
            },
        );
        let packet = SparkPacket {
            hello: Some(SparkHelloMsg {
                domain_name: "default".to_string(),
                node_name: "node1".to_string(),
                if_name: "eth0".to_string(),
                seq_num: 42,
                neighbor_infos,
                version: crate::config::TRELLIS_VERSION,
                solicit_response: true,
                restarting: false,
                sent_ts_us: 1_000_000,
            }),
            heartbeat: None,
            handshake: None,
        };
        let bytes = serialize_message(&packet).unwrap();
        let decoded: SparkPacket = deserialize_message(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_route_delta_round_trip() {
        let delta = RouteDatabaseDelta {
            unicast_routes_to_update: vec![UnicastRoute {
                dest: Some(IpPrefix {
                    prefix_address: vec![0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                    prefix_length: 64,
                }),
                next_hops: vec![NextHop {
                    address: Some(BinaryAddress {
                        addr: vec![0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2],
                        if_name: Some("eth0".to_string()),
                    }),
                    metric: 2,
                    mpls_action: None,
                }],
            }],
            unicast_routes_to_delete: vec![],
            mpls_routes_to_update: vec![],
            mpls_routes_to_delete: vec![101],
            perf_events: None,
        };
        let bytes = serialize_message(&delta).unwrap();
        let decoded: RouteDatabaseDelta = deserialize_message(&bytes).unwrap();
        assert_eq!(decoded, delta);
    }

    #[test]
    fn test_ip_prefix_usable_as_map_key() {
        let mut map = HashMap::new();
        let prefix = IpPrefix {
            prefix_address: vec![10, 0, 0, 0],
            prefix_length: 8,
        };
        map.insert(prefix.clone(), "route");
        assert_eq!(map.get(&prefix), Some(&"route"));
    }
}
