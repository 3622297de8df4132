//! Node configuration
//!
//! All tunables are collected into a single immutable [`Config`] constructed
//! at startup and passed by shared reference to every component. There are
//! no mutable globals. Validation failures here are the only fatal errors
//! in the system; everything after startup degrades and retries.

use crate::error::{ConfigError, Result};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

/// The default (and only implicit) KvStore area
pub const DEFAULT_AREA: &str = "0";

/// Key marker for adjacency databases
pub const ADJ_DB_MARKER: &str = "adj:";

/// Key marker for prefix databases
pub const PREFIX_DB_MARKER: &str = "prefix:";

/// Key marker for elected prefix-allocator indices
pub const ALLOC_PREFIX_MARKER: &str = "allocprefix:";

/// Key marker for FIB programming-time reports (ordered FIB)
pub const FIB_TIME_MARKER: &str = "fibtime:";

/// Key marker for segment-routing node-label election
pub const NODE_LABEL_MARKER: &str = "nodeLabel:";

/// KvStore key carrying seed prefix + allocation length
pub const SEED_PREFIX_ALLOC_PARAM_KEY: &str = "e2e-network-prefix";

/// KvStore key carrying statically allocated indices
pub const STATIC_PREFIX_ALLOC_PARAM_KEY: &str = "e2e-network-allocations";

/// TTL value meaning "never expires"
pub const TTL_INFINITY: i64 = i32::MIN as i64;

/// Minimum TTL for accepting a previously unseen key
pub const TTL_THRESHOLD_MS: i64 = 500;

/// TTL decrement applied before re-flooding an entry
pub const TTL_DECREMENT_MS: i64 = 1;

/// Segment-routing global label range (node labels)
pub const SR_GLOBAL_RANGE: (i32, i32) = (101, 49_999);

/// Segment-routing local label range (adjacency labels)
pub const SR_LOCAL_RANGE: (i32, i32) = (50_000, 59_999);

/// Client identifier used when programming routes into the agent
pub const FIB_CLIENT_ID: i32 = 786;

/// Current protocol version advertised in Spark hellos
pub const TRELLIS_VERSION: u32 = 20191122;

/// Lowest protocol version we interoperate with
pub const TRELLIS_SUPPORTED_VERSION: u32 = 20180307;

/// Hold time for blocked adjacency long-poll requests
pub const LONG_POLL_HOLD: Duration = Duration::from_secs(20);

/// Default metric for adjacencies when RTT metrics are disabled
pub const DEFAULT_ADJ_METRIC: u64 = 1;

/// Metric penalty applied to every adjacency of an overloaded node
pub const OVERLOAD_NODE_METRIC: u64 = 1 << 32;

/// Flood-rate configuration for KvStore: (messages/sec, burst size)
pub type FloodRate = (f64, usize);

/// Prefix-allocation operating mode
///
/// Mirrors the three ways the allocator can learn its parameters. Runtime
/// switching between modes is not supported; the mode is fixed when the
/// node is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixAllocationMode {
    /// Look up a static per-node allocation published under
    /// `e2e-network-allocations` in the KvStore
    Static,
    /// Read seed prefix and allocation length from `e2e-network-prefix`
    /// in the KvStore, then elect a subprefix index
    Seeded,
    /// Elect a subprefix index from parameters given at construction,
    /// e.g. `fc00:cafe::/56,64`
    Params {
        /// Seed prefix, e.g. `fc00:cafe::/56`
        seed_prefix: String,
        /// Length of each allocated subprefix, e.g. 64
        alloc_prefix_len: u8,
    },
}

/// Interface matching rules built from the configured regex lists
#[derive(Debug)]
pub struct InterfaceMatchers {
    include: RegexSet,
    exclude: RegexSet,
    redistribute: RegexSet,
}

impl InterfaceMatchers {
    fn build(config: &Config) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<RegexSet> {
            RegexSet::new(patterns).map_err(|e| {
                ConfigError::InvalidRegex {
                    pattern: patterns.join(","),
                    reason: e.to_string(),
                }
                .into()
            })
        };
        Ok(Self {
            include: compile(&config.include_interface_regexes)?,
            exclude: compile(&config.exclude_interface_regexes)?,
            redistribute: compile(&config.redistribute_interface_regexes)?,
        })
    }

    /// Should this interface run neighbor discovery?
    pub fn is_monitored(&self, if_name: &str) -> bool {
        if self.exclude.is_match(if_name) {
            return false;
        }
        !self.include.patterns().is_empty() && self.include.is_match(if_name)
    }

    /// Should this interface's global addresses be advertised as prefixes?
    pub fn is_redistributed(&self, if_name: &str) -> bool {
        self.redistribute.is_match(if_name)
    }
}

/// Complete node configuration
///
/// Construct with [`Config::default`], adjust fields, then pass through
/// [`Config::validate`]. `Node::builder` calls `validate` for you.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this node; must be unique within the routing domain
    pub node_name: String,

    /// Routing domain tag; hello packets from other domains are dropped
    pub domain: String,

    /// KvStore areas this node participates in
    pub areas: Vec<String>,

    /// Interface name regexes to run neighbor discovery on
    pub include_interface_regexes: Vec<String>,

    /// Interface name regexes to never run neighbor discovery on
    pub exclude_interface_regexes: Vec<String>,

    /// Interface name regexes whose global addresses are advertised
    pub redistribute_interface_regexes: Vec<String>,

    /// Static prefixes this node always advertises
    pub static_prefixes: Vec<String>,

    //
    // Feature toggles
    //
    /// Exchange IPv4 transport addresses and compute IPv4 routes
    pub enable_v4: bool,

    /// Validate that IPv4 neighbor addresses share our subnet
    pub enable_subnet_validation: bool,

    /// Allocate node/adjacency labels and compute MPLS routes
    pub enable_segment_routing: bool,

    /// Compute loop-free alternate next-hops
    pub enable_lfa: bool,

    /// Ordered FIB programming (hold route changes per rfc 6976)
    pub enable_ordered_fib: bool,

    /// DUAL-based flood optimization overlay
    pub enable_flood_optimization: bool,

    /// Advertise this node as a flood root
    pub is_flood_root: bool,

    /// Skip all forwarding-agent RPCs (state machine runs unchanged)
    pub dryrun: bool,

    /// Run the prefix allocator
    pub enable_prefix_allocation: bool,

    /// Prefix-allocation mode; fixed for the lifetime of the process
    pub prefix_allocation_mode: PrefixAllocationMode,

    /// Advertise each prefix under its own KvStore key
    pub per_prefix_keys: bool,

    /// Program the elected prefix onto the loopback interface
    pub set_loopback_address: bool,

    /// Loopback interface name used for address programming
    pub loopback_interface: String,

    /// Use measured RTT as the adjacency metric
    pub use_rtt_metric: bool,

    /// Wrap KvStore peer connections in TLS 1.3
    pub enable_tls: bool,

    //
    // Ports
    //
    /// TCP port the KvStore listens on for peer commands and syncs
    pub kvstore_port: u16,

    /// UDP multicast port for Spark hello packets
    pub spark_mcast_port: u16,

    /// TCP port of the local forwarding agent
    pub fib_agent_port: u16,

    /// TCP port of the local system agent (address programming)
    pub system_agent_port: u16,

    /// Port the control facade is reachable on
    pub ctrl_port: u16,

    //
    // Spark timers
    //
    /// Steady-state hello interval
    pub spark_hello_time: Duration,

    /// Hello interval while an interface is in fast-init
    pub spark_fast_init_hello_time: Duration,

    /// Handshake retransmit interval during negotiation
    pub spark_handshake_time: Duration,

    /// Heartbeat (keepalive) interval
    pub spark_heartbeat_time: Duration,

    /// How long to stay in NEGOTIATE before falling back to WARM
    pub spark_negotiate_hold_time: Duration,

    /// Missing-heartbeat hold before declaring a neighbor down
    pub spark_heartbeat_hold_time: Duration,

    /// Graceful-restart hold time advertised to neighbors
    pub spark_gr_hold_time: Duration,

    //
    // KvStore timers / limits
    //
    /// Periodic full-sync interval with a random peer
    pub kvstore_sync_interval: Duration,

    /// TTL applied to keys this node originates
    pub kvstore_key_ttl: Duration,

    /// Flood rate limit; `None` disables rate limiting
    pub kvstore_flood_rate: Option<FloodRate>,

    /// Drain interval for rate-limited buffered publications
    pub kvstore_flood_buffer_interval: Duration,

    //
    // LinkMonitor timers
    //
    /// Initial link-flap backoff
    pub link_flap_initial_backoff: Duration,

    /// Maximum link-flap backoff
    pub link_flap_max_backoff: Duration,

    /// Delay before the first adjacency advertisement
    pub adjacency_hold_time: Duration,

    /// Window for batching adjacency advertisements
    pub adjacency_throttle: Duration,

    //
    // PrefixManager timers
    //
    /// Window for batching prefix publications to the KvStore
    pub prefix_throttle: Duration,

    /// Sync interval for the prefix allocator's range elector
    pub prefix_alloc_sync_interval: Duration,

    //
    // Decision timers
    //
    /// Minimum debounce before an SPF run
    pub decision_debounce_min: Duration,

    /// Maximum debounce before an SPF run
    pub decision_debounce_max: Duration,

    /// Defer the first route publication by this much after start
    pub decision_graceful_restart_window: Duration,

    /// Interval of the ordered-FIB hold decrement tick
    pub ordered_fib_tick: Duration,

    /// Number of decision ticks a metric/overload change is held
    pub ordered_fib_hold_ticks: u64,

    //
    // Fib timers
    //
    /// Wait before first programming after start or agent restart
    pub fib_cold_start_duration: Duration,

    /// Poll interval for the agent's aliveSince epoch
    pub fib_keep_alive_interval: Duration,

    /// Initial backoff for FIB resync retries
    pub fib_sync_initial_backoff: Duration,

    /// Maximum backoff for FIB resync retries
    pub fib_sync_max_backoff: Duration,

    //
    // Persistent store
    //
    /// Backing file for the persistent config store
    pub config_store_path: PathBuf,

    /// Initial debounce for persistent-store flushes
    pub store_flush_initial_backoff: Duration,

    /// Maximum debounce for persistent-store flushes
    pub store_flush_max_backoff: Duration,

    //
    // TLS material
    //
    /// x509 certificate path; self-signed material is generated when unset
    pub tls_cert_path: Option<PathBuf>,

    /// x509 private-key path
    pub tls_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            domain: "default".to_string(),
            areas: vec![DEFAULT_AREA.to_string()],
            include_interface_regexes: vec![],
            exclude_interface_regexes: vec![],
            redistribute_interface_regexes: vec![],
            static_prefixes: vec![],
            enable_v4: false,
            enable_subnet_validation: true,
            enable_segment_routing: false,
            enable_lfa: false,
            enable_ordered_fib: false,
            enable_flood_optimization: false,
            is_flood_root: false,
            dryrun: false,
            enable_prefix_allocation: false,
            prefix_allocation_mode: PrefixAllocationMode::Seeded,
            per_prefix_keys: false,
            set_loopback_address: false,
            loopback_interface: "lo".to_string(),
            use_rtt_metric: true,
            enable_tls: false,
            kvstore_port: 60002,
            spark_mcast_port: 6666,
            fib_agent_port: 60100,
            system_agent_port: 60099,
            ctrl_port: 2018,
            spark_hello_time: Duration::from_secs(20),
            spark_fast_init_hello_time: Duration::from_millis(500),
            spark_handshake_time: Duration::from_millis(500),
            spark_heartbeat_time: Duration::from_secs(1),
            spark_negotiate_hold_time: Duration::from_secs(5),
            spark_heartbeat_hold_time: Duration::from_secs(5),
            spark_gr_hold_time: Duration::from_secs(30),
            kvstore_sync_interval: Duration::from_secs(60),
            kvstore_key_ttl: Duration::from_secs(300),
            kvstore_flood_rate: None,
            kvstore_flood_buffer_interval: Duration::from_millis(100),
            link_flap_initial_backoff: Duration::from_millis(1000),
            link_flap_max_backoff: Duration::from_secs(8),
            adjacency_hold_time: Duration::from_secs(4),
            adjacency_throttle: Duration::from_millis(100),
            prefix_throttle: Duration::from_millis(250),
            prefix_alloc_sync_interval: Duration::from_secs(1),
            decision_debounce_min: Duration::from_millis(100),
            decision_debounce_max: Duration::from_millis(250),
            decision_graceful_restart_window: Duration::from_secs(0),
            ordered_fib_tick: Duration::from_millis(100),
            ordered_fib_hold_ticks: 4,
            fib_cold_start_duration: Duration::from_secs(0),
            fib_keep_alive_interval: Duration::from_secs(1),
            fib_sync_initial_backoff: Duration::from_millis(64),
            fib_sync_max_backoff: Duration::from_millis(8192),
            config_store_path: PathBuf::from("/tmp/trellis_config_store"),
            store_flush_initial_backoff: Duration::from_millis(100),
            store_flush_max_backoff: Duration::from_secs(5),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// Called once at startup; any error here is fatal. Also compiles the
    /// interface regex lists and returns them so a bad pattern is caught
    /// before any component starts.
    pub fn validate(&self) -> Result<InterfaceMatchers> {
        if self.node_name.is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "node_name".to_string(),
            }
            .into());
        }
        if self.node_name.contains(':') {
            // ':' is the key-marker separator in KvStore keys
            return Err(ConfigError::InvalidValue {
                field: "node_name".to_string(),
                reason: "must not contain ':'".to_string(),
            }
            .into());
        }
        if self.areas.is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "areas".to_string(),
            }
            .into());
        }
        if self.spark_hello_time < self.spark_fast_init_hello_time {
            return Err(ConfigError::InvalidValue {
                field: "spark_hello_time".to_string(),
                reason: "must be >= spark_fast_init_hello_time".to_string(),
            }
            .into());
        }
        if self.spark_heartbeat_hold_time < self.spark_heartbeat_time {
            return Err(ConfigError::InvalidValue {
                field: "spark_heartbeat_hold_time".to_string(),
                reason: "must be >= spark_heartbeat_time".to_string(),
            }
            .into());
        }
        if self.decision_debounce_min > self.decision_debounce_max {
            return Err(ConfigError::InvalidValue {
                field: "decision_debounce_min".to_string(),
                reason: "must be <= decision_debounce_max".to_string(),
            }
            .into());
        }
        if self.link_flap_initial_backoff > self.link_flap_max_backoff {
            return Err(ConfigError::InvalidValue {
                field: "link_flap_initial_backoff".to_string(),
                reason: "must be <= link_flap_max_backoff".to_string(),
            }
            .into());
        }
        if let Some((rate, burst)) = self.kvstore_flood_rate {
            if rate <= 0.0 || burst == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "kvstore_flood_rate".to_string(),
                    reason: "rate and burst must be positive".to_string(),
                }
                .into());
            }
        }
        if self.enable_prefix_allocation {
            if let PrefixAllocationMode::Params {
                seed_prefix,
                alloc_prefix_len,
            } = &self.prefix_allocation_mode
            {
                validate_seed_prefix(seed_prefix, *alloc_prefix_len)?;
            }
        }
        for prefix in &self.static_prefixes {
            prefix.parse::<ipnet::IpNet>().map_err(|e| {
                crate::error::TrellisError::from(ConfigError::InvalidValue {
                    field: "static_prefixes".to_string(),
                    reason: format!("'{}': {}", prefix, e),
                })
            })?;
        }
        InterfaceMatchers::build(self)
    }

    /// TTL (in milliseconds) applied to originated KvStore keys
    pub fn key_ttl_ms(&self) -> i64 {
        self.kvstore_key_ttl.as_millis() as i64
    }

    /// The Spark IPv6 link-local multicast group
    pub fn spark_mcast_addr() -> Ipv6Addr {
        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)
    }
}

/// Parse and validate seed-prefix allocation parameters
///
/// Accepts the `<prefix>,<alloc_len>` form carried in the
/// `e2e-network-prefix` key, or the two parts separately.
pub fn validate_seed_prefix(seed_prefix: &str, alloc_prefix_len: u8) -> Result<ipnet::IpNet> {
    let net: ipnet::IpNet =
        seed_prefix
            .parse()
            .map_err(|e: ipnet::AddrParseError| ConfigError::InvalidSeedPrefix {
                prefix: seed_prefix.to_string(),
                reason: e.to_string(),
            })?;
    let max_len = match net {
        ipnet::IpNet::V4(_) => 32,
        ipnet::IpNet::V6(_) => 128,
    };
    if alloc_prefix_len <= net.prefix_len() || alloc_prefix_len > max_len {
        return Err(ConfigError::InvalidSeedPrefix {
            prefix: seed_prefix.to_string(),
            reason: format!(
                "allocation length {} outside ({}, {}]",
                alloc_prefix_len,
                net.prefix_len(),
                max_len
            ),
        }
        .into());
    }
    // cap the index space at 2^31 so indices fit the wire format
    if alloc_prefix_len - net.prefix_len() > 31 {
        return Err(ConfigError::InvalidSeedPrefix {
            prefix: seed_prefix.to_string(),
            reason: "allocation space exceeds 2^31 entries".to_string(),
        }
        .into());
    }
    Ok(net)
}
