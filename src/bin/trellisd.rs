//! Trellis routing daemon
//!
//! One process per node: parses flags into a [`Config`], builds the node,
//! and runs until SIGINT/SIGTERM. Configuration errors exit non-zero with
//! a diagnostic; everything after startup retries instead of dying.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use trellis::{Config, Node, PrefixAllocationMode};

#[derive(Parser, Debug)]
#[command(name = "trellisd", about = "Trellis link-state routing daemon")]
struct Cli {
    /// Node name, unique within the routing domain
    #[arg(long)]
    node_name: String,

    /// Routing domain tag
    #[arg(long, default_value = "default")]
    domain: String,

    /// KvStore areas, repeatable
    #[arg(long = "area", default_value = "0")]
    areas: Vec<String>,

    /// Interface regexes to run discovery on, repeatable
    #[arg(long = "iface-regex-include")]
    include_regexes: Vec<String>,

    /// Interface regexes to never run discovery on, repeatable
    #[arg(long = "iface-regex-exclude")]
    exclude_regexes: Vec<String>,

    /// Interface regexes whose addresses are advertised, repeatable
    #[arg(long = "redistribute-iface-regex")]
    redistribute_regexes: Vec<String>,

    /// Static prefixes to always advertise, repeatable
    #[arg(long = "static-prefix")]
    static_prefixes: Vec<String>,

    /// Seed prefix and allocation length, e.g. "fc00:cafe::/56,64"
    #[arg(long)]
    seed_prefix: Option<String>,

    /// Elect a unique subprefix from the seed
    #[arg(long)]
    enable_prefix_alloc: bool,

    /// Advertise each prefix under its own KvStore key
    #[arg(long)]
    per_prefix_keys: bool,

    /// Program the elected prefix onto the loopback
    #[arg(long)]
    set_loopback_address: bool,

    /// Loopback interface name
    #[arg(long, default_value = "lo")]
    loopback_iface: String,

    /// Exchange IPv4 addresses and compute IPv4 routes
    #[arg(long)]
    enable_v4: bool,

    /// Allocate labels and compute MPLS routes
    #[arg(long)]
    enable_segment_routing: bool,

    /// Compute loop-free alternate next-hops
    #[arg(long)]
    enable_lfa: bool,

    /// Ordered FIB programming holds
    #[arg(long)]
    enable_ordered_fib: bool,

    /// DUAL-based flood optimization
    #[arg(long)]
    enable_flood_optimization: bool,

    /// Advertise this node as a flood root
    #[arg(long)]
    is_flood_root: bool,

    /// Skip all forwarding-agent calls
    #[arg(long)]
    dryrun: bool,

    /// Wrap KvStore peer connections in TLS 1.3
    #[arg(long)]
    enable_tls: bool,

    /// TCP port of the KvStore peer listener
    #[arg(long, default_value_t = 60002)]
    kvstore_port: u16,

    /// UDP multicast port for hello packets
    #[arg(long, default_value_t = 6666)]
    spark_mcast_port: u16,

    /// TCP port of the forwarding agent
    #[arg(long, default_value_t = 60100)]
    fib_agent_port: u16,

    /// Control-plane port advertised to neighbors
    #[arg(long, default_value_t = 2018)]
    ctrl_port: u16,

    /// Steady-state hello interval in seconds
    #[arg(long, default_value_t = 20)]
    hello_interval_s: u64,

    /// Heartbeat hold time in seconds
    #[arg(long, default_value_t = 5)]
    heartbeat_hold_s: u64,

    /// Graceful-restart hold time in seconds
    #[arg(long, default_value_t = 30)]
    gr_hold_s: u64,

    /// Delay before the first adjacency advertisement, in seconds
    #[arg(long, default_value_t = 4)]
    adj_hold_s: u64,

    /// Initial link-flap backoff in milliseconds
    #[arg(long, default_value_t = 1000)]
    flap_initial_backoff_ms: u64,

    /// Maximum link-flap backoff in milliseconds
    #[arg(long, default_value_t = 8000)]
    flap_max_backoff_ms: u64,

    /// Path of the persistent config store
    #[arg(long, default_value = "/var/lib/trellis/config_store")]
    config_store_path: PathBuf,

    /// DER-encoded x509 certificate for the peer transport
    #[arg(long)]
    tls_cert_path: Option<PathBuf>,

    /// DER-encoded private key for the peer transport
    #[arg(long)]
    tls_key_path: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Config {
        let prefix_allocation_mode = match &self.seed_prefix {
            Some(raw) => match raw.split_once(',') {
                Some((prefix, len)) => PrefixAllocationMode::Params {
                    seed_prefix: prefix.trim().to_string(),
                    alloc_prefix_len: len.trim().parse().unwrap_or(0),
                },
                None => PrefixAllocationMode::Seeded,
            },
            None => PrefixAllocationMode::Seeded,
        };
        Config {
            node_name: self.node_name,
            domain: self.domain,
            areas: self.areas,
            include_interface_regexes: self.include_regexes,
            exclude_interface_regexes: self.exclude_regexes,
            redistribute_interface_regexes: self.redistribute_regexes,
            static_prefixes: self.static_prefixes,
            enable_v4: self.enable_v4,
            enable_segment_routing: self.enable_segment_routing,
            enable_lfa: self.enable_lfa,
            enable_ordered_fib: self.enable_ordered_fib,
            enable_flood_optimization: self.enable_flood_optimization,
            is_flood_root: self.is_flood_root,
            dryrun: self.dryrun,
            enable_prefix_allocation: self.enable_prefix_alloc,
            prefix_allocation_mode,
            per_prefix_keys: self.per_prefix_keys,
            set_loopback_address: self.set_loopback_address,
            loopback_interface: self.loopback_iface,
            enable_tls: self.enable_tls,
            kvstore_port: self.kvstore_port,
            spark_mcast_port: self.spark_mcast_port,
            fib_agent_port: self.fib_agent_port,
            ctrl_port: self.ctrl_port,
            spark_hello_time: Duration::from_secs(self.hello_interval_s),
            spark_heartbeat_hold_time: Duration::from_secs(self.heartbeat_hold_s),
            spark_gr_hold_time: Duration::from_secs(self.gr_hold_s),
            adjacency_hold_time: Duration::from_secs(self.adj_hold_s),
            link_flap_initial_backoff: Duration::from_millis(self.flap_initial_backoff_ms),
            link_flap_max_backoff: Duration::from_millis(self.flap_max_backoff_ms),
            config_store_path: self.config_store_path,
            tls_cert_path: self.tls_cert_path,
            tls_key_path: self.tls_key_path,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_config();

    let node = match Node::builder(config).build().await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("trellisd: startup failed: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("trellisd running; send SIGINT to stop");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(e) => tracing::warn!("signal listener failed: {}", e),
    }
    node.stop().await;
}
