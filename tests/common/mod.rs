//! Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trellis::fib::MockFibAgent;
use trellis::link_monitor::PlatformEvent;
use trellis::protocol::net::parse_prefix;
use trellis::spark::TestIoHub;
use trellis::{Config, Node};

/// A node wired to the in-memory spark hub with a recording FIB agent
pub struct TestNode {
    pub node: Node,
    pub agent: Arc<MockFibAgent>,
}

/// Build a config tuned for fast test convergence
pub fn test_config(name: &str, dir: &TempDir, static_prefix: &str) -> Config {
    Config {
        node_name: name.to_string(),
        include_interface_regexes: vec!["iface.*".to_string()],
        static_prefixes: vec![static_prefix.to_string()],
        kvstore_port: 0,
        kvstore_sync_interval: Duration::from_secs(3600),
        adjacency_hold_time: Duration::from_millis(50),
        adjacency_throttle: Duration::from_millis(20),
        prefix_throttle: Duration::from_millis(20),
        decision_debounce_min: Duration::from_millis(10),
        decision_debounce_max: Duration::from_millis(50),
        spark_hello_time: Duration::from_millis(200),
        spark_fast_init_hello_time: Duration::from_millis(50),
        spark_handshake_time: Duration::from_millis(50),
        spark_heartbeat_time: Duration::from_millis(60),
        spark_negotiate_hold_time: Duration::from_millis(600),
        spark_heartbeat_hold_time: Duration::from_millis(500),
        link_flap_initial_backoff: Duration::from_millis(100),
        link_flap_max_backoff: Duration::from_millis(800),
        config_store_path: dir.path().join(format!("{}-store", name)),
        ..Default::default()
    }
}

/// Build and start a node attached to the hub
pub async fn spawn_node(hub: &TestIoHub, config: Config) -> TestNode {
    let agent = Arc::new(MockFibAgent::new());
    let node = Node::builder(config.clone())
        .with_io_provider(hub.provider(config.node_name.clone()))
        .with_fib_agent(Arc::clone(&agent) as Arc<dyn trellis::FibAgent>)
        .build()
        .await
        .expect("node failed to build");
    TestNode { node, agent }
}

/// Bring one interface up with a loopback-reachable transport address
pub fn bring_up_interface(node: &Node, if_name: &str, if_index: i32) {
    let writer = node.platform_event_writer();
    writer
        .push(PlatformEvent::Link {
            if_name: if_name.to_string(),
            if_index,
            is_up: true,
            weight: 1,
        })
        .unwrap();
    writer
        .push(PlatformEvent::Address {
            if_name: if_name.to_string(),
            prefix: parse_prefix("::1/128").unwrap(),
            is_valid: true,
        })
        .unwrap();
}

/// Deadline helper for polling loops
pub fn deadline(timeout: Duration) -> std::time::Instant {
    std::time::Instant::now() + timeout
}
