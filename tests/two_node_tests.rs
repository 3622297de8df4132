//! Two-node end-to-end scenarios
//!
//! A pair of full nodes wired through the in-memory spark hub, with the
//! KvStore mesh running over real loopback TCP: adjacency bring-up, route
//! programming, withdrawal via per-prefix keys, and flap dampening.

mod common;

use common::{bring_up_interface, deadline, spawn_node, test_config};
use std::time::Duration;
use tempfile::TempDir;
use trellis::config::DEFAULT_AREA;
use trellis::link_monitor::PlatformEvent;
use trellis::protocol::net::parse_prefix;
use trellis::protocol::{PrefixEntry, PrefixType};
use trellis::spark::TestIoHub;

async fn two_linked_nodes(
    dir: &TempDir,
    per_prefix_keys: bool,
) -> (common::TestNode, common::TestNode) {
    let hub = TestIoHub::new();
    hub.link(("n1", "iface12"), ("n2", "iface21"));

    let mut c1 = test_config("n1", dir, "2001:db8:1::/64");
    c1.per_prefix_keys = per_prefix_keys;
    let mut c2 = test_config("n2", dir, "2001:db8:2::/64");
    c2.per_prefix_keys = per_prefix_keys;

    let n1 = spawn_node(&hub, c1).await;
    let n2 = spawn_node(&hub, c2).await;
    bring_up_interface(&n1.node, "iface12", 1);
    bring_up_interface(&n2.node, "iface21", 2);
    (n1, n2)
}

#[tokio::test]
async fn test_two_node_adjacency_and_routes() {
    let dir = TempDir::new().unwrap();
    let (n1, n2) = two_linked_nodes(&dir, false).await;

    // both stores converge on both adjacency databases
    let until = deadline(Duration::from_secs(10));
    loop {
        let mut converged = true;
        for node in [&n1.node, &n2.node] {
            let publication = node
                .kvstore()
                .get_key_vals(
                    DEFAULT_AREA,
                    vec!["adj:n1".to_string(), "adj:n2".to_string()],
                )
                .await
                .unwrap();
            converged &= publication.key_vals.len() == 2;
        }
        if converged {
            break;
        }
        assert!(std::time::Instant::now() < until, "adjacencies never converged");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // each node programs a route to the other's prefix
    let until = deadline(Duration::from_secs(10));
    loop {
        let r1 = n1.agent.unicast_routes();
        let r2 = n2.agent.unicast_routes();
        let ok1 = r1.keys().any(|p| p.to_string() == "2001:db8:2::/64");
        let ok2 = r2.keys().any(|p| p.to_string() == "2001:db8:1::/64");
        if ok1 && ok2 {
            break;
        }
        assert!(std::time::Instant::now() < until, "routes never programmed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // the control surface agrees with the agent
    let ctrl = n1.node.ctrl_api();
    let routes = ctrl.get_unicast_routes(vec![]).await.unwrap();
    assert!(!routes.is_empty());
    let adj_dbs = ctrl.get_decision_adjacency_dbs().await.unwrap();
    assert_eq!(adj_dbs.len(), 2);

    n1.node.stop().await;
    n2.node.stop().await;
}

#[tokio::test]
async fn test_prefix_withdraw_via_per_prefix_key() {
    let dir = TempDir::new().unwrap();
    let (n1, n2) = two_linked_nodes(&dir, true).await;

    // n1 advertises an extra prefix through the control surface
    let extra = PrefixEntry {
        prefix: Some(parse_prefix("2001:db8:f00d::/64").unwrap()),
        prefix_type: PrefixType::Default as i32,
        data: Vec::new(),
        forwarding_type: 0,
        forwarding_algorithm: 0,
        ephemeral: false,
        mv: None,
    };
    let ctrl1 = n1.node.ctrl_api();
    ctrl1.advertise_prefixes(vec![extra.clone()]).await.unwrap();

    // n2 installs the route
    let until = deadline(Duration::from_secs(10));
    loop {
        if n2
            .agent
            .unicast_routes()
            .keys()
            .any(|p| p.to_string() == "2001:db8:f00d::/64")
        {
            break;
        }
        assert!(std::time::Instant::now() < until, "route never appeared");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // withdraw: the tombstone travels ahead of TTL expiry
    ctrl1.withdraw_prefixes(vec![extra]).await.unwrap();
    let until = deadline(Duration::from_secs(10));
    loop {
        if !n2
            .agent
            .unicast_routes()
            .keys()
            .any(|p| p.to_string() == "2001:db8:f00d::/64")
        {
            break;
        }
        assert!(std::time::Instant::now() < until, "route never withdrawn");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    n1.node.stop().await;
    n2.node.stop().await;
}

#[tokio::test]
async fn test_link_flap_dampening() {
    let dir = TempDir::new().unwrap();
    let hub = TestIoHub::new();
    let node = spawn_node(&hub, test_config("flappy", &dir, "2001:db8::/64")).await;
    bring_up_interface(&node.node, "iface1", 1);

    let ctrl = node.node.ctrl_api();
    let until = deadline(Duration::from_secs(5));
    loop {
        let interfaces = ctrl.get_interfaces().await.unwrap();
        if interfaces.iter().any(|i| i.if_name == "iface1" && i.is_up) {
            break;
        }
        assert!(std::time::Instant::now() < until, "interface never up");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // flap down/up quickly: the interface reports down while dampened
    let writer = node.node.platform_event_writer();
    for is_up in [false, true] {
        writer
            .push(PlatformEvent::Link {
                if_name: "iface1".to_string(),
                if_index: 1,
                is_up,
                weight: 1,
            })
            .unwrap();
    }
    let until = deadline(Duration::from_secs(5));
    loop {
        let interfaces = ctrl.get_interfaces().await.unwrap();
        if interfaces.iter().any(|i| i.if_name == "iface1" && !i.is_up) {
            break;
        }
        assert!(std::time::Instant::now() < until, "dampening never observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // and recovers once the backoff clears
    let until = deadline(Duration::from_secs(5));
    loop {
        let interfaces = ctrl.get_interfaces().await.unwrap();
        if interfaces.iter().any(|i| i.if_name == "iface1" && i.is_up) {
            break;
        }
        assert!(std::time::Instant::now() < until, "interface never recovered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    node.node.stop().await;
}

#[tokio::test]
async fn test_long_poll_over_ctrl_api() {
    let dir = TempDir::new().unwrap();
    let (n1, n2) = two_linked_nodes(&dir, false).await;

    // wait until n1 knows both adjacencies
    let until = deadline(Duration::from_secs(10));
    loop {
        let publication = n1
            .node
            .kvstore()
            .get_key_vals(
                DEFAULT_AREA,
                vec!["adj:n1".to_string(), "adj:n2".to_string()],
            )
            .await
            .unwrap();
        if publication.key_vals.len() == 2 {
            break;
        }
        assert!(std::time::Instant::now() < until, "adjacencies never converged");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // a stale (empty) snapshot completes immediately with "changed"
    let ctrl = n1.node.ctrl_api();
    let changed = ctrl
        .long_poll_kvstore_adj(DEFAULT_AREA.to_string(), Default::default())
        .await
        .unwrap();
    assert!(changed);

    n1.node.stop().await;
    n2.node.stop().await;
}
