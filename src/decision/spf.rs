//! Shortest-path computation and route building
//!
//! Dijkstra over the [`LinkState`] graph with ECMP first-hop tracking,
//! optional loop-free alternates, best-path selection across multiple
//! advertisers of a prefix, and MPLS route generation for segment
//! routing.

use crate::decision::link_state::{LinkState, LinkStateMetric};
use crate::protocol::{
    IpPrefix, MetricVector, MplsAction, MplsActionCode, MplsRoute, NextHop, PrefixEntry,
    PrefixType, RouteDatabase, UnicastRoute,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// SPF output for one destination node
#[derive(Debug, Clone, Default)]
pub struct SpfNode {
    /// Shortest distance from the root
    pub distance: LinkStateMetric,
    /// Neighbor(s) of the root on the shortest path(s)
    pub first_hops: HashSet<String>,
}

/// Run Dijkstra from `root`
///
/// Overloaded nodes never carry transit traffic: their links are not
/// expanded (unless the overloaded node is the root itself), but they
/// remain reachable as destinations.
pub fn run_spf(link_state: &LinkState, root: &str) -> HashMap<String, SpfNode> {
    let mut result: HashMap<String, SpfNode> = HashMap::new();
    if !link_state.has_node(root) {
        return result;
    }
    result.insert(
        root.to_string(),
        SpfNode {
            distance: 0,
            first_hops: HashSet::new(),
        },
    );

    // (distance, node) min-heap; stale entries skipped on pop
    let mut heap: BinaryHeap<Reverse<(LinkStateMetric, String)>> = BinaryHeap::new();
    heap.push(Reverse((0, root.to_string())));
    let mut settled: HashSet<String> = HashSet::new();

    while let Some(Reverse((distance, node))) = heap.pop() {
        if !settled.insert(node.clone()) {
            continue;
        }
        // overloaded nodes do not forward transit traffic
        if node != root && link_state.is_node_overloaded(&node) {
            continue;
        }
        for id in link_state.links_from_node(&node) {
            let link = match link_state.link(id) {
                Some(link) => link,
                None => continue,
            };
            if !link.is_up() {
                continue;
            }
            let neighbor = link.other_node(&node).to_string();
            let candidate = distance + link.metric_from(&node);

            // first-hops carry the root's neighbor on each shortest path
            let hops_via_node: HashSet<String> = if node == root {
                [neighbor.clone()].into_iter().collect()
            } else {
                result
                    .get(&node)
                    .map(|entry| entry.first_hops.clone())
                    .unwrap_or_default()
            };

            match result.get_mut(&neighbor) {
                None => {
                    result.insert(
                        neighbor.clone(),
                        SpfNode {
                            distance: candidate,
                            first_hops: hops_via_node,
                        },
                    );
                    heap.push(Reverse((candidate, neighbor)));
                }
                Some(entry) => {
                    if candidate < entry.distance {
                        entry.distance = candidate;
                        entry.first_hops = hops_via_node;
                        heap.push(Reverse((candidate, neighbor)));
                    } else if candidate == entry.distance {
                        // equal-cost path: merge first-hops
                        entry.first_hops.extend(hops_via_node);
                    }
                }
            }
        }
    }
    result
}

/// Compare two metric vectors, larger (lexicographically) wins
fn mv_better(a: &MetricVector, b: &MetricVector) -> bool {
    a.metrics > b.metrics
}

/// Preference rank of a prefix origin type; smaller wins
fn type_preference(prefix_type: i32) -> u8 {
    match PrefixType::try_from(prefix_type) {
        Ok(PrefixType::Loopback) => 0,
        Ok(PrefixType::Default) => 1,
        Ok(PrefixType::Bgp) => 2,
        Ok(PrefixType::PrefixAllocator) => 3,
        Ok(PrefixType::Breeze) => 4,
        Err(_) => u8::MAX,
    }
}

/// Outcome of best-path selection for one prefix
#[derive(Debug, Default)]
pub struct BestPaths {
    /// Nodes whose advertisement won (ECMP set)
    pub nodes: HashSet<String>,
    /// The deterministic single best node (lowest name among winners)
    pub best_node: String,
    /// IGP distance to the best node
    pub best_igp_metric: LinkStateMetric,
}

/// Select the winning advertisers of one prefix
///
/// Type preference first, then the advertised metric vector when every
/// candidate has one, then IGP distance, then lowest originator name.
pub fn select_best_paths(
    advertisers: &HashMap<String, PrefixEntry>,
    spf: &HashMap<String, SpfNode>,
) -> Option<BestPaths> {
    // only reachable advertisers count
    let reachable: Vec<(&String, &PrefixEntry)> = advertisers
        .iter()
        .filter(|(node, _)| spf.contains_key(*node))
        .collect();
    if reachable.is_empty() {
        return None;
    }

    let best_rank = reachable
        .iter()
        .map(|(_, entry)| type_preference(entry.prefix_type))
        .min()?;
    let of_type: Vec<&(&String, &PrefixEntry)> = reachable
        .iter()
        .filter(|(_, entry)| type_preference(entry.prefix_type) == best_rank)
        .collect();

    // metric-vector tie-break applies only when every candidate has one
    let all_have_mv = of_type.iter().all(|(_, entry)| entry.mv.is_some());
    let mv_winners: Vec<&(&String, &PrefixEntry)> = if all_have_mv {
        let best_mv = of_type
            .iter()
            .map(|(_, entry)| entry.mv.clone().unwrap_or_default())
            .fold(None::<MetricVector>, |best, mv| match best {
                None => Some(mv),
                Some(current) => {
                    if mv_better(&mv, &current) {
                        Some(mv)
                    } else {
                        Some(current)
                    }
                }
            });
        match best_mv {
            Some(best_mv) => of_type
                .iter()
                .filter(|(_, entry)| entry.mv.as_ref() == Some(&best_mv))
                .copied()
                .collect(),
            None => of_type.iter().copied().collect(),
        }
    } else {
        of_type.iter().copied().collect()
    };

    let best_distance = mv_winners
        .iter()
        .filter_map(|(node, _)| spf.get(*node).map(|e| e.distance))
        .min()?;
    let nodes: HashSet<String> = mv_winners
        .iter()
        .filter(|(node, _)| spf.get(*node).map(|e| e.distance) == Some(best_distance))
        .map(|(node, _)| (*node).clone())
        .collect();
    let best_node = nodes.iter().min().cloned()?;
    Some(BestPaths {
        nodes,
        best_node,
        best_igp_metric: best_distance,
    })
}

/// Flags controlling route building
#[derive(Debug, Clone, Copy, Default)]
pub struct SpfOptions {
    /// Compute IPv4 routes too
    pub enable_v4: bool,
    /// Add loop-free alternate next-hops
    pub enable_lfa: bool,
    /// Emit MPLS routes for node/adjacency labels
    pub enable_segment_routing: bool,
}

/// The SPF solver: cached per-root SPF runs over one graph revision
pub struct SpfSolver<'a> {
    link_state: &'a LinkState,
    options: SpfOptions,
    spf_cache: HashMap<String, HashMap<String, SpfNode>>,
}

impl<'a> SpfSolver<'a> {
    /// Build a solver over the current graph
    pub fn new(link_state: &'a LinkState, options: SpfOptions) -> Self {
        Self {
            link_state,
            options,
            spf_cache: HashMap::new(),
        }
    }

    fn spf_from(&mut self, root: &str) -> &HashMap<String, SpfNode> {
        if !self.spf_cache.contains_key(root) {
            let result = run_spf(self.link_state, root);
            self.spf_cache.insert(root.to_string(), result);
        }
        &self.spf_cache[root]
    }

    /// Build the full route database from `my_node`'s perspective
    ///
    /// `prefix_entries` maps advertising node -> (prefix -> entry).
    pub fn build_route_db(
        &mut self,
        my_node: &str,
        prefix_entries: &HashMap<String, HashMap<IpPrefix, PrefixEntry>>,
    ) -> RouteDatabase {
        let mut db = RouteDatabase {
            this_node_name: my_node.to_string(),
            ..Default::default()
        };
        if !self.link_state.has_node(my_node) {
            return db;
        }
        let my_spf = self.spf_from(my_node).clone();

        // group advertisers per prefix
        let mut by_prefix: HashMap<IpPrefix, HashMap<String, PrefixEntry>> = HashMap::new();
        for (node, prefixes) in prefix_entries {
            for (prefix, entry) in prefixes {
                by_prefix
                    .entry(prefix.clone())
                    .or_default()
                    .insert(node.clone(), entry.clone());
            }
        }

        for (prefix, advertisers) in by_prefix {
            // never install routes toward our own prefixes
            if advertisers.len() == 1 && advertisers.contains_key(my_node) {
                continue;
            }
            if prefix.is_v4() && !self.options.enable_v4 {
                continue;
            }
            let mut candidates = advertisers;
            candidates.remove(my_node);
            let best = match select_best_paths(&candidates, &my_spf) {
                Some(best) => best,
                None => continue,
            };
            let next_hops = self.next_hops_toward(my_node, &best.nodes, &my_spf, prefix.is_v4());
            if next_hops.is_empty() {
                debug!("no usable next-hops for {}", prefix);
                continue;
            }
            db.unicast_routes.push(UnicastRoute {
                dest: Some(prefix),
                next_hops,
            });
        }

        if self.options.enable_segment_routing {
            self.build_mpls_routes(my_node, &my_spf, &mut db);
        }

        // deterministic output order
        db.unicast_routes.sort_by(|a, b| {
            let ka = a.dest.as_ref().map(|p| (p.prefix_address.clone(), p.prefix_length));
            let kb = b.dest.as_ref().map(|p| (p.prefix_address.clone(), p.prefix_length));
            ka.cmp(&kb)
        });
        db.mpls_routes.sort_by_key(|r| r.top_label);
        db
    }

    /// ECMP (plus LFA) next-hops from `my_node` toward a set of
    /// destination nodes
    fn next_hops_toward(
        &mut self,
        my_node: &str,
        dest_nodes: &HashSet<String>,
        my_spf: &HashMap<String, SpfNode>,
        want_v4: bool,
    ) -> Vec<NextHop> {
        let mut next_hops: HashSet<NextHop> = HashSet::new();
        for dest in dest_nodes {
            let spf_entry = match my_spf.get(dest) {
                Some(entry) => entry,
                None => continue,
            };
            // shortest-path first-hops
            for first_hop in &spf_entry.first_hops {
                next_hops.extend(self.hops_via_neighbor(
                    my_node,
                    first_hop,
                    spf_entry.distance,
                    want_v4,
                ));
            }
            // loop-free alternates: a neighbor qualifies when its own
            // shortest path to the destination avoids us entirely
            if self.options.enable_lfa {
                let neighbors = self.direct_neighbors(my_node);
                for neighbor in neighbors {
                    if spf_entry.first_hops.contains(&neighbor) {
                        continue;
                    }
                    let neighbor_spf = self.spf_from(&neighbor).clone();
                    let (nbr_to_dest, nbr_to_me) = match (
                        neighbor_spf.get(dest),
                        neighbor_spf.get(my_node),
                    ) {
                        (Some(d), Some(m)) => (d.distance, m.distance),
                        _ => continue,
                    };
                    if nbr_to_dest < nbr_to_me + spf_entry.distance {
                        let via = self.link_metric(my_node, &neighbor);
                        next_hops.extend(self.hops_via_neighbor(
                            my_node,
                            &neighbor,
                            via + nbr_to_dest,
                            want_v4,
                        ));
                    }
                }
            }
        }
        let mut next_hops: Vec<NextHop> = next_hops.into_iter().collect();
        next_hops.sort_by(|a, b| {
            (a.metric, a.address.clone().unwrap_or_default().addr)
                .cmp(&(b.metric, b.address.clone().unwrap_or_default().addr))
        });
        next_hops
    }

    fn direct_neighbors(&self, node: &str) -> Vec<String> {
        let mut neighbors: HashSet<String> = HashSet::new();
        for id in self.link_state.links_from_node(node) {
            if let Some(link) = self.link_state.link(id) {
                if link.is_up() {
                    neighbors.insert(link.other_node(node).to_string());
                }
            }
        }
        neighbors.into_iter().collect()
    }

    fn link_metric(&self, node: &str, neighbor: &str) -> LinkStateMetric {
        self.link_state
            .links_from_node(node)
            .into_iter()
            .filter_map(|id| self.link_state.link(id))
            .filter(|link| link.is_up() && link.other_node(node) == neighbor)
            .map(|link| link.metric_from(node))
            .min()
            .unwrap_or(LinkStateMetric::MAX)
    }

    /// Concrete next-hop addresses over every up link to `neighbor`
    fn hops_via_neighbor(
        &self,
        my_node: &str,
        neighbor: &str,
        metric: LinkStateMetric,
        want_v4: bool,
    ) -> Vec<NextHop> {
        let mut hops = Vec::new();
        let best = self.link_metric(my_node, neighbor);
        for id in self.link_state.links_from_node(my_node) {
            let link = match self.link_state.link(id) {
                Some(link) => link,
                None => continue,
            };
            if !link.is_up()
                || link.other_node(my_node) != neighbor
                || link.metric_from(my_node) != best
            {
                continue;
            }
            let address = if want_v4 {
                link.nh_v4_from(my_node).cloned()
            } else {
                link.nh_v6_from(my_node).cloned()
            };
            if let Some(address) = address {
                hops.push(NextHop {
                    address: Some(address),
                    metric,
                    mpls_action: None,
                });
            }
        }
        hops
    }

    fn build_mpls_routes(
        &mut self,
        my_node: &str,
        my_spf: &HashMap<String, SpfNode>,
        db: &mut RouteDatabase,
    ) {
        // node labels: swap toward the owner, php on the last hop
        for (node, adj_db) in self.link_state.adjacency_databases() {
            if adj_db.node_label == 0 {
                continue;
            }
            if node == my_node {
                // our own label terminates here
                db.mpls_routes.push(MplsRoute {
                    top_label: adj_db.node_label,
                    next_hops: vec![NextHop {
                        address: None,
                        metric: 0,
                        mpls_action: Some(MplsAction {
                            action: MplsActionCode::Pop as i32,
                            swap_label: None,
                            push_labels: Vec::new(),
                        }),
                    }],
                });
                continue;
            }
            let spf_entry = match my_spf.get(node) {
                Some(entry) => entry,
                None => continue,
            };
            let is_neighbor_dest = spf_entry.first_hops.contains(node);
            let mut next_hops = Vec::new();
            for first_hop in &spf_entry.first_hops {
                for mut hop in self.hops_via_neighbor(my_node, first_hop, spf_entry.distance, false)
                {
                    hop.mpls_action = Some(if is_neighbor_dest {
                        MplsAction {
                            action: MplsActionCode::PhpPop as i32,
                            swap_label: None,
                            push_labels: Vec::new(),
                        }
                    } else {
                        MplsAction {
                            action: MplsActionCode::Swap as i32,
                            swap_label: Some(adj_db.node_label),
                            push_labels: Vec::new(),
                        }
                    });
                    next_hops.push(hop);
                }
            }
            if !next_hops.is_empty() {
                db.mpls_routes.push(MplsRoute {
                    top_label: adj_db.node_label,
                    next_hops,
                });
            }
        }

        // adjacency labels: one php route per local link
        for id in self.link_state.links_from_node(my_node) {
            let link = match self.link_state.link(id) {
                Some(link) => link,
                None => continue,
            };
            let label = link.adj_label_from(my_node);
            if label == 0 || !link.is_up() {
                continue;
            }
            if let Some(address) = link.nh_v6_from(my_node).cloned() {
                db.mpls_routes.push(MplsRoute {
                    top_label: label,
                    next_hops: vec![NextHop {
                        address: Some(address),
                        metric: link.metric_from(my_node),
                        mpls_action: Some(MplsAction {
                            action: MplsActionCode::PhpPop as i32,
                            swap_label: None,
                            push_labels: Vec::new(),
                        }),
                    }],
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::net::parse_prefix;
    use crate::protocol::{Adjacency, AdjacencyDatabase, BinaryAddress};

    fn adj(other: &str, if_name: &str, other_if: &str, metric: u64, nh_host: u16) -> Adjacency {
        Adjacency {
            other_node_name: other.to_string(),
            if_name: if_name.to_string(),
            other_if_name: other_if.to_string(),
            next_hop_v6: Some(BinaryAddress {
                addr: std::net::Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, nh_host)
                    .octets()
                    .to_vec(),
                if_name: Some(if_name.to_string()),
            }),
            next_hop_v4: None,
            metric,
            adj_label: 0,
            is_overloaded: false,
            rtt_us: 0,
            timestamp_ms: 0,
            weight: 1,
        }
    }

    fn adj_db(node: &str, adjacencies: Vec<Adjacency>) -> AdjacencyDatabase {
        AdjacencyDatabase {
            this_node_name: node.to_string(),
            is_overloaded: false,
            adjacencies,
            node_label: 0,
            area: "0".to_string(),
            perf_events: None,
        }
    }

    fn entry(prefix: &str, prefix_type: PrefixType) -> PrefixEntry {
        PrefixEntry {
            prefix: Some(parse_prefix(prefix).unwrap()),
            prefix_type: prefix_type as i32,
            data: Vec::new(),
            forwarding_type: 0,
            forwarding_algorithm: 0,
            ephemeral: false,
            mv: None,
        }
    }

    /// n1 -- n2 -- n3 line topology, all metrics 1
    fn line_topology() -> LinkState {
        let mut state = LinkState::new();
        state.update_adjacency_database(
            adj_db("n1", vec![adj("n2", "if12", "if21", 1, 2)]),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n2",
                vec![
                    adj("n1", "if21", "if12", 1, 1),
                    adj("n3", "if23", "if32", 1, 3),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db("n3", vec![adj("n2", "if32", "if23", 1, 2)]),
            0,
            0,
        );
        state
    }

    /// full triangle n1-n2-n3, all metrics 1
    fn triangle_topology() -> LinkState {
        let mut state = LinkState::new();
        state.update_adjacency_database(
            adj_db(
                "n1",
                vec![
                    adj("n2", "if12", "if21", 1, 2),
                    adj("n3", "if13", "if31", 1, 3),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n2",
                vec![
                    adj("n1", "if21", "if12", 1, 1),
                    adj("n3", "if23", "if32", 1, 3),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n3",
                vec![
                    adj("n1", "if31", "if13", 1, 1),
                    adj("n2", "if32", "if23", 1, 2),
                ],
            ),
            0,
            0,
        );
        state
    }

    #[test]
    fn test_spf_distances_on_line() {
        let state = line_topology();
        let spf = run_spf(&state, "n1");
        assert_eq!(spf["n1"].distance, 0);
        assert_eq!(spf["n2"].distance, 1);
        assert_eq!(spf["n3"].distance, 2);
        // n3 is reached through n2
        assert_eq!(
            spf["n3"].first_hops,
            ["n2".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_spf_ecmp_first_hops() {
        // square: n1-n2-n4 and n1-n3-n4, all metric 1
        let mut state = LinkState::new();
        state.update_adjacency_database(
            adj_db(
                "n1",
                vec![
                    adj("n2", "if12", "if21", 1, 2),
                    adj("n3", "if13", "if31", 1, 3),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n2",
                vec![
                    adj("n1", "if21", "if12", 1, 1),
                    adj("n4", "if24", "if42", 1, 4),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n3",
                vec![
                    adj("n1", "if31", "if13", 1, 1),
                    adj("n4", "if34", "if43", 1, 4),
                ],
            ),
            0,
            0,
        );
        state.update_adjacency_database(
            adj_db(
                "n4",
                vec![
                    adj("n2", "if42", "if24", 1, 2),
                    adj("n3", "if43", "if34", 1, 3),
                ],
            ),
            0,
            0,
        );

        let spf = run_spf(&state, "n1");
        assert_eq!(spf["n4"].distance, 2);
        assert_eq!(
            spf["n4"].first_hops,
            ["n2".to_string(), "n3".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_overloaded_node_not_transit() {
        let mut state = line_topology();
        let mut overloaded = adj_db(
            "n2",
            vec![
                adj("n1", "if21", "if12", 1, 1),
                adj("n3", "if23", "if32", 1, 3),
            ],
        );
        overloaded.is_overloaded = true;
        state.update_adjacency_database(overloaded, 0, 0);

        let spf = run_spf(&state, "n1");
        // n2 still reachable as a destination
        assert_eq!(spf["n2"].distance, 1);
        // n3 is not, since the only path transits n2
        assert!(!spf.contains_key("n3"));
    }

    #[test]
    fn test_route_to_remote_prefix() {
        let state = line_topology();
        let mut solver = SpfSolver::new(&state, SpfOptions::default());
        let mut prefix_entries: HashMap<String, HashMap<IpPrefix, PrefixEntry>> = HashMap::new();
        let p3 = entry("2001:db8:3::/64", PrefixType::Loopback);
        prefix_entries.entry("n3".to_string()).or_default().insert(
            p3.prefix.clone().unwrap(),
            p3,
        );

        let db = solver.build_route_db("n1", &prefix_entries);
        assert_eq!(db.unicast_routes.len(), 1);
        let route = &db.unicast_routes[0];
        assert_eq!(route.dest.as_ref().unwrap().to_string(), "2001:db8:3::/64");
        assert_eq!(route.next_hops.len(), 1);
        assert_eq!(route.next_hops[0].metric, 2);
        // next-hop is n2's link-local on if12
        let address = route.next_hops[0].address.as_ref().unwrap();
        assert_eq!(address.if_name.as_deref(), Some("if12"));
    }

    #[test]
    fn test_own_prefix_not_installed() {
        let state = line_topology();
        let mut solver = SpfSolver::new(&state, SpfOptions::default());
        let mut prefix_entries: HashMap<String, HashMap<IpPrefix, PrefixEntry>> = HashMap::new();
        let p1 = entry("2001:db8:1::/64", PrefixType::Loopback);
        prefix_entries.entry("n1".to_string()).or_default().insert(
            p1.prefix.clone().unwrap(),
            p1,
        );
        let db = solver.build_route_db("n1", &prefix_entries);
        assert!(db.unicast_routes.is_empty());
    }

    #[test]
    fn test_lfa_adds_triangle_alternate() {
        let state = triangle_topology();
        let mut solver = SpfSolver::new(
            &state,
            SpfOptions {
                enable_lfa: true,
                ..Default::default()
            },
        );
        let mut prefix_entries: HashMap<String, HashMap<IpPrefix, PrefixEntry>> = HashMap::new();
        let p3 = entry("2001:db8:3::/64", PrefixType::Loopback);
        prefix_entries.entry("n3".to_string()).or_default().insert(
            p3.prefix.clone().unwrap(),
            p3,
        );

        let db = solver.build_route_db("n1", &prefix_entries);
        assert_eq!(db.unicast_routes.len(), 1);
        let route = &db.unicast_routes[0];
        // primary via the direct n1-n3 link plus the LFA via n2
        // (n2's path to n3 is direct and avoids n1: 1 < 1 + 1)
        assert_eq!(route.next_hops.len(), 2);
        let metrics: Vec<u64> = route.next_hops.iter().map(|h| h.metric).collect();
        assert!(metrics.contains(&1)); // direct
        assert!(metrics.contains(&2)); // via n2
    }

    #[test]
    fn test_best_path_type_preference() {
        let state = line_topology();
        let spf = run_spf(&state, "n1");
        let mut advertisers = HashMap::new();
        advertisers.insert("n2".to_string(), entry("2001:db8::/64", PrefixType::Bgp));
        advertisers.insert(
            "n3".to_string(),
            entry("2001:db8::/64", PrefixType::Loopback),
        );
        // loopback beats bgp despite the longer path
        let best = select_best_paths(&advertisers, &spf).unwrap();
        assert_eq!(best.best_node, "n3");
        assert_eq!(best.best_igp_metric, 2);
    }

    #[test]
    fn test_best_path_igp_distance_tiebreak() {
        let state = line_topology();
        let spf = run_spf(&state, "n1");
        let mut advertisers = HashMap::new();
        advertisers.insert(
            "n2".to_string(),
            entry("2001:db8::/64", PrefixType::Loopback),
        );
        advertisers.insert(
            "n3".to_string(),
            entry("2001:db8::/64", PrefixType::Loopback),
        );
        let best = select_best_paths(&advertisers, &spf).unwrap();
        assert_eq!(best.best_node, "n2");
        assert_eq!(best.nodes.len(), 1);
    }

    #[test]
    fn test_best_path_metric_vector() {
        let state = line_topology();
        let spf = run_spf(&state, "n1");
        let mut strong = entry("2001:db8::/64", PrefixType::Bgp);
        strong.mv = Some(MetricVector {
            metrics: vec![100, 5],
        });
        let mut weak = entry("2001:db8::/64", PrefixType::Bgp);
        weak.mv = Some(MetricVector {
            metrics: vec![100, 3],
        });
        let mut advertisers = HashMap::new();
        advertisers.insert("n2".to_string(), weak);
        advertisers.insert("n3".to_string(), strong);
        // the larger vector wins even though n2 is closer
        let best = select_best_paths(&advertisers, &spf).unwrap();
        assert_eq!(best.best_node, "n3");
    }

    #[test]
    fn test_mpls_node_and_adj_labels() {
        let mut state = LinkState::new();
        let mut db1 = adj_db("n1", vec![adj("n2", "if12", "if21", 1, 2)]);
        db1.node_label = 101;
        db1.adjacencies[0].adj_label = 50001;
        let mut db2 = adj_db("n2", vec![adj("n1", "if21", "if12", 1, 1)]);
        db2.node_label = 102;
        state.update_adjacency_database(db1, 0, 0);
        state.update_adjacency_database(db2, 0, 0);

        let mut solver = SpfSolver::new(
            &state,
            SpfOptions {
                enable_segment_routing: true,
                ..Default::default()
            },
        );
        let db = solver.build_route_db("n1", &HashMap::new());
        let labels: Vec<i32> = db.mpls_routes.iter().map(|r| r.top_label).collect();
        // own label (pop), neighbor label (php), adjacency label (php)
        assert!(labels.contains(&101));
        assert!(labels.contains(&102));
        assert!(labels.contains(&50001));

        let own = db.mpls_routes.iter().find(|r| r.top_label == 101).unwrap();
        assert_eq!(
            own.next_hops[0].mpls_action.as_ref().unwrap().action,
            MplsActionCode::Pop as i32
        );
        let neighbor = db.mpls_routes.iter().find(|r| r.top_label == 102).unwrap();
        assert_eq!(
            neighbor.next_hops[0].mpls_action.as_ref().unwrap().action,
            MplsActionCode::PhpPop as i32
        );
    }
}
