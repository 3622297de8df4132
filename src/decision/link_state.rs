//! Link-state database
//!
//! The graph Decision runs SPF over. Only bidirectional links exist: a
//! link is formed when both endpoints advertise the matching half-edge.
//! Metrics and overload bits are holdable values so ordered-FIB holds can
//! dampen transitions; an update while a hold is running falls back to a
//! fast update, otherwise transient loops get longer, not shorter.

use crate::protocol::{Adjacency, AdjacencyDatabase, BinaryAddress};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Metric type used throughout SPF
pub type LinkStateMetric = u64;

/// Hold-aware change classification
pub trait BringsUp {
    /// Does moving from `current` to `new` make things better (an "up"
    /// transition)?
    fn brings_up(current: &Self, new: &Self) -> bool;
}

impl BringsUp for bool {
    fn brings_up(current: &Self, new: &Self) -> bool {
        // clearing an overload bit brings the edge up
        *current && !*new
    }
}

impl BringsUp for LinkStateMetric {
    fn brings_up(current: &Self, new: &Self) -> bool {
        // a metric decrease attracts traffic
        *new < *current
    }
}

/// A value whose transitions are dampened by a TTL countdown
///
/// `update` with a new value arms a hold; `value()` keeps returning the
/// previous value until [`HoldableValue::decrement_ttl`] counts the hold
/// down. A second change while held clears the hold (fast update).
#[derive(Debug, Clone)]
pub struct HoldableValue<T> {
    val: T,
    held_val: Option<T>,
    hold_ttl: u64,
}

impl<T: PartialEq + Clone + BringsUp> HoldableValue<T> {
    /// Start with a settled value
    pub fn new(val: T) -> Self {
        Self {
            val,
            held_val: None,
            hold_ttl: 0,
        }
    }

    /// The effective value (held one while a hold is running)
    pub fn value(&self) -> &T {
        self.held_val.as_ref().unwrap_or(&self.val)
    }

    /// Is a hold currently running?
    pub fn has_hold(&self) -> bool {
        self.held_val.is_some()
    }

    /// Count the hold down one tick; true when this tick released it
    pub fn decrement_ttl(&mut self) -> bool {
        if self.held_val.is_some() {
            self.hold_ttl = self.hold_ttl.saturating_sub(1);
            if self.hold_ttl == 0 {
                self.held_val = None;
                return true;
            }
        }
        false
    }

    /// Apply an update; returns true when the effective value changed now
    pub fn update(&mut self, val: T, hold_up_ttl: u64, hold_down_ttl: u64) -> bool {
        if val == self.val {
            return false;
        }
        if self.has_hold() {
            // already holding: fall back to a fast update
            self.held_val = None;
            self.hold_ttl = 0;
        } else {
            self.hold_ttl = if T::brings_up(&self.val, &val) {
                hold_up_ttl
            } else {
                hold_down_ttl
            };
            if self.hold_ttl != 0 {
                self.held_val = Some(self.val.clone());
            }
        }
        self.val = val;
        !self.has_hold()
    }
}

/// Arena index of a link
pub type LinkId = usize;

type OrderedKey = ((String, String), (String, String));

/// A bidirectional link between two (node, interface) endpoints
#[derive(Debug, Clone)]
pub struct Link {
    n1: String,
    n2: String,
    if1: String,
    if2: String,
    metric1: HoldableValue<LinkStateMetric>,
    metric2: HoldableValue<LinkStateMetric>,
    overload1: HoldableValue<bool>,
    overload2: HoldableValue<bool>,
    adj_label1: i32,
    adj_label2: i32,
    nh_v4_1: Option<BinaryAddress>,
    nh_v4_2: Option<BinaryAddress>,
    nh_v6_1: Option<BinaryAddress>,
    nh_v6_2: Option<BinaryAddress>,
    hold_up_ttl: u64,
    ordered_key: OrderedKey,
}

impl Link {
    /// Form a link from the two matching half-edges
    pub fn new(node1: &str, adj1: &Adjacency, node2: &str, adj2: &Adjacency) -> Self {
        let end1 = (node1.to_string(), adj1.if_name.clone());
        let end2 = (node2.to_string(), adj2.if_name.clone());
        let ordered_key = if end1 <= end2 {
            (end1, end2)
        } else {
            (end2, end1)
        };
        Self {
            n1: node1.to_string(),
            n2: node2.to_string(),
            if1: adj1.if_name.clone(),
            if2: adj2.if_name.clone(),
            metric1: HoldableValue::new(adj1.metric.max(1)),
            metric2: HoldableValue::new(adj2.metric.max(1)),
            overload1: HoldableValue::new(adj1.is_overloaded),
            overload2: HoldableValue::new(adj2.is_overloaded),
            adj_label1: adj1.adj_label,
            adj_label2: adj2.adj_label,
            nh_v4_1: adj1.next_hop_v4.clone(),
            nh_v4_2: adj2.next_hop_v4.clone(),
            nh_v6_1: adj1.next_hop_v6.clone(),
            nh_v6_2: adj2.next_hop_v6.clone(),
            hold_up_ttl: 0,
            ordered_key,
        }
    }

    /// Sort/equality key: the unordered pair of (node, iface) endpoints
    pub fn ordered_key(&self) -> &OrderedKey {
        &self.ordered_key
    }

    /// Endpoint opposite to `node`
    pub fn other_node(&self, node: &str) -> &str {
        if self.n1 == node {
            &self.n2
        } else {
            &self.n1
        }
    }

    /// First endpoint in key order
    pub fn first_node(&self) -> &str {
        &self.ordered_key.0 .0
    }

    /// Second endpoint in key order
    pub fn second_node(&self) -> &str {
        &self.ordered_key.1 .0
    }

    /// Interface `node` uses on this link
    pub fn iface_from(&self, node: &str) -> &str {
        if self.n1 == node {
            &self.if1
        } else {
            &self.if2
        }
    }

    /// Effective metric as seen from `node`
    pub fn metric_from(&self, node: &str) -> LinkStateMetric {
        if self.n1 == node {
            *self.metric1.value()
        } else {
            *self.metric2.value()
        }
    }

    /// Effective overload bit as seen from `node`
    pub fn overload_from(&self, node: &str) -> bool {
        if self.n1 == node {
            *self.overload1.value()
        } else {
            *self.overload2.value()
        }
    }

    /// Adjacency label as seen from `node`
    pub fn adj_label_from(&self, node: &str) -> i32 {
        if self.n1 == node {
            self.adj_label1
        } else {
            self.adj_label2
        }
    }

    /// IPv6 next-hop toward the far end, from `node`'s perspective
    pub fn nh_v6_from(&self, node: &str) -> Option<&BinaryAddress> {
        if self.n1 == node {
            self.nh_v6_1.as_ref()
        } else {
            self.nh_v6_2.as_ref()
        }
    }

    /// IPv4 next-hop toward the far end, from `node`'s perspective
    pub fn nh_v4_from(&self, node: &str) -> Option<&BinaryAddress> {
        if self.n1 == node {
            self.nh_v4_1.as_ref()
        } else {
            self.nh_v4_2.as_ref()
        }
    }

    /// Hold a freshly-formed link down for `ttl` ticks
    pub fn set_hold_up_ttl(&mut self, ttl: u64) {
        self.hold_up_ttl = ttl;
    }

    /// Is the link usable: past its formation hold, neither end overloaded
    pub fn is_up(&self) -> bool {
        self.hold_up_ttl == 0 && !*self.overload1.value() && !*self.overload2.value()
    }

    /// Any holds still running?
    pub fn has_holds(&self) -> bool {
        self.hold_up_ttl != 0
            || self.metric1.has_hold()
            || self.metric2.has_hold()
            || self.overload1.has_hold()
            || self.overload2.has_hold()
    }

    /// Tick every hold down; true when any released
    pub fn decrement_holds(&mut self) -> bool {
        let mut released = false;
        if self.hold_up_ttl != 0 {
            self.hold_up_ttl -= 1;
            released |= self.hold_up_ttl == 0;
        }
        released |= self.metric1.decrement_ttl();
        released |= self.metric2.decrement_ttl();
        released |= self.overload1.decrement_ttl();
        released |= self.overload2.decrement_ttl();
        released
    }

    fn set_metric_from(
        &mut self,
        node: &str,
        metric: LinkStateMetric,
        hold_up: u64,
        hold_down: u64,
    ) -> bool {
        if self.n1 == node {
            self.metric1.update(metric.max(1), hold_up, hold_down)
        } else {
            self.metric2.update(metric.max(1), hold_up, hold_down)
        }
    }

    fn set_overload_from(
        &mut self,
        node: &str,
        overload: bool,
        hold_up: u64,
        hold_down: u64,
    ) -> bool {
        let was_up = self.is_up();
        if self.n1 == node {
            self.overload1.update(overload, hold_up, hold_down);
        } else {
            self.overload2.update(overload, hold_up, hold_down);
        }
        // simplex overloads are not supported; only the up/down flip of
        // the whole link is a topology change
        was_up != self.is_up()
    }

    fn directional_string(&self, from: &str) -> String {
        format!(
            "{}%{} ---> {}%{}",
            from,
            self.iface_from(from),
            self.other_node(from),
            self.iface_from(self.other_node(from))
        )
    }
}

/// Result of feeding an adjacency database into the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Reachability or cost changed; SPF must re-run
    pub topology_changed: bool,
    /// Next-hop addresses or labels changed; routes must be rebuilt
    pub route_attrs_changed: bool,
}

/// The link-state graph
#[derive(Default)]
pub struct LinkState {
    // arena; freed slots are reused
    links: Vec<Option<Link>>,
    free_slots: Vec<LinkId>,
    // node -> link ids touching it
    link_map: HashMap<String, HashSet<LinkId>>,
    node_overloads: HashMap<String, HoldableValue<bool>>,
    adjacency_dbs: HashMap<String, AdjacencyDatabase>,
}

impl LinkState {
    /// An empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of formed (bidirectional) links
    pub fn num_links(&self) -> usize {
        self.links.iter().filter(|l| l.is_some()).count()
    }

    /// Is this node known (has ever advertised an adjacency database)?
    pub fn has_node(&self, node: &str) -> bool {
        self.adjacency_dbs.contains_key(node)
    }

    /// The stored adjacency databases
    pub fn adjacency_databases(&self) -> &HashMap<String, AdjacencyDatabase> {
        &self.adjacency_dbs
    }

    /// Is a node refusing transit?
    pub fn is_node_overloaded(&self, node: &str) -> bool {
        self.node_overloads
            .get(node)
            .map(|h| *h.value())
            .unwrap_or(false)
    }

    /// Links touching `node`, arena ids
    pub fn links_from_node(&self, node: &str) -> Vec<LinkId> {
        self.link_map
            .get(node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve an arena id
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id).and_then(|slot| slot.as_ref())
    }

    /// Every live link id
    pub fn all_links(&self) -> Vec<LinkId> {
        self.links
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    fn ordered_links_from(&self, node: &str) -> Vec<LinkId> {
        let mut ids = self.links_from_node(node);
        ids.sort_by(|a, b| {
            let ka = self.links[*a].as_ref().map(|l| l.ordered_key());
            let kb = self.links[*b].as_ref().map(|l| l.ordered_key());
            ka.cmp(&kb)
        });
        ids
    }

    fn insert_link(&mut self, link: Link) -> LinkId {
        let first = link.first_node().to_string();
        let second = link.second_node().to_string();
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.links[id] = Some(link);
                id
            }
            None => {
                self.links.push(Some(link));
                self.links.len() - 1
            }
        };
        self.link_map.entry(first).or_default().insert(id);
        self.link_map.entry(second).or_default().insert(id);
        id
    }

    fn remove_link(&mut self, id: LinkId) {
        if let Some(link) = self.links[id].take() {
            if let Some(set) = self.link_map.get_mut(link.first_node()) {
                set.remove(&id);
            }
            if let Some(set) = self.link_map.get_mut(link.second_node()) {
                set.remove(&id);
            }
            self.free_slots.push(id);
        }
    }

    /// Set/clear a node's overload bit with holds; true when the
    /// effective value changed
    fn update_node_overloaded(
        &mut self,
        node: &str,
        overloaded: bool,
        hold_up: u64,
        hold_down: u64,
    ) -> bool {
        match self.node_overloads.get_mut(node) {
            Some(holdable) => holdable.update(overloaded, hold_up, hold_down),
            None => {
                self.node_overloads
                    .insert(node.to_string(), HoldableValue::new(overloaded));
                // a brand-new node is not a change to existing state
                false
            }
        }
    }

    /// Form the link for `adj` if the reverse half-edge exists
    fn maybe_make_link(&self, node: &str, adj: &Adjacency) -> Option<Link> {
        let other_db = self.adjacency_dbs.get(&adj.other_node_name)?;
        other_db
            .adjacencies
            .iter()
            .find(|other| {
                other.other_node_name == node
                    && adj.other_if_name == other.if_name
                    && adj.if_name == other.other_if_name
            })
            .map(|other| Link::new(node, adj, &adj.other_node_name, other))
    }

    fn candidate_links(&self, db: &AdjacencyDatabase) -> Vec<Link> {
        let mut links: Vec<Link> = db
            .adjacencies
            .iter()
            .filter_map(|adj| self.maybe_make_link(&db.this_node_name, adj))
            .collect();
        links.sort_by(|a, b| a.ordered_key().cmp(b.ordered_key()));
        links
    }

    /// Feed a node's adjacency database into the graph
    ///
    /// Walks the old and new ordered link sets side by side, adding,
    /// removing, and updating in one pass, exactly discriminating
    /// topology changes from route-attribute changes.
    pub fn update_adjacency_database(
        &mut self,
        new_db: AdjacencyDatabase,
        hold_up: u64,
        hold_down: u64,
    ) -> UpdateResult {
        let node = new_db.this_node_name.clone();
        debug!("updating adjacency database for {}", node);

        let prior_db = self.adjacency_dbs.insert(node.clone(), new_db.clone());
        let old_ids = self.ordered_links_from(&node);
        let new_links = self.candidate_links(&new_db);

        let mut result = UpdateResult {
            topology_changed: self.update_node_overloaded(
                &node,
                new_db.is_overloaded,
                hold_up,
                hold_down,
            ),
            route_attrs_changed: prior_db
                .map(|p| p.node_label != new_db.node_label)
                .unwrap_or(new_db.node_label != 0),
        };

        enum Step {
            AddNew,
            RemoveOld,
            Reconcile,
        }

        let mut old_iter = old_ids.into_iter().peekable();
        let mut new_iter = new_links.into_iter().peekable();
        loop {
            let old_key = old_iter
                .peek()
                .and_then(|id| self.links[*id].as_ref())
                .map(|l| l.ordered_key().clone());
            let new_key = new_iter.peek().map(|l| l.ordered_key().clone());

            let step = match (&old_key, &new_key) {
                (None, None) => break,
                (None, Some(_)) => Step::AddNew,
                (Some(_), None) => Step::RemoveOld,
                (Some(old), Some(new)) => {
                    if new < old {
                        Step::AddNew
                    } else if old < new {
                        Step::RemoveOld
                    } else {
                        Step::Reconcile
                    }
                }
            };

            match step {
                Step::AddNew => {
                    // a link not currently present: add it behind a
                    // formation hold; the hold is checked at SPF time so
                    // the same hold is never added twice
                    let mut link = match new_iter.next() {
                        Some(link) => link,
                        None => break,
                    };
                    link.set_hold_up_ttl(hold_up);
                    result.topology_changed |= link.is_up();
                    info!("adding link {}", link.directional_string(&node));
                    self.insert_link(link);
                }
                Step::RemoveOld => {
                    // a link that disappeared; held-down or overloaded
                    // links going away change nothing
                    let id = match old_iter.next() {
                        Some(id) => id,
                        None => break,
                    };
                    if let Some(link) = self.links[id].as_ref() {
                        result.topology_changed |= link.is_up();
                        info!("removing link {}", link.directional_string(&node));
                    }
                    self.remove_link(id);
                }
                Step::Reconcile => {
                    // same link on both sides; reconcile attributes
                    let id = match old_iter.next() {
                        Some(id) => id,
                        None => break,
                    };
                    let incoming = match new_iter.next() {
                        Some(link) => link,
                        None => break,
                    };
                    if let Some(existing) = self.links[id].as_mut() {
                        let new_metric = incoming.metric_from(&node);
                        if existing.metric_from(&node) != new_metric {
                            info!(
                                "metric change on {}: {} -> {}",
                                existing.directional_string(&node),
                                existing.metric_from(&node),
                                new_metric
                            );
                            result.topology_changed |=
                                existing.set_metric_from(&node, new_metric, hold_up, hold_down);
                        }
                        let new_overload = incoming.overload_from(&node);
                        if existing.overload_from(&node) != new_overload {
                            info!(
                                "overload change on {}: {}",
                                existing.directional_string(&node),
                                new_overload
                            );
                            result.topology_changed |= existing.set_overload_from(
                                &node,
                                new_overload,
                                hold_up,
                                hold_down,
                            );
                        }
                        let new_label = incoming.adj_label_from(&node);
                        if existing.adj_label_from(&node) != new_label {
                            result.route_attrs_changed = true;
                            if existing.n1 == node {
                                existing.adj_label1 = new_label;
                            } else {
                                existing.adj_label2 = new_label;
                            }
                        }
                        let new_v6 = incoming.nh_v6_from(&node).cloned();
                        if existing.nh_v6_from(&node) != new_v6.as_ref() {
                            result.route_attrs_changed = true;
                            if existing.n1 == node {
                                existing.nh_v6_1 = new_v6;
                            } else {
                                existing.nh_v6_2 = new_v6;
                            }
                        }
                        let new_v4 = incoming.nh_v4_from(&node).cloned();
                        if existing.nh_v4_from(&node) != new_v4.as_ref() {
                            result.route_attrs_changed = true;
                            if existing.n1 == node {
                                existing.nh_v4_1 = new_v4;
                            } else {
                                existing.nh_v4_2 = new_v4;
                            }
                        }
                    }
                }
            }
        }
        result
    }

    /// Remove a node and everything touching it
    pub fn delete_adjacency_database(&mut self, node: &str) -> bool {
        if self.adjacency_dbs.remove(node).is_none() {
            warn!("deleting adjacency database for unknown node {}", node);
            return false;
        }
        for id in self.links_from_node(node) {
            self.remove_link(id);
        }
        self.link_map.remove(node);
        self.node_overloads.remove(node);
        true
    }

    /// Any ordered-FIB holds still running?
    pub fn has_holds(&self) -> bool {
        self.links
            .iter()
            .flatten()
            .any(|link| link.has_holds())
            || self.node_overloads.values().any(|h| h.has_hold())
    }

    /// Tick every hold; true when any released (SPF should re-run)
    pub fn decrement_holds(&mut self) -> bool {
        let mut released = false;
        for link in self.links.iter_mut().flatten() {
            released |= link.decrement_holds();
        }
        for holdable in self.node_overloads.values_mut() {
            released |= holdable.decrement_ttl();
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::net::parse_prefix;

    fn adj(other: &str, if_name: &str, other_if: &str, metric: u64) -> Adjacency {
        Adjacency {
            other_node_name: other.to_string(),
            if_name: if_name.to_string(),
            other_if_name: other_if.to_string(),
            next_hop_v6: Some(BinaryAddress {
                addr: parse_prefix("fe80::1/128").unwrap().prefix_address,
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

    fn db(node: &str, adjacencies: Vec<Adjacency>) -> AdjacencyDatabase {
        AdjacencyDatabase {
            this_node_name: node.to_string(),
            is_overloaded: false,
            adjacencies,
            node_label: 0,
            area: "0".to_string(),
            perf_events: None,
        }
    }

    #[test]
    fn test_holdable_value_basic() {
        let mut holdable = HoldableValue::new(10u64);
        // no hold configured: change is immediate
        assert!(holdable.update(20, 0, 0));
        assert_eq!(*holdable.value(), 20);
    }

    #[test]
    fn test_holdable_value_holds_then_releases() {
        let mut holdable = HoldableValue::new(10u64);
        // increase (a "down" direction for metrics) held for 2 ticks
        assert!(!holdable.update(30, 1, 2));
        assert_eq!(*holdable.value(), 10);
        assert!(holdable.has_hold());
        assert!(!holdable.decrement_ttl());
        assert!(holdable.decrement_ttl());
        assert_eq!(*holdable.value(), 30);
    }

    #[test]
    fn test_holdable_value_fast_update_on_second_change() {
        let mut holdable = HoldableValue::new(10u64);
        holdable.update(30, 2, 2);
        assert!(holdable.has_hold());
        // a second change while held applies immediately
        assert!(holdable.update(50, 2, 2));
        assert!(!holdable.has_hold());
        assert_eq!(*holdable.value(), 50);
    }

    #[test]
    fn test_holdable_same_value_is_noop() {
        let mut holdable = HoldableValue::new(true);
        assert!(!holdable.update(true, 3, 3));
        assert!(!holdable.has_hold());
    }

    #[test]
    fn test_link_forms_only_bidirectionally() {
        let mut state = LinkState::new();
        let result = state.update_adjacency_database(
            db("n1", vec![adj("n2", "if12", "if21", 1)]),
            0,
            0,
        );
        // half-edge only: nothing formed
        assert!(!result.topology_changed);
        assert_eq!(state.num_links(), 0);

        let result = state.update_adjacency_database(
            db("n2", vec![adj("n1", "if21", "if12", 1)]),
            0,
            0,
        );
        assert!(result.topology_changed);
        assert_eq!(state.num_links(), 1);
    }

    #[test]
    fn test_link_removal_changes_topology() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![adj("n2", "if12", "if21", 1)]), 0, 0);
        state.update_adjacency_database(db("n2", vec![adj("n1", "if21", "if12", 1)]), 0, 0);
        assert_eq!(state.num_links(), 1);

        let result = state.update_adjacency_database(db("n1", vec![]), 0, 0);
        assert!(result.topology_changed);
        assert_eq!(state.num_links(), 0);
    }

    #[test]
    fn test_metric_change_flags_topology() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![adj("n2", "if12", "if21", 1)]), 0, 0);
        state.update_adjacency_database(db("n2", vec![adj("n1", "if21", "if12", 1)]), 0, 0);

        let result = state.update_adjacency_database(
            db("n1", vec![adj("n2", "if12", "if21", 50)]),
            0,
            0,
        );
        assert!(result.topology_changed);
        let id = state.links_from_node("n1")[0];
        assert_eq!(state.link(id).unwrap().metric_from("n1"), 50);
    }

    #[test]
    fn test_metric_change_held_with_ordered_fib() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![adj("n2", "if12", "if21", 1)]), 0, 0);
        state.update_adjacency_database(db("n2", vec![adj("n1", "if21", "if12", 1)]), 0, 0);

        // with holds configured, a metric increase takes effect later
        let result = state.update_adjacency_database(
            db("n1", vec![adj("n2", "if12", "if21", 50)]),
            2,
            2,
        );
        assert!(!result.topology_changed);
        let id = state.links_from_node("n1")[0];
        assert_eq!(state.link(id).unwrap().metric_from("n1"), 1);
        assert!(state.has_holds());

        state.decrement_holds();
        let released = state.decrement_holds();
        assert!(released);
        assert_eq!(state.link(id).unwrap().metric_from("n1"), 50);
        assert!(!state.has_holds());
    }

    #[test]
    fn test_new_link_held_down() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![adj("n2", "if12", "if21", 1)]), 2, 2);
        let result = state.update_adjacency_database(
            db("n2", vec![adj("n1", "if21", "if12", 1)]),
            2,
            2,
        );
        // formed but held down
        assert!(!result.topology_changed);
        assert_eq!(state.num_links(), 1);
        let id = state.all_links()[0];
        assert!(!state.link(id).unwrap().is_up());

        state.decrement_holds();
        assert!(state.decrement_holds());
        assert!(state.link(id).unwrap().is_up());
    }

    #[test]
    fn test_node_overload() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![]), 0, 0);
        assert!(!state.is_node_overloaded("n1"));

        let mut overloaded = db("n1", vec![]);
        overloaded.is_overloaded = true;
        let result = state.update_adjacency_database(overloaded, 0, 0);
        assert!(result.topology_changed);
        assert!(state.is_node_overloaded("n1"));
    }

    #[test]
    fn test_delete_adjacency_database() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![adj("n2", "if12", "if21", 1)]), 0, 0);
        state.update_adjacency_database(db("n2", vec![adj("n1", "if21", "if12", 1)]), 0, 0);
        assert_eq!(state.num_links(), 1);

        assert!(state.delete_adjacency_database("n1"));
        assert_eq!(state.num_links(), 0);
        assert!(!state.has_node("n1"));
        assert!(state.has_node("n2"));
        assert!(!state.delete_adjacency_database("n1"));
    }

    #[test]
    fn test_node_label_change_is_route_attr() {
        let mut state = LinkState::new();
        state.update_adjacency_database(db("n1", vec![]), 0, 0);
        let mut labeled = db("n1", vec![]);
        labeled.node_label = 101;
        let result = state.update_adjacency_database(labeled, 0, 0);
        assert!(result.route_attrs_changed);
        assert!(!result.topology_changed);
    }
}
