//! Flood-optimization overlay
//!
//! A distance-vector spanning-tree computation run per flood-root. Peers
//! exchange distance reports (`DualMessages`); each node picks its closest
//! peer as parent toward a root and tells it so with a `FloodTopoSet`
//! command. The resulting children set (plus the parent) replaces the
//! all-peers fan-out for that root's keys. The overlay is self-stabilizing:
//! for any root without a formed tree, flooding falls back to all peers.

use crate::protocol::{DualMessage, DualMessages, FloodTopoSetParams, SptInfo, SptInfos};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Distance placed on every overlay hop
const HOP_DISTANCE: i64 = 1;

/// Sentinel wire distance meaning unreachable
const DISTANCE_INFINITY: i64 = -1;

/// I/O the overlay wants performed after a state change
#[derive(Debug, Clone, PartialEq)]
pub enum DualAction {
    /// Send distance reports to one peer (`Some`) or every peer (`None`)
    SendDual {
        /// Target peer; `None` broadcasts
        peer: Option<String>,
        /// The reports
        messages: DualMessages,
    },
    /// Tell `peer` to add/remove us as a child for a root
    SendTopoSet {
        /// Target peer
        peer: String,
        /// The command
        params: FloodTopoSetParams,
    },
}

#[derive(Debug, Default)]
struct RootState {
    // best-known distance via each peer
    peer_distances: HashMap<String, i64>,
    // chosen upstream peer; None at the root itself (or when unreachable)
    parent: Option<String>,
    distance: Option<i64>,
    // peers that chose us as their upstream
    children: HashSet<String>,
}

/// Per-area overlay state
pub struct FloodOptimizer {
    node_name: String,
    is_root: bool,
    peers: HashSet<String>,
    // ordered map keeps SPT dumps deterministic
    roots: BTreeMap<String, RootState>,
}

impl FloodOptimizer {
    /// Create the overlay; `is_root` advertises this node as a flood root
    pub fn new(node_name: impl Into<String>, is_root: bool) -> Self {
        let node_name = node_name.into();
        let mut optimizer = Self {
            node_name: node_name.clone(),
            is_root,
            peers: HashSet::new(),
            roots: BTreeMap::new(),
        };
        if is_root {
            let state = optimizer.roots.entry(node_name).or_default();
            state.distance = Some(0);
        }
        optimizer
    }

    /// A flood-optimization-capable peer came up
    pub fn peer_up(&mut self, peer: &str) -> Vec<DualAction> {
        self.peers.insert(peer.to_string());
        // introduce ourselves with our full distance vector
        let messages = self.distance_vector();
        if messages.is_empty() {
            return Vec::new();
        }
        vec![DualAction::SendDual {
            peer: Some(peer.to_string()),
            messages: DualMessages {
                src_node: self.node_name.clone(),
                messages,
            },
        }]
    }

    /// A peer went away; recompute every tree it participated in
    pub fn peer_down(&mut self, peer: &str) -> Vec<DualAction> {
        self.peers.remove(peer);
        let mut actions = Vec::new();
        let roots: Vec<String> = self.roots.keys().cloned().collect();
        for root in roots {
            if let Some(state) = self.roots.get_mut(&root) {
                state.peer_distances.remove(peer);
                state.children.remove(peer);
            }
            actions.extend(self.reelect(&root, false));
        }
        actions
    }

    /// Process distance reports from a peer
    pub fn process_dual_messages(&mut self, msgs: &DualMessages) -> Vec<DualAction> {
        let peer = msgs.src_node.clone();
        if !self.peers.contains(&peer) {
            // unknown peers may race peer-add; track them anyway
            self.peers.insert(peer.clone());
        }
        let mut actions = Vec::new();
        for msg in &msgs.messages {
            let state = self.roots.entry(msg.root_id.clone()).or_default();
            if msg.distance < 0 {
                state.peer_distances.remove(&peer);
            } else {
                state.peer_distances.insert(peer.clone(), msg.distance);
            }
            actions.extend(self.reelect(&msg.root_id, false));
        }
        actions
    }

    /// Process a child set/unset command from a peer
    pub fn process_flood_topo_set(&mut self, params: &FloodTopoSetParams) {
        if params.all_roots {
            for state in self.roots.values_mut() {
                if params.set_child {
                    state.children.insert(params.src_node.clone());
                } else {
                    state.children.remove(&params.src_node);
                }
            }
            return;
        }
        let state = self.roots.entry(params.root_id.clone()).or_default();
        if params.set_child {
            debug!(
                "flood overlay: {} is now our child for root {}",
                params.src_node, params.root_id
            );
            state.children.insert(params.src_node.clone());
        } else {
            state.children.remove(&params.src_node);
        }
    }

    /// Re-run parent election for one root; emits topo-set and distance
    /// updates when anything moved
    fn reelect(&mut self, root: &str, force_announce: bool) -> Vec<DualAction> {
        let node_name = self.node_name.clone();
        let is_root = self.is_root;
        let state = match self.roots.get_mut(root) {
            Some(state) => state,
            None => return Vec::new(),
        };
        // the root itself never elects a parent
        if root == node_name && is_root {
            return Vec::new();
        }

        let old_parent = state.parent.clone();
        let old_distance = state.distance;

        // closest peer wins; name breaks ties so both ends converge
        let best = state
            .peer_distances
            .iter()
            .min_by(|(name_a, dist_a), (name_b, dist_b)| {
                dist_a.cmp(dist_b).then_with(|| name_a.cmp(name_b))
            })
            .map(|(name, dist)| (name.clone(), *dist));

        match best {
            Some((parent, dist)) => {
                state.parent = Some(parent);
                state.distance = Some(dist + HOP_DISTANCE);
            }
            None => {
                state.parent = None;
                state.distance = None;
            }
        }

        let mut actions = Vec::new();
        if state.parent != old_parent {
            if let Some(old) = old_parent {
                actions.push(DualAction::SendTopoSet {
                    peer: old,
                    params: FloodTopoSetParams {
                        root_id: root.to_string(),
                        src_node: node_name.clone(),
                        set_child: false,
                        all_roots: false,
                    },
                });
            }
            if let Some(new) = state.parent.clone() {
                actions.push(DualAction::SendTopoSet {
                    peer: new,
                    params: FloodTopoSetParams {
                        root_id: root.to_string(),
                        src_node: node_name.clone(),
                        set_child: true,
                        all_roots: false,
                    },
                });
            }
        }
        if state.distance != old_distance || force_announce {
            let distance = state.distance.unwrap_or(DISTANCE_INFINITY);
            actions.push(DualAction::SendDual {
                peer: None,
                messages: DualMessages {
                    src_node: node_name,
                    messages: vec![DualMessage {
                        root_id: root.to_string(),
                        distance,
                    }],
                },
            });
        }
        actions
    }

    fn distance_vector(&self) -> Vec<DualMessage> {
        self.roots
            .iter()
            .filter_map(|(root, state)| {
                state.distance.map(|distance| DualMessage {
                    root_id: root.clone(),
                    distance,
                })
            })
            .collect()
    }

    /// Flood fan-out for a root: parent + children when the tree is
    /// formed, `None` to fall back to all-peers flooding
    pub fn flood_peers(&self, root: Option<&str>) -> Option<HashSet<String>> {
        let root = root?;
        let state = self.roots.get(root)?;
        if state.distance.is_none() {
            return None;
        }
        let mut peers: HashSet<String> = state.children.clone();
        if let Some(parent) = &state.parent {
            peers.insert(parent.clone());
        }
        Some(peers)
    }

    /// Snapshot of all trees, for the control surface
    pub fn spt_infos(&self) -> SptInfos {
        SptInfos {
            infos: self
                .roots
                .iter()
                .map(|(root, state)| {
                    let mut children: Vec<String> = state.children.iter().cloned().collect();
                    children.sort();
                    SptInfo {
                        root_id: root.clone(),
                        parent: state.parent.clone(),
                        children,
                        distance: state.distance.unwrap_or(DISTANCE_INFINITY),
                    }
                })
                .collect(),
        }
    }
}
