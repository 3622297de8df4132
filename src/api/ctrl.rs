//! Control-plane facade
//!
//! A thin request/response surface over the cores' public queries. Every
//! operation returns either a value or a structured
//! [`CtrlError`](crate::error::CtrlError); nothing here owns state.

use crate::decision::DecisionHandle;
use crate::error::CtrlError;
use crate::fib::FibHandle;
use crate::kvstore::{KvStoreFilters, KvStoreHandle};
use crate::link_monitor::LinkMonitorHandle;
use crate::messaging::RQueue;
use crate::prefix::PrefixManagerHandle;
use crate::protocol::{
    AdjacencyDatabase, InterfaceInfo, MplsRoute, PeerSpec, PrefixDatabase, PrefixEntry,
    PrefixType, Publication, RouteDatabase, SptInfos, UnicastRoute, Value,
};
use crate::spark::SparkHandle;
use std::collections::{BTreeMap, HashMap};

type CtrlResult<T> = std::result::Result<T, CtrlError>;

/// The operator-facing API over a running node
#[derive(Clone)]
pub struct CtrlApi {
    kvstore: KvStoreHandle,
    link_monitor: LinkMonitorHandle,
    prefix_manager: PrefixManagerHandle,
    decision: DecisionHandle,
    fib: FibHandle,
    spark: SparkHandle,
}

impl CtrlApi {
    pub(crate) fn new(
        kvstore: KvStoreHandle,
        link_monitor: LinkMonitorHandle,
        prefix_manager: PrefixManagerHandle,
        decision: DecisionHandle,
        fib: FibHandle,
        spark: SparkHandle,
    ) -> Self {
        Self {
            kvstore,
            link_monitor,
            prefix_manager,
            decision,
            fib,
            spark,
        }
    }

    //
    // Route queries
    //

    /// The FIB's current route database
    pub async fn get_route_db(&self) -> CtrlResult<RouteDatabase> {
        Ok(self.fib.get_route_db().await?)
    }

    /// Programmed unicast routes, optionally filtered by prefix strings
    pub async fn get_unicast_routes(&self, filter: Vec<String>) -> CtrlResult<Vec<UnicastRoute>> {
        Ok(self.fib.get_unicast_routes(filter).await?)
    }

    /// Programmed MPLS routes, optionally filtered by label
    pub async fn get_mpls_routes(&self, filter: Vec<i32>) -> CtrlResult<Vec<MplsRoute>> {
        Ok(self.fib.get_mpls_routes(filter).await?)
    }

    /// Decision's computed route database, for this or another node
    pub async fn get_decision_route_db(
        &self,
        node: Option<String>,
    ) -> CtrlResult<RouteDatabase> {
        Ok(self.decision.get_route_db(node).await?)
    }

    /// Every adjacency database in the link-state graph
    pub async fn get_decision_adjacency_dbs(
        &self,
    ) -> CtrlResult<HashMap<String, AdjacencyDatabase>> {
        Ok(self.decision.get_adjacency_dbs().await?)
    }

    /// Every node's assembled prefix database
    pub async fn get_decision_prefix_dbs(&self) -> CtrlResult<HashMap<String, PrefixDatabase>> {
        Ok(self.decision.get_prefix_dbs().await?)
    }

    //
    // KvStore operations
    //

    /// Point lookup of keys in an area
    pub async fn get_kvstore_key_vals(
        &self,
        area: String,
        keys: Vec<String>,
    ) -> CtrlResult<Publication> {
        Ok(self.kvstore.get_key_vals(area, keys).await?)
    }

    /// Merge key-values into an area
    pub async fn set_kvstore_key_vals(
        &self,
        area: String,
        key_vals: HashMap<String, Value>,
    ) -> CtrlResult<()> {
        Ok(self.kvstore.set_key_vals(area, key_vals).await?)
    }

    /// Dump an area's entries matching the filters
    pub async fn dump_kvstore_keys(
        &self,
        area: String,
        filters: KvStoreFilters,
    ) -> CtrlResult<Publication> {
        Ok(self.kvstore.dump_all(area, filters).await?)
    }

    /// Dump an area's entries, hashes only
    pub async fn dump_kvstore_hashes(
        &self,
        area: String,
        filters: KvStoreFilters,
    ) -> CtrlResult<Publication> {
        Ok(self.kvstore.dump_hashes(area, filters).await?)
    }

    /// Add peers to an area
    pub async fn add_kvstore_peers(
        &self,
        area: String,
        peers: HashMap<String, PeerSpec>,
    ) -> CtrlResult<()> {
        Ok(self.kvstore.add_peers(area, peers).await?)
    }

    /// Remove peers from an area
    pub async fn del_kvstore_peers(&self, area: String, peers: Vec<String>) -> CtrlResult<()> {
        Ok(self.kvstore.del_peers(area, peers).await?)
    }

    /// List an area's peers
    pub async fn get_kvstore_peers(&self, area: String) -> CtrlResult<HashMap<String, PeerSpec>> {
        Ok(self.kvstore.dump_peers(area).await?)
    }

    /// Areas this node participates in
    pub async fn get_areas(&self) -> CtrlResult<Vec<String>> {
        Ok(self.kvstore.get_areas().await?)
    }

    /// Flood-overlay spanning trees of an area
    pub async fn get_spt_infos(&self, area: String) -> CtrlResult<SptInfos> {
        Ok(self.kvstore.get_spt_infos(area).await?)
    }

    /// Stream of every publication the KvStore emits
    pub fn subscribe_kvstore(&self) -> RQueue<Publication> {
        self.kvstore.subscribe()
    }

    /// Block until adjacencies differ from the caller's hash snapshot or
    /// the hold expires; true when something changed
    pub async fn long_poll_kvstore_adj(
        &self,
        area: String,
        snapshot: HashMap<String, i64>,
    ) -> CtrlResult<bool> {
        Ok(self.kvstore.long_poll_adj(area, snapshot).await?)
    }

    //
    // Prefix operations
    //

    /// Advertise prefix entries
    pub async fn advertise_prefixes(&self, entries: Vec<PrefixEntry>) -> CtrlResult<bool> {
        Ok(self.prefix_manager.advertise(entries).await?)
    }

    /// Withdraw prefix entries
    pub async fn withdraw_prefixes(&self, entries: Vec<PrefixEntry>) -> CtrlResult<bool> {
        Ok(self.prefix_manager.withdraw(entries).await?)
    }

    /// Replace a type's entries wholesale
    pub async fn sync_prefixes_by_type(
        &self,
        prefix_type: PrefixType,
        entries: Vec<PrefixEntry>,
    ) -> CtrlResult<bool> {
        Ok(self.prefix_manager.sync_by_type(prefix_type, entries).await?)
    }

    /// Dump advertised prefixes, optionally restricted to one type
    pub async fn get_prefixes(
        &self,
        prefix_type: Option<PrefixType>,
    ) -> CtrlResult<Vec<PrefixEntry>> {
        Ok(self.prefix_manager.get_prefixes(prefix_type).await?)
    }

    //
    // Link-monitor operations
    //

    /// Set or clear the node overload bit
    pub async fn set_node_overload(&self, overloaded: bool) -> CtrlResult<()> {
        Ok(self.link_monitor.set_node_overload(overloaded).await?)
    }

    /// Set or clear an interface's overload bit
    pub async fn set_interface_overload(
        &self,
        if_name: String,
        overloaded: bool,
    ) -> CtrlResult<()> {
        Ok(self
            .link_monitor
            .set_interface_overload(if_name, overloaded)
            .await?)
    }

    /// Override (or restore) an interface's link metric
    pub async fn set_link_metric(
        &self,
        if_name: String,
        metric: Option<i64>,
    ) -> CtrlResult<()> {
        Ok(self.link_monitor.set_link_metric(if_name, metric).await?)
    }

    /// Override (or restore) one adjacency's metric
    pub async fn set_adjacency_metric(
        &self,
        if_name: String,
        node_name: String,
        metric: Option<i64>,
    ) -> CtrlResult<()> {
        Ok(self
            .link_monitor
            .set_adjacency_metric(if_name, node_name, metric)
            .await?)
    }

    /// Dump tracked interfaces
    pub async fn get_interfaces(&self) -> CtrlResult<Vec<InterfaceInfo>> {
        Ok(self.link_monitor.get_interfaces().await?)
    }

    /// The adjacency database as assembled by the link monitor
    pub async fn get_link_monitor_adjacencies(&self) -> CtrlResult<AdjacencyDatabase> {
        Ok(self.link_monitor.get_adjacencies().await?)
    }

    //
    // Counters
    //

    /// Merged counters from every core component
    pub fn get_counters(&self) -> BTreeMap<String, i64> {
        let mut counters = self.kvstore.counters();
        counters.extend(self.spark.counters());
        counters.extend(self.fib.counters());
        counters
    }
}
