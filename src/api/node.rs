//! Node assembly
//!
//! `NodeBuilder` validates the configuration, constructs every component
//! in dependency order, and wires the replicate queues between them:
//!
//! ```text
//! platform events -> LinkMonitor -> (peers, adj:) -> KvStore -> Decision -> Fib -> agent
//! spark events ----^          \--> InterfaceDatabase -> Spark, Fib
//! PrefixManager  <- prefix updates <- LinkMonitor, PrefixAllocator
//! ```

use crate::api::CtrlApi;
use crate::config::Config;
use crate::decision::{Decision, DecisionHandle};
use crate::error::Result;
use crate::fib::{Fib, FibAgent, FibHandle, MockFibAgent};
use crate::kvstore::{KvStore, KvStoreClient, KvStoreHandle};
use crate::link_monitor::{LinkMonitor, LinkMonitorHandle, PlatformEvent};
use crate::messaging::ReplicateQueue;
use crate::network::{PeerListener, TlsMaterial};
use crate::prefix::{
    AllocatorHandle, MockSystemAgent, PrefixAllocator, PrefixManager, PrefixManagerHandle,
    PrefixUpdateRequest, SystemAgent,
};
use crate::protocol::InterfaceDatabase;
use crate::spark::{Spark, SparkHandle, SparkIoProvider, UdpIoProvider};
use crate::storage::PersistentStore;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;

/// Builder for a complete routing node
pub struct NodeBuilder {
    config: Config,
    io_provider: Option<Arc<dyn SparkIoProvider>>,
    fib_agent: Option<Arc<dyn FibAgent>>,
    system_agent: Option<Arc<dyn SystemAgent>>,
}

impl NodeBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            io_provider: None,
            fib_agent: None,
            system_agent: None,
        }
    }

    /// Inject a Spark I/O provider (tests use the in-memory hub)
    pub fn with_io_provider(mut self, io: Arc<dyn SparkIoProvider>) -> Self {
        self.io_provider = Some(io);
        self
    }

    /// Inject the forwarding agent
    pub fn with_fib_agent(mut self, agent: Arc<dyn FibAgent>) -> Self {
        self.fib_agent = Some(agent);
        self
    }

    /// Inject the system agent used for address programming
    pub fn with_system_agent(mut self, agent: Arc<dyn SystemAgent>) -> Self {
        self.system_agent = Some(agent);
        self
    }

    /// Validate, construct, and start every component
    pub async fn build(self) -> Result<Node> {
        let mut config = self.config;
        let matchers = config.validate()?;

        // persistent store first: several components restore from it
        let config_store = PersistentStore::new(
            &config.config_store_path,
            config.store_flush_initial_backoff,
            config.store_flush_max_backoff,
            config.dryrun,
        )?
        .spawn();

        // peer transport; with port 0 the effective port feeds back into
        // the config so Spark advertises something reachable
        let (tls_client, tls_server) = if config.enable_tls {
            let material = match (&config.tls_cert_path, &config.tls_key_path) {
                (Some(cert), Some(key)) => TlsMaterial::load(cert, key)?,
                _ => TlsMaterial::self_signed(&config.node_name)?,
            };
            (
                Some(material.client_config()?),
                Some(material.server_config()?),
            )
        } else {
            (None, None)
        };
        let listener = PeerListener::bind(
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.kvstore_port)),
            tls_server,
        )
        .await?;
        config.kvstore_port = listener.local_addr()?.port();
        let config = Arc::new(config);

        let kvstore = KvStore::new(&config, tls_client).spawn(listener)?;
        let kvstore_client = KvStoreClient::spawn(config.node_name.clone(), kvstore.clone());

        // inter-component queues; every reader is opened before any
        // producer task starts, so nothing is lost to startup ordering
        let interface_updates: ReplicateQueue<InterfaceDatabase> = ReplicateQueue::new();
        let prefix_updates: ReplicateQueue<PrefixUpdateRequest> = ReplicateQueue::new();
        let platform_events: ReplicateQueue<PlatformEvent> = ReplicateQueue::new();
        let interface_reader_for_spark = interface_updates.get_reader();
        let interface_reader_for_fib = interface_updates.get_reader();
        let prefix_reader = prefix_updates.get_reader();
        let platform_reader = platform_events.get_reader();

        let io: Arc<dyn SparkIoProvider> = match self.io_provider {
            Some(io) => io,
            None => Arc::new(UdpIoProvider::bind(config.spark_mcast_port).await?),
        };
        let spark = Spark::new(Arc::clone(&config), io).spawn(interface_reader_for_spark);

        let prefix_manager = PrefixManager::new(
            Arc::clone(&config),
            kvstore_client.clone(),
            config_store.clone(),
        )
        .spawn(prefix_reader);

        let link_monitor = LinkMonitor::new(
            Arc::clone(&config),
            matchers,
            kvstore.clone(),
            kvstore_client.clone(),
            config_store.clone(),
            interface_updates.clone(),
            prefix_updates.clone(),
        )
        .spawn(spark.event_reader(), platform_reader);

        let allocator = if config.enable_prefix_allocation {
            let system_agent = self
                .system_agent
                .unwrap_or_else(|| Arc::new(MockSystemAgent::new()));
            Some(
                PrefixAllocator::new(
                    Arc::clone(&config),
                    kvstore.clone(),
                    kvstore_client.clone(),
                    config_store.clone(),
                    system_agent,
                    prefix_updates.clone(),
                )
                .spawn(),
            )
        } else {
            None
        };

        let decision = Decision::new(Arc::clone(&config));
        let route_updates = decision.route_update_queue();
        let route_reader = route_updates.get_reader();
        let decision_handle = decision.spawn(kvstore.subscribe());

        let fib_agent = self
            .fib_agent
            .unwrap_or_else(|| Arc::new(MockFibAgent::new()));
        let ordered_fib_client = if config.enable_ordered_fib {
            Some(kvstore_client.clone())
        } else {
            None
        };
        let fib = Fib::new(Arc::clone(&config), fib_agent, ordered_fib_client)
            .spawn(route_reader, interface_reader_for_fib);

        info!(
            "node {} up: kvstore on port {}, areas {:?}",
            config.node_name, config.kvstore_port, config.areas
        );

        Ok(Node {
            config,
            kvstore,
            spark,
            link_monitor,
            prefix_manager,
            allocator,
            decision: decision_handle,
            fib,
            platform_events,
        })
    }
}

/// A running routing node
///
/// Dropping the node closes the platform event stream; component tasks
/// then drain their queues and exit in dependency order.
pub struct Node {
    config: Arc<Config>,
    kvstore: KvStoreHandle,
    spark: SparkHandle,
    link_monitor: LinkMonitorHandle,
    prefix_manager: PrefixManagerHandle,
    allocator: Option<AllocatorHandle>,
    decision: DecisionHandle,
    fib: FibHandle,
    platform_events: ReplicateQueue<PlatformEvent>,
}

impl Node {
    /// Start building a node
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// The effective configuration (ports resolved)
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The KvStore handle
    pub fn kvstore(&self) -> &KvStoreHandle {
        &self.kvstore
    }

    /// The Spark handle
    pub fn spark(&self) -> &SparkHandle {
        &self.spark
    }

    /// The link monitor handle
    pub fn link_monitor(&self) -> &LinkMonitorHandle {
        &self.link_monitor
    }

    /// The prefix manager handle
    pub fn prefix_manager(&self) -> &PrefixManagerHandle {
        &self.prefix_manager
    }

    /// The prefix allocator handle, when allocation is enabled
    pub fn allocator(&self) -> Option<&AllocatorHandle> {
        self.allocator.as_ref()
    }

    /// The decision handle
    pub fn decision(&self) -> &DecisionHandle {
        &self.decision
    }

    /// The FIB handle
    pub fn fib(&self) -> &FibHandle {
        &self.fib
    }

    /// Writer for feeding OS link/address events into the node
    pub fn platform_event_writer(&self) -> ReplicateQueue<PlatformEvent> {
        self.platform_events.clone()
    }

    /// The control-plane facade over this node
    pub fn ctrl_api(&self) -> CtrlApi {
        CtrlApi::new(
            self.kvstore.clone(),
            self.link_monitor.clone(),
            self.prefix_manager.clone(),
            self.decision.clone(),
            self.fib.clone(),
            self.spark.clone(),
        )
    }

    /// Announce a graceful restart to neighbors, then shut down
    pub async fn stop(self) {
        let _ = self.spark.graceful_shutdown().await;
        self.platform_events.close();
    }
}
