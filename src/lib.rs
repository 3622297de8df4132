//! # Trellis
//!
//! A link-state routing platform for IP networks: each node discovers
//! neighbors on its links, floods node-local state to every other node
//! through a replicated key-value store, computes shortest-path routes
//! from the resulting graph, and programs the forwarding plane.
//!
//! ## Quick Start
//!
//! ```no_run
//! use trellis::{Config, Node};
//!
//! #[tokio::main]
//! async fn main() -> trellis::Result<()> {
//!     let config = Config {
//!         node_name: "node1".to_string(),
//!         include_interface_regexes: vec!["eth.*".to_string()],
//!         ..Default::default()
//!     };
//!     let node = Node::builder(config).build().await?;
//!     // feed OS link/address events into node.platform_event_writer()
//!     node.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod decision;
pub mod error;
pub mod fib;
pub mod kvstore;
pub mod link_monitor;
pub mod messaging;
pub mod network;
pub mod prefix;
pub mod protocol;
pub mod spark;
pub mod storage;
pub mod utils;

// Re-export main types
pub use api::{CtrlApi, Node, NodeBuilder};
pub use config::{Config, PrefixAllocationMode, DEFAULT_AREA};
pub use error::{CtrlError, ErrorCode, Result, TrellisError};
pub use fib::{FibAgent, MockFibAgent};
pub use kvstore::{KvStoreClient, KvStoreFilters, KvStoreHandle};
pub use link_monitor::PlatformEvent;
pub use prefix::{MockSystemAgent, SystemAgent};
pub use protocol::{
    AdjacencyDatabase, PrefixDatabase, PrefixEntry, PrefixType, Publication, RouteDatabase,
    RouteDatabaseDelta, UnicastRoute, Value,
};
pub use spark::{SparkNeighborEvent, SparkNeighborEventType};
