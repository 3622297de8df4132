//! Forwarding-agent interface
//!
//! The switch agent programs routes on behalf of the routing daemon. The
//! trait mirrors the agent's RPC surface; the mock records every call and
//! injects failures for the resync paths under test.

use crate::error::{FibError, Result};
use crate::protocol::{IpPrefix, MplsRoute, UnicastRoute};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// RPC surface of the forwarding agent
#[async_trait]
pub trait FibAgent: Send + Sync {
    /// Add or replace unicast routes
    async fn add_unicast_routes(&self, client_id: i32, routes: Vec<UnicastRoute>) -> Result<()>;

    /// Withdraw unicast routes by destination
    async fn delete_unicast_routes(&self, client_id: i32, prefixes: Vec<IpPrefix>) -> Result<()>;

    /// Replace the complete unicast table
    async fn sync_fib(&self, client_id: i32, routes: Vec<UnicastRoute>) -> Result<()>;

    /// Add or replace MPLS routes
    async fn add_mpls_routes(&self, client_id: i32, routes: Vec<MplsRoute>) -> Result<()>;

    /// Withdraw MPLS routes by label
    async fn delete_mpls_routes(&self, client_id: i32, labels: Vec<i32>) -> Result<()>;

    /// Replace the complete MPLS table
    async fn sync_mpls_fib(&self, client_id: i32, routes: Vec<MplsRoute>) -> Result<()>;

    /// Monotonic epoch of the agent process; a change means it restarted
    async fn alive_since(&self) -> Result<i64>;
}

#[derive(Default)]
struct MockState {
    unicast: HashMap<IpPrefix, UnicastRoute>,
    mpls: HashMap<i32, MplsRoute>,
    alive_since: i64,
    failing: bool,
    sync_count: u64,
    mpls_sync_count: u64,
    op_count: u64,
}

/// Recording agent used by tests and dry runs
#[derive(Default)]
pub struct MockFibAgent {
    state: Mutex<MockState>,
}

impl MockFibAgent {
    /// Create an agent reporting epoch 1
    pub fn new() -> Self {
        let agent = Self::default();
        agent.state.lock().alive_since = 1;
        agent
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Simulate an agent restart by bumping the epoch
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.alive_since += 1;
        state.unicast.clear();
        state.mpls.clear();
    }

    /// Programmed unicast routes
    pub fn unicast_routes(&self) -> HashMap<IpPrefix, UnicastRoute> {
        self.state.lock().unicast.clone()
    }

    /// Programmed MPLS routes
    pub fn mpls_routes(&self) -> HashMap<i32, MplsRoute> {
        self.state.lock().mpls.clone()
    }

    /// Number of full unicast syncs performed
    pub fn sync_count(&self) -> u64 {
        self.state.lock().sync_count
    }

    /// Total operations attempted
    pub fn op_count(&self) -> u64 {
        self.state.lock().op_count
    }

    fn guard(&self, op: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.op_count += 1;
        if state.failing {
            return Err(FibError::AgentFailure {
                op: op.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl FibAgent for MockFibAgent {
    async fn add_unicast_routes(&self, _client_id: i32, routes: Vec<UnicastRoute>) -> Result<()> {
        self.guard("addUnicastRoutes")?;
        let mut state = self.state.lock();
        for route in routes {
            if let Some(dest) = route.dest.clone() {
                state.unicast.insert(dest, route);
            }
        }
        Ok(())
    }

    async fn delete_unicast_routes(&self, _client_id: i32, prefixes: Vec<IpPrefix>) -> Result<()> {
        self.guard("deleteUnicastRoutes")?;
        let mut state = self.state.lock();
        for prefix in prefixes {
            state.unicast.remove(&prefix);
        }
        Ok(())
    }

    async fn sync_fib(&self, _client_id: i32, routes: Vec<UnicastRoute>) -> Result<()> {
        self.guard("syncFib")?;
        let mut state = self.state.lock();
        state.sync_count += 1;
        state.unicast = routes
            .into_iter()
            .filter_map(|route| route.dest.clone().map(|dest| (dest, route)))
            .collect();
        Ok(())
    }

    async fn add_mpls_routes(&self, _client_id: i32, routes: Vec<MplsRoute>) -> Result<()> {
        self.guard("addMplsRoutes")?;
        let mut state = self.state.lock();
        for route in routes {
            state.mpls.insert(route.top_label, route);
        }
        Ok(())
    }

    async fn delete_mpls_routes(&self, _client_id: i32, labels: Vec<i32>) -> Result<()> {
        self.guard("deleteMplsRoutes")?;
        let mut state = self.state.lock();
        for label in labels {
            state.mpls.remove(&label);
        }
        Ok(())
    }

    async fn sync_mpls_fib(&self, _client_id: i32, routes: Vec<MplsRoute>) -> Result<()> {
        self.guard("syncMplsFib")?;
        let mut state = self.state.lock();
        state.mpls_sync_count += 1;
        state.mpls = routes
            .into_iter()
            .map(|route| (route.top_label, route))
            .collect();
        Ok(())
    }

    async fn alive_since(&self) -> Result<i64> {
        self.guard("aliveSince")?;
        Ok(self.state.lock().alive_since)
    }
}
