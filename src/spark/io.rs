//! Spark I/O provider
//!
//! Socket access sits behind a trait so the discovery protocol can run on
//! an in-memory hub in tests. The real provider is one UDP socket joined
//! to the link-local multicast group per interface; the arrival interface
//! is recovered from the link-local source address scope.

use crate::error::{Result, SparkError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

/// A datagram delivered to Spark
#[derive(Debug, Clone)]
pub struct SparkDatagram {
    /// Interface the packet arrived on
    pub if_name: String,
    /// Raw packet bytes
    pub payload: Vec<u8>,
    /// Source address
    pub src: IpAddr,
    /// Receive timestamp (microseconds, local clock)
    pub recv_ts_us: i64,
}

/// I/O primitives Spark runs on
#[async_trait]
pub trait SparkIoProvider: Send + Sync {
    /// Start sending/receiving on an interface
    async fn add_interface(&self, if_name: &str, if_index: i32) -> Result<()>;

    /// Stop sending/receiving on an interface
    async fn remove_interface(&self, if_name: &str) -> Result<()>;

    /// Multicast one packet out of an interface
    async fn send(&self, if_name: &str, payload: Vec<u8>) -> Result<()>;

    /// Await the next packet from any joined interface
    async fn recv(&self) -> Result<SparkDatagram>;
}

/// Microsecond timestamp on the shared wall clock
pub fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// UDP multicast provider used in production
///
/// One socket bound to the Spark port, joined to `ff02::1` per tracked
/// interface; the egress interface is selected through the destination
/// scope id, the ingress interface recovered from the source scope id.
pub struct UdpIoProvider {
    socket: Arc<UdpSocket>,
    group: Ipv6Addr,
    port: u16,
    // if_name <-> if_index, maintained on add/remove
    interfaces: Mutex<HashMap<String, u32>>,
    names_by_index: Mutex<HashMap<u32, String>>,
}

impl UdpIoProvider {
    /// Bind the multicast socket on `port`
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::UNSPECIFIED,
            port,
            0,
            0,
        )))
        .await
        .map_err(|e| SparkError::McastSetupFailed {
            if_name: "*".to_string(),
            reason: e.to_string(),
        })?;
        socket.set_multicast_loop_v6(false).ok();
        Ok(Self {
            socket: Arc::new(socket),
            group: crate::config::Config::spark_mcast_addr(),
            port,
            interfaces: Mutex::new(HashMap::new()),
            names_by_index: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SparkIoProvider for UdpIoProvider {
    async fn add_interface(&self, if_name: &str, if_index: i32) -> Result<()> {
        let if_index = if_index.max(0) as u32;
        self.socket
            .join_multicast_v6(&self.group, if_index)
            .map_err(|e| SparkError::McastSetupFailed {
                if_name: if_name.to_string(),
                reason: e.to_string(),
            })?;
        self.interfaces.lock().insert(if_name.to_string(), if_index);
        self.names_by_index
            .lock()
            .insert(if_index, if_name.to_string());
        debug!("joined {} on {} (ifindex {})", self.group, if_name, if_index);
        Ok(())
    }

    async fn remove_interface(&self, if_name: &str) -> Result<()> {
        let if_index = self.interfaces.lock().remove(if_name);
        if let Some(if_index) = if_index {
            self.names_by_index.lock().remove(&if_index);
            // membership drops with the interface; ignore errors from an
            // interface that already disappeared
            let _ = self.socket.leave_multicast_v6(&self.group, if_index);
        }
        Ok(())
    }

    async fn send(&self, if_name: &str, payload: Vec<u8>) -> Result<()> {
        let if_index =
            self.interfaces
                .lock()
                .get(if_name)
                .copied()
                .ok_or_else(|| SparkError::UnknownInterface {
                    if_name: if_name.to_string(),
                })?;
        let dest = SocketAddr::V6(SocketAddrV6::new(self.group, self.port, 0, if_index));
        self.socket
            .send_to(&payload, dest)
            .await
            .map_err(|e| SparkError::McastSetupFailed {
                if_name: if_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self) -> Result<SparkDatagram> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await.map_err(|e| {
                crate::error::TrellisError::from(SparkError::McastSetupFailed {
                    if_name: "*".to_string(),
                    reason: e.to_string(),
                })
            })?;
            let recv_ts_us = now_us();
            // link-local sources carry the arrival interface in the scope
            let if_name = match src {
                SocketAddr::V6(v6) => self.names_by_index.lock().get(&v6.scope_id()).cloned(),
                SocketAddr::V4(_) => None,
            };
            match if_name {
                Some(if_name) => {
                    return Ok(SparkDatagram {
                        if_name,
                        payload: buf[..len].to_vec(),
                        src: src.ip(),
                        recv_ts_us,
                    })
                }
                None => {
                    // packet from an interface we are not tracking
                    continue;
                }
            }
        }
    }
}

/// In-memory hub wiring several virtual nodes together, for tests
///
/// Each endpoint is a (node, interface); links connect endpoint pairs.
/// Sending out an interface delivers to every endpoint linked to it.
pub struct TestIoHub {
    inner: Arc<Mutex<HubInner>>,
}

struct HubInner {
    // (node, if_name) -> sender toward that endpoint's provider
    endpoints: HashMap<(String, String), tokio::sync::mpsc::UnboundedSender<SparkDatagram>>,
    // (node, if_name) -> remote endpoints reachable from it
    links: HashMap<(String, String), Vec<(String, String)>>,
    // per-endpoint synthetic source addresses
    addrs: HashMap<(String, String), IpAddr>,
    partitioned: Vec<(String, String)>,
}

impl Default for TestIoHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TestIoHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                endpoints: HashMap::new(),
                links: HashMap::new(),
                addrs: HashMap::new(),
                partitioned: Vec::new(),
            })),
        }
    }

    /// Register a node's provider on the hub
    pub fn provider(&self, node: impl Into<String>) -> Arc<TestIoProvider> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(TestIoProvider {
            node: node.into(),
            hub: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
            tx,
        })
    }

    /// Wire two endpoints together bidirectionally with synthetic
    /// link-local addresses
    pub fn link(
        &self,
        a: (impl Into<String>, impl Into<String>),
        b: (impl Into<String>, impl Into<String>),
    ) {
        let a = (a.0.into(), a.1.into());
        let b = (b.0.into(), b.1.into());
        let mut inner = self.inner.lock();
        let index = inner.addrs.len() as u16;
        inner.addrs.entry(a.clone()).or_insert(IpAddr::V6(Ipv6Addr::new(
            0xfe80,
            0,
            0,
            0,
            0,
            0,
            0,
            index * 2 + 1,
        )));
        let index = inner.addrs.len() as u16;
        inner.addrs.entry(b.clone()).or_insert(IpAddr::V6(Ipv6Addr::new(
            0xfe80,
            0,
            0,
            0,
            0,
            0,
            0,
            index * 2 + 2,
        )));
        inner.links.entry(a.clone()).or_default().push(b.clone());
        inner.links.entry(b).or_default().push(a);
    }

    /// Drop (or restore) delivery from one endpoint, simulating link loss
    pub fn set_partitioned(&self, node: impl Into<String>, if_name: impl Into<String>, down: bool) {
        let endpoint = (node.into(), if_name.into());
        let mut inner = self.inner.lock();
        if down {
            if !inner.partitioned.contains(&endpoint) {
                inner.partitioned.push(endpoint);
            }
        } else {
            inner.partitioned.retain(|e| e != &endpoint);
        }
    }
}

/// One node's view of the hub
pub struct TestIoProvider {
    node: String,
    hub: Arc<Mutex<HubInner>>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<SparkDatagram>>,
    tx: tokio::sync::mpsc::UnboundedSender<SparkDatagram>,
}

#[async_trait]
impl SparkIoProvider for TestIoProvider {
    async fn add_interface(&self, if_name: &str, _if_index: i32) -> Result<()> {
        let mut inner = self.hub.lock();
        inner
            .endpoints
            .insert((self.node.clone(), if_name.to_string()), self.tx.clone());
        Ok(())
    }

    async fn remove_interface(&self, if_name: &str) -> Result<()> {
        let mut inner = self.hub.lock();
        inner.endpoints.remove(&(self.node.clone(), if_name.to_string()));
        Ok(())
    }

    async fn send(&self, if_name: &str, payload: Vec<u8>) -> Result<()> {
        let endpoint = (self.node.clone(), if_name.to_string());
        let inner = self.hub.lock();
        if inner.partitioned.contains(&endpoint) {
            return Ok(());
        }
        let src = inner
            .addrs
            .get(&endpoint)
            .copied()
            .unwrap_or(IpAddr::V6(Ipv6Addr::LOCALHOST));
        if let Some(remotes) = inner.links.get(&endpoint) {
            for remote in remotes {
                if inner.partitioned.contains(remote) {
                    continue;
                }
                if let Some(tx) = inner.endpoints.get(remote) {
                    let _ = tx.send(SparkDatagram {
                        if_name: remote.1.clone(),
                        payload: payload.clone(),
                        src,
                        recv_ts_us: now_us(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<SparkDatagram> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            SparkError::McastSetupFailed {
                if_name: "*".to_string(),
                reason: "hub closed".to_string(),
            }
            .into()
        })
    }
}
