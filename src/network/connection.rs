//! Framed peer connections
//!
//! `PeerChannel` is the client side: one lazily-established connection per
//! peer carrying request/response frames, re-dialed after any I/O error.
//! `PeerListener`/`ServerConnection` are the server side used by the
//! KvStore task.

use crate::error::{NetworkError, Result};
use crate::network::tls::peer_server_name;
use crate::network::{recv_framed, send_framed};
use crate::protocol::{deserialize_message, serialize_message, StoreRequest, StoreResponse};
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// How long to wait for connect and per-request I/O
const IO_TIMEOUT: Duration = Duration::from_secs(10);

enum PeerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A reconnecting request/response channel to one peer
pub struct PeerChannel {
    peer_name: String,
    addr: String,
    tls: Option<Arc<ClientConfig>>,
    stream: Option<PeerStream>,
}

impl PeerChannel {
    /// Create a channel toward `addr`; no connection is made until the
    /// first request
    pub fn new(peer_name: impl Into<String>, addr: impl Into<String>, tls: Option<Arc<ClientConfig>>) -> Self {
        Self {
            peer_name: peer_name.into(),
            addr: addr.into(),
            tls,
            stream: None,
        }
    }

    /// Name of the peer this channel points at
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    async fn connect(&mut self) -> Result<()> {
        let addr: SocketAddr = crate::network::parse_peer_addr(&self.addr).ok_or_else(|| {
            NetworkError::ConnectionFailed {
                address: self.addr.clone(),
                reason: "unparseable address".to_string(),
            }
        })?;
        let tcp = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout {
                peer: self.peer_name.clone(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                address: self.addr.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        let stream = match &self.tls {
            None => PeerStream::Plain(tcp),
            Some(config) => {
                let connector = TlsConnector::from(Arc::clone(config));
                let tls_stream = connector
                    .connect(peer_server_name(), tcp)
                    .await
                    .map_err(|e| NetworkError::TlsHandshakeFailed {
                        reason: e.to_string(),
                    })?;
                PeerStream::Tls(Box::new(tls_stream))
            }
        };
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one request and await its response
    ///
    /// Any I/O error drops the cached connection so the next request
    /// re-dials; the error is returned to the caller, who owns retry
    /// policy (exponential backoff in the sync scheduler).
    pub async fn request(&mut self, request: &StoreRequest) -> Result<StoreResponse> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        let bytes = serialize_message(request)?;
        let result = self.exchange(&bytes).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<StoreResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionClosed {
                peer: self.peer_name.clone(),
            })?;
        let io = async {
            match stream {
                PeerStream::Plain(s) => {
                    send_framed(s, payload).await?;
                    recv_framed(s).await
                }
                PeerStream::Tls(s) => {
                    send_framed(s.as_mut(), payload).await?;
                    recv_framed(s.as_mut()).await
                }
            }
        };
        let reply = tokio::time::timeout(IO_TIMEOUT, io)
            .await
            .map_err(|_| NetworkError::Timeout {
                peer: self.peer_name.clone(),
            })??;
        Ok(deserialize_message(&reply)?)
    }

    /// Drop the cached connection, if any
    pub fn close(&mut self) {
        self.stream = None;
    }
}

enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// An accepted peer connection on the server side
pub struct ServerConnection {
    stream: ServerStream,
    peer_addr: SocketAddr,
}

impl ServerConnection {
    /// Remote address of the connected peer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next request; `ConnectionReset` signals a clean hangup
    pub async fn read_request(&mut self) -> Result<StoreRequest> {
        let bytes = match &mut self.stream {
            ServerStream::Plain(s) => recv_framed(s).await?,
            ServerStream::Tls(s) => recv_framed(s.as_mut()).await?,
        };
        Ok(deserialize_message(&bytes)?)
    }

    /// Write one response frame
    pub async fn send_response(&mut self, response: &StoreResponse) -> Result<()> {
        let bytes = serialize_message(response)?;
        match &mut self.stream {
            ServerStream::Plain(s) => send_framed(s, &bytes).await?,
            ServerStream::Tls(s) => send_framed(s.as_mut(), &bytes).await?,
        }
        Ok(())
    }
}

/// Listener accepting framed peer connections
pub struct PeerListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl PeerListener {
    /// Bind to `addr`; TLS is used when a server config is given
    pub async fn bind(addr: SocketAddr, tls: Option<Arc<ServerConfig>>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                address: addr.to_string(),
                reason: format!("failed to bind listener: {}", e),
            })?;
        Ok(Self {
            listener,
            acceptor: tls.map(TlsAcceptor::from),
        })
    }

    /// The bound local address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection, completing the TLS handshake if enabled
    pub async fn accept(&self) -> Result<ServerConnection> {
        let (tcp, peer_addr) =
            self.listener
                .accept()
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    address: "incoming".to_string(),
                    reason: e.to_string(),
                })?;
        tcp.set_nodelay(true).ok();
        let stream = match &self.acceptor {
            None => ServerStream::Plain(tcp),
            Some(acceptor) => {
                let tls_stream =
                    acceptor
                        .accept(tcp)
                        .await
                        .map_err(|e| NetworkError::TlsHandshakeFailed {
                            reason: e.to_string(),
                        })?;
                ServerStream::Tls(Box::new(tls_stream))
            }
        };
        Ok(ServerConnection { stream, peer_addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{store_request, KeyGetParams};

    #[tokio::test]
    async fn test_plain_request_response() {
        let listener = PeerListener::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let request = conn.read_request().await.unwrap();
            assert_eq!(request.area, "0");
            conn.send_response(&StoreResponse {
                success: true,
                message: String::new(),
                publication: None,
            })
            .await
            .unwrap();
        });

        let mut channel = PeerChannel::new("peer", addr.to_string(), None);
        let response = channel
            .request(&StoreRequest {
                area: "0".to_string(),
                command: Some(store_request::Command::KeyGet(KeyGetParams {
                    keys: vec!["k".to_string()],
                })),
            })
            .await
            .unwrap();
        assert!(response.success);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_request_response() {
        let material = crate::network::TlsMaterial::self_signed("server").unwrap();
        let listener = PeerListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some(material.server_config().unwrap()),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let _request = conn.read_request().await.unwrap();
            conn.send_response(&StoreResponse {
                success: true,
                message: "ok".to_string(),
                publication: None,
            })
            .await
            .unwrap();
        });

        let client_material = crate::network::TlsMaterial::self_signed("client").unwrap();
        let mut channel = PeerChannel::new(
            "server",
            addr.to_string(),
            Some(client_material.client_config().unwrap()),
        );
        let response = channel
            .request(&StoreRequest {
                area: "0".to_string(),
                command: None,
            })
            .await
            .unwrap();
        assert_eq!(response.message, "ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_to_dead_peer_fails() {
        let mut channel = PeerChannel::new("ghost", "127.0.0.1:1", None);
        let result = channel
            .request(&StoreRequest {
                area: "0".to_string(),
                command: None,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_server_restart() {
        let listener = PeerListener::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        // serve exactly one request, then drop the connection
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let _ = conn.read_request().await.unwrap();
            conn.send_response(&StoreResponse {
                success: true,
                message: String::new(),
                publication: None,
            })
            .await
            .unwrap();
            drop(conn);
            // accept a second connection from the same channel
            let mut conn = listener.accept().await.unwrap();
            let _ = conn.read_request().await.unwrap();
            conn.send_response(&StoreResponse {
                success: true,
                message: "second".to_string(),
                publication: None,
            })
            .await
            .unwrap();
        });

        let mut channel = PeerChannel::new("peer", addr.to_string(), None);
        let request = StoreRequest {
            area: "0".to_string(),
            command: None,
        };
        assert!(channel.request(&request).await.unwrap().success);
        // first re-request may fail while the socket drains, then reconnects
        let mut last = None;
        for _ in 0..3 {
            match channel.request(&request).await {
                Ok(response) => {
                    last = Some(response);
                    break;
                }
                Err(_) => continue,
            }
        }
        assert_eq!(last.unwrap().message, "second");
        server.await.unwrap();
    }
}
