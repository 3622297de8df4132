//! Peer transport
//!
//! Length-prefixed framed messaging between KvStore peers over TCP, with
//! optional TLS 1.3. A connection carries a simple request/response
//! protocol: each frame is one serialized [`StoreRequest`] or
//! [`StoreResponse`](crate::protocol::StoreResponse).

mod connection;
mod tls;

pub use connection::{PeerChannel, PeerListener, ServerConnection};
pub use tls::TlsMaterial;

use crate::error::NetworkError;
use crate::protocol::MAX_MESSAGE_SIZE;
use std::net::{SocketAddr, SocketAddrV6};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Parse a peer address, accepting the `[v6%scope]:port` form produced by
/// `SocketAddrV6::to_string` for link-local addresses (std does not parse
/// the scope back)
pub fn parse_peer_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    // [fe80::1%3]:60002
    let rest = s.strip_prefix('[')?;
    let (host, port) = rest.rsplit_once("]:")?;
    let (addr, scope) = host.split_once('%')?;
    let addr: std::net::Ipv6Addr = addr.parse().ok()?;
    let scope: u32 = scope.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, scope)))
}

/// Write one framed message: 4-byte big-endian length, then the payload
pub(crate) async fn send_framed<S>(stream: &mut S, payload: &[u8]) -> Result<(), NetworkError>
where
    S: AsyncWriteExt + Unpin,
{
    let len = payload.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| NetworkError::SendFailed {
            reason: format!("failed to write length prefix: {}", e),
        })?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| NetworkError::SendFailed {
            reason: format!("failed to write payload: {}", e),
        })?;
    stream.flush().await.map_err(|e| NetworkError::SendFailed {
        reason: format!("failed to flush: {}", e),
    })?;
    Ok(())
}

/// Read one framed message, enforcing the size cap before allocating
pub(crate) async fn recv_framed<S>(stream: &mut S) -> Result<Vec<u8>, NetworkError>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionReset
        } else {
            NetworkError::ReceiveFailed {
                reason: format!("failed to read length prefix: {}", e),
            }
        }
    })?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge { size: len });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionReset
        } else {
            NetworkError::ReceiveFailed {
                reason: format!("failed to read payload: {}", e),
            }
        }
    })?;
    Ok(payload)
}
