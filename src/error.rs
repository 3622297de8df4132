//! Error types for Trellis
//!
//! Each subsystem has its own error enum; `TrellisError` is the umbrella
//! type returned by public APIs. Internal event handlers never propagate
//! errors across the task boundary; they log and continue.

use std::path::PathBuf;
use thiserror::Error;

/// Network and transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to establish a connection to a peer
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Address we tried to reach
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// TLS handshake with a peer failed
    #[error("TLS handshake failed: {reason}")]
    TlsHandshakeFailed {
        /// Underlying failure
        reason: String,
    },

    /// Connection closed while an operation was in flight
    #[error("Connection to {peer} closed")]
    ConnectionClosed {
        /// Peer name
        peer: String,
    },

    /// Peer reset the connection
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Sending a message failed
    #[error("Send failed: {reason}")]
    SendFailed {
        /// Underlying failure
        reason: String,
    },

    /// Receiving a message failed
    #[error("Receive failed: {reason}")]
    ReceiveFailed {
        /// Underlying failure
        reason: String,
    },

    /// Frame exceeds the maximum message size
    #[error("Message too large: {size} bytes")]
    MessageTooLarge {
        /// Offending size
        size: usize,
    },

    /// Request timed out
    #[error("Request to {peer} timed out")]
    Timeout {
        /// Peer name
        peer: String,
    },
}

/// KvStore errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation referenced an area this store does not participate in
    #[error("Unknown area: {area}")]
    UnknownArea {
        /// Area identifier
        area: String,
    },

    /// Operation referenced a peer that is not configured
    #[error("Unknown peer: {peer}")]
    UnknownPeer {
        /// Peer name
        peer: String,
    },

    /// Requested key does not exist
    #[error("Key not found: {key}")]
    KeyNotFound {
        /// Key name
        key: String,
    },

    /// The store task has shut down
    #[error("KvStore is not running")]
    NotRunning,

    /// Full sync with a peer failed
    #[error("Sync with {peer} failed: {reason}")]
    SyncFailed {
        /// Peer name
        peer: String,
        /// Underlying failure
        reason: String,
    },
}

/// Spark neighbor-discovery errors
#[derive(Error, Debug)]
pub enum SparkError {
    /// Multicast socket setup failed
    #[error("Multicast setup on {if_name} failed: {reason}")]
    McastSetupFailed {
        /// Interface name
        if_name: String,
        /// Underlying failure
        reason: String,
    },

    /// Operation referenced an interface Spark is not tracking
    #[error("Unknown interface: {if_name}")]
    UnknownInterface {
        /// Interface name
        if_name: String,
    },

    /// Packet failed validation and was dropped
    #[error("Invalid packet on {if_name}: {reason}")]
    InvalidPacket {
        /// Interface the packet arrived on
        if_name: String,
        /// Rejection reason
        reason: String,
    },
}

/// LinkMonitor errors
#[derive(Error, Debug)]
pub enum LinkMonitorError {
    /// Operation referenced an unknown interface
    #[error("Unknown interface: {if_name}")]
    UnknownInterface {
        /// Interface name
        if_name: String,
    },

    /// Operation referenced an unknown adjacency
    #[error("Unknown adjacency: {if_name}/{node}")]
    UnknownAdjacency {
        /// Local interface name
        if_name: String,
        /// Remote node name
        node: String,
    },

    /// The link monitor task has shut down
    #[error("LinkMonitor is not running")]
    NotRunning,
}

/// PrefixManager / PrefixAllocator errors
#[derive(Error, Debug)]
pub enum PrefixError {
    /// A prefix entry failed validation
    #[error("Invalid prefix entry: {reason}")]
    InvalidEntry {
        /// Rejection reason
        reason: String,
    },

    /// Seed-prefix allocation parameters are unusable
    #[error("Invalid allocation parameters '{params}': {reason}")]
    InvalidAllocParams {
        /// Raw parameter string
        params: String,
        /// Rejection reason
        reason: String,
    },

    /// The allocation space is exhausted
    #[error("No free prefix index in a space of {space} entries")]
    SpaceExhausted {
        /// Number of allocatable indices
        space: u32,
    },

    /// The prefix manager task has shut down
    #[error("PrefixManager is not running")]
    NotRunning,
}

/// Decision errors
#[derive(Error, Debug)]
pub enum DecisionError {
    /// A route query referenced an unknown node
    #[error("No route database for node {node}")]
    UnknownNode {
        /// Node name
        node: String,
    },

    /// The decision task has shut down
    #[error("Decision is not running")]
    NotRunning,
}

/// FIB programming errors
#[derive(Error, Debug)]
pub enum FibError {
    /// The forwarding agent rejected or failed an operation
    #[error("Agent operation {op} failed: {reason}")]
    AgentFailure {
        /// Operation name
        op: String,
        /// Underlying failure
        reason: String,
    },

    /// The FIB task has shut down
    #[error("Fib is not running")]
    NotRunning,
}

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backing file could not be read or written
    #[error("Storage I/O on {path}: {source}")]
    Io {
        /// Backing file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Backing file contents are not in the expected format
    #[error("Corrupt store file {path}: {reason}")]
    Corrupt {
        /// Backing file path
        path: PathBuf,
        /// What failed to parse
        reason: String,
    },

    /// Requested key does not exist
    #[error("No stored object under key {key}")]
    NotFound {
        /// Object key
        key: String,
    },

    /// A stored blob failed to decode into the requested type
    #[error("Failed to decode object {key}: {reason}")]
    DecodeFailed {
        /// Object key
        key: String,
        /// Decode failure
        reason: String,
    },

    /// The store task has shut down
    #[error("PersistentStore is not running")]
    NotRunning,
}

/// Configuration errors; these are fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required field is missing or zero
    #[error("Missing or invalid required field: {field}")]
    MissingRequiredField {
        /// Field name
        field: String,
    },

    /// A field holds an out-of-range or inconsistent value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// A regex list entry failed to compile
    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        /// Offending pattern
        pattern: String,
        /// Compile error
        reason: String,
    },

    /// The seed prefix cannot support the requested allocation length
    #[error("Invalid seed prefix '{prefix}': {reason}")]
    InvalidSeedPrefix {
        /// Offending prefix string
        prefix: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Protocol (wire-format) errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Failed to serialize a message to bytes
    #[error("Failed to serialize {message_type}: {reason}")]
    SerializationFailed {
        /// Message type name
        message_type: String,
        /// Underlying failure
        reason: String,
    },

    /// Failed to deserialize bytes into a message
    #[error("Failed to deserialize message: {reason}")]
    DeserializationFailed {
        /// Underlying failure
        reason: String,
    },

    /// Message size exceeds the maximum allowed
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Offending size
        size: usize,
        /// Enforced cap
        max: usize,
    },

    /// A field holds a value outside its domain
    #[error("Invalid field {field}: {reason}")]
    InvalidFieldValue {
        /// Field name
        field: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Main error type for Trellis operations
#[derive(Error, Debug)]
pub enum TrellisError {
    /// Network-level errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// KvStore errors
    #[error("KvStore error: {0}")]
    Store(#[from] StoreError),

    /// Spark errors
    #[error("Spark error: {0}")]
    Spark(#[from] SparkError),

    /// LinkMonitor errors
    #[error("LinkMonitor error: {0}")]
    LinkMonitor(#[from] LinkMonitorError),

    /// Prefix management errors
    #[error("Prefix error: {0}")]
    Prefix(#[from] PrefixError),

    /// Decision errors
    #[error("Decision error: {0}")]
    Decision(#[from] DecisionError),

    /// FIB errors
    #[error("Fib error: {0}")]
    Fib(#[from] FibError),

    /// Persistent store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Error codes surfaced by the control-plane facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request referenced an unknown area, peer, key, node or interface
    NotFound = 1,
    /// Request was malformed or inconsistent
    InvalidRequest = 2,
    /// The target component has shut down
    NotRunning = 3,
    /// An internal operation failed; the request may be retried
    Internal = 4,
    /// The request timed out
    Timeout = 5,
}

/// Structured error returned by control-plane operations
#[derive(Error, Debug)]
#[error("[{code:?}] {message}")]
pub struct CtrlError {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
}

impl CtrlError {
    /// Build a ctrl error from a code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<TrellisError> for CtrlError {
    fn from(err: TrellisError) -> Self {
        let code = match &err {
            TrellisError::Store(StoreError::UnknownArea { .. })
            | TrellisError::Store(StoreError::UnknownPeer { .. })
            | TrellisError::Store(StoreError::KeyNotFound { .. })
            | TrellisError::Storage(StorageError::NotFound { .. })
            | TrellisError::Decision(DecisionError::UnknownNode { .. })
            | TrellisError::LinkMonitor(LinkMonitorError::UnknownInterface { .. })
            | TrellisError::LinkMonitor(LinkMonitorError::UnknownAdjacency { .. })
            | TrellisError::Spark(SparkError::UnknownInterface { .. }) => ErrorCode::NotFound,
            TrellisError::Store(StoreError::NotRunning)
            | TrellisError::LinkMonitor(LinkMonitorError::NotRunning)
            | TrellisError::Prefix(PrefixError::NotRunning)
            | TrellisError::Decision(DecisionError::NotRunning)
            | TrellisError::Fib(FibError::NotRunning)
            | TrellisError::Storage(StorageError::NotRunning) => ErrorCode::NotRunning,
            TrellisError::Config(_) | TrellisError::Protocol(_) => ErrorCode::InvalidRequest,
            TrellisError::Network(NetworkError::Timeout { .. }) => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        };
        CtrlError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrellisError::from(StoreError::UnknownArea {
            area: "backbone".to_string(),
        });
        assert_eq!(err.to_string(), "KvStore error: Unknown area: backbone");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: TrellisError = io.into();
        assert!(matches!(err, TrellisError::Io(_)));
    }

    #[test]
    fn test_ctrl_error_codes() {
        let err = TrellisError::from(StoreError::KeyNotFound {
            key: "adj:node1".to_string(),
        });
        let ctrl: CtrlError = err.into();
        assert_eq!(ctrl.code, ErrorCode::NotFound);

        let err = TrellisError::from(FibError::NotRunning);
        let ctrl: CtrlError = err.into();
        assert_eq!(ctrl.code, ErrorCode::NotRunning);

        let err = TrellisError::from(FibError::AgentFailure {
            op: "syncFib".to_string(),
            reason: "connection refused".to_string(),
        });
        let ctrl: CtrlError = err.into();
        assert_eq!(ctrl.code, ErrorCode::Internal);
    }
}
