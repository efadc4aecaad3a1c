//! Transport collaborator
//!
//! The engine never touches sockets. A [`Transport`] owns every connection,
//! hands out opaque [`ConnectionHandle`]s, and queues [`TransportMessage`]s
//! that the engine drains from its receive callback:
//!
//! ```text
//!  application threads                transport thread
//!  ───────────────────                ────────────────
//!  connect / send / approve ──cmd──►  event loop ──► socket
//!                                        │
//!                 read_message() ◄──queue─┴── callback() ──► engine
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    PeerConfig, DEFAULT_APP_ID, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_DATAGRAM_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE,
};

pub mod interfaces;
pub mod quic;

// ============================================================================
// Handles and Messages
// ============================================================================

/// Opaque reference to a transport-owned connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Delivery guarantee requested for one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Delivered once, in order with other reliable sends
    ReliableOrdered,
    /// Best effort, may be lost or reordered
    Unreliable,
}

/// Connection lifecycle as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Event queued by the transport for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    /// Transport-level failure
    Error(String),
    /// Transport-level anomaly that did not stop it
    Warning(String),
    /// Remote side asks to connect; answer with approve or deny
    ConnectionApproval {
        connection: ConnectionHandle,
        remote: SocketAddr,
        hail: Vec<u8>,
    },
    /// Connection moved to a new status
    StatusChanged {
        connection: ConnectionHandle,
        status: ConnectionStatus,
        remote: SocketAddr,
        /// Hail of the remote side, present with `Connected`
        remote_hail: Option<Vec<u8>>,
    },
    /// Payload received on a connection
    Data {
        connection: ConnectionHandle,
        payload: Vec<u8>,
    },
    /// Datagram received outside any connection
    UnconnectedData { from: SocketAddr, payload: Vec<u8> },
}

// ============================================================================
// Configuration
// ============================================================================

/// Settings applied when the transport starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Local socket address (port 0 for ephemeral)
    pub bind_addr: SocketAddr,
    /// Whether inbound connection requests are surfaced for approval
    pub accept_incoming: bool,
    /// Protocol identifier both sides must share
    pub app_id: String,
    /// Idle time after which a connection is dropped
    pub idle_timeout: Duration,
    /// Largest framed message on a reliable stream
    pub max_message_size: usize,
    /// UDP payload size
    pub max_datagram_size: usize,
}

impl TransportConfig {
    /// Configuration derived from engine settings
    pub fn from_peer_config(config: &PeerConfig, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            accept_incoming: true,
            app_id: config.app_id.clone(),
            idle_timeout: config.connection_timeout,
            max_message_size: config.max_message_size,
            max_datagram_size: config.max_datagram_size,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            accept_incoming: true,
            app_id: DEFAULT_APP_ID.to_string(),
            idle_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// Invoked on the transport thread whenever messages were queued
pub type ReceiveCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Transport Trait
// ============================================================================

/// Connection-oriented datagram transport
///
/// All methods are non-blocking: they queue work for the transport thread
/// and return.
pub trait Transport: Send + Sync {
    /// Bind and start the event loop
    fn start(&self, config: &TransportConfig, on_receive: ReceiveCallback)
        -> Result<(), TransportError>;

    fn is_running(&self) -> bool;

    /// Bound socket address, once started
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Open a connection carrying `hail`
    fn connect(&self, remote: SocketAddr, hail: Vec<u8>)
        -> Result<ConnectionHandle, TransportError>;

    /// Accept a pending inbound connection, replying with `hail`
    fn approve(&self, connection: ConnectionHandle, hail: Vec<u8>) -> Result<(), TransportError>;

    /// Refuse a pending inbound connection
    fn deny(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError>;

    fn disconnect(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError>;

    fn send(
        &self,
        connection: ConnectionHandle,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), TransportError>;

    /// Send a datagram outside any connection (hole punching)
    fn send_unconnected(&self, payload: Vec<u8>, remote: SocketAddr) -> Result<(), TransportError>;

    /// Pop the next queued message
    fn read_message(&self) -> Option<TransportMessage>;

    /// Close every connection and stop the event loop
    fn shutdown(&self, reason: &str);
}

// ============================================================================
// Error Types
// ============================================================================

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Operation requires a started transport
    NotRunning,
    /// `start` called twice
    AlreadyRunning,
    /// Handle does not name a live connection
    UnknownConnection(ConnectionHandle),
    /// Payload exceeds the configured message size
    MessageTooLarge(usize),
    /// Socket error
    Io(String),
    /// QUIC protocol error
    Quic(String),
    /// Invalid transport configuration
    Config(String),
    /// Failure reported asynchronously by the transport thread
    Reported(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotRunning => write!(f, "transport not running"),
            TransportError::AlreadyRunning => write!(f, "transport already running"),
            TransportError::UnknownConnection(handle) => {
                write!(f, "unknown connection {}", handle)
            }
            TransportError::MessageTooLarge(len) => {
                write!(f, "message of {} bytes exceeds the size limit", len)
            }
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Quic(e) => write!(f, "QUIC error: {}", e),
            TransportError::Config(e) => write!(f, "configuration error: {}", e),
            TransportError::Reported(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<quiche::Error> for TransportError {
    fn from(e: quiche::Error) -> Self {
        TransportError::Quic(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_peer_config() {
        let peer = PeerConfig {
            connection_timeout: Duration::from_secs(5),
            ..PeerConfig::default()
        };
        let bind = SocketAddr::from(([127, 0, 0, 1], 0));
        let config = TransportConfig::from_peer_config(&peer, bind);

        assert_eq!(config.bind_addr, bind);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert!(config.accept_incoming);
        assert_eq!(config.app_id, peer.app_id);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::UnknownConnection(ConnectionHandle(7)).to_string(),
            "unknown connection #7"
        );
    }
}
