//! Peer Chat Connection Engine
//!
//! This crate provides the peer-to-peer transport core of the chat client:
//! - Rendezvous with a service node and NAT hole punching
//! - X25519 key agreement carried in connection hails
//! - Encrypted, length-framed command packages per link
//! - Buffering of commands until their link exists
//! - Ordered per-peer dispatch of inbound commands
//! - A QUIC transport over a single UDP socket

// ============================================================================
// Modules
// ============================================================================

pub mod command_id;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod framing;
pub mod hail;
pub mod link;
pub mod metrics;
pub mod package;
pub mod packer;
pub mod peer;
pub mod session;
pub mod state;
pub mod transport;
pub mod waiting;

// ============================================================================
// Re-exports
// ============================================================================

pub use command_id::ServerCommandId;
pub use config::PeerConfig;
pub use dispatch::{
    Command, CommandArgs, CommandMap, CommandRegistry, ExecutionQueue, RequestQueue,
};
pub use package::{Package, Unpacked};
pub use packer::{PackError, Packer};
pub use peer::{AsyncPeer, PeerError};
pub use session::Session;
pub use state::PeerState;
pub use transport::quic::{QuicConfig, QuicTransport};
pub use transport::{
    ConnectionHandle, ConnectionStatus, DeliveryMode, Transport, TransportConfig,
    TransportError, TransportMessage,
};
