//! Engine configuration

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Application protocol identifier, negotiated as the transport ALPN
pub const DEFAULT_APP_ID: &str = "peer-chat-v1";

/// Connection timeout, also applied as the transport idle timeout
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest packed message accepted on a reliable stream
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum UDP payload size for transport packets
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1350;

// ============================================================================
// Peer Config
// ============================================================================

/// Tunables for one [`AsyncPeer`](crate::peer::AsyncPeer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Protocol identifier; peers with different ids never link
    pub app_id: String,
    /// Idle time after which a silent connection is dropped
    pub connection_timeout: Duration,
    /// Upper bound on one packed message
    pub max_message_size: usize,
    /// UDP payload size handed to the transport
    pub max_datagram_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.app_id, "peer-chat-v1");
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.max_datagram_size, 1350);
    }
}
