//! Link identity registry
//!
//! The registry maintains mappings between:
//! - Peer identities and their tagged link (connection + packer)
//! - Connection handles and the identity they were tagged with
//!
//! Connections are owned by the transport; the registry only keeps
//! handles. An entry exists from handshake completion until the
//! connection reports a disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::packer::Packer;
use crate::transport::ConnectionHandle;

// ============================================================================
// Link
// ============================================================================

/// A tagged, keyed connection to one peer identity
#[derive(Debug)]
pub struct Link {
    /// Transport connection carrying this link
    pub connection: ConnectionHandle,
    /// Remote endpoint reported when the link came up
    pub remote: SocketAddr,
    /// Encryptor for this link
    pub packer: Packer,
}

// ============================================================================
// Registry Structure
// ============================================================================

/// Registry of live links keyed by peer identity
#[derive(Debug, Default)]
pub struct LinkRegistry {
    /// Map from peer identity to its link
    links: HashMap<String, Link>,

    /// Reverse map: connection handle to peer identity (the tag)
    tags: HashMap<ConnectionHandle, String>,
}

impl LinkRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag a connection with a peer identity
    ///
    /// Refuses (and hands the packer back) if the identity is already linked
    /// or the connection already carries a tag.
    pub fn tag(
        &mut self,
        peer_id: &str,
        connection: ConnectionHandle,
        remote: SocketAddr,
        packer: Packer,
    ) -> Result<(), Packer> {
        if self.links.contains_key(peer_id) || self.tags.contains_key(&connection) {
            return Err(packer);
        }

        log::debug!(
            "Tagging connection {} as '{}' ({})",
            connection,
            peer_id,
            remote
        );
        self.tags.insert(connection, peer_id.to_string());
        self.links.insert(
            peer_id.to_string(),
            Link {
                connection,
                remote,
                packer,
            },
        );
        Ok(())
    }

    /// Clear the tag of a connection and drop its packer
    ///
    /// Returns the identity the connection carried, if any.
    pub fn untag(&mut self, connection: ConnectionHandle) -> Option<String> {
        let peer_id = self.tags.remove(&connection)?;
        self.links.remove(&peer_id);
        log::debug!("Untagged connection {} ('{}')", connection, peer_id);
        Some(peer_id)
    }

    /// Find the link for a peer identity
    pub fn get(&self, peer_id: &str) -> Option<&Link> {
        self.links.get(peer_id)
    }

    /// Identity a connection was tagged with
    pub fn tag_of(&self, connection: ConnectionHandle) -> Option<&str> {
        self.tags.get(&connection).map(String::as_str)
    }

    /// Identity of the link whose remote endpoint is `addr`
    pub fn find_by_remote(&self, addr: SocketAddr) -> Option<&str> {
        self.links
            .iter()
            .find(|(_, link)| link.remote == addr)
            .map(|(peer_id, _)| peer_id.as_str())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Drop every link (disposal)
    pub fn clear(&mut self) {
        self.links.clear();
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LINK_KEY_LEN;

    fn packer() -> Packer {
        Packer::new(&[3u8; LINK_KEY_LEN]).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 5], port))
    }

    #[test]
    fn test_tag_and_lookup() {
        let mut registry = LinkRegistry::new();
        registry
            .tag("bob", ConnectionHandle(1), addr(9001), packer())
            .unwrap();

        assert!(registry.contains("bob"));
        assert_eq!(registry.get("bob").unwrap().connection, ConnectionHandle(1));
        assert_eq!(registry.tag_of(ConnectionHandle(1)), Some("bob"));
        assert_eq!(registry.find_by_remote(addr(9001)), Some("bob"));
        assert_eq!(registry.find_by_remote(addr(9002)), None);
    }

    #[test]
    fn test_duplicate_identity_refused() {
        let mut registry = LinkRegistry::new();
        registry
            .tag("bob", ConnectionHandle(1), addr(9001), packer())
            .unwrap();

        assert!(registry
            .tag("bob", ConnectionHandle(2), addr(9002), packer())
            .is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tag_of(ConnectionHandle(2)), None);
    }

    #[test]
    fn test_retag_connection_refused() {
        let mut registry = LinkRegistry::new();
        registry
            .tag("bob", ConnectionHandle(1), addr(9001), packer())
            .unwrap();

        assert!(registry
            .tag("carol", ConnectionHandle(1), addr(9001), packer())
            .is_err());
        assert!(!registry.contains("carol"));
    }

    #[test]
    fn test_untag() {
        let mut registry = LinkRegistry::new();
        registry
            .tag("bob", ConnectionHandle(1), addr(9001), packer())
            .unwrap();

        assert_eq!(registry.untag(ConnectionHandle(1)), Some("bob".to_string()));
        assert!(registry.is_empty());
        assert_eq!(registry.untag(ConnectionHandle(1)), None);
    }

    #[test]
    fn test_untag_unknown_connection() {
        let mut registry = LinkRegistry::new();
        assert_eq!(registry.untag(ConnectionHandle(42)), None);
    }
}
