//! Session collaborator
//!
//! The session is the application side of the engine: it knows the local
//! nickname, asks the service node to broker connections, and receives
//! errors raised on the transport thread.

use crate::peer::PeerError;

pub trait Session: Send + Sync {
    /// Local identity sent in every hail
    fn nickname(&self) -> String;

    /// Ask the service node to connect us to `peer_id`
    ///
    /// Called from application threads and the receive callback, so it must
    /// not block on network I/O.
    fn request_connection(&self, peer_id: &str);

    /// Error raised while processing inbound transport messages
    fn on_async_error(&self, error: PeerError);
}
