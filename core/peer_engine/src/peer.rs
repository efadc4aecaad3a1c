//! Peer connection engine
//!
//! `AsyncPeer` drives one local peer through rendezvous, NAT traversal and
//! link establishment, then moves encrypted command packages over the
//! resulting links.
//!
//! ```text
//!   Alice                         Service                          Bob
//!     │ connect_to_service ─────────► │ ◄───────── connect_to_service │
//!     │ (service hail: nick, local ep)│                               │
//!     │                               │ ── P2P request ─────────────► │
//!     │ wait_connection(bob_ep)       │                               │
//!     │ ── hole punch [0x00] ─────────┼─────────────────────────────► │
//!     │                               │     connect_to_peer(alice_ep) │
//!     │ ◄─────────────────────────────┼──── peer hail {bob, key} ──── │
//!     │ ── approve: peer hail {alice, key} ─────────────────────────► │
//!     │                                                               │
//!     │      both sides: ECDH ─► HKDF ─► Packer, tag, flush waiting   │
//! ```
//!
//! # Locking
//!
//! One mutex guards the waiting commands, the link registry, pending
//! outbound connections and the service connection. The lifecycle state is a
//! separate atomic and is never updated while the lock is held. Transport
//! calls made under the lock only queue work and never call back.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ring::rand::SystemRandom;
use serde::Serialize;

use crate::config::PeerConfig;
use crate::crypto::{CryptoError, KeyExchange, PUBLIC_KEY_LEN};
use crate::dispatch::{panic_message, CommandArgs, CommandRegistry, ExecutionQueue};
use crate::hail::{HailError, PeerHail, ServiceHail};
use crate::link::{Link, LinkRegistry};
use crate::metrics::PeerMetrics;
use crate::packer::{PackError, Packer};
use crate::package::{Package, Unpacked};
use crate::session::Session;
use crate::state::{PeerState, PeerStateCell};
use crate::transport::{
    interfaces, ConnectionHandle, ConnectionStatus, DeliveryMode, ReceiveCallback, Transport,
    TransportConfig, TransportError, TransportMessage,
};
use crate::waiting::{WaitingCommand, WaitingCommands};

// ============================================================================
// Constants
// ============================================================================

/// Payload of the unconnected datagram that opens a NAT binding
pub const HOLE_PUNCH: u8 = 0;

// ============================================================================
// Engine
// ============================================================================

/// Tables guarded by the engine lock
#[derive(Debug, Default)]
struct PeerTables {
    waiting: WaitingCommands,
    links: LinkRegistry,
    /// Outbound peer connections not yet tagged
    pending: HashMap<ConnectionHandle, String>,
    service_connection: Option<ConnectionHandle>,
    /// Service connection closed by us whose status events may still arrive
    retired_service: Option<ConnectionHandle>,
}

/// Peer connection engine
///
/// Shared as `Arc<AsyncPeer>`; every public method may be called from any
/// thread and none of them blocks on network I/O.
pub struct AsyncPeer {
    /// Handed to the transport callback without creating a cycle
    self_ref: Weak<AsyncPeer>,
    state: PeerStateCell,
    disposed: AtomicBool,
    transport: Arc<dyn Transport>,
    session: Arc<dyn Session>,
    commands: Arc<dyn CommandRegistry>,
    queue: Arc<dyn ExecutionQueue>,
    config: PeerConfig,
    /// Dropped on disposal
    key_exchange: Mutex<Option<KeyExchange>>,
    public_key: [u8; PUBLIC_KEY_LEN],
    tables: Mutex<PeerTables>,
    metrics: PeerMetrics,
}

impl AsyncPeer {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<dyn Session>,
        commands: Arc<dyn CommandRegistry>,
        queue: Arc<dyn ExecutionQueue>,
        config: PeerConfig,
    ) -> Result<Arc<Self>, PeerError> {
        let key_exchange = KeyExchange::generate(&SystemRandom::new())?;
        let public_key = key_exchange.public_key();

        Ok(Arc::new_cyclic(|self_ref| AsyncPeer {
            self_ref: self_ref.clone(),
            state: PeerStateCell::new(),
            disposed: AtomicBool::new(false),
            transport,
            session,
            commands,
            queue,
            config,
            key_exchange: Mutex::new(Some(key_exchange)),
            public_key,
            tables: Mutex::new(PeerTables::default()),
            metrics: PeerMetrics::new(),
        }))
    }

    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    pub fn metrics(&self) -> &PeerMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Public key sent in peer hails
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public_key
    }

    /// Bound address of the transport socket
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    fn tables(&self) -> MutexGuard<'_, PeerTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_disposed(&self) -> Result<(), PeerError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(PeerError::Disposed)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Rendezvous & NAT traversal
    // ========================================================================

    /// Open the rendezvous connection to the service node
    pub fn connect_to_service(&self, remote: SocketAddr) -> Result<(), PeerError> {
        self.check_disposed()?;
        self.state
            .transition(PeerState::NotConnected, PeerState::ConnectedToService)
            .map_err(|state| PeerError::InvalidState {
                operation: "connect_to_service",
                state,
            })?;

        if let Err(e) = self.open_service_connection(remote) {
            log::warn!("Connecting to service at {} failed: {}", remote, e);
            self.transport.shutdown("service connection failed");
            self.state
                .rollback(PeerState::ConnectedToService, PeerState::NotConnected);
            return Err(e);
        }
        Ok(())
    }

    fn open_service_connection(&self, remote: SocketAddr) -> Result<(), PeerError> {
        self.start_transport(remote)?;

        let bound = self
            .transport
            .local_addr()
            .ok_or(PeerError::Transport(TransportError::NotRunning))?;
        let hail = ServiceHail {
            nickname: self.session.nickname(),
            local_endpoint: interfaces::reachable_endpoint(bound),
        };
        log::info!(
            "Connecting to service at {} as '{}' (local endpoint {})",
            remote,
            hail.nickname,
            hail.local_endpoint
        );

        let mut tables = self.tables();
        let connection = self.transport.connect(remote, hail.encode()?)?;
        tables.service_connection = Some(connection);
        Ok(())
    }

    /// Open a NAT binding towards `remote` and wait for it to connect to us
    pub fn wait_connection(&self, remote: SocketAddr) -> Result<(), PeerError> {
        self.check_disposed()?;
        self.enter_peer_mode("wait_connection")?;

        log::info!("Sending hole punch to {}", remote);
        self.transport.send_unconnected(vec![HOLE_PUNCH], remote)?;
        self.drop_service_connection();
        Ok(())
    }

    /// Connect to a peer whose endpoint the service node handed us
    pub fn connect_to_peer(&self, peer_id: &str, remote: SocketAddr) -> Result<(), PeerError> {
        self.check_disposed()?;
        self.enter_peer_mode("connect_to_peer")?;

        self.open_peer_connection(peer_id, remote)?;
        self.drop_service_connection();
        Ok(())
    }

    /// Connect to a peer without a service node
    pub fn connect_direct(&self, peer_id: &str, remote: SocketAddr) -> Result<(), PeerError> {
        self.check_disposed()?;
        self.state
            .transition(PeerState::NotConnected, PeerState::ConnectedToPeers)
            .map_err(|state| PeerError::InvalidState {
                operation: "connect_direct",
                state,
            })?;

        let opened = self
            .start_transport(remote)
            .and_then(|()| self.open_peer_connection(peer_id, remote));
        if let Err(e) = opened {
            log::warn!("Direct connection to '{}' at {} failed: {}", peer_id, remote, e);
            self.transport.shutdown("direct connection failed");
            self.state
                .rollback(PeerState::ConnectedToPeers, PeerState::NotConnected);
            return Err(e);
        }
        Ok(())
    }

    /// `ConnectedToService → ConnectedToPeers`, staying put if already there
    fn enter_peer_mode(&self, operation: &'static str) -> Result<(), PeerError> {
        match self
            .state
            .transition(PeerState::ConnectedToService, PeerState::ConnectedToPeers)
        {
            Ok(()) | Err(PeerState::ConnectedToPeers) => Ok(()),
            Err(state) => Err(PeerError::InvalidState { operation, state }),
        }
    }

    fn start_transport(&self, remote: SocketAddr) -> Result<(), PeerError> {
        let bind_addr = if remote.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let config = TransportConfig::from_peer_config(&self.config, bind_addr);

        let peer = self.self_ref.clone();
        let on_receive: ReceiveCallback = Arc::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.on_receive();
            }
        });

        self.transport.start(&config, on_receive)?;
        log::debug!("Transport started on {:?}", self.transport.local_addr());
        Ok(())
    }

    fn open_peer_connection(&self, peer_id: &str, remote: SocketAddr) -> Result<(), PeerError> {
        let hail = self.peer_hail()?;
        log::info!("Connecting to peer '{}' at {}", peer_id, remote);

        let mut tables = self.tables();
        let connection = self.transport.connect(remote, hail)?;
        tables.pending.insert(connection, peer_id.to_string());
        Ok(())
    }

    fn drop_service_connection(&self) {
        let service = {
            let mut tables = self.tables();
            let service = tables.service_connection.take();
            if service.is_some() {
                tables.retired_service = service;
            }
            service
        };
        if let Some(connection) = service {
            log::debug!("Closing service connection {}", connection);
            if let Err(e) = self.transport.disconnect(connection, "switching to peers") {
                log::debug!("Service disconnect failed: {}", e);
            }
        }
    }

    fn peer_hail(&self) -> Result<Vec<u8>, PeerError> {
        let hail = PeerHail {
            nickname: self.session.nickname(),
            public_key: self.public_key.to_vec(),
        };
        Ok(hail.encode()?)
    }

    // ========================================================================
    // Outbound commands
    // ========================================================================

    /// Whether a tagged, keyed link to `peer_id` exists
    pub fn is_connected(&self, peer_id: &str) -> Result<bool, PeerError> {
        self.check_disposed()?;
        Ok(self.tables().links.contains(peer_id))
    }

    /// Whether a packer exists for `peer_id`
    pub fn has_packer(&self, peer_id: &str) -> bool {
        self.tables().links.get(peer_id).is_some()
    }

    /// Number of commands waiting for a link to `peer_id`
    pub fn pending_commands(&self, peer_id: &str) -> usize {
        self.tables().waiting.count(peer_id)
    }

    /// Pack a package with the link key of `peer_id` without sending it
    pub fn pack_for(
        &self,
        peer_id: &str,
        package: &Package,
        raw_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, PeerError> {
        self.check_disposed()?;
        let tables = self.tables();
        let link = tables
            .links
            .get(peer_id)
            .ok_or_else(|| PeerError::MissingPacker(peer_id.to_string()))?;
        Ok(link.packer.pack(package, raw_data)?)
    }

    /// Send a package, buffering it until a link to `peer_id` exists
    ///
    /// The first buffered command for an identity asks the session for a
    /// connection; later ones only queue behind it.
    pub fn send_package(
        &self,
        peer_id: &str,
        package: Package,
        raw_data: Option<Vec<u8>>,
        unreliable: bool,
    ) -> Result<(), PeerError> {
        self.check_disposed()?;

        let request_connection = {
            let mut tables = self.tables();
            // Disposal clears the tables under this lock
            self.check_disposed()?;

            if self.transport.is_running() {
                if let Some(link) = tables.links.get(peer_id) {
                    return self.send_over(link, &package, raw_data.as_deref(), unreliable);
                }
            }

            log::debug!(
                "No link to '{}', buffering command 0x{:X}",
                peer_id,
                package.id
            );
            PeerMetrics::incr(&self.metrics.commands_buffered);
            tables.waiting.push(
                peer_id,
                WaitingCommand {
                    package,
                    raw_data,
                    unreliable,
                },
            )
        };

        if request_connection {
            log::info!("Requesting connection to '{}'", peer_id);
            self.session.request_connection(peer_id);
        }
        Ok(())
    }

    /// Drop every command waiting for `peer_id`
    ///
    /// Used when the session learns that `peer_id` cannot be reached. The
    /// next send to it requests a connection again. Returns the number of
    /// dropped commands.
    pub fn abandon(&self, peer_id: &str) -> Result<usize, PeerError> {
        self.check_disposed()?;
        let dropped = self.tables().waiting.take(peer_id);
        if !dropped.is_empty() {
            log::info!(
                "Abandoned connection request to '{}', dropped {} waiting commands",
                peer_id,
                dropped.len()
            );
        }
        Ok(dropped.len())
    }

    /// Send a package only if a link to `peer_id` exists
    ///
    /// Returns whether the package was handed to the transport.
    pub fn send_package_if_connected(
        &self,
        peer_id: &str,
        package: Package,
        raw_data: Option<Vec<u8>>,
        unreliable: bool,
    ) -> Result<bool, PeerError> {
        self.check_disposed()?;

        let tables = self.tables();
        match tables.links.get(peer_id) {
            Some(link) if self.transport.is_running() => {
                self.send_over(link, &package, raw_data.as_deref(), unreliable)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn send_message<T: Serialize>(
        &self,
        peer_id: &str,
        id: impl Into<u64>,
        content: &T,
        unreliable: bool,
    ) -> Result<(), PeerError> {
        self.send_package(peer_id, Package::new(id.into(), content)?, None, unreliable)
    }

    pub fn send_message_with_raw<T: Serialize>(
        &self,
        peer_id: &str,
        id: impl Into<u64>,
        content: &T,
        raw_data: Vec<u8>,
        unreliable: bool,
    ) -> Result<(), PeerError> {
        self.send_package(
            peer_id,
            Package::new(id.into(), content)?,
            Some(raw_data),
            unreliable,
        )
    }

    pub fn send_empty(
        &self,
        peer_id: &str,
        id: impl Into<u64>,
        unreliable: bool,
    ) -> Result<(), PeerError> {
        self.send_package(peer_id, Package::empty(id.into()), None, unreliable)
    }

    pub fn send_message_if_connected<T: Serialize>(
        &self,
        peer_id: &str,
        id: impl Into<u64>,
        content: &T,
        unreliable: bool,
    ) -> Result<bool, PeerError> {
        self.send_package_if_connected(
            peer_id,
            Package::new(id.into(), content)?,
            None,
            unreliable,
        )
    }

    pub fn send_empty_if_connected(
        &self,
        peer_id: &str,
        id: impl Into<u64>,
        unreliable: bool,
    ) -> Result<bool, PeerError> {
        self.send_package_if_connected(peer_id, Package::empty(id.into()), None, unreliable)
    }

    /// Pack and hand to the transport; caller holds the engine lock
    fn send_over(
        &self,
        link: &Link,
        package: &Package,
        raw_data: Option<&[u8]>,
        unreliable: bool,
    ) -> Result<(), PeerError> {
        let blob = link.packer.pack(package, raw_data)?;
        let mode = if unreliable {
            DeliveryMode::Unreliable
        } else {
            DeliveryMode::ReliableOrdered
        };

        self.transport.send(link.connection, blob, mode)?;
        PeerMetrics::incr(&self.metrics.packets_sent);
        Ok(())
    }

    // ========================================================================
    // Disposal
    // ========================================================================

    /// Shut the engine down; later calls fail with [`PeerError::Disposed`]
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Disposing peer engine");

        self.transport.shutdown("peer disposed");

        let key_exchange = self
            .key_exchange
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(key_exchange);

        self.queue.close();

        let mut tables = self.tables();
        tables.waiting.clear();
        tables.links.clear();
        tables.pending.clear();
        tables.service_connection = None;
        tables.retired_service = None;
        self.metrics.active_links.store(0, Ordering::Relaxed);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Inbound pipeline
    // ========================================================================

    /// Drain every queued transport message
    fn on_receive(&self) {
        while let Some(message) = self.transport.read_message() {
            if self.is_disposed() {
                return;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.handle_message(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report(e),
                Err(payload) => {
                    self.report(PeerError::Panicked(panic_message(payload.as_ref())))
                }
            }
        }
    }

    fn report(&self, error: PeerError) {
        log::warn!("Peer error: {}", error);
        PeerMetrics::incr(&self.metrics.async_errors);
        self.session.on_async_error(error);
    }

    fn handle_message(&self, message: TransportMessage) -> Result<(), PeerError> {
        match message {
            TransportMessage::Error(e) => {
                Err(PeerError::Transport(TransportError::Reported(e)))
            }
            TransportMessage::Warning(w) => {
                Err(PeerError::Transport(TransportError::Reported(w)))
            }
            TransportMessage::ConnectionApproval {
                connection,
                remote,
                hail,
            } => {
                log::debug!(
                    "Approving connection {} from {} ({} byte hail)",
                    connection,
                    remote,
                    hail.len()
                );
                self.transport.approve(connection, self.peer_hail()?)?;
                Ok(())
            }
            TransportMessage::StatusChanged {
                connection,
                status,
                remote,
                remote_hail,
            } => match status {
                ConnectionStatus::Connected => self.on_connected(connection, remote, remote_hail),
                ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {
                    self.on_disconnected(connection)
                }
                ConnectionStatus::Connecting => {
                    log::trace!("Connection {} to {} in progress", connection, remote);
                    Ok(())
                }
            },
            TransportMessage::Data {
                connection,
                payload,
            } => self.on_data(connection, payload),
            TransportMessage::UnconnectedData { from, payload } => {
                self.on_unconnected_data(from, payload)
            }
        }
    }

    fn on_connected(
        &self,
        connection: ConnectionHandle,
        remote: SocketAddr,
        remote_hail: Option<Vec<u8>>,
    ) -> Result<(), PeerError> {
        let is_service = {
            let tables = self.tables();
            tables.service_connection == Some(connection)
                || tables.retired_service == Some(connection)
        };
        let state = self.state.get();

        if is_service || state == PeerState::ConnectedToService {
            log::info!("Connected to service at {}", remote);
            return Ok(());
        }
        if state != PeerState::ConnectedToPeers {
            log::debug!("Ignoring connection {} in state '{}'", connection, state);
            return Ok(());
        }

        self.on_peer_connected(connection, remote, remote_hail)
    }

    /// Handshake completion: derive the key, tag, flush waiting commands
    fn on_peer_connected(
        &self,
        connection: ConnectionHandle,
        remote: SocketAddr,
        remote_hail: Option<Vec<u8>>,
    ) -> Result<(), PeerError> {
        let hail = match remote_hail.as_deref().map(PeerHail::decode) {
            Some(Ok(hail)) => hail,
            Some(Err(e)) => {
                self.abort_connection(connection, "invalid hail");
                return Err(PeerError::Handshake(format!(
                    "invalid hail from {}: {}",
                    remote, e
                )));
            }
            None => {
                self.abort_connection(connection, "missing hail");
                return Err(PeerError::Handshake(format!(
                    "connection {} from {} carried no hail",
                    connection, remote
                )));
            }
        };

        let derived = {
            let key_exchange = self
                .key_exchange
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match key_exchange.as_ref() {
                Some(kx) => kx.derive_link_key(&hail.public_key),
                None => return Err(PeerError::Disposed),
            }
        };
        let key = match derived {
            Ok(key) => key,
            Err(e) => {
                self.abort_connection(connection, "key agreement failed");
                return Err(PeerError::Crypto(e));
            }
        };
        let packer = Packer::new(&key)?;
        let peer_id = hail.nickname;

        let mut tables = self.tables();
        if self.is_disposed() {
            log::debug!("Ignoring handshake on {} after disposal", connection);
            return Ok(());
        }

        // An outbound connection answered by another identity never links
        // the one it was opened for
        let expected = tables.pending.remove(&connection);
        let mismatched = expected.filter(|expected| *expected != peer_id);
        if let Some(expected) = &mismatched {
            let dropped = tables.waiting.take(expected);
            log::warn!(
                "Connection {} opened for '{}' answered as '{}', dropping {} waiting commands",
                connection,
                expected,
                peer_id,
                dropped.len()
            );
        }

        if tables.links.tag(&peer_id, connection, remote, packer).is_err() {
            drop(tables);
            log::warn!(
                "Connection {} from {} claims identity '{}' which is already linked",
                connection,
                remote,
                peer_id
            );
            self.abort_connection(connection, "duplicate identity");
            if let Some(expected) = mismatched {
                self.report(PeerError::ConnectionFailed(expected));
            }
            return Err(PeerError::DuplicateIdentity(peer_id));
        }

        let waiting = tables.waiting.take(&peer_id);
        PeerMetrics::incr(&self.metrics.handshakes_total);
        PeerMetrics::incr(&self.metrics.active_links);
        log::info!(
            "Link to '{}' established via {} ({}), flushing {} waiting commands",
            peer_id,
            connection,
            remote,
            waiting.len()
        );

        let mut first_error = None;
        if let Some(link) = tables.links.get(&peer_id) {
            for command in waiting {
                let sent = self.send_over(
                    link,
                    &command.package,
                    command.raw_data.as_deref(),
                    command.unreliable,
                );
                if let Err(e) = sent {
                    log::warn!(
                        "Flushing command 0x{:X} to '{}' failed: {}",
                        command.package.id,
                        peer_id,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(tables);

        if let Some(expected) = mismatched {
            self.report(PeerError::ConnectionFailed(expected));
        }
        first_error.map_or(Ok(()), Err)
    }

    fn on_disconnected(&self, connection: ConnectionHandle) -> Result<(), PeerError> {
        let mut tables = self.tables();

        if tables.service_connection == Some(connection) {
            log::info!("Service connection {} closed", connection);
            tables.service_connection = None;
        }
        if tables.retired_service == Some(connection) {
            tables.retired_service = None;
            return Ok(());
        }

        if let Some(peer_id) = tables.links.untag(connection) {
            tables.pending.remove(&connection);
            PeerMetrics::decr(&self.metrics.active_links);
            log::info!("Link to '{}' closed", peer_id);
            return Ok(());
        }

        if let Some(peer_id) = tables.pending.remove(&connection) {
            let dropped = tables.waiting.take(&peer_id);
            drop(tables);
            log::warn!(
                "Connection to '{}' closed before handshake, dropping {} waiting commands",
                peer_id,
                dropped.len()
            );
            return Err(PeerError::ConnectionFailed(peer_id));
        }

        Ok(())
    }

    fn on_data(&self, connection: ConnectionHandle, payload: Vec<u8>) -> Result<(), PeerError> {
        if self.state.get() != PeerState::ConnectedToPeers {
            log::debug!("Dropping data on {} outside peer mode", connection);
            return Ok(());
        }

        let (peer_id, unpacked) = {
            let tables = self.tables();
            if tables.service_connection == Some(connection)
                || tables.retired_service == Some(connection)
            {
                log::debug!("Dropping data on service connection {}", connection);
                return Ok(());
            }

            let peer_id = tables
                .links
                .tag_of(connection)
                .ok_or_else(|| PeerError::MissingPacker(format!("connection {}", connection)))?;
            let link = tables
                .links
                .get(peer_id)
                .ok_or_else(|| PeerError::MissingPacker(peer_id.to_string()))?;
            (peer_id.to_string(), link.packer.unpack(&payload))
        };

        self.dispatch(peer_id, unpacked)
    }

    fn on_unconnected_data(&self, from: SocketAddr, payload: Vec<u8>) -> Result<(), PeerError> {
        if self.state.get() != PeerState::ConnectedToPeers {
            log::trace!("Dropping unconnected datagram from {}", from);
            return Ok(());
        }
        if payload == [HOLE_PUNCH] {
            log::trace!("Hole punch received from {}", from);
            return Ok(());
        }

        let (peer_id, unpacked) = {
            let tables = self.tables();
            let peer_id = tables
                .links
                .find_by_remote(from)
                .ok_or(PeerError::UnknownSender(from))?;
            let link = tables
                .links
                .get(peer_id)
                .ok_or(PeerError::UnknownSender(from))?;
            (peer_id.to_string(), link.packer.unpack(&payload))
        };

        self.dispatch(peer_id, unpacked)
    }

    /// Resolve an unpacked message and queue it on the sender's worker
    fn dispatch(
        &self,
        peer_id: String,
        unpacked: Result<Unpacked, PackError>,
    ) -> Result<(), PeerError> {
        let Unpacked { package, raw_data } = match unpacked {
            Ok(unpacked) => unpacked,
            Err(e) => {
                PeerMetrics::incr(&self.metrics.unpack_errors);
                return Err(PeerError::Pack(e));
            }
        };

        let command = self
            .commands
            .resolve(package.id)
            .ok_or(PeerError::UnknownCommand(package.id))?;

        PeerMetrics::incr(&self.metrics.packets_received);
        log::trace!("Dispatching command 0x{:X} from '{}'", package.id, peer_id);
        self.queue.enqueue(
            &peer_id,
            command,
            CommandArgs {
                peer_id: peer_id.clone(),
                package,
                raw_data,
            },
        );
        Ok(())
    }

    fn abort_connection(&self, connection: ConnectionHandle, reason: &str) {
        if let Err(e) = self.transport.disconnect(connection, reason) {
            log::debug!("Disconnecting {} failed: {}", connection, e);
        }
    }
}

impl Drop for AsyncPeer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for AsyncPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPeer")
            .field("state", &self.state.get())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the peer engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Operation not allowed in the current lifecycle state
    InvalidState {
        operation: &'static str,
        state: PeerState,
    },
    /// Engine was disposed
    Disposed,
    /// No link key for the identity or connection
    MissingPacker(String),
    /// Packing or unpacking failed
    Pack(PackError),
    /// No handler registered for a command id
    UnknownCommand(u64),
    /// Unconnected datagram from an endpoint with no link
    UnknownSender(SocketAddr),
    /// Hail missing or malformed
    Handshake(String),
    /// Identity already linked on another connection
    DuplicateIdentity(String),
    /// Outbound connection closed before its handshake completed
    ConnectionFailed(String),
    Transport(TransportError),
    Crypto(CryptoError),
    /// Message handler panicked
    Panicked(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::InvalidState { operation, state } => {
                write!(f, "{} not allowed while {}", operation, state)
            }
            PeerError::Disposed => write!(f, "peer engine disposed"),
            PeerError::MissingPacker(peer) => write!(f, "no packer for {}", peer),
            PeerError::Pack(e) => write!(f, "pack error: {}", e),
            PeerError::UnknownCommand(id) => write!(f, "unknown command id 0x{:X}", id),
            PeerError::UnknownSender(addr) => write!(f, "datagram from unknown sender {}", addr),
            PeerError::Handshake(e) => write!(f, "handshake failed: {}", e),
            PeerError::DuplicateIdentity(peer) => {
                write!(f, "identity '{}' is already connected", peer)
            }
            PeerError::ConnectionFailed(peer) => write!(f, "connection to '{}' failed", peer),
            PeerError::Transport(e) => write!(f, "transport error: {}", e),
            PeerError::Crypto(e) => write!(f, "crypto error: {}", e),
            PeerError::Panicked(msg) => write!(f, "message handler panicked: {}", msg),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeerError::Pack(e) => Some(e),
            PeerError::Transport(e) => Some(e),
            PeerError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for PeerError {
    fn from(e: PackError) -> Self {
        PeerError::Pack(e)
    }
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        PeerError::Transport(e)
    }
}

impl From<CryptoError> for PeerError {
    fn from(e: CryptoError) -> Self {
        PeerError::Crypto(e)
    }
}

impl From<HailError> for PeerError {
    fn from(e: HailError) -> Self {
        PeerError::Handshake(e.to_string())
    }
}
