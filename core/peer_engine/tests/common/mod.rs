//! Shared fixtures for engine integration tests
//!
//! `MockTransport` records every call the engine makes and lets a test
//! inject transport messages, invoking the engine callback the way the real
//! event loop does.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use peer_engine::crypto::KeyExchange;
use peer_engine::dispatch::{Command, CommandArgs, CommandMap, CommandRegistry, ExecutionQueue};
use peer_engine::hail::PeerHail;
use peer_engine::transport::ReceiveCallback;
use peer_engine::{
    AsyncPeer, ConnectionHandle, ConnectionStatus, DeliveryMode, PeerConfig, PeerError, Packer,
    Session, Transport, TransportConfig, TransportError, TransportMessage,
};
use ring::rand::SystemRandom;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Mock Transport
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct TransportLog {
    pub starts: Vec<TransportConfig>,
    pub connects: Vec<(ConnectionHandle, SocketAddr, Vec<u8>)>,
    pub approvals: Vec<(ConnectionHandle, Vec<u8>)>,
    pub disconnects: Vec<(ConnectionHandle, String)>,
    pub sends: Vec<(ConnectionHandle, Vec<u8>, DeliveryMode)>,
    pub unconnected: Vec<(Vec<u8>, SocketAddr)>,
    pub shutdowns: usize,
}

pub struct MockTransport {
    local: SocketAddr,
    running: AtomicBool,
    fail_start: AtomicBool,
    next_handle: AtomicU64,
    callback: Mutex<Option<ReceiveCallback>>,
    messages: Mutex<VecDeque<TransportMessage>>,
    log: Mutex<TransportLog>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: SocketAddr::from(([192, 168, 1, 20], 40000)),
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            callback: Mutex::new(None),
            messages: Mutex::new(VecDeque::new()),
            log: Mutex::new(TransportLog::default()),
        })
    }

    /// Make the next `start` fail
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> TransportLog {
        self.log.lock().unwrap().clone()
    }

    /// Queue messages and run the engine callback once
    pub fn deliver(&self, messages: Vec<TransportMessage>) {
        self.messages.lock().unwrap().extend(messages);
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn queued(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn require_running(&self) -> Result<(), TransportError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotRunning)
        }
    }
}

impl Transport for MockTransport {
    fn start(
        &self,
        config: &TransportConfig,
        on_receive: ReceiveCallback,
    ) -> Result<(), TransportError> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io("address in use".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning);
        }
        *self.callback.lock().unwrap() = Some(on_receive);
        self.log.lock().unwrap().starts.push(config.clone());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.is_running().then_some(self.local)
    }

    fn connect(
        &self,
        remote: SocketAddr,
        hail: Vec<u8>,
    ) -> Result<ConnectionHandle, TransportError> {
        self.require_running()?;
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.log.lock().unwrap().connects.push((handle, remote, hail));
        Ok(handle)
    }

    fn approve(&self, connection: ConnectionHandle, hail: Vec<u8>) -> Result<(), TransportError> {
        self.require_running()?;
        self.log.lock().unwrap().approvals.push((connection, hail));
        Ok(())
    }

    fn deny(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        self.disconnect(connection, reason)
    }

    fn disconnect(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        self.require_running()?;
        self.log
            .lock()
            .unwrap()
            .disconnects
            .push((connection, reason.to_string()));
        Ok(())
    }

    fn send(
        &self,
        connection: ConnectionHandle,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        self.require_running()?;
        self.log.lock().unwrap().sends.push((connection, payload, mode));
        Ok(())
    }

    fn send_unconnected(&self, payload: Vec<u8>, remote: SocketAddr) -> Result<(), TransportError> {
        self.require_running()?;
        self.log.lock().unwrap().unconnected.push((payload, remote));
        Ok(())
    }

    fn read_message(&self) -> Option<TransportMessage> {
        self.messages.lock().unwrap().pop_front()
    }

    fn shutdown(&self, _reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        *self.callback.lock().unwrap() = None;
        self.log.lock().unwrap().shutdowns += 1;
    }
}

// ============================================================================
// Session, Commands, Queue
// ============================================================================

pub struct RecordingSession {
    nickname: String,
    pub requests: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<PeerError>>,
}

impl RecordingSession {
    pub fn new(nickname: &str) -> Arc<Self> {
        Arc::new(Self {
            nickname: nickname.to_string(),
            requests: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<PeerError> {
        self.errors.lock().unwrap().clone()
    }
}

impl Session for RecordingSession {
    fn nickname(&self) -> String {
        self.nickname.clone()
    }

    fn request_connection(&self, peer_id: &str) {
        self.requests.lock().unwrap().push(peer_id.to_string());
    }

    fn on_async_error(&self, error: PeerError) {
        self.errors.lock().unwrap().push(error);
    }
}

/// Handler that does nothing; execution is observed through the queue
pub struct Noop;

impl Command for Noop {
    fn run(&self, _args: CommandArgs) {}
}

/// Queue that records enqueued commands instead of running them
#[derive(Default)]
pub struct RecordingQueue {
    pub enqueued: Mutex<Vec<CommandArgs>>,
    pub closed: AtomicBool,
}

impl RecordingQueue {
    pub fn enqueued(&self) -> Vec<CommandArgs> {
        self.enqueued.lock().unwrap().clone()
    }
}

impl ExecutionQueue for RecordingQueue {
    fn enqueue(&self, peer_id: &str, _command: Arc<dyn Command>, args: CommandArgs) {
        assert_eq!(peer_id, args.peer_id);
        self.enqueued.lock().unwrap().push(args);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn command_map(ids: &[u64]) -> Arc<CommandMap> {
    let mut map = CommandMap::new();
    for id in ids {
        map.register(*id, Arc::new(Noop));
    }
    Arc::new(map)
}

// ============================================================================
// Engine Fixture
// ============================================================================

pub struct Fixture {
    pub peer: Arc<AsyncPeer>,
    pub transport: Arc<MockTransport>,
    pub session: Arc<RecordingSession>,
    pub queue: Arc<RecordingQueue>,
}

impl Fixture {
    pub fn new(nickname: &str, known_commands: &[u64]) -> Self {
        Self::with_registry(nickname, command_map(known_commands))
    }

    pub fn with_registry(nickname: &str, commands: Arc<dyn CommandRegistry>) -> Self {
        init_logging();
        let transport = MockTransport::new();
        let session = RecordingSession::new(nickname);
        let queue = Arc::new(RecordingQueue::default());

        let peer = AsyncPeer::new(
            transport.clone(),
            session.clone(),
            commands,
            queue.clone(),
            PeerConfig::default(),
        )
        .unwrap();

        Self {
            peer,
            transport,
            session,
            queue,
        }
    }
}

// ============================================================================
// Remote Peer
// ============================================================================

/// The other end of a link, holding its own key pair
pub struct RemotePeer {
    pub nickname: String,
    pub addr: SocketAddr,
    key_exchange: KeyExchange,
}

impl RemotePeer {
    pub fn new(nickname: &str, addr: SocketAddr) -> Self {
        Self {
            nickname: nickname.to_string(),
            addr,
            key_exchange: KeyExchange::generate(&SystemRandom::new()).unwrap(),
        }
    }

    pub fn hail(&self) -> Vec<u8> {
        PeerHail {
            nickname: self.nickname.clone(),
            public_key: self.key_exchange.public_key().to_vec(),
        }
        .encode()
        .unwrap()
    }

    /// Packer this peer derives for a link with `local`
    pub fn packer_for(&self, local: &AsyncPeer) -> Packer {
        let key = self
            .key_exchange
            .derive_link_key(&local.public_key())
            .unwrap();
        Packer::new(&key).unwrap()
    }

    /// Status message announcing a completed handshake with this peer
    pub fn connected(&self, connection: ConnectionHandle) -> TransportMessage {
        TransportMessage::StatusChanged {
            connection,
            status: ConnectionStatus::Connected,
            remote: self.addr,
            remote_hail: Some(self.hail()),
        }
    }
}

pub fn disconnected(connection: ConnectionHandle, remote: SocketAddr) -> TransportMessage {
    TransportMessage::StatusChanged {
        connection,
        status: ConnectionStatus::Disconnected,
        remote,
        remote_hail: None,
    }
}
