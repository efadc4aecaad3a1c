//! QUIC transport
//!
//! One UDP socket carries every connection (service node and peers alike),
//! so the NAT binding opened by the rendezvous connection is reused by the
//! peer connections that follow it.
//!
//! ```text
//!                     ┌───────────────── event loop thread ─────────────────┐
//! connect/send ─cmd─► │ mio Poll ──► UdpSocket ──► quiche::Connection (n)   │
//!        Waker::wake  │                 │                 │                 │
//!                     │       not QUIC ─┘      stream 0 / DATAGRAM          │
//!                     │          ▼                        ▼                 │
//!                     │   UnconnectedData         Approval/Status/Data      │
//!                     └──────────────────────────────┬──────────────────────┘
//!                                                    ▼
//!                                       message queue + callback
//! ```
//!
//! # Control stream
//!
//! Stream 0 carries length-framed messages. The client's first frame is its
//! hail; the server surfaces it as [`TransportMessage::ConnectionApproval`]
//! and [`Transport::approve`] writes the reply hail as the server's first
//! frame. Every later frame is reliable data. Unreliable data travels in
//! QUIC DATAGRAM frames.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use ring::rand::{SecureRandom, SystemRandom};

use super::{
    ConnectionHandle, ConnectionStatus, DeliveryMode, ReceiveCallback, Transport,
    TransportConfig, TransportError, TransportMessage,
};
use crate::dispatch::panic_message;
use crate::framing::{self, FrameError};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the command waker
const WAKER_TOKEN: Token = Token(1);

/// Stream carrying hails and reliable data
const CONTROL_STREAM: u64 = 0;

/// Application close code for a normal disconnect
const CLOSE_NORMAL: u64 = 0x0;

/// Application close code for a refused connection
const CLOSE_DENIED: u64 = 0x1;

/// Application close code for a framing violation
const CLOSE_PROTOCOL: u64 = 0x2;

/// Largest UDP datagram we read
const RECV_BUF_SIZE: usize = 65535;

// ============================================================================
// Configuration
// ============================================================================

/// TLS material for the QUIC transport
///
/// Without a configured certificate the transport generates an ephemeral
/// self-signed one when it starts accepting inbound connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicConfig {
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM private key
    pub key_path: Option<PathBuf>,
}

impl QuicConfig {
    pub fn with_certificate(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
        }
    }
}

fn build_quiche_config(
    config: &TransportConfig,
    tls: Option<(&str, &str)>,
) -> Result<quiche::Config, TransportError> {
    let mut qc = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    if let Some((cert, key)) = tls {
        qc.load_cert_chain_from_pem_file(cert)?;
        qc.load_priv_key_from_pem_file(key)?;
    }

    qc.set_application_protos(&[config.app_id.as_bytes()])?;

    qc.enable_dgram(true, 1000, 1000);

    qc.set_max_idle_timeout(config.idle_timeout.as_millis() as u64);
    qc.set_max_recv_udp_payload_size(config.max_datagram_size);
    qc.set_max_send_udp_payload_size(config.max_datagram_size);
    qc.set_initial_max_data(10_000_000);
    qc.set_initial_max_stream_data_bidi_local(1_000_000);
    qc.set_initial_max_stream_data_bidi_remote(1_000_000);
    qc.set_initial_max_streams_bidi(100);
    qc.set_initial_max_streams_uni(100);

    // Link trust comes from the hail key exchange, not from certificates
    qc.verify_peer(false);

    Ok(qc)
}

/// Self-signed certificate written to a private temporary directory
///
/// quiche only loads TLS material from PEM files. The files are removed on
/// drop; the loaded config keeps its own copy.
struct EphemeralCertificate {
    dir: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl EphemeralCertificate {
    fn generate() -> Result<Self, TransportError> {
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .map_err(|e| TransportError::Config(format!("certificate params: {}", e)))?;
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| TransportError::Config(format!("certificate key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Config(format!("self-signed certificate: {}", e)))?;

        let mut suffix = [0u8; 8];
        SystemRandom::new()
            .fill(&mut suffix)
            .map_err(|_| TransportError::Config("random generator failure".into()))?;
        let suffix: String = suffix.iter().map(|b| format!("{:02x}", b)).collect();
        let dir = std::env::temp_dir().join(format!("peer-engine-{}-{}", std::process::id(), suffix));
        std::fs::create_dir_all(&dir)?;

        let ephemeral = Self {
            cert_path: dir.join("cert.pem"),
            key_path: dir.join("key.pem"),
            dir,
        };
        std::fs::write(&ephemeral.cert_path, cert.pem())?;
        std::fs::write(&ephemeral.key_path, key_pair.serialize_pem())?;
        Ok(ephemeral)
    }

    fn paths(&self) -> Result<(&str, &str), TransportError> {
        let cert = self
            .cert_path
            .to_str()
            .ok_or_else(|| TransportError::Config("certificate path is not UTF-8".into()))?;
        let key = self
            .key_path
            .to_str()
            .ok_or_else(|| TransportError::Config("key path is not UTF-8".into()))?;
        Ok((cert, key))
    }
}

impl Drop for EphemeralCertificate {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            log::debug!("Failed to remove {}: {}", self.dir.display(), e);
        }
    }
}

// ============================================================================
// Transport Handle
// ============================================================================

/// Work queued for the event loop
enum LoopCommand {
    Connect {
        connection: ConnectionHandle,
        remote: SocketAddr,
        hail: Vec<u8>,
    },
    Approve {
        connection: ConnectionHandle,
        hail: Vec<u8>,
    },
    Deny {
        connection: ConnectionHandle,
        reason: String,
    },
    Disconnect {
        connection: ConnectionHandle,
        reason: String,
    },
    Send {
        connection: ConnectionHandle,
        payload: Vec<u8>,
        mode: DeliveryMode,
    },
    SendUnconnected {
        payload: Vec<u8>,
        remote: SocketAddr,
    },
    Shutdown {
        reason: String,
    },
}

/// State shared between the handle and the event loop
struct Shared {
    messages: Mutex<VecDeque<TransportMessage>>,
    live: Mutex<HashSet<ConnectionHandle>>,
    running: AtomicBool,
    next_handle: AtomicU64,
}

impl Shared {
    fn allocate_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn live(&self) -> MutexGuard<'_, HashSet<ConnectionHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Running {
    commands: mpsc::Sender<LoopCommand>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
    max_message_size: usize,
}

/// [`Transport`] over QUIC (quiche) on a mio event loop
pub struct QuicTransport {
    tls: QuicConfig,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl QuicTransport {
    pub fn new(tls: QuicConfig) -> Self {
        Self {
            tls,
            shared: Arc::new(Shared {
                messages: Mutex::new(VecDeque::new()),
                live: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                next_handle: AtomicU64::new(1),
            }),
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, command: LoopCommand) -> Result<(), TransportError> {
        let running = self.lock_running();
        let running = running.as_ref().ok_or(TransportError::NotRunning)?;
        running
            .commands
            .send(command)
            .map_err(|_| TransportError::NotRunning)?;
        running.waker.wake()?;
        Ok(())
    }

    fn ensure_live(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        if self.shared.live().contains(&connection) {
            Ok(())
        } else {
            Err(TransportError::UnknownConnection(connection))
        }
    }

    fn tls_paths(&self) -> Result<Option<(&str, &str)>, TransportError> {
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(cert), Some(key)) => {
                let cert = cert
                    .to_str()
                    .ok_or_else(|| TransportError::Config("certificate path is not UTF-8".into()))?;
                let key = key
                    .to_str()
                    .ok_or_else(|| TransportError::Config("key path is not UTF-8".into()))?;
                Ok(Some((cert, key)))
            }
            _ => Ok(None),
        }
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new(QuicConfig::default())
    }
}

impl Transport for QuicTransport {
    fn start(
        &self,
        config: &TransportConfig,
        on_receive: ReceiveCallback,
    ) -> Result<(), TransportError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let client_config = build_quiche_config(config, None)?;
        let server_config = if config.accept_incoming {
            match self.tls_paths()? {
                Some(tls) => Some(build_quiche_config(config, Some(tls))?),
                None => {
                    log::info!("No certificate configured, generating an ephemeral one");
                    let ephemeral = EphemeralCertificate::generate()?;
                    Some(build_quiche_config(config, Some(ephemeral.paths()?))?)
                }
            }
        } else {
            None
        };

        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(config.bind_addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_addr = socket.local_addr()?;

        let (commands, receiver) = mpsc::channel();

        let event_loop = EventLoop {
            poll,
            socket,
            local_addr,
            client_config,
            server_config,
            commands: receiver,
            shared: self.shared.clone(),
            on_receive,
            conns: HashMap::new(),
            ids: HashMap::new(),
            rng: SystemRandom::new(),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
            send_buf: vec![0u8; config.max_datagram_size],
            max_message_size: config.max_message_size,
            notify: false,
        };

        self.shared.running.store(true, Ordering::Release);
        let thread = match thread::Builder::new()
            .name("peer-transport".to_string())
            .spawn(move || event_loop.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        log::info!("QUIC transport listening on {}", local_addr);

        *running = Some(Running {
            commands,
            waker,
            thread,
            local_addr,
            max_message_size: config.max_message_size,
        });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.local_addr)
    }

    fn connect(
        &self,
        remote: SocketAddr,
        hail: Vec<u8>,
    ) -> Result<ConnectionHandle, TransportError> {
        let connection = self.shared.allocate_handle();
        self.shared.live().insert(connection);

        let submitted = self.submit(LoopCommand::Connect {
            connection,
            remote,
            hail,
        });
        if let Err(e) = submitted {
            self.shared.live().remove(&connection);
            return Err(e);
        }
        Ok(connection)
    }

    fn approve(&self, connection: ConnectionHandle, hail: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_live(connection)?;
        self.submit(LoopCommand::Approve { connection, hail })
    }

    fn deny(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        self.ensure_live(connection)?;
        self.submit(LoopCommand::Deny {
            connection,
            reason: reason.to_string(),
        })
    }

    fn disconnect(&self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        self.ensure_live(connection)?;
        self.submit(LoopCommand::Disconnect {
            connection,
            reason: reason.to_string(),
        })
    }

    fn send(
        &self,
        connection: ConnectionHandle,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let limit = self
            .lock_running()
            .as_ref()
            .map(|r| r.max_message_size)
            .ok_or(TransportError::NotRunning)?;
        if payload.len() > limit {
            return Err(TransportError::MessageTooLarge(payload.len()));
        }

        self.ensure_live(connection)?;
        self.submit(LoopCommand::Send {
            connection,
            payload,
            mode,
        })
    }

    fn send_unconnected(&self, payload: Vec<u8>, remote: SocketAddr) -> Result<(), TransportError> {
        self.submit(LoopCommand::SendUnconnected { payload, remote })
    }

    fn read_message(&self) -> Option<TransportMessage> {
        self.shared
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn shutdown(&self, reason: &str) {
        let running = match self.lock_running().take() {
            Some(running) => running,
            None => return,
        };

        self.shared.running.store(false, Ordering::Release);
        let _ = running.commands.send(LoopCommand::Shutdown {
            reason: reason.to_string(),
        });
        let _ = running.waker.wake();

        // Shutdown may be requested from the receive callback
        if running.thread.thread().id() != thread::current().id() {
            if running.thread.join().is_err() {
                log::error!("QUIC event loop thread panicked");
            }
        }

        self.shared.live().clear();
        log::info!("QUIC transport shut down: {}", reason);
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.shutdown("transport dropped");
    }
}

// ============================================================================
// Connection State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// We opened the connection
    Client,
    /// The remote opened the connection
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// QUIC handshake running or hails not exchanged yet
    Handshaking,
    /// Server received the client hail, waiting for approve/deny
    AwaitingApproval,
    /// Hails exchanged, data flows
    Connected,
    /// Close requested
    Closing,
}

struct PeerConn {
    conn: quiche::Connection,
    remote: SocketAddr,
    role: Role,
    phase: Phase,
    /// Framed hail to write once the handshake completes (client only)
    hail_out: Option<Vec<u8>>,
    /// Hail received from the remote side
    remote_hail: Option<Vec<u8>>,
    /// Inbound control stream bytes not yet framed
    inbound: Vec<u8>,
    /// Outbound control stream bytes not yet accepted by quiche
    outbound: Vec<u8>,
    /// Whether the engine knows about this connection
    surfaced: bool,
}

impl PeerConn {
    fn new(conn: quiche::Connection, remote: SocketAddr, role: Role) -> Self {
        PeerConn {
            conn,
            remote,
            role,
            phase: Phase::Handshaking,
            hail_out: None,
            remote_hail: None,
            inbound: Vec::new(),
            outbound: Vec::new(),
            // Outbound handles are returned by `connect`
            surfaced: role == Role::Client,
        }
    }

    fn queue_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = framing::encode_frame(payload)?;
        self.outbound.extend_from_slice(&frame);
        Ok(())
    }

    fn close(&mut self, code: u64, reason: &str) {
        self.phase = Phase::Closing;
        match self.conn.close(true, code, reason.as_bytes()) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("Close error: {:?}", e),
        }
    }

    /// Move queued control stream bytes into quiche
    fn flush_stream(&mut self) {
        if self.outbound.is_empty() || !self.conn.is_established() {
            return;
        }

        match self.conn.stream_send(CONTROL_STREAM, &self.outbound, false) {
            Ok(written) => {
                self.outbound.drain(..written);
            }
            Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("Control stream send error: {:?}", e),
        }
    }

    /// Read the control stream and datagrams, producing engine messages
    fn service(
        &mut self,
        connection: ConnectionHandle,
        buf: &mut [u8],
        max_message_size: usize,
        out: &mut Vec<TransportMessage>,
    ) {
        if !self.conn.is_established() {
            return;
        }

        if let Some(hail) = self.hail_out.take() {
            self.outbound.extend_from_slice(&hail);
        }

        for stream_id in self.conn.readable() {
            loop {
                match self.conn.stream_recv(stream_id, buf) {
                    Ok((len, _fin)) => {
                        if stream_id == CONTROL_STREAM {
                            self.inbound.extend_from_slice(&buf[..len]);
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("Stream {} recv error: {:?}", stream_id, e);
                        break;
                    }
                }
            }
        }

        self.process_frames(connection, max_message_size, out);

        if self.phase == Phase::Connected {
            while let Ok(len) = self.conn.dgram_recv(buf) {
                out.push(TransportMessage::Data {
                    connection,
                    payload: buf[..len].to_vec(),
                });
            }
        }

        self.flush_stream();
    }

    fn process_frames(
        &mut self,
        connection: ConnectionHandle,
        max_message_size: usize,
        out: &mut Vec<TransportMessage>,
    ) {
        while matches!(self.phase, Phase::Handshaking | Phase::Connected) {
            let frame = match framing::decode_frame(&self.inbound) {
                Ok((payload, consumed)) if payload.len() <= max_message_size => {
                    let frame = payload.to_vec();
                    self.inbound.drain(..consumed);
                    frame
                }
                Ok((payload, _)) => {
                    let len = payload.len();
                    self.protocol_violation(connection, FrameError::TooLarge(len), out);
                    return;
                }
                Err(FrameError::Incomplete(_)) => return,
                Err(e) => {
                    self.protocol_violation(connection, e, out);
                    return;
                }
            };

            match (self.role, self.phase) {
                (Role::Server, Phase::Handshaking) => {
                    log::debug!("Connection {} from {} sent its hail", connection, self.remote);
                    self.phase = Phase::AwaitingApproval;
                    self.surfaced = true;
                    self.remote_hail = Some(frame.clone());
                    out.push(TransportMessage::ConnectionApproval {
                        connection,
                        remote: self.remote,
                        hail: frame,
                    });
                }
                (Role::Client, Phase::Handshaking) => {
                    log::debug!("Connection {} to {} approved", connection, self.remote);
                    self.phase = Phase::Connected;
                    self.remote_hail = Some(frame.clone());
                    out.push(TransportMessage::StatusChanged {
                        connection,
                        status: ConnectionStatus::Connected,
                        remote: self.remote,
                        remote_hail: Some(frame),
                    });
                }
                _ => out.push(TransportMessage::Data {
                    connection,
                    payload: frame,
                }),
            }
        }
    }

    fn protocol_violation(
        &mut self,
        connection: ConnectionHandle,
        error: FrameError,
        out: &mut Vec<TransportMessage>,
    ) {
        log::warn!("Connection {} framing error: {}", connection, error);
        out.push(TransportMessage::Warning(format!(
            "connection {} closed: {}",
            connection, error
        )));
        self.close(CLOSE_PROTOCOL, "framing error");
    }
}

// ============================================================================
// Event Loop
// ============================================================================

struct EventLoop {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    client_config: quiche::Config,
    /// `None` when inbound connections are not accepted
    server_config: Option<quiche::Config>,
    commands: mpsc::Receiver<LoopCommand>,
    shared: Arc<Shared>,
    on_receive: ReceiveCallback,
    conns: HashMap<ConnectionHandle, PeerConn>,
    /// Connection IDs (ours and the client's original DCID) to handles
    ids: HashMap<quiche::ConnectionId<'static>, ConnectionHandle>,
    rng: SystemRandom,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    max_message_size: usize,
    /// Messages were queued since the last callback
    notify: bool,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = self.conns.values().filter_map(|c| c.conn.timeout()).min();

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Poll failed: {}", e);
                self.emit(TransportMessage::Error(format!("poll failed: {}", e)));
                self.notify();
                break;
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket();
                }
            }

            if !self.process_commands() {
                break;
            }

            self.process_timeouts();
            self.service_connections();
            self.send_pending();
            self.cleanup_closed();
            self.notify();
        }

        self.shared.running.store(false, Ordering::Release);
        log::debug!("QUIC event loop stopped");
    }

    fn emit(&mut self, message: TransportMessage) {
        self.shared
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        self.notify = true;
    }

    fn notify(&mut self) {
        if !self.notify {
            return;
        }
        self.notify = false;

        let callback = self.on_receive.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            log::error!(
                "Receive callback panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    fn process_socket(&mut self) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Socket recv error: {}", e);
                    self.emit(TransportMessage::Warning(format!("socket recv error: {}", e)));
                    break;
                }
            };

            let mut pkt = self.recv_buf[..len].to_vec();
            log::trace!("Received {} bytes from {}", len, from);

            let hdr = match quiche::Header::from_slice(&mut pkt, quiche::MAX_CONN_ID_LEN) {
                Ok(v) => v,
                Err(_) => {
                    let payload = self.recv_buf[..len].to_vec();
                    self.emit(TransportMessage::UnconnectedData { from, payload });
                    continue;
                }
            };

            let conn_id = hdr.dcid.clone().into_owned();
            let connection = match self.ids.get(&conn_id) {
                Some(handle) => *handle,
                None => {
                    if hdr.ty != quiche::Type::Initial {
                        log::trace!("Non-Initial packet for unknown connection from {}", from);
                        continue;
                    }
                    match self.handle_new_connection(&hdr, from) {
                        Ok(Some(handle)) => handle,
                        Ok(None) => continue,
                        Err(e) => {
                            log::debug!("Failed to handle new connection: {}", e);
                            continue;
                        }
                    }
                }
            };

            if let Some(pc) = self.conns.get_mut(&connection) {
                let recv_info = quiche::RecvInfo {
                    from,
                    to: self.local_addr,
                };
                match pc.conn.recv(&mut pkt, recv_info) {
                    Ok(_) => {
                        if pc.remote != from {
                            log::debug!(
                                "Connection {} address change: {} -> {}",
                                connection,
                                pc.remote,
                                from
                            );
                            pc.remote = from;
                        }
                    }
                    Err(e) => log::debug!("Connection {} recv error: {:?}", connection, e),
                }
            }
        }
    }

    fn handle_new_connection(
        &mut self,
        hdr: &quiche::Header,
        from: SocketAddr,
    ) -> Result<Option<ConnectionHandle>, TransportError> {
        if self.server_config.is_none() {
            log::debug!("Inbound connection from {} ignored", from);
            return Ok(None);
        }

        if !quiche::version_is_supported(hdr.version) {
            log::debug!("Version negotiation needed for {:?}", hdr.version);
            let len = quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut self.send_buf)?;
            self.socket.send_to(&self.send_buf[..len], from)?;
            return Ok(None);
        }

        let scid = self.generate_scid()?;
        let conn = match self.server_config.as_mut() {
            Some(config) => quiche::accept(&scid, None, self.local_addr, from, config)?,
            None => return Ok(None),
        };

        let connection = self.shared.allocate_handle();
        log::info!("New connection {} from {}", connection, from);

        self.shared.live().insert(connection);
        self.ids.insert(scid, connection);
        self.ids.insert(hdr.dcid.clone().into_owned(), connection);
        self.conns
            .insert(connection, PeerConn::new(conn, from, Role::Server));

        Ok(Some(connection))
    }

    fn generate_scid(&self) -> Result<quiche::ConnectionId<'static>, TransportError> {
        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        self.rng
            .fill(&mut scid)
            .map_err(|_| TransportError::Quic("failed to generate connection ID".into()))?;
        Ok(quiche::ConnectionId::from_ref(&scid).into_owned())
    }

    /// Returns `false` once the loop must stop
    fn process_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(LoopCommand::Shutdown { reason }) => {
                    self.close_all(&reason);
                    return false;
                }
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    self.close_all("transport dropped");
                    return false;
                }
            }
        }
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Connect {
                connection,
                remote,
                hail,
            } => self.connect(connection, remote, hail),
            LoopCommand::Approve { connection, hail } => self.approve(connection, hail),
            LoopCommand::Deny { connection, reason } => {
                if let Some(pc) = self.conns.get_mut(&connection) {
                    log::info!("Denying connection {}: {}", connection, reason);
                    pc.close(CLOSE_DENIED, &reason);
                }
            }
            LoopCommand::Disconnect { connection, reason } => {
                let remote = match self.conns.get_mut(&connection) {
                    Some(pc) if pc.phase != Phase::Closing => {
                        log::info!("Disconnecting {}: {}", connection, reason);
                        pc.close(CLOSE_NORMAL, &reason);
                        pc.remote
                    }
                    _ => return,
                };
                self.emit(TransportMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Disconnecting,
                    remote,
                    remote_hail: None,
                });
            }
            LoopCommand::Send {
                connection,
                payload,
                mode,
            } => self.send(connection, payload, mode),
            LoopCommand::SendUnconnected { payload, remote } => {
                log::trace!("Unconnected send of {} bytes to {}", payload.len(), remote);
                if let Err(e) = self.socket.send_to(&payload, remote) {
                    log::debug!("Unconnected send to {} failed: {}", remote, e);
                    self.emit(TransportMessage::Warning(format!(
                        "unconnected send to {} failed: {}",
                        remote, e
                    )));
                }
            }
            LoopCommand::Shutdown { .. } => {}
        }
    }

    fn connect(&mut self, connection: ConnectionHandle, remote: SocketAddr, hail: Vec<u8>) {
        let created = self.generate_scid().and_then(|scid| {
            let conn = quiche::connect(
                None,
                &scid,
                self.local_addr,
                remote,
                &mut self.client_config,
            )?;
            let frame = framing::encode_frame(&hail)
                .map_err(|e| TransportError::Config(e.to_string()))?;
            Ok((scid, conn, frame))
        });

        match created {
            Ok((scid, conn, frame)) => {
                log::info!("Connecting {} to {} (scid={:?})", connection, remote, scid);
                let mut pc = PeerConn::new(conn, remote, Role::Client);
                pc.hail_out = Some(frame);
                self.ids.insert(scid, connection);
                self.conns.insert(connection, pc);
                self.emit(TransportMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Connecting,
                    remote,
                    remote_hail: None,
                });
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", remote, e);
                self.shared.live().remove(&connection);
                self.emit(TransportMessage::Error(format!(
                    "connect to {} failed: {}",
                    remote, e
                )));
                self.emit(TransportMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Disconnected,
                    remote,
                    remote_hail: None,
                });
            }
        }
    }

    fn approve(&mut self, connection: ConnectionHandle, hail: Vec<u8>) {
        let mut out = Vec::new();

        match self.conns.get_mut(&connection) {
            Some(pc) if pc.phase == Phase::AwaitingApproval => {
                if let Err(e) = pc.queue_frame(&hail) {
                    log::warn!("Approval hail for {} rejected: {}", connection, e);
                    pc.close(CLOSE_PROTOCOL, "invalid hail");
                    return;
                }
                pc.phase = Phase::Connected;
                log::debug!("Connection {} approved", connection);

                out.push(TransportMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Connected,
                    remote: pc.remote,
                    remote_hail: pc.remote_hail.clone(),
                });

                // Frames that arrived while approval was pending
                pc.process_frames(connection, self.max_message_size, &mut out);
                pc.flush_stream();
            }
            Some(_) => log::debug!("Connection {} is not awaiting approval", connection),
            None => log::debug!("Approve for unknown connection {}", connection),
        }

        for message in out {
            self.emit(message);
        }
    }

    fn send(&mut self, connection: ConnectionHandle, payload: Vec<u8>, mode: DeliveryMode) {
        let pc = match self.conns.get_mut(&connection) {
            Some(pc) if pc.phase != Phase::Closing => pc,
            _ => {
                log::debug!("Send on closed connection {}", connection);
                return;
            }
        };

        if mode == DeliveryMode::Unreliable {
            match pc.conn.dgram_send(&payload) {
                Ok(()) => return,
                Err(quiche::Error::Done) => {
                    log::trace!("DATAGRAM queue full on {}, dropping", connection);
                    return;
                }
                Err(e) => {
                    // Too large for a DATAGRAM frame or DATAGRAMs unsupported
                    log::debug!("DATAGRAM send on {} failed ({:?}), using stream", connection, e);
                }
            }
        }

        if let Err(e) = pc.queue_frame(&payload) {
            log::warn!("Dropping message on {}: {}", connection, e);
            return;
        }
        pc.flush_stream();
    }

    fn process_timeouts(&mut self) {
        for pc in self.conns.values_mut() {
            pc.conn.on_timeout();
        }
    }

    fn service_connections(&mut self) {
        let mut out = Vec::new();
        for (connection, pc) in self.conns.iter_mut() {
            pc.service(*connection, &mut self.recv_buf, self.max_message_size, &mut out);
        }
        for message in out {
            self.emit(message);
        }
    }

    fn send_pending(&mut self) {
        for (connection, pc) in self.conns.iter_mut() {
            loop {
                match pc.conn.send(&mut self.send_buf) {
                    Ok((len, send_info)) => {
                        log::trace!("Sending {} bytes to {:?}", len, send_info.to);
                        if let Err(e) = self.socket.send_to(&self.send_buf[..len], send_info.to) {
                            if e.kind() == io::ErrorKind::WouldBlock {
                                break;
                            }
                            log::debug!("Socket send error on {}: {}", connection, e);
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("Send error on {}: {:?}", connection, e);
                        break;
                    }
                }
            }
        }
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<ConnectionHandle> = self
            .conns
            .iter()
            .filter(|(_, pc)| pc.conn.is_closed())
            .map(|(handle, _)| *handle)
            .collect();

        for connection in closed {
            let pc = match self.conns.remove(&connection) {
                Some(pc) => pc,
                None => continue,
            };
            log::info!("Connection {} to {} closed", connection, pc.remote);

            self.ids.retain(|_, handle| *handle != connection);
            self.shared.live().remove(&connection);

            if pc.surfaced {
                self.emit(TransportMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Disconnected,
                    remote: pc.remote,
                    remote_hail: None,
                });
            }
        }
    }

    fn close_all(&mut self, reason: &str) {
        for pc in self.conns.values_mut() {
            pc.close(CLOSE_NORMAL, reason);
        }
        self.send_pending();
        self.conns.clear();
        self.ids.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiche_config_builds_without_certificate() {
        let config = TransportConfig::default();
        assert!(build_quiche_config(&config, None).is_ok());
    }

    #[test]
    fn test_missing_certificate_file_is_error() {
        let config = TransportConfig::default();
        let result = build_quiche_config(&config, Some(("/nonexistent/cert.pem", "/nonexistent/key.pem")));
        assert!(matches!(result, Err(TransportError::Quic(_))));
    }

    #[test]
    fn test_operations_require_running_transport() {
        let transport = QuicTransport::default();

        assert!(!transport.is_running());
        assert_eq!(transport.local_addr(), None);
        assert_eq!(
            transport.connect(SocketAddr::from(([127, 0, 0, 1], 9)), Vec::new()),
            Err(TransportError::NotRunning)
        );
        assert_eq!(
            transport.send_unconnected(vec![0], SocketAddr::from(([127, 0, 0, 1], 9))),
            Err(TransportError::NotRunning)
        );
        assert!(transport.read_message().is_none());
    }

    #[test]
    fn test_ephemeral_certificate_builds_server_config() {
        let ephemeral = EphemeralCertificate::generate().unwrap();
        let dir = ephemeral.dir.clone();
        assert!(ephemeral.cert_path.exists());
        assert!(ephemeral.key_path.exists());

        let config = TransportConfig::default();
        assert!(build_quiche_config(&config, Some(ephemeral.paths().unwrap())).is_ok());

        drop(ephemeral);
        assert!(!dir.exists());
    }

    #[test]
    fn test_default_transport_accepts_incoming() {
        let transport = QuicTransport::default();
        let config = TransportConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            accept_incoming: true,
            ..TransportConfig::default()
        };

        transport.start(&config, Arc::new(|| {})).unwrap();
        assert!(transport.is_running());
        transport.shutdown("test over");
    }

    #[test]
    fn test_start_twice_fails() {
        let transport = QuicTransport::default();
        let config = TransportConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            accept_incoming: false,
            ..TransportConfig::default()
        };

        transport.start(&config, Arc::new(|| {})).unwrap();
        assert!(transport.is_running());
        assert_ne!(transport.local_addr().unwrap().port(), 0);

        assert_eq!(
            transport.start(&config, Arc::new(|| {})),
            Err(TransportError::AlreadyRunning)
        );

        transport.shutdown("test over");
        assert!(!transport.is_running());
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let transport = QuicTransport::default();
        let config = TransportConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            accept_incoming: false,
            ..TransportConfig::default()
        };
        transport.start(&config, Arc::new(|| {})).unwrap();

        assert_eq!(
            transport.send(ConnectionHandle(999), vec![1], DeliveryMode::ReliableOrdered),
            Err(TransportError::UnknownConnection(ConnectionHandle(999)))
        );
        transport.shutdown("test over");
    }

    #[test]
    fn test_non_quic_datagram_surfaces_as_unconnected() {
        let transport = QuicTransport::default();
        let config = TransportConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            accept_incoming: false,
            ..TransportConfig::default()
        };
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        transport
            .start(
                &config,
                Arc::new(move || {
                    let _ = tx.lock().unwrap().send(());
                }),
            )
            .unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&[0], transport.local_addr().unwrap())
            .unwrap();

        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.read_message(),
            Some(TransportMessage::UnconnectedData {
                from: sender.local_addr().unwrap(),
                payload: vec![0],
            })
        );
        transport.shutdown("test over");
    }
}
