//! The node: owner of every session, the listener and the UDP socket.
//!
//! All progress happens in [`Node::poll`]. It accepts inbound peers, redials
//! dropped outbound peers with a fresh handshake, runs one multiplexed wait
//! across every session channel and feeds the resulting events back into the
//! sessions. Nothing runs in the background.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, UdpSocket};
use mio::{Interest, Token};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::crypto::KeyPair;
use crate::io::{poll_many, AsyncIo, IoError, MioSelector, TcpDriver};
use crate::node::{NodeError, NodeId, NodeIdentity};
use crate::protocol::{DisconnectReason, ProtocolError, ProtocolFactory, MAX_PROTOCOL_SLOTS};
use crate::session::{Session, SessionConfig, SessionError, SessionEvent};

const LISTENER: Token = Token(usize::MAX);
const UDP: Token = Token(usize::MAX - 1);
const UDP_BUFFER_SIZE: usize = 1280;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[from] IoError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("all {0} peer slots are in use")]
    Full(usize),
    #[error("already connected to {0}")]
    AlreadyConnected(NodeId),
    #[error("cannot connect to own identity")]
    SelfConnect,
}

/// One occupied slot.
struct Peer {
    session: Session<TcpDriver>,
    /// Set for peers this node dialled; they are redialled after dropping.
    dial: Option<NodeIdentity>,
    last_attempt: Instant,
}

impl Peer {
    fn is_reusable(&self) -> bool {
        self.dial.is_none() && self.session.state().is_finished()
    }
}

pub struct Node {
    key: KeyPair,
    config: NodeConfig,
    session_config: SessionConfig,
    /// Sub-protocols instantiated on every dialled and accepted session.
    protocols: Vec<ProtocolFactory>,
    peers: Vec<Peer>,
    selector: MioSelector,
    listener: Option<TcpListener>,
    udp: Option<UdpSocket>,
    udp_buf: Vec<u8>,
    /// Events produced outside a poll, returned by the next one.
    pending: Vec<(usize, SessionEvent)>,
    stopping: bool,
}

impl Node {
    /// Binds the configured sockets and dials every configured peer.
    pub fn new(config: NodeConfig) -> Result<Self, HostError> {
        Self::with_protocols(config, Vec::new())
    }

    /// Like [`Node::new`], running `protocols` on every session in order.
    /// Their message ids follow the base protocol's, so peers must register
    /// the same list to understand each other.
    pub fn with_protocols(
        config: NodeConfig,
        protocols: Vec<ProtocolFactory>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        if protocols.len() >= MAX_PROTOCOL_SLOTS {
            return Err(SessionError::from(ProtocolError::TooManyProtocols).into());
        }
        let key = config.key()?;
        let selector = MioSelector::new(config.max_peers + 2)?;

        let listener = match config.listen_port {
            Some(port) => {
                let mut listener = TcpListener::bind(any_addr(port))?;
                selector
                    .registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let udp = match config.udp_port {
            Some(port) => {
                let mut socket = UdpSocket::bind(any_addr(port))?;
                selector
                    .registry()
                    .register(&mut socket, UDP, Interest::READABLE)?;
                Some(socket)
            }
            None => None,
        };

        let mut session_config = config.session_config();
        if let Some(listener) = &listener {
            session_config.listen_port = listener.local_addr()?.port();
        }

        let mut node = Self {
            key,
            session_config,
            protocols,
            peers: Vec::with_capacity(config.max_peers),
            selector,
            listener,
            udp,
            udp_buf: vec![0u8; UDP_BUFFER_SIZE],
            pending: Vec::new(),
            stopping: false,
            config,
        };
        info!(enode = %node.enode(), "node started");

        for peer in node.config.peers()? {
            node.connect(peer)?;
        }
        Ok(node)
    }

    pub fn connect_enode(&mut self, uri: &str) -> Result<usize, HostError> {
        self.connect(uri.parse()?)
    }

    /// Dials `peer` in a new slot and returns the slot index.
    pub fn connect(&mut self, peer: NodeIdentity) -> Result<usize, HostError> {
        if peer.id == self.key.id() {
            return Err(HostError::SelfConnect);
        }
        if self.find(&peer.id).is_some() {
            return Err(HostError::AlreadyConnected(peer.id));
        }
        let slot = self.free_slot().ok_or(HostError::Full(self.config.max_peers))?;
        let mut session = self.new_session(Session::new(
            self.key.clone(),
            self.session_config.clone(),
            TcpDriver::new(),
        ))?;
        match session.connect(&peer) {
            Ok(events) => self.pending.extend(events.into_iter().map(|event| (slot, event))),
            Err(SessionError::Io(err)) => {
                warn!(slot, peer = %peer, error = %err, "dial failed, will retry")
            }
            Err(err) => return Err(err.into()),
        }
        self.place(
            slot,
            Peer {
                session,
                dial: Some(peer),
                last_attempt: Instant::now(),
            },
        );
        info!(slot, peer = %peer, "dialling");
        Ok(slot)
    }

    /// One round of work, waiting at most the configured poll timeout.
    pub fn poll(&mut self) -> Result<Vec<(usize, SessionEvent)>, HostError> {
        self.poll_for(self.config.poll_timeout())
    }

    pub fn poll_for(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<(usize, SessionEvent)>, HostError> {
        let mut events = std::mem::take(&mut self.pending);
        if !self.stopping {
            self.accept_inbound(&mut events);
            self.redial(&mut events);
        }

        for (slot, peer) in self.peers.iter_mut().enumerate() {
            tag(slot, peer.session.flush(), &mut events);
        }

        let ready = {
            let mut channels: Vec<&mut AsyncIo<TcpDriver>> =
                self.peers.iter_mut().map(|peer| peer.session.io_mut()).collect();
            poll_many(&mut self.selector, &mut channels, timeout)?
        };
        trace!(ready = ready.len(), "poll");
        for (slot, io_event) in ready {
            if let Some(peer) = self.peers.get_mut(slot) {
                tag(slot, peer.session.handle(io_event), &mut events);
            }
        }

        self.drain_udp();

        let now = Instant::now();
        for (slot, peer) in self.peers.iter_mut().enumerate() {
            let mut expired = Vec::new();
            peer.session.check_timeout(now, &mut expired);
            tag(slot, expired, &mut events);
        }

        for (slot, event) in &events {
            match event {
                SessionEvent::Ready(id) => info!(slot, peer = %id, "peer ready"),
                SessionEvent::Pong(latency) => debug!(slot, ?latency, "pong"),
                SessionEvent::Disconnected(reason) => info!(slot, %reason, "peer left"),
                _ => {}
            }
        }
        Ok(events)
    }

    /// Pings every ready peer; returns how many were pinged.
    pub fn broadcast_ping(&mut self) -> usize {
        let mut sent = 0;
        for peer in self.peers.iter_mut().filter(|peer| peer.session.is_ready()) {
            match peer.session.send_ping() {
                Ok(()) => sent += 1,
                Err(err) => debug!(error = %err, "ping not sent"),
            }
        }
        sent
    }

    /// Sends a sub-protocol message to every ready peer; returns how many
    /// accepted it. Ids outside the registered protocols reach nobody.
    pub fn broadcast(&mut self, id: u64, payload: &[u8]) -> usize {
        let mut sent = 0;
        for peer in self.peers.iter_mut().filter(|peer| peer.session.is_ready()) {
            match peer.session.send_message(id, payload) {
                Ok(()) => sent += 1,
                Err(err) => debug!(error = %err, "message not sent"),
            }
        }
        sent
    }

    /// Disconnects one slot with `reason`.
    pub fn disconnect(&mut self, slot: usize, reason: DisconnectReason) -> Result<(), HostError> {
        if let Some(peer) = self.peers.get_mut(slot) {
            peer.dial = None;
            let events = peer.session.send_disconnect(reason)?;
            self.pending.extend(events.into_iter().map(|event| (slot, event)));
        }
        Ok(())
    }

    /// Disconnects every peer, then polls until all are closed or the
    /// shutdown iterations run out. Stragglers are force-closed.
    pub fn stop(&mut self) -> Vec<(usize, SessionEvent)> {
        self.stopping = true;
        let mut events = std::mem::take(&mut self.pending);
        for (slot, peer) in self.peers.iter_mut().enumerate() {
            peer.dial = None;
            match peer.session.send_disconnect(DisconnectReason::ClientQuitting) {
                Ok(closed) => tag(slot, closed, &mut events),
                Err(err) => debug!(slot, error = %err, "disconnect not queued"),
            }
        }

        let interval = self.config.shutdown_interval();
        let mut iterations = 0;
        while self.live_peers() > 0 && iterations < self.config.shutdown_iterations {
            iterations += 1;
            match self.poll_for(interval) {
                Ok(more) => events.extend(more),
                Err(err) => {
                    warn!(error = %err, "poll failed during shutdown");
                    break;
                }
            }
        }

        let abandoned = self.live_peers();
        for (slot, peer) in self.peers.iter_mut().enumerate() {
            let mut closed = Vec::new();
            peer.session.close(&mut closed);
            tag(slot, closed, &mut events);
        }
        info!(iterations, abandoned, "node stopped");
        events
    }

    /// This node's `enode://` URI.
    pub fn enode(&self) -> String {
        let port = self
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(self.session_config.listen_port);
        let mut identity = NodeIdentity::new(
            self.key.id(),
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
        );
        identity.udp_port = self.udp_port();
        identity.to_string()
    }

    pub fn id(&self) -> NodeId {
        self.key.id()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn session(&self, slot: usize) -> Option<&Session<TcpDriver>> {
        self.peers.get(slot).map(|peer| &peer.session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (usize, &Session<TcpDriver>)> {
        self.peers.iter().enumerate().map(|(slot, peer)| (slot, &peer.session))
    }

    pub fn ready_peers(&self) -> usize {
        self.peers.iter().filter(|peer| peer.session.is_ready()).count()
    }

    /// Sessions that still hold a socket.
    pub fn live_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| !peer.session.state().is_finished())
            .count()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    fn new_session(
        &self,
        mut session: Session<TcpDriver>,
    ) -> Result<Session<TcpDriver>, SessionError> {
        for factory in &self.protocols {
            session.register(factory())?;
        }
        Ok(session)
    }

    fn find(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|peer| {
            let dialled = peer.dial.map(|d| d.id == *id).unwrap_or(false);
            let live =
                !peer.session.state().is_finished() && peer.session.remote_id() == Some(*id);
            dialled || live
        })
    }

    fn free_slot(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(Peer::is_reusable)
            .or_else(|| {
                (self.peers.len() < self.config.max_peers).then_some(self.peers.len())
            })
    }

    fn place(&mut self, slot: usize, peer: Peer) {
        if slot == self.peers.len() {
            self.peers.push(peer);
        } else {
            self.peers[slot] = peer;
        }
    }

    fn accept_inbound(&mut self, events: &mut Vec<(usize, SessionEvent)>) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let (stream, from) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            };
            let Some(slot) = self.free_slot() else {
                info!(%from, "rejecting inbound peer, no free slot");
                drop(stream);
                continue;
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%from, error = %err, "set_nodelay failed");
            }
            let session = match self.new_session(Session::accepted(
                self.key.clone(),
                self.session_config.clone(),
                TcpDriver::from_stream(stream),
            )) {
                Ok(session) => session,
                Err(err) => {
                    warn!(%from, error = %err, "rejecting inbound peer");
                    continue;
                }
            };
            self.place(
                slot,
                Peer {
                    session,
                    dial: None,
                    last_attempt: Instant::now(),
                },
            );
            info!(slot, %from, "inbound peer");
            events.push((slot, SessionEvent::Connected));
        }
    }

    /// Redials dropped outbound peers with a fresh ephemeral key and nonce.
    fn redial(&mut self, events: &mut Vec<(usize, SessionEvent)>) {
        let interval = self.config.reconnect_interval();
        for (slot, peer) in self.peers.iter_mut().enumerate() {
            let Some(target) = peer.dial else {
                continue;
            };
            if !peer.session.state().is_finished() || peer.last_attempt.elapsed() < interval {
                continue;
            }
            peer.last_attempt = Instant::now();
            debug!(slot, peer = %target, "redialling");
            match peer.session.connect(&target) {
                Ok(more) => tag(slot, more, events),
                Err(err) => debug!(slot, error = %err, "redial failed"),
            }
        }
    }

    /// Datagrams are read and discarded so the socket never backs up.
    fn drain_udp(&mut self) {
        let Some(socket) = self.udp.as_ref() else {
            return;
        };
        loop {
            match socket.recv_from(&mut self.udp_buf) {
                Ok((len, from)) => trace!(len, %from, "udp datagram ignored"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    debug!(error = %err, "udp receive failed");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.key.id())
            .field("peers", &self.peers.len())
            .field("protocols", &self.protocols.len())
            .field("listen", &self.listen_addr())
            .field("stopping", &self.stopping)
            .finish_non_exhaustive()
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}

fn tag(slot: usize, events: Vec<SessionEvent>, out: &mut Vec<(usize, SessionEvent)>) {
    out.extend(events.into_iter().map(|event| (slot, event)));
}
