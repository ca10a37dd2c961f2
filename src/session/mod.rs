//! One RLPx connection: channel, handshake, frame codec and protocol dispatch.
//!
//! A [`Session`] is driven entirely by the caller. Each [`IoEvent`] coming out
//! of its channel is fed to [`Session::handle`], which advances the
//! handshake, decodes frames and answers the base protocol, returning what
//! happened as [`SessionEvent`]s.
//!
//! # Guarantees
//! - Outbound bytes leave through a FIFO outbox; the channel only ever holds
//!   one pending send.
//! - Any fatal condition closes the socket and is reported once as
//!   [`SessionEvent::Failed`].
//! - No application frame is dispatched before the peer's hello has been
//!   checked against the key that negotiated the session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::KeyPair;
use crate::frame::{encoded_len, max_body_within, Frame, FrameCodec, FrameError};
use crate::handshake::{Handshake, HandshakeError, WireFormat};
use crate::io::{
    AsyncIo, ConnectStatus, Driver, IoError, IoEvent, TcpDriver, DEFAULT_BUFFER_SIZE,
};
use crate::node::{NodeError, NodeId, NodeIdentity};
use crate::protocol::{
    Capability, Devp2pMessage, DisconnectReason, Hello, ProtocolError, ProtocolTable, SubProtocol,
    BASE_PROTOCOL_LENGTH, P2P_VERSION,
};

pub mod state;
pub use state::{SessionState, SessionStateError};

/// Default time allowed from connect to the peer's hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on frame bodies. The channel buffer usually sets a lower limit,
/// see [`Session::frame_limit`].
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Io(#[from] IoError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("node: {0}")]
    Node(#[from] NodeError),
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error("hello from {received} does not match handshake key {expected}")]
    IdentityMismatch { expected: NodeId, received: NodeId },
    #[error("peer did not complete the handshake within {0:?}")]
    Timeout(Duration),
    #[error("more than {0} inbound bytes buffered")]
    Overflow(usize),
    #[error("session not ready to {0}")]
    NotReady(&'static str),
    #[error("peer has no address")]
    NoAddress,
}

/// Per-session settings, shared by every session a node creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    /// TCP port advertised in hello.
    pub listen_port: u16,
    /// Capabilities advertised in hello besides registered sub-protocols.
    pub capabilities: Vec<Capability>,
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
    /// Envelope used when this side initiates.
    pub wire_format: WireFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: format!("rlpx/{}", env!("CARGO_PKG_VERSION")),
            listen_port: 0,
            capabilities: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            wire_format: WireFormat::Eip8,
        }
    }
}

/// What a session reports back to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    /// Peer's hello verified; application traffic may flow.
    Ready(NodeId),
    Hello(Hello),
    /// Message for a registered sub-protocol (absolute id).
    Message { id: u64, payload: Vec<u8> },
    /// Round trip of the last ping.
    Pong(Duration),
    /// Peer sent disconnect.
    Disconnected(DisconnectReason),
    Closed,
    Failed(SessionError),
}

#[derive(Debug)]
struct Outbound {
    bytes: Vec<u8>,
    close_after: bool,
}

/// One peer connection.
pub struct Session<D = TcpDriver> {
    io: AsyncIo<D>,
    state: SessionState,
    key: KeyPair,
    config: SessionConfig,
    remote: Option<NodeIdentity>,
    handshake: Option<Handshake>,
    codec: Option<FrameCodec>,
    protocols: ProtocolTable,
    inbound: Vec<u8>,
    outbox: VecDeque<Outbound>,
    in_flight: bool,
    hello_sent: bool,
    remote_hello: Option<Hello>,
    ping_sent: Option<Instant>,
    latency: Option<Duration>,
    disconnect_reason: Option<DisconnectReason>,
    started: Instant,
}

impl<D: Driver> Session<D> {
    /// Idle session that will dial out with [`connect`](Self::connect).
    pub fn new(key: KeyPair, config: SessionConfig, driver: D) -> Self {
        let io = AsyncIo::new(driver, config.buffer_size);
        Self {
            io,
            state: SessionState::Idle,
            key,
            config,
            remote: None,
            handshake: None,
            codec: None,
            protocols: ProtocolTable::new(),
            inbound: Vec::new(),
            outbox: VecDeque::new(),
            in_flight: false,
            hello_sent: false,
            remote_hello: None,
            ping_sent: None,
            latency: None,
            disconnect_reason: None,
            started: Instant::now(),
        }
    }

    /// Session for an inbound connection; it waits for the peer's AUTH.
    pub fn accepted(key: KeyPair, config: SessionConfig, driver: D) -> Self {
        let mut session = Self::new(key, config, driver);
        session.handshake = Some(Handshake::responder(session.key.clone()));
        session.state = SessionState::AwaitingAuth;
        session
    }

    /// Registers a sub-protocol; its ids follow the base protocol's.
    pub fn register(&mut self, protocol: Box<dyn SubProtocol>) -> Result<u64, SessionError> {
        Ok(self.protocols.register(protocol)?)
    }

    /// Dials `node` with a fresh ephemeral key and nonce.
    ///
    /// Allowed from any finished state, so a failed peer can be retried.
    pub fn connect(&mut self, node: &NodeIdentity) -> Result<Vec<SessionEvent>, SessionError> {
        if !self.state.is_finished() {
            return Err(SessionError::State(SessionStateError {
                from: self.state,
                to: SessionState::Connecting,
            }));
        }
        let addr = node.socket_addr().ok_or(SessionError::NoAddress)?;
        let remote_key = node.id.public_key()?;

        self.reset();
        self.state = SessionState::Idle;
        self.remote = Some(*node);
        self.handshake = Some(
            Handshake::initiator(self.key.clone(), remote_key).with_format(self.config.wire_format),
        );
        self.started = Instant::now();

        debug!(peer = %node, "connecting");
        let mut events = Vec::new();
        match self.io.connect(addr) {
            Ok(ConnectStatus::Pending) => self.transition(SessionState::Connecting)?,
            Ok(ConnectStatus::Connected) => {
                events.push(SessionEvent::Connected);
                self.on_connected(&mut events);
            }
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(err.into());
            }
        }
        Ok(events)
    }

    /// Queues the base-protocol hello. Sent automatically once secrets exist.
    pub fn send_hello(&mut self) -> Result<(), SessionError> {
        if self.hello_sent {
            return Ok(());
        }
        let mut capabilities = self.config.capabilities.clone();
        capabilities.extend(self.protocols.capabilities());
        let hello = Hello {
            version: P2P_VERSION,
            client_id: self.config.client_id.clone(),
            capabilities,
            listen_port: self.config.listen_port,
            id: self.key.id(),
        };
        self.send_devp2p(&Devp2pMessage::Hello(hello), false)?;
        self.hello_sent = true;
        Ok(())
    }

    pub fn send_ping(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady("ping"));
        }
        self.send_devp2p(&Devp2pMessage::Ping, false)?;
        self.ping_sent = Some(Instant::now());
        Ok(())
    }

    /// Queues disconnect and closes the socket once it has been written.
    /// Without an established frame layer the socket is closed right away.
    pub fn send_disconnect(
        &mut self,
        reason: DisconnectReason,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let mut events = Vec::new();
        match self.state {
            SessionState::AwaitingHello | SessionState::Ready => {
                self.send_devp2p(&Devp2pMessage::Disconnect(reason), true)?;
                self.transition(SessionState::Disconnecting)?;
                self.flush_into(&mut events);
            }
            SessionState::Disconnecting => {}
            state if state.is_finished() => {}
            _ => self.close(&mut events),
        }
        Ok(events)
    }

    /// Sends a sub-protocol message by absolute id.
    ///
    /// The id must belong to a protocol registered on this session, and the
    /// body must fit [`frame_limit`](Self::frame_limit); otherwise nothing is
    /// queued and the session stays usable.
    pub fn send_message(&mut self, id: u64, payload: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady("send message"));
        }
        if id < BASE_PROTOCOL_LENGTH || !self.protocols.contains(id) {
            return Err(ProtocolError::UnknownMessage(id).into());
        }
        self.send_frame(&Frame::new(id, payload.to_vec()), false)
    }

    /// Hands the head of the outbox to the channel if it is idle.
    pub fn flush(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.flush_into(&mut events);
        events
    }

    /// Steps the channel once and handles the result.
    pub fn poll_once(&mut self) -> Vec<SessionEvent> {
        let mut events = self.flush();
        if let Some(event) = self.io.poll_one() {
            events.extend(self.handle(event));
        }
        self.check_timeout(Instant::now(), &mut events);
        events
    }

    /// Feeds one channel event through the session.
    pub fn handle(&mut self, event: IoEvent) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match event {
            IoEvent::Connected => {
                events.push(SessionEvent::Connected);
                self.on_connected(&mut events);
            }
            IoEvent::Sent(len) => self.on_sent(len, &mut events),
            IoEvent::Received(bytes) => self.on_received(&bytes, &mut events),
            IoEvent::Error(err) => {
                if self.state == SessionState::Disconnecting {
                    self.close(&mut events);
                } else if !self.state.is_finished() {
                    self.fail(err.into(), &mut events);
                }
            }
        }
        self.flush_into(&mut events);
        events
    }

    /// Fails the session if the handshake has been running too long.
    pub fn check_timeout(&mut self, now: Instant, events: &mut Vec<SessionEvent>) {
        if self
            .state
            .check_timeout(self.config.handshake_timeout, self.started, now)
        {
            self.fail(SessionError::Timeout(self.config.handshake_timeout), events);
        }
    }

    /// Force-closes the socket.
    pub fn close(&mut self, events: &mut Vec<SessionEvent>) {
        let was_open = !self.state.is_finished();
        self.io.close();
        self.handshake = None;
        self.codec = None;
        self.outbox.clear();
        self.in_flight = false;
        self.state = SessionState::Closed;
        if was_open {
            debug!(peer = ?self.remote_id(), "session closed");
            events.push(SessionEvent::Closed);
        }
    }

    fn on_connected(&mut self, events: &mut Vec<SessionEvent>) {
        let auth = match self.handshake.as_mut() {
            Some(hs) => hs.write_auth(),
            None => Err(HandshakeError::Protocol("connected without a handshake".into())),
        };
        match auth {
            Ok(bytes) => {
                self.enqueue(bytes, false);
                if let Err(err) = self.transition(SessionState::AuthSent) {
                    self.fail(err.into(), events);
                }
            }
            Err(err) => self.fail(err.into(), events),
        }
    }

    fn on_sent(&mut self, len: usize, events: &mut Vec<SessionEvent>) {
        if !self.in_flight {
            return;
        }
        self.in_flight = false;
        if let Some(done) = self.outbox.pop_front() {
            debug_assert_eq!(done.bytes.len(), len);
            if done.close_after {
                self.close(events);
            }
        }
    }

    fn on_received(&mut self, bytes: &[u8], events: &mut Vec<SessionEvent>) {
        self.inbound.extend_from_slice(bytes);
        let ceiling = encoded_len(self.frame_limit()) + self.io.capacity();
        if self.inbound.len() > ceiling {
            self.fail(SessionError::Overflow(ceiling), events);
            return;
        }
        if let Err(err) = self.process_inbound(events) {
            self.fail(err, events);
        }
    }

    fn process_inbound(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), SessionError> {
        loop {
            if self.inbound.is_empty() {
                return Ok(());
            }
            match self.state {
                SessionState::AwaitingAuth => {
                    let Some(hs) = self.handshake.as_mut() else {
                        return Err(SessionError::NotReady("read auth"));
                    };
                    let used = match hs.read_auth(&self.inbound) {
                        Err(HandshakeError::Incomplete) => return Ok(()),
                        other => other?,
                    };
                    self.inbound.drain(..used);
                    if let Some(id) = hs.remote_id() {
                        self.remote = Some(NodeIdentity::new(id, None));
                    }
                    let ack = hs.write_ack()?;
                    self.enqueue(ack, false);
                    self.install_secrets()?;
                }
                SessionState::AuthSent => {
                    let Some(hs) = self.handshake.as_mut() else {
                        return Err(SessionError::NotReady("read ack"));
                    };
                    let used = match hs.read_ack(&self.inbound) {
                        Err(HandshakeError::Incomplete) => return Ok(()),
                        other => other?,
                    };
                    self.inbound.drain(..used);
                    self.install_secrets()?;
                }
                SessionState::AwaitingHello | SessionState::Ready | SessionState::Disconnecting => {
                    let Some(codec) = self.codec.as_mut() else {
                        return Err(SessionError::NotReady("decode frame"));
                    };
                    let Some((frame, used)) = codec.decode(&self.inbound)? else {
                        return Ok(());
                    };
                    self.inbound.drain(..used);
                    self.dispatch(frame, events)?;
                }
                _ => {
                    self.inbound.clear();
                    return Ok(());
                }
            }
        }
    }

    fn install_secrets(&mut self) -> Result<(), SessionError> {
        let mut hs = self
            .handshake
            .take()
            .ok_or(SessionError::NotReady("derive secrets"))?;
        let secrets = hs.secrets()?;
        self.codec = Some(FrameCodec::new(secrets).with_max_frame_size(self.frame_limit()));
        self.transition(SessionState::AwaitingHello)?;
        debug!(peer = ?self.remote_id(), format = ?hs.format(), "secrets installed");
        self.send_hello()
    }

    fn dispatch(
        &mut self,
        frame: Frame,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        if frame.id >= BASE_PROTOCOL_LENGTH {
            if self.state != SessionState::Ready {
                return Err(ProtocolError::BeforeHello("sub-protocol message").into());
            }
            let replies = self.protocols.dispatch(frame.id, &frame.payload)?;
            for reply in &replies {
                self.send_frame(reply, false)?;
            }
            events.push(SessionEvent::Message {
                id: frame.id,
                payload: frame.payload,
            });
            return Ok(());
        }

        let message = Devp2pMessage::decode(frame.id, &frame.payload)?;
        debug!(peer = ?self.remote_id(), "[ IN] {}", message.name());
        let awaiting_hello = self.state == SessionState::AwaitingHello;
        match message {
            Devp2pMessage::Hello(hello) => self.on_hello(hello, events),
            Devp2pMessage::Disconnect(reason) => {
                info!(peer = ?self.remote_id(), %reason, "peer disconnected");
                self.disconnect_reason = Some(reason);
                events.push(SessionEvent::Disconnected(reason));
                self.close(events);
                Ok(())
            }
            Devp2pMessage::Ping if awaiting_hello => Err(ProtocolError::BeforeHello("ping").into()),
            Devp2pMessage::Pong if awaiting_hello => Err(ProtocolError::BeforeHello("pong").into()),
            Devp2pMessage::Ping => {
                if self.state == SessionState::Ready {
                    self.send_devp2p(&Devp2pMessage::Pong, false)?;
                }
                Ok(())
            }
            Devp2pMessage::Pong => {
                if let Some(sent) = self.ping_sent.take() {
                    let latency = sent.elapsed();
                    self.latency = Some(latency);
                    events.push(SessionEvent::Pong(latency));
                }
                Ok(())
            }
        }
    }

    fn on_hello(
        &mut self,
        hello: Hello,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::AwaitingHello {
            return Err(ProtocolError::Malformed("hello", "duplicate hello".into()).into());
        }
        let expected = self
            .remote_id()
            .ok_or(SessionError::NotReady("verify hello"))?;
        if hello.id != expected {
            return Err(SessionError::IdentityMismatch {
                expected,
                received: hello.id,
            });
        }
        self.transition(SessionState::Ready)?;
        info!(
            peer = %expected,
            client = %hello.client_id,
            caps = hello.capabilities.len(),
            "session ready"
        );
        events.push(SessionEvent::Ready(expected));
        self.remote_hello = Some(hello.clone());
        events.push(SessionEvent::Hello(hello));
        Ok(())
    }

    fn send_devp2p(
        &mut self,
        message: &Devp2pMessage,
        close_after: bool,
    ) -> Result<(), SessionError> {
        debug!(peer = ?self.remote_id(), "[OUT] {}", message.name());
        self.send_frame(&message.to_frame(), close_after)
    }

    fn send_frame(&mut self, frame: &Frame, close_after: bool) -> Result<(), SessionError> {
        let codec = self
            .codec
            .as_mut()
            .ok_or(SessionError::NotReady("encode frame"))?;
        let bytes = codec.encode(frame)?;
        self.enqueue(bytes, close_after);
        Ok(())
    }

    /// Splits `bytes` into sends of at most half the buffer at the back of
    /// the outbox. Frames already fit one send; only handshake messages on
    /// small buffers are split.
    fn enqueue(&mut self, bytes: Vec<u8>, close_after: bool) {
        let capacity = (self.io.capacity() / 2).max(1);
        if bytes.len() <= capacity {
            self.outbox.push_back(Outbound { bytes, close_after });
            return;
        }
        let chunks: Vec<Vec<u8>> = bytes.chunks(capacity).map(<[u8]>::to_vec).collect();
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.outbox.push_back(Outbound {
                bytes: chunk,
                close_after: close_after && index == last,
            });
        }
    }

    fn flush_into(&mut self, events: &mut Vec<SessionEvent>) {
        if self.in_flight || !self.io.is_idle() {
            return;
        }
        let Some(next) = self.outbox.front() else {
            return;
        };
        match self.io.send(&next.bytes) {
            Ok(()) => self.in_flight = true,
            Err(err) => self.fail(err.into(), events),
        }
    }

    fn fail(&mut self, err: SessionError, events: &mut Vec<SessionEvent>) {
        warn!(peer = ?self.remote_id(), state = ?self.state, error = %err, "session failed");
        self.io.close();
        self.handshake = None;
        self.codec = None;
        self.outbox.clear();
        self.in_flight = false;
        self.state = SessionState::Failed;
        events.push(SessionEvent::Failed(err));
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionStateError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.io.close();
        self.handshake = None;
        self.codec = None;
        self.inbound.clear();
        self.outbox.clear();
        self.in_flight = false;
        self.hello_sent = false;
        self.remote_hello = None;
        self.ping_sent = None;
        self.latency = None;
        self.disconnect_reason = None;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Largest frame body sent or accepted. A whole encoded frame fits in
    /// half the channel buffer, so a peer with the same buffer size can
    /// read it even when it arrives right behind an earlier one.
    pub fn frame_limit(&self) -> usize {
        self.config
            .max_frame_size
            .min(max_body_within(self.io.capacity() / 2))
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// The peer as dialled, or as learned from its AUTH.
    pub fn remote(&self) -> Option<&NodeIdentity> {
        self.remote.as_ref()
    }

    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote.map(|r| r.id)
    }

    pub fn remote_hello(&self) -> Option<&Hello> {
        self.remote_hello.as_ref()
    }

    /// Round trip of the most recent ping/pong.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// Messages queued and not yet fully written.
    pub fn pending_sends(&self) -> usize {
        self.outbox.len()
    }

    pub fn io(&self) -> &AsyncIo<D> {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut AsyncIo<D> {
        &mut self.io
    }
}

impl<D> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("outbox", &self.outbox.len())
            .field("inbound", &self.inbound.len())
            .finish_non_exhaustive()
    }
}
