//! RLPx authenticated key agreement.
//!
//! The initiator sends AUTH, the responder answers with ACK, and both sides
//! then derive identical [`SessionSecrets`]. The initiator's ephemeral public
//! key never travels in the clear: the responder recovers it from the AUTH
//! signature over `ecdh(static keys) ⊕ initiator nonce`.
//!
//! ```text
//! initiator: Init -> AuthSent -> AckReceived -> SecretsDerived
//! responder: Init -> AuthReceived -> AckSent -> SecretsDerived
//! ```

use rlp::DecoderError;
use secp256k1::PublicKey;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{ecdh, nonce, recover, sign_recoverable, CryptoError, KeyPair};
use crate::node::NodeId;
use crate::util::{xor32, H256};

pub mod message;
pub mod secrets;

pub use message::{
    AckMessage, AuthMessage, WireFormat, HANDSHAKE_VERSION, LEGACY_ACK_LEN, LEGACY_AUTH_LEN,
};
pub use secrets::SessionSecrets;

use message::{open, seal};
use secrets::Derivation;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake message incomplete")]
    Incomplete,
    #[error("handshake message too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("handshake crypto failure: {0}")]
    Crypto(#[from] CryptoError),
    #[error("handshake protocol error: {0}")]
    Protocol(String),
}

impl From<DecoderError> for HandshakeError {
    fn from(err: DecoderError) -> Self {
        HandshakeError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AuthSent,
    AuthReceived,
    AckSent,
    AckReceived,
    SecretsDerived,
    Failed,
}

/// One handshake attempt. Dropped once [`secrets`](Handshake::secrets) is taken.
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    format: WireFormat,
    static_key: KeyPair,
    ephemeral: KeyPair,
    nonce: H256,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    remote_nonce: Option<H256>,
    remote_version: u64,
    sent: Vec<u8>,
    received: Vec<u8>,
}

impl Handshake {
    /// Starts a handshake towards `remote`, with a fresh ephemeral key and nonce.
    pub fn initiator(static_key: KeyPair, remote: PublicKey) -> Self {
        let mut hs = Self::new(Role::Initiator, static_key);
        hs.remote_static = Some(remote);
        hs
    }

    /// Waits for an inbound AUTH.
    pub fn responder(static_key: KeyPair) -> Self {
        Self::new(Role::Responder, static_key)
    }

    fn new(role: Role, static_key: KeyPair) -> Self {
        Self {
            role,
            state: HandshakeState::Init,
            format: WireFormat::Eip8,
            static_key,
            ephemeral: KeyPair::random(),
            nonce: nonce(),
            remote_static: None,
            remote_ephemeral: None,
            remote_nonce: None,
            remote_version: HANDSHAKE_VERSION,
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Replaces the random ephemeral key and nonce, for reproducible exchanges.
    pub fn with_ephemeral(mut self, ephemeral: KeyPair, nonce: H256) -> Self {
        self.ephemeral = ephemeral;
        self.nonce = nonce;
        self
    }

    /// Envelope used for AUTH. Responders always answer in the AUTH's format.
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Builds and encrypts AUTH.
    pub fn write_auth(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.require(Role::Initiator, HandshakeState::Init, "write auth")?;
        let remote = self.remote_static()?;

        let static_shared = ecdh(self.static_key.secret(), &remote);
        let signature =
            sign_recoverable(self.ephemeral.secret(), &xor32(&static_shared, &self.nonce))?;
        let auth = AuthMessage {
            signature,
            public: self.static_key.id(),
            nonce: self.nonce,
            version: HANDSHAKE_VERSION,
        };
        let body = match self.format {
            WireFormat::Eip8 => auth.to_rlp(),
            WireFormat::Legacy => auth.to_legacy(self.ephemeral.public()),
        };

        let bytes = seal(self.format, &remote, &body)?;
        debug!(len = bytes.len(), format = ?self.format, "[OUT] auth");
        self.sent = bytes.clone();
        self.state = HandshakeState::AuthSent;
        Ok(bytes)
    }

    /// Decrypts AUTH from the front of `bytes` and returns how many bytes it occupied.
    pub fn read_auth(&mut self, bytes: &[u8]) -> Result<usize, HandshakeError> {
        self.require(Role::Responder, HandshakeState::Init, "read auth")?;
        let result = self.load_auth(bytes);
        self.settle(result)
    }

    fn load_auth(&mut self, bytes: &[u8]) -> Result<usize, HandshakeError> {
        let opened = open(self.static_key.secret(), bytes, LEGACY_AUTH_LEN)?;
        let auth = match opened.format {
            WireFormat::Eip8 => AuthMessage::from_rlp(&opened.plain)?,
            WireFormat::Legacy => AuthMessage::from_legacy(&opened.plain)?,
        };

        let remote_static = auth
            .public
            .public_key()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let static_shared = ecdh(self.static_key.secret(), &remote_static);
        let remote_ephemeral = recover(&auth.signature, &xor32(&static_shared, &auth.nonce))?;

        debug!(
            len = opened.consumed,
            format = ?opened.format,
            version = auth.version,
            "[ IN] auth"
        );
        self.format = opened.format;
        self.remote_static = Some(remote_static);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_nonce = Some(auth.nonce);
        self.remote_version = auth.version;
        self.received = bytes[..opened.consumed].to_vec();
        self.state = HandshakeState::AuthReceived;
        Ok(opened.consumed)
    }

    /// Builds and encrypts ACK in the format AUTH arrived in.
    pub fn write_ack(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.require(Role::Responder, HandshakeState::AuthReceived, "write ack")?;
        let remote = self.remote_static()?;
        let ack = AckMessage {
            ephemeral: self.ephemeral.id(),
            nonce: self.nonce,
            version: HANDSHAKE_VERSION,
        };
        let body = match self.format {
            WireFormat::Eip8 => ack.to_rlp(),
            WireFormat::Legacy => ack.to_legacy(),
        };

        let bytes = seal(self.format, &remote, &body)?;
        debug!(len = bytes.len(), format = ?self.format, "[OUT] ack");
        self.sent = bytes.clone();
        self.state = HandshakeState::AckSent;
        Ok(bytes)
    }

    /// Decrypts ACK from the front of `bytes` and returns how many bytes it occupied.
    pub fn read_ack(&mut self, bytes: &[u8]) -> Result<usize, HandshakeError> {
        self.require(Role::Initiator, HandshakeState::AuthSent, "read ack")?;
        let result = self.load_ack(bytes);
        self.settle(result)
    }

    fn load_ack(&mut self, bytes: &[u8]) -> Result<usize, HandshakeError> {
        let opened = open(self.static_key.secret(), bytes, LEGACY_ACK_LEN)?;
        let ack = match opened.format {
            WireFormat::Eip8 => AckMessage::from_rlp(&opened.plain)?,
            WireFormat::Legacy => AckMessage::from_legacy(&opened.plain)?,
        };
        let remote_ephemeral = ack
            .ephemeral
            .public_key()
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        debug!(len = opened.consumed, format = ?opened.format, version = ack.version, "[ IN] ack");
        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_nonce = Some(ack.nonce);
        self.remote_version = ack.version;
        self.received = bytes[..opened.consumed].to_vec();
        self.state = HandshakeState::AckReceived;
        Ok(opened.consumed)
    }

    /// Derives the session secrets once both AUTH and ACK have been exchanged.
    pub fn secrets(&mut self) -> Result<SessionSecrets, HandshakeError> {
        match self.state {
            HandshakeState::AckSent | HandshakeState::AckReceived => {}
            state => {
                return Err(HandshakeError::Protocol(format!(
                    "secrets requested in state {state:?}"
                )))
            }
        }
        let (remote_ephemeral, remote_nonce) = match (self.remote_ephemeral, self.remote_nonce) {
            (Some(key), Some(nonce)) => (key, nonce),
            _ => return Err(HandshakeError::Protocol("remote ephemeral key unknown".into())),
        };
        let (initiator_nonce, responder_nonce) = match self.role {
            Role::Initiator => (self.nonce, remote_nonce),
            Role::Responder => (remote_nonce, self.nonce),
        };

        let secrets = Derivation {
            ephemeral_shared: ecdh(self.ephemeral.secret(), &remote_ephemeral),
            initiator_nonce,
            responder_nonce,
            local_nonce: self.nonce,
            remote_nonce,
            sent: &self.sent,
            received: &self.received,
        }
        .derive();
        self.state = HandshakeState::SecretsDerived;
        Ok(secrets)
    }

    fn require(&self, role: Role, state: HandshakeState, op: &str) -> Result<(), HandshakeError> {
        if self.role != role || self.state != state {
            return Err(HandshakeError::Protocol(format!(
                "cannot {op} as {:?} in state {:?}",
                self.role, self.state
            )));
        }
        Ok(())
    }

    fn settle(&mut self, result: Result<usize, HandshakeError>) -> Result<usize, HandshakeError> {
        if let Err(err) = &result {
            if *err != HandshakeError::Incomplete {
                self.state = HandshakeState::Failed;
            }
        }
        result
    }

    fn remote_static(&self) -> Result<PublicKey, HandshakeError> {
        self.remote_static
            .ok_or_else(|| HandshakeError::Protocol("remote static key unknown".into()))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn nonce(&self) -> &H256 {
        &self.nonce
    }

    pub fn ephemeral_public(&self) -> &PublicKey {
        self.ephemeral.public()
    }

    /// Peer's static key: given up front to an initiator, learned from AUTH by a responder.
    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_static.as_ref().map(NodeId::from_public_key)
    }

    pub fn remote_ephemeral(&self) -> Option<&PublicKey> {
        self.remote_ephemeral.as_ref()
    }

    pub fn remote_nonce(&self) -> Option<&H256> {
        self.remote_nonce.as_ref()
    }

    pub fn remote_version(&self) -> u64 {
        self.remote_version
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("format", &self.format)
            .field("remote", &self.remote_id())
            .finish_non_exhaustive()
    }
}
