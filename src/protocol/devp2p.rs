//! The base `p2p` capability: hello, disconnect, ping and pong.

use std::fmt;

use rlp::{Rlp, RlpStream};

use super::ProtocolError;
use crate::frame::Frame;
use crate::node::NodeId;

/// Base protocol version. Version 5 would add snappy compression.
pub const P2P_VERSION: u64 = 4;

pub const HELLO_ID: u64 = 0x00;
pub const DISCONNECT_ID: u64 = 0x01;
pub const PING_ID: u64 = 0x02;
pub const PONG_ID: u64 = 0x03;

/// Ids `0x00..0x10` belong to the base protocol.
pub const BASE_PROTOCOL_LENGTH: u64 = 0x10;

const EMPTY_LIST: [u8; 1] = [0xc0];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    /// Sender's static key without the `0x04` prefix.
    pub id: NodeId,
}

impl Hello {
    fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(5);
        s.append(&self.version);
        s.append(&self.client_id);
        s.begin_list(self.capabilities.len());
        for cap in &self.capabilities {
            s.begin_list(2);
            s.append(&cap.name);
            s.append(&cap.version);
        }
        s.append(&self.listen_port);
        s.append(&&self.id.as_bytes()[..]);
        s.out().to_vec()
    }

    fn decode(rlp: &Rlp<'_>) -> Result<Self, ProtocolError> {
        let malformed = |err: rlp::DecoderError| ProtocolError::Malformed("hello", err.to_string());
        let mut capabilities = Vec::new();
        for cap in rlp.at(2).map_err(malformed)?.iter() {
            capabilities.push(Capability {
                name: cap.val_at(0).map_err(malformed)?,
                version: cap.val_at(1).map_err(malformed)?,
            });
        }
        let id = NodeId::from_slice(rlp.at(4).and_then(|r| r.data()).map_err(malformed)?)
            .map_err(|err| ProtocolError::Malformed("hello", err.to_string()))?;
        Ok(Self {
            version: rlp.val_at(0).map_err(malformed)?,
            client_id: rlp.val_at(1).map_err(malformed)?,
            capabilities,
            listen_port: rlp.val_at(3).map_err(malformed)?,
            id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TcpSubsystemError,
    ProtocolBreach,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleVersion,
    NullNodeIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    PingTimeout,
    SubprotocolSpecific,
    Other(u8),
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        match self {
            Self::Requested => 0x00,
            Self::TcpSubsystemError => 0x01,
            Self::ProtocolBreach => 0x02,
            Self::UselessPeer => 0x03,
            Self::TooManyPeers => 0x04,
            Self::AlreadyConnected => 0x05,
            Self::IncompatibleVersion => 0x06,
            Self::NullNodeIdentity => 0x07,
            Self::ClientQuitting => 0x08,
            Self::UnexpectedIdentity => 0x09,
            Self::ConnectedToSelf => 0x0a,
            Self::PingTimeout => 0x0b,
            Self::SubprotocolSpecific => 0x10,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Requested,
            0x01 => Self::TcpSubsystemError,
            0x02 => Self::ProtocolBreach,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleVersion,
            0x07 => Self::NullNodeIdentity,
            0x08 => Self::ClientQuitting,
            0x09 => Self::UnexpectedIdentity,
            0x0a => Self::ConnectedToSelf,
            0x0b => Self::PingTimeout,
            0x10 => Self::SubprotocolSpecific,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Requested => "disconnect requested",
            Self::TcpSubsystemError => "tcp sub-system error",
            Self::ProtocolBreach => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleVersion => "incompatible p2p protocol version",
            Self::NullNodeIdentity => "null node identity received",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedIdentity => "unexpected identity in handshake",
            Self::ConnectedToSelf => "connected to self",
            Self::PingTimeout => "ping timeout",
            Self::SubprotocolSpecific => "subprotocol specific reason",
            Self::Other(code) => return write!(f, "unknown reason {code:#04x}"),
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Devp2pMessage {
    Hello(Hello),
    Disconnect(DisconnectReason),
    Ping,
    Pong,
}

impl Devp2pMessage {
    pub fn id(&self) -> u64 {
        match self {
            Self::Hello(_) => HELLO_ID,
            Self::Disconnect(_) => DISCONNECT_ID,
            Self::Ping => PING_ID,
            Self::Pong => PONG_ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Disconnect(_) => "disconnect",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Hello(hello) => hello.encode(),
            Self::Disconnect(reason) => {
                let mut s = RlpStream::new_list(1);
                s.append(&reason.code());
                s.out().to_vec()
            }
            Self::Ping | Self::Pong => EMPTY_LIST.to_vec(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.id(), self.encode_payload())
    }

    /// Decodes a base-protocol message. Ids the base protocol reserves but
    /// does not define are reported as [`ProtocolError::UnknownMessage`].
    pub fn decode(id: u64, payload: &[u8]) -> Result<Self, ProtocolError> {
        match id {
            HELLO_ID => Ok(Self::Hello(Hello::decode(&Rlp::new(payload))?)),
            DISCONNECT_ID => decode_disconnect(payload).map(Self::Disconnect),
            PING_ID => Ok(Self::Ping),
            PONG_ID => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}

/// Accepts `[reason]`, a bare `reason` and an empty payload.
fn decode_disconnect(payload: &[u8]) -> Result<DisconnectReason, ProtocolError> {
    if payload.is_empty() {
        return Ok(DisconnectReason::Requested);
    }
    let malformed =
        |err: rlp::DecoderError| ProtocolError::Malformed("disconnect", err.to_string());
    let rlp = Rlp::new(payload);
    let code: u8 = if rlp.is_list() {
        if rlp.item_count().map_err(malformed)? == 0 {
            return Ok(DisconnectReason::Requested);
        }
        rlp.val_at(0).map_err(malformed)?
    } else {
        rlp.as_val().map_err(malformed)?
    };
    Ok(DisconnectReason::from(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn hello() -> Hello {
        Hello {
            version: P2P_VERSION,
            client_id: "rlpx/0.1.0".into(),
            capabilities: vec![Capability::new("eth", 68), Capability::new("snap", 1)],
            listen_port: 30303,
            id: KeyPair::random().id(),
        }
    }

    #[test]
    fn hello_payload_decodes() {
        let msg = Devp2pMessage::Hello(hello());
        let frame = msg.to_frame();
        assert_eq!(frame.id, HELLO_ID);
        assert_eq!(Devp2pMessage::decode(frame.id, &frame.payload).unwrap(), msg);
    }

    #[test]
    fn hello_with_trailing_fields_is_accepted() {
        let h = hello();
        let mut s = RlpStream::new_list(6);
        s.append(&h.version);
        s.append(&h.client_id);
        s.begin_list(0);
        s.append(&h.listen_port);
        s.append(&&h.id.as_bytes()[..]);
        s.append(&"extension".to_string());
        match Devp2pMessage::decode(HELLO_ID, &s.out()).unwrap() {
            Devp2pMessage::Hello(decoded) => {
                assert_eq!(decoded.id, h.id);
                assert!(decoded.capabilities.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hello_with_short_id_is_malformed() {
        let mut s = RlpStream::new_list(5);
        s.append(&P2P_VERSION);
        s.append(&"x".to_string());
        s.begin_list(0);
        s.append(&0u16);
        s.append(&&[1u8; 10][..]);
        assert!(matches!(
            Devp2pMessage::decode(HELLO_ID, &s.out()),
            Err(ProtocolError::Malformed("hello", _))
        ));
    }

    #[test]
    fn disconnect_forms() {
        let listed = Devp2pMessage::Disconnect(DisconnectReason::TooManyPeers).encode_payload();
        assert_eq!(listed, vec![0xc1, 0x04]);
        assert_eq!(
            Devp2pMessage::decode(DISCONNECT_ID, &listed).unwrap(),
            Devp2pMessage::Disconnect(DisconnectReason::TooManyPeers)
        );
        assert_eq!(
            Devp2pMessage::decode(DISCONNECT_ID, &[0x08]).unwrap(),
            Devp2pMessage::Disconnect(DisconnectReason::ClientQuitting)
        );
        assert_eq!(
            Devp2pMessage::decode(DISCONNECT_ID, &[0xc0]).unwrap(),
            Devp2pMessage::Disconnect(DisconnectReason::Requested)
        );
        assert_eq!(
            Devp2pMessage::decode(DISCONNECT_ID, &[0xc1, 0x42]).unwrap(),
            Devp2pMessage::Disconnect(DisconnectReason::Other(0x42))
        );
    }

    #[test]
    fn ping_and_pong_carry_empty_lists() {
        assert_eq!(Devp2pMessage::Ping.to_frame(), Frame::new(PING_ID, vec![0xc0]));
        assert_eq!(Devp2pMessage::Pong.to_frame(), Frame::new(PONG_ID, vec![0xc0]));
    }

    #[test]
    fn reserved_but_undefined_id_is_unknown() {
        assert_eq!(
            Devp2pMessage::decode(0x07, &[0xc0]),
            Err(ProtocolError::UnknownMessage(0x07))
        );
    }

    #[test]
    fn reason_codes_round_trip() {
        for code in 0u8..=0x12 {
            assert_eq!(DisconnectReason::from(code).code(), code);
        }
    }
}
