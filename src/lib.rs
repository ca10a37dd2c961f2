//! RLPx session layer for devp2p peers.
//!
//! Implements the ECIES AUTH/ACK handshake (EIP-8 and the fixed-size legacy
//! form), the MAC-chained frame protocol, the devp2p base protocol
//! (hello, disconnect, ping, pong) and a single-threaded, poll-driven socket
//! engine that runs any number of sessions without background threads.

pub mod config;
pub mod crypto;
pub mod frame;
pub mod handshake;
pub mod host;
pub mod io;
pub mod node;
pub mod protocol;
pub mod session;
pub mod util;

pub use config::{ConfigError, NodeConfig};
pub use crypto::{CryptoError, KeyPair};
pub use frame::{Frame, FrameCodec, FrameError};
pub use handshake::{Handshake, HandshakeError, SessionSecrets, WireFormat};
pub use host::{HostError, Node};
pub use io::{
    poll_many, AsyncIo, Driver, IoError, IoEvent, MioSelector, Selector, TcpDriver,
};
pub use node::{NodeError, NodeId, NodeIdentity};
pub use protocol::{
    Capability, Devp2pMessage, DisconnectReason, Hello, ProtocolError, ProtocolFactory,
    SubProtocol,
};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};
