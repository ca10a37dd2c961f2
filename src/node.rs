//! Node identifiers and `enode://` addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use secp256k1::PublicKey;
use thiserror::Error;

/// Length of a node id: an uncompressed public key without its `0x04` prefix.
pub const NODE_ID_LEN: usize = 64;

const ENODE_SCHEME: &str = "enode://";

/// Error produced while parsing node ids and enode URIs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("missing enode:// scheme")]
    MissingScheme,
    #[error("node id must be {NODE_ID_LEN} hex-encoded bytes")]
    InvalidId,
    #[error("node id is not a valid secp256k1 point")]
    InvalidPublicKey,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// 64-byte node id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let raw = key.serialize_uncompressed();
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&raw[1..]);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() != NODE_ID_LEN {
            return Err(NodeError::InvalidId);
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Restores the `0x04` prefix and parses the point.
    pub fn public_key(&self) -> Result<PublicKey, NodeError> {
        let mut raw = [0u8; NODE_ID_LEN + 1];
        raw[0] = 0x04;
        raw[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&raw).map_err(|_| NodeError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "NodeId({}..{})", &hex[..8], &hex[hex.len() - 8..])
    }
}

impl FromStr for NodeId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| NodeError::InvalidId)?;
        Self::from_slice(&bytes)
    }
}

/// Remote peer: its id plus, when known, where to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub addr: Option<SocketAddrV4>,
    /// Discovery port from `?discport=`, when it differs from the TCP port.
    pub udp_port: Option<u16>,
}

impl NodeIdentity {
    pub fn new(id: NodeId, addr: Option<SocketAddrV4>) -> Self {
        Self {
            id,
            addr,
            udp_port: None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr.map(SocketAddr::V4)
    }
}

impl FromStr for NodeIdentity {
    type Err = NodeError;

    /// Parses `enode://<128 hex>@<ipv4>:<tcp>[?discport=<udp>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.trim().strip_prefix(ENODE_SCHEME).ok_or(NodeError::MissingScheme)?;
        let (id, host) = rest
            .split_once('@')
            .ok_or_else(|| NodeError::InvalidAddress("missing '@'".into()))?;
        let id: NodeId = id.parse()?;
        id.public_key()?;

        let (host, query) = match host.split_once('?') {
            Some((host, query)) => (host, Some(query)),
            None => (host, None),
        };
        let (ip, port) = host
            .rsplit_once(':')
            .ok_or_else(|| NodeError::InvalidAddress(format!("missing port in {host}")))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| NodeError::InvalidAddress(format!("not an ipv4 address: {ip}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| NodeError::InvalidAddress(format!("bad tcp port: {port}")))?;

        let mut udp_port = None;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("discport=") {
                    udp_port = Some(value.parse().map_err(|_| {
                        NodeError::InvalidAddress(format!("bad discport: {value}"))
                    })?);
                }
            }
        }

        Ok(Self {
            id,
            addr: Some(SocketAddrV4::new(ip, port)),
            udp_port,
        })
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ENODE_SCHEME}{}", self.id)?;
        if let Some(addr) = self.addr {
            write!(f, "@{addr}")?;
            if let Some(port) = self.udp_port.filter(|p| *p != addr.port()) {
                write!(f, "?discport={port}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn parses_enode_uri() {
        let key = KeyPair::random();
        let uri = format!("enode://{}@127.0.0.1:30303", key.id());
        let node: NodeIdentity = uri.parse().unwrap();
        assert_eq!(node.id, key.id());
        assert_eq!(node.addr, Some("127.0.0.1:30303".parse().unwrap()));
        assert_eq!(node.udp_port, None);
        assert_eq!(node.to_string(), uri);
        assert_eq!(node.id.public_key().unwrap(), *key.public());
    }

    #[test]
    fn parses_discport() {
        let key = KeyPair::random();
        let uri = format!("enode://{}@10.0.0.1:30303?discport=30301", key.id());
        let node: NodeIdentity = uri.parse().unwrap();
        assert_eq!(node.udp_port, Some(30301));
        assert_eq!(node.to_string(), uri);
    }

    #[test]
    fn rejects_malformed_uris() {
        let key = KeyPair::random();
        assert_eq!(
            "http://x@1.2.3.4:1".parse::<NodeIdentity>(),
            Err(NodeError::MissingScheme)
        );
        assert_eq!(
            "enode://abcd@1.2.3.4:1".parse::<NodeIdentity>(),
            Err(NodeError::InvalidId)
        );
        assert!(matches!(
            format!("enode://{}@localhost:1", key.id()).parse::<NodeIdentity>(),
            Err(NodeError::InvalidAddress(_))
        ));
        assert!(matches!(
            format!("enode://{}@1.2.3.4", key.id()).parse::<NodeIdentity>(),
            Err(NodeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_off_curve_id() {
        let uri = format!("enode://{}@1.2.3.4:1", "00".repeat(NODE_ID_LEN));
        assert_eq!(uri.parse::<NodeIdentity>(), Err(NodeError::InvalidPublicKey));
    }
}
