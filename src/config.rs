//! Node configuration, loadable from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, KeyPair};
use crate::handshake::WireFormat;
use crate::node::{NodeError, NodeIdentity};
use crate::protocol::Capability;
use crate::session::SessionConfig;

pub const DEFAULT_UDP_PORT: u16 = 22332;

/// Smallest channel buffer a node accepts.
pub const MIN_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid private key: {0}")]
    Key(#[from] CryptoError),
    #[error("invalid peer: {0}")]
    Peer(#[from] NodeError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub name: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex secp256k1 secret; a fresh key is generated when absent.
    pub private_key: Option<String>,
    pub client_id: String,
    /// UDP port opened next to the TCP sessions. `None` opens nothing.
    pub udp_port: Option<u16>,
    /// TCP port for inbound peers. `None` accepts nothing.
    pub listen_port: Option<u16>,
    pub max_peers: usize,
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub poll_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Minimum gap between reconnect attempts to a dropped peer.
    pub reconnect_interval_ms: u64,
    pub shutdown_iterations: u32,
    pub shutdown_interval_ms: u64,
    /// Initiate with the pre-EIP-8 fixed-size handshake.
    pub legacy_handshake: bool,
    pub capabilities: Vec<CapabilityConfig>,
    /// `enode://` URIs dialled at start-up.
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            client_id: format!("rlpx/{}", env!("CARGO_PKG_VERSION")),
            udp_port: Some(DEFAULT_UDP_PORT),
            listen_port: None,
            max_peers: 10,
            buffer_size: crate::io::DEFAULT_BUFFER_SIZE,
            max_frame_size: crate::session::DEFAULT_MAX_FRAME_SIZE,
            poll_timeout_ms: 100,
            handshake_timeout_ms: 10_000,
            reconnect_interval_ms: 1_000,
            shutdown_iterations: 50,
            shutdown_interval_ms: 100,
            legacy_handshake: false,
            capabilities: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        // must hold a padded EIP-8 AUTH, or an ACK with hello right behind it
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} is below {MIN_BUFFER_SIZE} bytes",
                self.buffer_size
            )));
        }
        if self.peers.len() > self.max_peers {
            return Err(ConfigError::Invalid(format!(
                "{} peers configured but max_peers is {}",
                self.peers.len(),
                self.max_peers
            )));
        }
        Ok(())
    }

    /// Loads the configured key or generates a new one.
    pub fn key(&self) -> Result<KeyPair, ConfigError> {
        match &self.private_key {
            Some(hex) => Ok(KeyPair::from_hex(hex)?),
            None => Ok(KeyPair::random()),
        }
    }

    pub fn peers(&self) -> Result<Vec<NodeIdentity>, ConfigError> {
        self.peers
            .iter()
            .map(|uri| uri.parse().map_err(ConfigError::from))
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_id: self.client_id.clone(),
            listen_port: self.listen_port.unwrap_or(0),
            capabilities: self
                .capabilities
                .iter()
                .map(|c| Capability::new(c.name.clone(), c.version))
                .collect(),
            buffer_size: self.buffer_size,
            max_frame_size: self.max_frame_size,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            wire_format: if self.legacy_handshake {
                WireFormat::Legacy
            } else {
                WireFormat::Eip8
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.udp_port, Some(22332));
        assert_eq!(config.buffer_size, 1200);
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.shutdown_iterations, 50);
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config = NodeConfig::from_json(
            r#"{
                "private_key": "b71c71a67e1177ad4e901695e1b4b9ee17ae16c6668d313eac2f96dbcda3f291",
                "udp_port": null,
                "listen_port": 30303,
                "legacy_handshake": true,
                "capabilities": [{ "name": "eth", "version": 68 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.udp_port, None);
        let session = config.session_config();
        assert_eq!(session.listen_port, 30303);
        assert_eq!(session.wire_format, WireFormat::Legacy);
        assert_eq!(session.capabilities, vec![Capability::new("eth", 68)]);
        assert!(config.key().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            NodeConfig::from_json(r#"{ "max_peers": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{ "buffer_size": 512 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn bad_key_and_peer_are_typed_errors() {
        let config = NodeConfig {
            private_key: Some("00".into()),
            peers: vec!["enode://nope".into()],
            ..NodeConfig::default()
        };
        assert!(matches!(config.key(), Err(ConfigError::Key(_))));
        assert!(matches!(config.peers(), Err(ConfigError::Peer(_))));
    }
}
