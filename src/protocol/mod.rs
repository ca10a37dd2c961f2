//! Message-id routing between the base protocol and registered sub-protocols.
//!
//! Ids `0x00..0x10` always belong to [`devp2p`]. Every registered
//! [`SubProtocol`] then takes the next `message_count()` ids, in
//! registration order.

use std::sync::Arc;

use thiserror::Error;

use crate::frame::Frame;

pub mod devp2p;

pub use devp2p::{
    Capability, Devp2pMessage, DisconnectReason, Hello, BASE_PROTOCOL_LENGTH, P2P_VERSION,
};

/// Handler slots per session, the base protocol included.
pub const MAX_PROTOCOL_SLOTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message id {0:#x}")]
    UnknownMessage(u64),
    #[error("malformed {0} message: {1}")]
    Malformed(&'static str, String),
    #[error("{0} received before hello")]
    BeforeHello(&'static str),
    #[error("no more than {MAX_PROTOCOL_SLOTS} protocol slots")]
    TooManyProtocols,
    #[error("{0}")]
    Handler(String),
}

/// A capability multiplexed over the session after the base protocol.
///
/// Ids passed to and returned from the handler are relative to the
/// protocol's own range; the session adds the offset.
pub trait SubProtocol {
    fn capability(&self) -> Capability;

    /// Number of message ids the protocol occupies.
    fn message_count(&self) -> u64;

    /// Handles one inbound message and returns any frames to send back.
    fn handle(&mut self, id: u64, payload: &[u8]) -> Result<Vec<Frame>, ProtocolError>;
}

/// Builds a fresh handler for each new session.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn SubProtocol> + Send + Sync>;

struct Slot {
    offset: u64,
    handler: Box<dyn SubProtocol>,
}

/// Sub-protocols registered on one session.
#[derive(Default)]
pub struct ProtocolTable {
    slots: Vec<Slot>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a protocol and returns the first id of its range.
    pub fn register(&mut self, handler: Box<dyn SubProtocol>) -> Result<u64, ProtocolError> {
        if self.slots.len() + 1 >= MAX_PROTOCOL_SLOTS {
            return Err(ProtocolError::TooManyProtocols);
        }
        let offset = self.next_offset();
        self.slots.push(Slot { offset, handler });
        Ok(offset)
    }

    fn next_offset(&self) -> u64 {
        self.slots
            .last()
            .map(|slot| slot.offset + slot.handler.message_count())
            .unwrap_or(BASE_PROTOCOL_LENGTH)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.slots.iter().map(|slot| slot.handler.capability()).collect()
    }

    /// Whether `id` falls inside a registered protocol's range.
    pub fn contains(&self, id: u64) -> bool {
        self.slots
            .iter()
            .any(|slot| id >= slot.offset && id < slot.offset + slot.handler.message_count())
    }

    /// Routes an absolute id to its handler and returns the replies with
    /// absolute ids. Ids inside the base range are not routed here.
    pub fn dispatch(&mut self, id: u64, payload: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| id >= slot.offset && id < slot.offset + slot.handler.message_count())
            .ok_or(ProtocolError::UnknownMessage(id))?;
        let offset = slot.offset;
        let count = slot.handler.message_count();
        let replies = slot.handler.handle(id - offset, payload)?;
        replies
            .into_iter()
            .map(|frame| {
                if frame.id >= count {
                    Err(ProtocolError::UnknownMessage(offset + frame.id))
                } else {
                    Ok(Frame::new(offset + frame.id, frame.payload))
                }
            })
            .collect()
    }

    /// Absolute id of a protocol's relative message, by capability name.
    pub fn absolute_id(&self, name: &str, id: u64) -> Option<u64> {
        self.slots
            .iter()
            .find(|slot| {
                slot.handler.capability().name == name && id < slot.handler.message_count()
            })
            .map(|slot| slot.offset + id)
    }
}

impl std::fmt::Debug for ProtocolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.slots
                    .iter()
                    .map(|slot| (slot.offset, slot.handler.capability().to_string())),
            )
            .finish()
    }
}
