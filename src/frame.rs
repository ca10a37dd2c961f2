//! Authenticated RLPx frames.
//!
//! ```text
//! header-ct(16) ‖ header-mac(16) ‖ body-ct(pad16(size)) ‖ body-mac(16)
//! header = size(3, BE) ‖ rlp([0, 0]) ‖ zero padding
//! body   = rlp(message id) ‖ payload ‖ zero padding
//! ```
//!
//! Both directions share the AES-256-CTR key (zero IV, independent
//! counters). Each direction's MAC absorbs every ciphertext byte, so a
//! flipped, dropped or replayed frame fails verification.

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use rlp::Rlp;
use thiserror::Error;

use crate::crypto::mac::MAC_LEN;
use crate::crypto::MacState;
use crate::handshake::SessionSecrets;
use crate::util::{pad16, read_u24_be, write_u24_be};

type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

pub const HEADER_LEN: usize = 16;

/// Largest body size the 3-byte length can announce.
pub const MAX_FRAME_SIZE: usize = 0x00ff_ffff;

/// `rlp([capability-id, context-id])`, both zero.
const HEADER_DATA: [u8; 3] = [0xc2, 0x80, 0x80];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body of {size} bytes exceeds the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("frame header mac mismatch")]
    HeaderMac,
    #[error("frame body mac mismatch")]
    BodyMac,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame cipher counter exhausted")]
    Cipher,
}

/// A decoded frame: message id plus the raw RLP payload that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Per-session frame cipher and MAC state.
pub struct FrameCodec {
    enc: Aes256Ctr,
    dec: Aes256Ctr,
    egress: MacState,
    ingress: MacState,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(secrets: SessionSecrets) -> Self {
        let iv = [0u8; 16];
        Self {
            enc: Aes256Ctr::new(&secrets.aes_secret.into(), &iv.into()),
            dec: Aes256Ctr::new(&secrets.aes_secret.into(), &iv.into()),
            egress: secrets.egress_mac,
            ingress: secrets.ingress_mac,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Lowers the largest body this codec accepts or produces.
    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit.min(MAX_FRAME_SIZE);
        self
    }

    pub fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let id = rlp::encode(&frame.id);
        let size = id.len() + frame.payload.len();
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        let size_bytes = write_u24_be(size).ok_or(FrameError::TooLarge {
            size,
            limit: MAX_FRAME_SIZE,
        })?;

        let mut header = [0u8; HEADER_LEN];
        header[..3].copy_from_slice(&size_bytes);
        header[3..3 + HEADER_DATA.len()].copy_from_slice(&HEADER_DATA);
        self.enc.apply_keystream(&mut header);
        let header_mac = self.egress.update_header(&header);

        let mut body = Vec::with_capacity(pad16(size));
        body.extend_from_slice(&id);
        body.extend_from_slice(&frame.payload);
        body.resize(pad16(size), 0);
        self.enc.apply_keystream(&mut body);
        let body_mac = self.egress.update_body(&body);

        let mut out = Vec::with_capacity(HEADER_LEN + MAC_LEN + body.len() + MAC_LEN);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header_mac);
        out.extend_from_slice(&body);
        out.extend_from_slice(&body_mac);
        Ok(out)
    }

    /// Decodes the frame at the front of `bytes`.
    ///
    /// Returns `Ok(None)` without touching any state while the frame is still
    /// incomplete, and `Ok(Some((frame, consumed)))` once it has been verified.
    /// Any error is fatal for the session.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        if bytes.len() < HEADER_LEN + MAC_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);

        let mut ingress = self.ingress.clone();
        if ingress.update_header(&header)[..] != bytes[HEADER_LEN..HEADER_LEN + MAC_LEN] {
            return Err(FrameError::HeaderMac);
        }

        let start: u64 = self.dec.try_current_pos().map_err(|_| FrameError::Cipher)?;
        self.dec.apply_keystream(&mut header);
        let size = read_u24_be(&header).ok_or(FrameError::Cipher)?;
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }

        let body_start = HEADER_LEN + MAC_LEN;
        let padded = pad16(size);
        let total = body_start + padded + MAC_LEN;
        if bytes.len() < total {
            self.dec.try_seek(start).map_err(|_| FrameError::Cipher)?;
            return Ok(None);
        }

        let body_ct = &bytes[body_start..body_start + padded];
        if ingress.update_body(body_ct)[..] != bytes[body_start + padded..total] {
            return Err(FrameError::BodyMac);
        }
        self.ingress = ingress;

        let mut body = body_ct.to_vec();
        self.dec.apply_keystream(&mut body);
        body.truncate(size);

        let id_len = Rlp::new(&body)
            .payload_info()
            .map_err(|err| FrameError::Malformed(err.to_string()))?
            .total();
        if id_len > body.len() {
            return Err(FrameError::Malformed("truncated message id".into()));
        }
        let id: u64 =
            rlp::decode(&body[..id_len]).map_err(|err| FrameError::Malformed(err.to_string()))?;

        Ok(Some((Frame::new(id, &body[id_len..]), total)))
    }

    /// Digest of everything sent so far.
    pub fn egress_digest(&self) -> [u8; 32] {
        self.egress.digest()
    }

    /// Digest of everything received so far.
    pub fn ingress_digest(&self) -> [u8; 32] {
        self.ingress.digest()
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("egress", &self.egress)
            .field("ingress", &self.ingress)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

/// Exact encoded length of a frame carrying a `size`-byte body.
pub fn encoded_len(size: usize) -> usize {
    HEADER_LEN + MAC_LEN + pad16(size) + MAC_LEN
}

/// Largest body whose whole encoded frame fits in `room` bytes.
pub fn max_body_within(room: usize) -> usize {
    let aligned = room.saturating_sub(encoded_len(0));
    aligned - aligned % 16
}
