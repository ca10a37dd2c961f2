//! AUTH/ACK bodies and their two envelopes.
//!
//! EIP-8 envelope: `size(2, BE) ‖ ecies(rlp(body) ‖ padding)` with the size
//! prefix authenticated as ECIES shared MAC data. Legacy envelope: the bare
//! ECIES ciphertext of a fixed-layout body, 307 bytes for AUTH and 210 for ACK.

use rand::Rng;
use rlp::{Rlp, RlpStream};
use secp256k1::{PublicKey, SecretKey};

use super::HandshakeError;
use crate::crypto::{ecies, keccak256, SIGNATURE_LEN};
use crate::node::{NodeId, NODE_ID_LEN};
use crate::util::{read_u16_be, write_u16_be, H256};

/// Version advertised in AUTH/ACK bodies and assumed for legacy peers.
pub const HANDSHAKE_VERSION: u64 = 4;

pub const LEGACY_AUTH_BODY_LEN: usize = SIGNATURE_LEN + 32 + NODE_ID_LEN + 32 + 1;
pub const LEGACY_AUTH_LEN: usize = LEGACY_AUTH_BODY_LEN + ecies::OVERHEAD;
pub const LEGACY_ACK_BODY_LEN: usize = NODE_ID_LEN + 32 + 1;
pub const LEGACY_ACK_LEN: usize = LEGACY_ACK_BODY_LEN + ecies::OVERHEAD;

/// Random padding appended to EIP-8 bodies.
pub const MIN_PADDING: usize = 100;
pub const MAX_PADDING: usize = 300;

/// Largest EIP-8 envelope still waited for once a legacy decrypt has failed.
/// Legacy messages start with `0x04`, which reads as a size of at least 1024.
pub const MAX_EIP8_SIZE: usize = 1023;

/// Envelope a handshake message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Eip8,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    /// Ephemeral-key signature over `ecdh(static) ⊕ nonce`.
    pub signature: [u8; SIGNATURE_LEN],
    pub public: NodeId,
    pub nonce: H256,
    pub version: u64,
}

impl AuthMessage {
    pub fn to_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(4);
        s.append(&&self.signature[..]);
        s.append(&&self.public.as_bytes()[..]);
        s.append(&&self.nonce[..]);
        s.append(&self.version);
        s.out().to_vec()
    }

    /// Decodes `[sig, pubkey, nonce, version?, ...]`; extra elements are ignored.
    pub fn from_rlp(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let rlp = list(bytes)?;
        Ok(Self {
            signature: fixed(&rlp, 0)?,
            public: NodeId::from_slice(rlp.at(1)?.data()?)
                .map_err(|_| HandshakeError::Malformed("auth public key".into()))?,
            nonce: fixed(&rlp, 2)?,
            version: optional_version(&rlp, 3)?,
        })
    }

    /// `sig(65) ‖ keccak(ephemeral)(32) ‖ pubkey(64) ‖ nonce(32) ‖ 0x00`
    pub fn to_legacy(&self, ephemeral: &PublicKey) -> Vec<u8> {
        let ephemeral = NodeId::from_public_key(ephemeral);
        let mut out = Vec::with_capacity(LEGACY_AUTH_BODY_LEN);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&keccak256(&[&ephemeral.as_bytes()[..]]));
        out.extend_from_slice(self.public.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.push(0x00);
        out
    }

    pub fn from_legacy(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != LEGACY_AUTH_BODY_LEN {
            return Err(HandshakeError::Malformed(format!(
                "legacy auth body is {} bytes",
                bytes.len()
            )));
        }
        let (signature, rest) = bytes.split_at(SIGNATURE_LEN);
        let (_ephemeral_hash, rest) = rest.split_at(32);
        let (public, rest) = rest.split_at(NODE_ID_LEN);
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(signature);
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&rest[..32]);
        Ok(Self {
            signature: sig,
            public: NodeId::from_slice(public)
                .map_err(|_| HandshakeError::Malformed("auth public key".into()))?,
            nonce,
            version: HANDSHAKE_VERSION,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub ephemeral: NodeId,
    pub nonce: H256,
    pub version: u64,
}

impl AckMessage {
    pub fn to_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(3);
        s.append(&&self.ephemeral.as_bytes()[..]);
        s.append(&&self.nonce[..]);
        s.append(&self.version);
        s.out().to_vec()
    }

    pub fn from_rlp(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let rlp = list(bytes)?;
        Ok(Self {
            ephemeral: NodeId::from_slice(rlp.at(0)?.data()?)
                .map_err(|_| HandshakeError::Malformed("ack ephemeral key".into()))?,
            nonce: fixed(&rlp, 1)?,
            version: optional_version(&rlp, 2)?,
        })
    }

    /// `ephemeral(64) ‖ nonce(32) ‖ 0x00`
    pub fn to_legacy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_ACK_BODY_LEN);
        out.extend_from_slice(self.ephemeral.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.push(0x00);
        out
    }

    pub fn from_legacy(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != LEGACY_ACK_BODY_LEN {
            return Err(HandshakeError::Malformed(format!(
                "legacy ack body is {} bytes",
                bytes.len()
            )));
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&bytes[NODE_ID_LEN..NODE_ID_LEN + 32]);
        Ok(Self {
            ephemeral: NodeId::from_slice(&bytes[..NODE_ID_LEN])
                .map_err(|_| HandshakeError::Malformed("ack ephemeral key".into()))?,
            nonce,
            version: HANDSHAKE_VERSION,
        })
    }
}

/// Encrypts `body` to `remote` inside the chosen envelope.
pub fn seal(
    format: WireFormat,
    remote: &PublicKey,
    body: &[u8],
) -> Result<Vec<u8>, HandshakeError> {
    match format {
        WireFormat::Legacy => Ok(ecies::encrypt(remote, body, &[])?),
        WireFormat::Eip8 => {
            let mut rng = rand::thread_rng();
            let padding = rng.gen_range(MIN_PADDING..=MAX_PADDING);
            let mut plain = Vec::with_capacity(body.len() + padding);
            plain.extend_from_slice(body);
            plain.resize(body.len() + padding, 0);
            rng.fill(&mut plain[body.len()..]);

            let size = u16::try_from(plain.len() + ecies::OVERHEAD)
                .map_err(|_| HandshakeError::TooLarge(plain.len() + ecies::OVERHEAD))?;
            let prefix = write_u16_be(size);
            let cipher = ecies::encrypt(remote, &plain, &prefix)?;

            let mut out = Vec::with_capacity(prefix.len() + cipher.len());
            out.extend_from_slice(&prefix);
            out.extend_from_slice(&cipher);
            Ok(out)
        }
    }
}

/// A decrypted handshake message.
#[derive(Debug)]
pub struct Opened {
    pub plain: Vec<u8>,
    pub format: WireFormat,
    /// Bytes of input the message occupied.
    pub consumed: usize,
}

/// Decrypts the handshake message at the start of `bytes`.
///
/// The EIP-8 envelope is tried first once its announced size is buffered;
/// the legacy envelope of `legacy_len` bytes is tried next. Returns
/// [`HandshakeError::Incomplete`] while the EIP-8 size is not yet buffered
/// and the legacy attempt is impossible or failed.
pub fn open(secret: &SecretKey, bytes: &[u8], legacy_len: usize) -> Result<Opened, HandshakeError> {
    let size = read_u16_be(bytes).ok_or(HandshakeError::Incomplete)? as usize;

    let complete = bytes.len() >= 2 + size;
    let mut eip8_error = None;
    if complete {
        match ecies::decrypt(secret, &bytes[2..2 + size], &bytes[..2]) {
            Ok(plain) => {
                return Ok(Opened {
                    plain,
                    format: WireFormat::Eip8,
                    consumed: 2 + size,
                })
            }
            Err(err) => eip8_error = Some(err),
        }
    }

    if bytes.len() >= legacy_len {
        return match ecies::decrypt(secret, &bytes[..legacy_len], &[]) {
            Ok(plain) => Ok(Opened {
                plain,
                format: WireFormat::Legacy,
                consumed: legacy_len,
            }),
            // a longer EIP-8 message may still be arriving
            Err(_) if !complete && size <= MAX_EIP8_SIZE => Err(HandshakeError::Incomplete),
            Err(err) => Err(err.into()),
        };
    }

    match eip8_error {
        Some(err) => Err(err.into()),
        None => Err(HandshakeError::Incomplete),
    }
}

fn list(bytes: &[u8]) -> Result<Rlp<'_>, HandshakeError> {
    let total = Rlp::new(bytes).payload_info()?.total();
    if total > bytes.len() {
        return Err(HandshakeError::Malformed("truncated rlp list".into()));
    }
    let rlp = Rlp::new(&bytes[..total]);
    if !rlp.is_list() {
        return Err(HandshakeError::Malformed("expected rlp list".into()));
    }
    Ok(rlp)
}

fn fixed<const N: usize>(rlp: &Rlp<'_>, index: usize) -> Result<[u8; N], HandshakeError> {
    let data = rlp.at(index)?.data()?;
    if data.len() != N {
        return Err(HandshakeError::Malformed(format!(
            "field {index} is {} bytes, expected {N}",
            data.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(data);
    Ok(out)
}

fn optional_version(rlp: &Rlp<'_>, index: usize) -> Result<u64, HandshakeError> {
    if rlp.item_count()? > index {
        Ok(rlp.val_at(index)?)
    } else {
        Ok(HANDSHAKE_VERSION)
    }
}
