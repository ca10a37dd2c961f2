//! secp256k1 identity keys, key agreement and recoverable signatures.
//!
//! The heavy lifting is delegated to `secp256k1`, `aes`/`ctr`, `sha3` and the
//! KDF/HMAC crates; this module only shapes them the way the handshake and
//! frame layers consume them.

use rand::RngCore;
use secp256k1::ecdh::shared_secret_point;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::node::NodeId;
use crate::util::H256;

pub mod ecies;
pub mod mac;

pub use mac::MacState;

/// Length of a recoverable signature on the wire: `r(32) ‖ s(32) ‖ v(1)`.
pub const SIGNATURE_LEN: usize = 65;

/// Errors produced by the cryptographic collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("public key recovery failed")]
    RecoveryFailed,
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("ciphertext tag mismatch")]
    TagMismatch,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Static or ephemeral secp256k1 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh key from the OS-seeded thread RNG.
    pub fn random() -> Self {
        let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self { secret, public }
    }

    /// Loads a key from 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_secret(secret))
    }

    /// Loads a key from 64 hex characters (an optional `0x` prefix is accepted).
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let trimmed = hex_str.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(|_| CryptoError::InvalidSecretKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The 64-byte node id advertised for this key.
    pub fn id(&self) -> NodeId {
        NodeId::from_public_key(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.id())
            .finish_non_exhaustive()
    }
}

/// ECDH agreement returning the x-coordinate of the shared point.
pub fn ecdh(secret: &SecretKey, public: &PublicKey) -> H256 {
    let point = shared_secret_point(public, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// Signs a 32-byte digest, returning `r ‖ s ‖ v`.
pub fn sign_recoverable(
    secret: &SecretKey,
    digest: &H256,
) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let message = Message::from_slice(digest).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = SECP256K1.sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    Ok(out)
}

/// Recovers the signer's public key from a 65-byte signature over `digest`.
pub fn recover(signature: &[u8], digest: &H256) -> Result<PublicKey, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let message = Message::from_slice(digest).map_err(|_| CryptoError::InvalidSignature)?;
    SECP256K1
        .recover_ecdsa(&message, &signature)
        .map_err(|_| CryptoError::RecoveryFailed)
}

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Fresh 32-byte handshake nonce.
pub fn nonce() -> H256 {
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees_in_both_directions() {
        let alice = KeyPair::random();
        let bob = KeyPair::random();
        assert_eq!(
            ecdh(alice.secret(), bob.public()),
            ecdh(bob.secret(), alice.public())
        );
    }

    #[test]
    fn recover_returns_signer() {
        let key = KeyPair::random();
        let digest = keccak256(&[&b"recoverable"[..]]);
        let sig = sign_recoverable(key.secret(), &digest).unwrap();
        assert_eq!(recover(&sig, &digest).unwrap(), *key.public());
    }

    #[test]
    fn recover_rejects_short_signature() {
        let digest = keccak256(&[&b"short"[..]]);
        assert_eq!(recover(&[0u8; 64], &digest), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn key_from_hex_matches_bytes() {
        let hex_key = "49a7b37aa6f6645917e7b807e9d1c00d4fa71f18343b0d4122a4d2df64dd6fee";
        let a = KeyPair::from_hex(hex_key).unwrap();
        let b = KeyPair::from_hex(&format!("0x{hex_key}")).unwrap();
        assert_eq!(a.public(), b.public());
        assert!(KeyPair::from_hex("zz").is_err());
    }
}
