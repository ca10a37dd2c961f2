use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha3::{Digest, Keccak256};

use crate::util::H256;

/// Length of the truncated frame MAC.
pub const MAC_LEN: usize = 16;

/// Running Keccak-256 state for one direction of a session.
///
/// Every frame is absorbed into the state, so a tag only verifies when the
/// receiver has seen exactly the same byte stream the sender produced.
#[derive(Clone)]
pub struct MacState {
    hasher: Keccak256,
    cipher: Aes256,
}

impl MacState {
    /// Seeds the state with `(mac_secret ⊕ nonce) ‖ handshake bytes`.
    pub fn new(mac_secret: &H256, seed: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        Self {
            hasher,
            cipher: Aes256::new(GenericArray::from_slice(mac_secret)),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Full 32-byte digest of everything absorbed so far.
    pub fn digest(&self) -> H256 {
        self.hasher.clone().finalize().into()
    }

    /// First 16 bytes of the current digest.
    pub fn tag(&self) -> [u8; MAC_LEN] {
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&self.digest()[..MAC_LEN]);
        out
    }

    /// Absorbs an encrypted frame header and returns its tag.
    pub fn update_header(&mut self, header_ciphertext: &[u8; MAC_LEN]) -> [u8; MAC_LEN] {
        self.fold(header_ciphertext);
        self.tag()
    }

    /// Absorbs an encrypted frame body and returns its tag.
    pub fn update_body(&mut self, body_ciphertext: &[u8]) -> [u8; MAC_LEN] {
        self.hasher.update(body_ciphertext);
        let seed = self.tag();
        self.fold(&seed);
        self.tag()
    }

    // keccak.update(aes(digest[..16]) ^ seed)
    fn fold(&mut self, seed: &[u8; MAC_LEN]) {
        let mut block = GenericArray::clone_from_slice(&self.tag());
        self.cipher.encrypt_block(&mut block);
        for (b, s) in block.iter_mut().zip(seed.iter()) {
            *b ^= s;
        }
        self.hasher.update(block);
    }
}

impl std::fmt::Debug for MacState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacState")
            .field("digest", &hex::encode(self.digest()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_seeds_produce_identical_tags() {
        let secret = [7u8; 32];
        let mut a = MacState::new(&secret, b"seed");
        let mut b = MacState::new(&secret, b"seed");
        assert_eq!(a.update_header(&[1u8; 16]), b.update_header(&[1u8; 16]));
        assert_eq!(a.update_body(&[2u8; 32]), b.update_body(&[2u8; 32]));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn tags_chain_over_history() {
        let secret = [7u8; 32];
        let mut a = MacState::new(&secret, b"seed");
        let mut b = MacState::new(&secret, b"seed");
        a.update_body(&[0u8; 16]);
        b.update_body(&[1u8; 16]);
        assert_ne!(a.update_header(&[9u8; 16]), b.update_header(&[9u8; 16]));
    }

    #[test]
    fn digest_does_not_consume_state() {
        let mut a = MacState::new(&[1u8; 32], b"");
        a.update(b"foo");
        assert_eq!(a.digest(), a.digest());
    }
}
