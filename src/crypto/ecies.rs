//! ECIES as used by the RLPx handshake.
//!
//! Ciphertext layout: `0x04 ‖ R(64) ‖ iv(16) ‖ AES-128-CTR(kE, iv, m) ‖ tag(32)`
//! where `kE ‖ kM = concatKDF(ECDH(r, K), 32)` and
//! `tag = HMAC-SHA-256(sha256(kM), iv ‖ c ‖ shared_mac_data)`.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use super::{ecdh, CryptoError, KeyPair};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const PUBLIC_KEY_LEN: usize = 65;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Bytes added to a plaintext by [`encrypt`].
pub const OVERHEAD: usize = PUBLIC_KEY_LEN + IV_LEN + TAG_LEN;

struct Keys {
    enc: [u8; 16],
    mac: [u8; 32],
}

fn derive_keys(shared: &[u8; 32]) -> Result<Keys, CryptoError> {
    let mut material = [0u8; 32];
    concat_kdf::derive_key_into::<Sha256>(shared, &[], &mut material)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let mut enc = [0u8; 16];
    enc.copy_from_slice(&material[..16]);
    let mac: [u8; 32] = Sha256::digest(&material[16..]).into();
    Ok(Keys { enc, mac })
}

fn tag(
    mac_key: &[u8; 32],
    iv: &[u8],
    body: &[u8],
    shared_mac_data: &[u8],
) -> Result<HmacSha256, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(iv);
    mac.update(body);
    mac.update(shared_mac_data);
    Ok(mac)
}

/// Encrypts `plain` to `remote`, authenticating `shared_mac_data` alongside it.
pub fn encrypt(
    remote: &PublicKey,
    plain: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = KeyPair::random();
    let keys = derive_keys(&ecdh(ephemeral.secret(), remote))?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(plain.len() + OVERHEAD);
    out.extend_from_slice(&ephemeral.public().serialize_uncompressed());
    out.extend_from_slice(&iv);
    let body_start = out.len();
    out.extend_from_slice(plain);
    Aes128Ctr::new(&keys.enc.into(), &iv.into()).apply_keystream(&mut out[body_start..]);

    let digest = tag(&keys.mac, &iv, &out[body_start..], shared_mac_data)?
        .finalize()
        .into_bytes();
    out.extend_from_slice(&digest);
    Ok(out)
}

/// Decrypts a ciphertext produced by [`encrypt`] with the recipient's secret key.
pub fn decrypt(
    secret: &SecretKey,
    cipher: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if cipher.len() < OVERHEAD {
        return Err(CryptoError::CiphertextTooShort(cipher.len()));
    }
    let (ephemeral, rest) = cipher.split_at(PUBLIC_KEY_LEN);
    let (iv, rest) = rest.split_at(IV_LEN);
    let (body, received_tag) = rest.split_at(rest.len() - TAG_LEN);

    let ephemeral = PublicKey::from_slice(ephemeral).map_err(|_| CryptoError::InvalidPublicKey)?;
    let keys = derive_keys(&ecdh(secret, &ephemeral))?;

    tag(&keys.mac, iv, body, shared_mac_data)?
        .verify_slice(received_tag)
        .map_err(|_| CryptoError::TagMismatch)?;

    let mut iv_block = [0u8; IV_LEN];
    iv_block.copy_from_slice(iv);
    let mut plain = body.to_vec();
    Aes128Ctr::new(&keys.enc.into(), &iv_block.into()).apply_keystream(&mut plain);
    Ok(plain)
}
