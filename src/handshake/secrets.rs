use crate::crypto::{keccak256, MacState};
use crate::util::{xor32, H256};

/// Symmetric state produced by a completed handshake.
///
/// # Guarantees
/// - Both peers of an honest exchange derive equal `aes_secret` and
///   `mac_secret`, and one side's egress MAC equals the other's ingress MAC.
/// - Nothing here is reused across connections: a new handshake always
///   starts from fresh ephemeral keys and nonces.
#[derive(Clone)]
pub struct SessionSecrets {
    pub aes_secret: H256,
    pub mac_secret: H256,
    pub egress_mac: MacState,
    pub ingress_mac: MacState,
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("egress_mac", &self.egress_mac)
            .field("ingress_mac", &self.ingress_mac)
            .finish_non_exhaustive()
    }
}

/// Inputs to secret derivation, as seen from one side.
pub struct Derivation<'a> {
    pub ephemeral_shared: H256,
    pub initiator_nonce: H256,
    pub responder_nonce: H256,
    pub local_nonce: H256,
    pub remote_nonce: H256,
    /// Handshake bytes this side wrote (AUTH for the initiator, ACK for the responder).
    pub sent: &'a [u8],
    pub received: &'a [u8],
}

impl Derivation<'_> {
    pub fn derive(&self) -> SessionSecrets {
        let nonce_material = keccak256(&[&self.responder_nonce[..], &self.initiator_nonce[..]]);
        let shared_secret = keccak256(&[&self.ephemeral_shared[..], &nonce_material[..]]);
        let aes_secret = keccak256(&[&self.ephemeral_shared[..], &shared_secret[..]]);
        let mac_secret = keccak256(&[&self.ephemeral_shared[..], &aes_secret[..]]);

        let egress_seed = xor32(&mac_secret, &self.remote_nonce);
        let mut egress_mac = MacState::new(&mac_secret, &egress_seed);
        egress_mac.update(self.sent);

        let ingress_seed = xor32(&mac_secret, &self.local_nonce);
        let mut ingress_mac = MacState::new(&mac_secret, &ingress_seed);
        ingress_mac.update(self.received);

        SessionSecrets {
            aes_secret,
            mac_secret,
            egress_mac,
            ingress_mac,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ecdh, KeyPair};

    #[test]
    fn known_ephemeral_keys_and_nonces_give_known_secrets() {
        let ephemeral_a = KeyPair::from_hex(
            "869d6ecf5211f1cc60418a13b9d870b22959d0c16f02bec714c960dd2298a32d",
        )
        .unwrap();
        let ephemeral_b = KeyPair::from_hex(
            "e238eb8e04fee6511ab04c6dd3c89ce097b11f25d584863ac2b6d5b35b1847e4",
        )
        .unwrap();
        let nonce_a: H256 =
            hex::decode("7e968bba13b6c50e2c4cd7f241cc0d64d1ac25c7f5952df231ac6a2bda8ee5d6")
                .unwrap()
                .try_into()
                .unwrap();
        let nonce_b: H256 =
            hex::decode("559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd")
                .unwrap()
                .try_into()
                .unwrap();

        let secrets = Derivation {
            ephemeral_shared: ecdh(ephemeral_a.secret(), ephemeral_b.public()),
            initiator_nonce: nonce_a,
            responder_nonce: nonce_b,
            local_nonce: nonce_a,
            remote_nonce: nonce_b,
            sent: b"",
            received: b"",
        }
        .derive();
        assert_eq!(
            hex::encode(secrets.aes_secret),
            "80e8632c05fed6fc2a13b0f8d31a3cf645366239170ea067065aba8e28bac487"
        );
        assert_eq!(
            hex::encode(secrets.mac_secret),
            "2ea74ec5dae199227dff1af715362700e989d889d7a493cb0639691efb8e5f98"
        );
    }

    #[test]
    fn mirrored_inputs_give_mirrored_macs() {
        let shared = [5u8; 32];
        let (ni, nr) = ([1u8; 32], [2u8; 32]);
        let initiator = Derivation {
            ephemeral_shared: shared,
            initiator_nonce: ni,
            responder_nonce: nr,
            local_nonce: ni,
            remote_nonce: nr,
            sent: b"auth",
            received: b"ack",
        }
        .derive();
        let responder = Derivation {
            ephemeral_shared: shared,
            initiator_nonce: ni,
            responder_nonce: nr,
            local_nonce: nr,
            remote_nonce: ni,
            sent: b"ack",
            received: b"auth",
        }
        .derive();

        assert_eq!(initiator.aes_secret, responder.aes_secret);
        assert_eq!(initiator.mac_secret, responder.mac_secret);
        assert_eq!(initiator.egress_mac.digest(), responder.ingress_mac.digest());
        assert_eq!(initiator.ingress_mac.digest(), responder.egress_mac.digest());
        assert_ne!(initiator.egress_mac.digest(), initiator.ingress_mac.digest());
    }
}
