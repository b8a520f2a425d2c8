//! Curve25519 key exchange (RFC 8731) and session key derivation
//! (RFC 4253 Section 7.2).

use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use sshpiper_platform::{PiperError, PiperResult};

use crate::ssh::wire;

/// Ephemeral curve25519 exchange state for one key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> PiperResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| PiperError::Security("failed to generate curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            PiperError::Security("failed to compute curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns our ephemeral public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret K, consuming the exchange.
    pub fn compute_shared_secret(self, peer_public: &[u8; 32]) -> PiperResult<Vec<u8>> {
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| PiperError::Security("curve25519 key agreement failed".to_string()))
    }
}

/// Computes the exchange hash H (RFC 4253 Section 8):
///
/// ```text
/// H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)
/// ```
///
/// with every component length-prefixed and K encoded as mpint.
#[allow(clippy::too_many_arguments)]
pub fn compute_exchange_hash(
    client_version: &str,
    server_version: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();

    let mut hash_string = |data: &[u8]| {
        hasher.update((data.len() as u32).to_be_bytes());
        hasher.update(data);
    };

    hash_string(client_version.trim_end_matches("\r\n").as_bytes());
    hash_string(server_version.trim_end_matches("\r\n").as_bytes());
    hash_string(client_kexinit);
    hash_string(server_kexinit);
    hash_string(host_key_blob);
    hash_string(client_public);
    hash_string(server_public);

    hasher.update(wire::encode_mpint(shared_secret));

    hasher.finalize().to_vec()
}

/// Derives session key material (RFC 4253 Section 7.2):
///
/// ```text
/// key = HASH(K || H || key_type || session_id)
/// ```
///
/// extended with `HASH(K || H || key_so_far)` blocks until
/// `key_length` bytes are available. `key_type` is `b'C'` for the
/// client-to-server cipher key and `b'D'` for server-to-client.
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = wire::encode_mpint(shared_secret);
    let mut key = Vec::new();
    let mut hasher = Sha256::new();

    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize_reset());

    while key.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key[key.len() - 32..]);
        key.extend_from_slice(&hasher.finalize_reset());
    }

    key.truncate(key_length);
    key
}
