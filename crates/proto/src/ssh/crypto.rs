//! AEAD packet ciphers.
//!
//! The transport encrypts each packet body with an AEAD cipher via
//! ring. The 4-byte length word travels in cleartext but is bound
//! into the AEAD computation as associated data, so tampering with it
//! fails the tag check. The nonce is the 64-bit packet sequence
//! number, so both sides must install keys at the same point in the
//! stream.
//!
//! This framing is a private profile of this crate family, negotiated
//! under `@sshpiper.dev` algorithm names. It is NOT wire compatible
//! with chacha20-poly1305@openssh.com (which encrypts the length with
//! a second cipher instance) or the RFC 5647 AES-GCM modes (which
//! derive the invocation IV from key exchange material).

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM, CHACHA20_POLY1305,
};
use sshpiper_platform::{PiperError, PiperResult};

/// Per-direction nonce: the packet sequence number in the last eight
/// nonce bytes.
struct Counter {
    value: u64,
}

impl Counter {
    fn new() -> Self {
        Self { value: 0 }
    }
}

impl NonceSequence for Counter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&self.value.to_be_bytes());
        self.value = self.value.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Packet cipher algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// chacha20-poly1305@sshpiper.dev
    ChaCha20Poly1305,
    /// aes128-gcm@sshpiper.dev
    Aes128Gcm,
    /// aes256-gcm@sshpiper.dev
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Returns the negotiated algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@sshpiper.dev",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@sshpiper.dev",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@sshpiper.dev",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 | CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Gcm => 16,
        }
    }

    /// Returns the authentication tag size in bytes.
    pub fn tag_size(&self) -> usize {
        16
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@sshpiper.dev" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@sshpiper.dev" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@sshpiper.dev" => Some(CipherAlgorithm::Aes256Gcm),
            _ => None,
        }
    }

    fn ring_algorithm(&self) -> &'static ring::aead::Algorithm {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
        }
    }
}

/// Sealing key for one outbound direction.
pub struct EncryptionKey {
    algorithm: CipherAlgorithm,
    key: SealingKey<Counter>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EncryptionKey {
    /// Creates a sealing key from derived key material.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> PiperResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(PiperError::Security(format!(
                "insufficient key material: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        let unbound = UnboundKey::new(
            algorithm.ring_algorithm(),
            &key_material[..algorithm.key_size()],
        )
        .map_err(|_| PiperError::Security(format!("failed to create {} key", algorithm.name())))?;

        Ok(Self {
            algorithm,
            key: SealingKey::new(unbound, Counter::new()),
        })
    }

    /// Encrypts a packet body in place, appending the tag. `aad` is
    /// authenticated but not encrypted; the transport passes the
    /// cleartext length word here.
    pub fn seal(&mut self, aad: &[u8], body: &mut Vec<u8>) -> PiperResult<()> {
        self.key
            .seal_in_place_append_tag(Aad::from(aad), body)
            .map_err(|_| PiperError::Security("packet encryption failed".to_string()))
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Opening key for one inbound direction.
pub struct DecryptionKey {
    algorithm: CipherAlgorithm,
    key: OpeningKey<Counter>,
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DecryptionKey {
    /// Creates an opening key from derived key material.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> PiperResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(PiperError::Security(format!(
                "insufficient key material: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        let unbound = UnboundKey::new(
            algorithm.ring_algorithm(),
            &key_material[..algorithm.key_size()],
        )
        .map_err(|_| PiperError::Security(format!("failed to create {} key", algorithm.name())))?;

        Ok(Self {
            algorithm,
            key: OpeningKey::new(unbound, Counter::new()),
        })
    }

    /// Decrypts `ciphertext || tag` in place, verifying the tag (which
    /// covers `aad`, the cleartext length word) and truncating it
    /// away.
    pub fn open(&mut self, aad: &[u8], body: &mut Vec<u8>) -> PiperResult<()> {
        let plaintext_len = self
            .key
            .open_in_place(Aad::from(aad), body)
            .map_err(|_| {
                PiperError::Security("packet decryption failed or tag mismatch".to_string())
            })?
            .len();
        body.truncate(plaintext_len);
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.name(), "chacha20-poly1305@sshpiper.dev");
        assert_eq!(chacha.key_size(), 32);
        assert_eq!(chacha.tag_size(), 16);

        assert_eq!(CipherAlgorithm::Aes128Gcm.key_size(), 16);
        assert_eq!(CipherAlgorithm::Aes256Gcm.key_size(), 32);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("chacha20-poly1305@sshpiper.dev"),
            Some(CipherAlgorithm::ChaCha20Poly1305)
        );
        assert_eq!(CipherAlgorithm::from_name("chacha20-poly1305@openssh.com"), None);
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_seal_open_round_trip() {
        for algorithm in [
            CipherAlgorithm::ChaCha20Poly1305,
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Gcm,
        ] {
            let key_material = vec![7u8; 32];
            let mut seal = EncryptionKey::new(algorithm, &key_material).unwrap();
            let mut open = DecryptionKey::new(algorithm, &key_material).unwrap();

            let aad = 24u32.to_be_bytes();
            let original = b"packet body".to_vec();
            let mut body = original.clone();
            seal.seal(&aad, &mut body).unwrap();
            assert_eq!(body.len(), original.len() + algorithm.tag_size());
            assert_ne!(&body[..original.len()], &original[..]);

            open.open(&aad, &mut body).unwrap();
            assert_eq!(body, original);
        }
    }

    #[test]
    fn test_sequence_numbers_must_match() {
        let key_material = vec![7u8; 32];
        let mut seal =
            EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();
        let mut open =
            DecryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();

        let mut first = b"first".to_vec();
        seal.seal(b"", &mut first).unwrap();
        let mut second = b"second".to_vec();
        seal.seal(b"", &mut second).unwrap();

        // Opening out of order must fail the tag check.
        let mut out_of_order = second.clone();
        assert!(open.open(b"", &mut out_of_order).is_err());
    }

    #[test]
    fn test_tamper_detected() {
        let key_material = vec![7u8; 32];
        let mut seal =
            EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();
        let mut open =
            DecryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();

        let mut body = b"payload".to_vec();
        seal.seal(b"", &mut body).unwrap();
        body[0] ^= 0xff;
        assert!(open.open(b"", &mut body).is_err());
    }

    #[test]
    fn test_aad_tamper_detected() {
        let key_material = vec![7u8; 32];
        let mut seal =
            EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();
        let mut open =
            DecryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap();

        // Sealed under one length word, opened under another: the tag
        // must not verify.
        let mut body = b"payload".to_vec();
        seal.seal(&16u32.to_be_bytes(), &mut body).unwrap();
        assert!(open.open(&32u32.to_be_bytes(), &mut body).is_err());
    }

    #[test]
    fn test_short_key_material_rejected() {
        let result = EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &[0u8; 16]);
        assert!(result.is_err());
    }
}
