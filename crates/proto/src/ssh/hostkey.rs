//! Host key signers and verification policies.
//!
//! [`HostKey`] is the signer abstraction used in both roles: the piper
//! presents host keys to the downstream, and client-side public-key
//! authentication signs with the same trait. Ed25519 is the supported
//! algorithm.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use sshpiper_platform::{PiperError, PiperResult};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::ssh::wire;

/// Host key algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 (RFC 8709)
    SshEd25519,
}

impl HostKeyAlgorithm {
    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            _ => None,
        }
    }
}

/// A key that can identify one side of an SSH connection.
pub trait HostKey: Send + Sync {
    /// Returns the algorithm identifier.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Returns the public key in SSH wire format
    /// (string algorithm name, then algorithm-specific fields).
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Signs data, returning the signature in SSH wire format
    /// (string algorithm name, string raw signature).
    fn sign(&self, data: &[u8]) -> PiperResult<Vec<u8>>;

    /// Returns the algorithm name.
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 key pair (ssh-ed25519).
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a fresh key pair.
    pub fn generate() -> PiperResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; SECRET_KEY_LENGTH] = rand::Rng::gen(&mut csprng);
        Ok(Self::from_seed(secret_bytes))
    }

    /// Builds a key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Builds a key pair from raw secret key bytes.
    pub fn from_bytes(secret_bytes: &[u8]) -> PiperResult<Self> {
        let seed: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            PiperError::Security("ed25519 secret key must be 32 bytes".to_string())
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Returns the secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Verifies a raw 64-byte signature made by the 32-byte public key.
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> PiperResult<bool> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            PiperError::Security("ed25519 public key must be 32 bytes".to_string())
        })?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            PiperError::Security("ed25519 signature must be 64 bytes".to_string())
        })?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| PiperError::Security(format!("invalid ed25519 public key: {}", e)))?;

        Ok(verifying_key
            .verify(data, &Signature::from_bytes(&sig_bytes))
            .is_ok())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        wire::put_string(&mut buf, "ssh-ed25519");
        wire::put_bytes(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> PiperResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut buf = bytes::BytesMut::new();
        wire::put_string(&mut buf, "ssh-ed25519");
        wire::put_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verifies an SSH wire-format signature blob over `data`, given the
/// signer's wire-format public key blob.
pub fn verify_signature_blob(
    public_key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> PiperResult<bool> {
    let mut offset = 0;
    let key_alg = wire::take_string(public_key_blob, &mut offset)?;
    let raw_key = wire::take_bytes(public_key_blob, &mut offset)?;

    let mut offset = 0;
    let sig_alg = wire::take_string(signature_blob, &mut offset)?;
    let raw_sig = wire::take_bytes(signature_blob, &mut offset)?;

    if key_alg != sig_alg {
        return Ok(false);
    }

    match HostKeyAlgorithm::from_name(&key_alg) {
        Some(HostKeyAlgorithm::SshEd25519) => Ed25519HostKey::verify(&raw_key, data, &raw_sig),
        None => Err(PiperError::Security(format!(
            "unsupported public key algorithm: {}",
            key_alg
        ))),
    }
}

/// Policy deciding whether a peer's host key (wire-format blob) is
/// acceptable. Shared by all sessions, so it must be thread safe.
pub type HostKeyVerifier = Arc<dyn Fn(&[u8]) -> PiperResult<()> + Send + Sync>;

/// A verifier that accepts any host key. For tests and lab setups only.
pub fn insecure_ignore_host_key() -> HostKeyVerifier {
    Arc::new(|_blob| Ok(()))
}

/// A verifier that accepts exactly the given wire-format key blobs.
pub fn fixed_host_keys(accepted: Vec<Vec<u8>>) -> HostKeyVerifier {
    Arc::new(move |blob| {
        if accepted.iter().any(|key| key == blob) {
            Ok(())
        } else {
            Err(PiperError::UpstreamHostKey(
                "host key not in accepted set".to_string(),
            ))
        }
    })
}
