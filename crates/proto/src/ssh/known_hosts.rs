//! OpenSSH known_hosts entries (single-line form).
//!
//! Each line has the format
//!
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! where hostnames may be plain (`example.com`, `[example.com]:2222`),
//! wildcarded (`*.example.com`), hashed (`|1|salt|hash`), comma
//! separated and `!`-negated. [`verifier_from_line`] turns one such
//! line into a [`HostKeyVerifier`] that accepts exactly the key the
//! line names.

use base64::Engine;
use sshpiper_platform::{PiperError, PiperResult};
use std::sync::Arc;

use crate::ssh::hostkey::HostKeyVerifier;
use crate::ssh::wire;

/// A parsed known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
}

impl KnownHost {
    /// Returns the hostname pattern field.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key algorithm name.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the public key blob (SSH wire format).
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Parses a single known_hosts line.
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Protocol`] for comments, blank lines,
    /// missing fields, undecodable keys, or a key blob whose embedded
    /// algorithm disagrees with the keytype field.
    pub fn parse_line(line: &str) -> PiperResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(PiperError::Protocol(
                "empty or comment known_hosts line".to_string(),
            ));
        }

        let mut parts = line.split_whitespace();
        let (hostname_pattern, key_type, base64_key) =
            match (parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(t), Some(k)) => (h, t, k),
                _ => {
                    return Err(PiperError::Protocol(
                        "known_hosts line needs at least 3 fields".to_string(),
                    ))
                }
            };
        let comment = parts.collect::<Vec<_>>().join(" ");

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(base64_key)
            .map_err(|e| PiperError::Protocol(format!("invalid base64 key: {}", e)))?;

        // The blob embeds its own algorithm name; it must agree with
        // the keytype column.
        let mut offset = 0;
        let embedded = wire::take_string(&key_data, &mut offset)?;
        if embedded != key_type {
            return Err(PiperError::Protocol(format!(
                "keytype field {:?} disagrees with key blob {:?}",
                key_type, embedded
            )));
        }

        Ok(Self {
            hostname_pattern: hostname_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data,
            comment,
        })
    }

    /// Whether this entry applies to `hostname:port`.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let full_host = if port == 22 {
            hostname.to_string()
        } else {
            format!("[{}]:{}", hostname, port)
        };

        let mut matched = false;
        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
            } else if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }
        matched
    }
}

fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return matches_hashed(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(
            &pattern.chars().collect::<Vec<_>>(),
            &hostname.chars().collect::<Vec<_>>(),
            0,
            0,
        );
    }
    pattern == hostname
}

/// Hashed hostname check: `|1|salt|hash` with
/// hash = Base64(HMAC-SHA1(salt, hostname)).
fn matches_hashed(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let engine = &base64::engine::general_purpose::STANDARD;
    let (salt, expected) = match (engine.decode(parts[2]), engine.decode(parts[3])) {
        (Ok(salt), Ok(expected)) => (salt, expected),
        _ => return false,
    };

    use hmac::{Hmac, Mac};
    let mut hmac = match Hmac::<sha1::Sha1>::new_from_slice(&salt) {
        Ok(hmac) => hmac,
        Err(_) => return false,
    };
    hmac.update(hostname.as_bytes());
    let computed = hmac.finalize().into_bytes();

    use subtle::ConstantTimeEq;
    computed.ct_eq(&expected[..]).into()
}

fn wildcard_match(pattern: &[char], text: &[char], p: usize, t: usize) -> bool {
    if p == pattern.len() {
        return t == text.len();
    }
    match pattern[p] {
        '*' => {
            wildcard_match(pattern, text, p + 1, t)
                || (t < text.len() && wildcard_match(pattern, text, p, t + 1))
        }
        '?' => t < text.len() && wildcard_match(pattern, text, p + 1, t + 1),
        c => t < text.len() && text[t] == c && wildcard_match(pattern, text, p + 1, t + 1),
    }
}

/// Builds a host-key verifier from a single known_hosts line.
///
/// The verifier accepts exactly the key the line names and rejects
/// everything else with an error mentioning `source` (the line's
/// provenance, e.g. a file name or database row).
pub fn verifier_from_line(line: &str, source: &str) -> PiperResult<HostKeyVerifier> {
    let entry = KnownHost::parse_line(line)
        .map_err(|e| PiperError::Config(format!("bad known_hosts line from {}: {}", source, e)))?;
    let source = source.to_string();

    Ok(Arc::new(move |blob: &[u8]| {
        if blob == entry.key_data() {
            Ok(())
        } else {
            Err(PiperError::UpstreamHostKey(format!(
                "host key does not match {} entry from {}",
                entry.key_type(),
                source
            )))
        }
    }))
}
