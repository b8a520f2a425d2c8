//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! Covers the SSH_MSG_KEXINIT / SSH_MSG_NEWKEYS messages and the
//! first-match algorithm negotiation rule. The actual curve25519
//! exchange lives in [`crate::ssh::kex_dh`].

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sshpiper_platform::{PiperError, PiperResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
///
/// Algorithm lists are ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with this crate's algorithm preferences:
    /// curve25519-sha256 key exchange, ed25519 host keys and the
    /// private `@sshpiper.dev` AEAD packet ciphers. MAC lists are
    /// advertised for non-AEAD interoperability but the AEAD ciphers
    /// ignore them.
    pub fn new(host_key_algorithms: Vec<String>) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = vec![
            "chacha20-poly1305@sshpiper.dev".to_string(),
            "aes256-gcm@sshpiper.dev".to_string(),
            "aes128-gcm@sshpiper.dev".to_string(),
        ];

        Self {
            cookie,
            kex_algorithms: vec![
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
            ],
            server_host_key_algorithms: host_key_algorithms,
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: vec!["hmac-sha2-256".to_string()],
            mac_server_to_client: vec!["hmac-sha2-256".to_string()],
            compression_client_to_server: vec!["none".to_string()],
            compression_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the key exchange algorithm list.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the host key algorithm list.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server cipher list.
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption_client_to_server
    }

    /// Returns the server-to-client cipher list.
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption_server_to_client
    }

    /// Serializes to message bytes (without packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        wire::put_name_list(&mut buf, &self.kex_algorithms);
        wire::put_name_list(&mut buf, &self.server_host_key_algorithms);
        wire::put_name_list(&mut buf, &self.encryption_client_to_server);
        wire::put_name_list(&mut buf, &self.encryption_server_to_client);
        wire::put_name_list(&mut buf, &self.mac_client_to_server);
        wire::put_name_list(&mut buf, &self.mac_server_to_client);
        wire::put_name_list(&mut buf, &self.compression_client_to_server);
        wire::put_name_list(&mut buf, &self.compression_server_to_client);
        wire::put_name_list(&mut buf, &self.languages_client_to_server);
        wire::put_name_list(&mut buf, &self.languages_server_to_client);

        wire::put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0); // reserved

        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        if data.first() != Some(&(MessageType::KexInit as u8)) {
            return Err(PiperError::Protocol("expected SSH_MSG_KEXINIT".to_string()));
        }
        if data.len() < 17 {
            return Err(PiperError::Protocol(format!(
                "KEXINIT too short: {} bytes",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);
        let mut offset = 17;

        let kex_algorithms = wire::take_name_list(data, &mut offset)?;
        let server_host_key_algorithms = wire::take_name_list(data, &mut offset)?;
        let encryption_client_to_server = wire::take_name_list(data, &mut offset)?;
        let encryption_server_to_client = wire::take_name_list(data, &mut offset)?;
        let mac_client_to_server = wire::take_name_list(data, &mut offset)?;
        let mac_server_to_client = wire::take_name_list(data, &mut offset)?;
        let compression_client_to_server = wire::take_name_list(data, &mut offset)?;
        let compression_server_to_client = wire::take_name_list(data, &mut offset)?;
        let languages_client_to_server = wire::take_name_list(data, &mut offset)?;
        let languages_server_to_client = wire::take_name_list(data, &mut offset)?;
        let first_kex_packet_follows = wire::take_bool(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS: a single message byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        if data.first() != Some(&(MessageType::NewKeys as u8)) {
            return Err(PiperError::Protocol("expected SSH_MSG_NEWKEYS".to_string()));
        }
        Ok(Self)
    }
}

/// First-match algorithm negotiation (RFC 4253 Section 7.1): the first
/// algorithm on the client's list that the server also supports wins.
pub fn negotiate_algorithm(client: &[String], server: &[String]) -> PiperResult<String> {
    client
        .iter()
        .find(|alg| server.contains(alg))
        .cloned()
        .ok_or_else(|| {
            PiperError::Protocol(format!(
                "no common algorithm: client offers {:?}, server offers {:?}",
                client, server
            ))
        })
}
