//! The SSH transport engine.
//!
//! [`Transport`] drives version exchange, curve25519 key exchange and
//! NEWKEYS over any byte stream, in either role, and then reads and
//! writes encrypted binary packets. [`Transport::into_split`] yields
//! the [`PacketReader`] / [`PacketWriter`] halves, each owning the
//! cipher state of its direction, so that a forwarding loop can own
//! one half per task.
//!
//! Post-handshake rekeying is not supported: a KEXINIT received after
//! NEWKEYS is a protocol error.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use sshpiper_platform::{PiperError, PiperResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
use crate::ssh::hostkey::{self, HostKey, HostKeyVerifier};
use crate::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
use crate::ssh::kex_dh::{compute_exchange_hash, derive_key, Curve25519Exchange};
use crate::ssh::message::MessageType;
use crate::ssh::packet;
use crate::ssh::version::{Version, MAX_VERSION_LENGTH};
use crate::ssh::wire;

/// The byte streams the transport runs over: TCP sockets in
/// production, in-memory duplex pipes in tests.
pub trait SshStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SshStream for T {}

/// Reading half of a handshaked transport. Owns the inbound cipher.
pub struct PacketReader {
    stream: ReadHalf<Box<dyn SshStream>>,
    cipher: Option<DecryptionKey>,
}

impl PacketReader {
    /// Reads one packet and returns its cleartext payload (message
    /// code byte followed by the body).
    pub async fn read_packet(&mut self) -> PiperResult<Vec<u8>> {
        let mut length_bytes = [0u8; 4];
        self.stream.read_exact(&mut length_bytes).await?;
        let packet_length = u32::from_be_bytes(length_bytes) as usize;
        packet::check_packet_length(packet_length)?;

        let tag_len = self
            .cipher
            .as_ref()
            .map_or(0, |c| c.algorithm().tag_size());
        let mut body = vec![0u8; packet_length + tag_len];
        self.stream.read_exact(&mut body).await?;

        // The cleartext length word is associated data; a tampered
        // length fails the tag check here.
        if let Some(cipher) = &mut self.cipher {
            cipher.open(&length_bytes, &mut body)?;
        }

        packet::unframe_body(&body)
    }
}

/// Writing half of a handshaked transport. Owns the outbound cipher.
pub struct PacketWriter {
    stream: WriteHalf<Box<dyn SshStream>>,
    cipher: Option<EncryptionKey>,
}

impl PacketWriter {
    /// Frames, encrypts and writes one packet payload. The cleartext
    /// length word is bound into the AEAD tag as associated data.
    pub async fn write_packet(&mut self, payload: &[u8]) -> PiperResult<()> {
        let mut body = packet::frame_payload(payload)?;
        let length_bytes = (body.len() as u32).to_be_bytes();

        if let Some(cipher) = &mut self.cipher {
            cipher.seal(&length_bytes, &mut body)?;
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_slice(&length_bytes);
        frame.put_slice(&body);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Shuts down the underlying write side.
    pub async fn shutdown(&mut self) -> PiperResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A handshaked SSH transport: encrypted packet IO plus the session
/// identity established by the key exchange.
pub struct Transport {
    reader: PacketReader,
    writer: PacketWriter,
    session_id: Vec<u8>,
    local_version: String,
    peer_version: String,
}

impl Transport {
    /// Performs the client side of the handshake: version exchange,
    /// curve25519 key exchange (verifying the server's host key with
    /// `verifier`), and NEWKEYS.
    pub async fn client_handshake(
        stream: Box<dyn SshStream>,
        software: &str,
        verifier: &HostKeyVerifier,
    ) -> PiperResult<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader {
            stream: read_half,
            cipher: None,
        };
        let mut writer = PacketWriter {
            stream: write_half,
            cipher: None,
        };

        let local_version = Version::new(software, None).to_string();
        write_version_line(&mut writer.stream, &local_version).await?;
        let peer_version = read_version_line(&mut reader.stream).await?;
        Version::parse(&peer_version)?;
        debug!(peer = %peer_version, "client version exchange complete");

        // KEXINIT exchange. Client preference wins negotiation.
        let our_kexinit = KexInit::new(vec!["ssh-ed25519".to_string()]);
        let our_kexinit_bytes = our_kexinit.to_bytes();
        writer.write_packet(&our_kexinit_bytes).await?;
        let peer_kexinit_bytes = read_nontrivial(&mut reader).await?;
        let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;

        let negotiated = Negotiated::negotiate(&our_kexinit, &peer_kexinit)?;

        // ECDH: send our ephemeral key, receive host key + server
        // ephemeral key + signature over the exchange hash.
        let exchange = Curve25519Exchange::new()?;
        let our_public = *exchange.public_key();

        let mut init = BytesMut::new();
        init.put_u8(MessageType::KexEcdhInit as u8);
        wire::put_bytes(&mut init, &our_public);
        writer.write_packet(&init).await?;

        let reply = read_nontrivial(&mut reader).await?;
        let mut offset = 0;
        if wire::take_u8(&reply, &mut offset)? != MessageType::KexEcdhReply as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_KEX_ECDH_REPLY".to_string(),
            ));
        }
        let host_key_blob = wire::take_bytes(&reply, &mut offset)?;
        let server_public_bytes = wire::take_bytes(&reply, &mut offset)?;
        let signature_blob = wire::take_bytes(&reply, &mut offset)?;

        let server_public: [u8; 32] = server_public_bytes.as_slice().try_into().map_err(|_| {
            PiperError::Protocol(format!(
                "curve25519 public key must be 32 bytes, got {}",
                server_public_bytes.len()
            ))
        })?;

        let shared_secret = exchange.compute_shared_secret(&server_public)?;
        let exchange_hash = compute_exchange_hash(
            &local_version,
            &peer_version,
            &our_kexinit_bytes,
            &peer_kexinit_bytes,
            &host_key_blob,
            &our_public,
            &server_public,
            &shared_secret,
        );

        if !hostkey::verify_signature_blob(&host_key_blob, &exchange_hash, &signature_blob)? {
            return Err(PiperError::Security(
                "host key signature verification failed".to_string(),
            ));
        }
        verifier(&host_key_blob)?;

        // NEWKEYS, then switch on the ciphers. The exchange hash of the
        // first (and only) key exchange is the session identifier.
        writer.write_packet(&NewKeys.to_bytes()).await?;
        let newkeys = read_nontrivial(&mut reader).await?;
        NewKeys::from_bytes(&newkeys)?;

        let session_id = exchange_hash.clone();
        writer.cipher = Some(EncryptionKey::new(
            negotiated.cipher_c2s,
            &derive_key(
                &shared_secret,
                &exchange_hash,
                &session_id,
                b'C',
                negotiated.cipher_c2s.key_size(),
            ),
        )?);
        reader.cipher = Some(DecryptionKey::new(
            negotiated.cipher_s2c,
            &derive_key(
                &shared_secret,
                &exchange_hash,
                &session_id,
                b'D',
                negotiated.cipher_s2c.key_size(),
            ),
        )?);

        debug!(cipher = negotiated.cipher_c2s.name(), "client handshake complete");

        Ok(Self {
            reader,
            writer,
            session_id,
            local_version,
            peer_version,
        })
    }

    /// Performs the server side of the handshake, presenting the first
    /// host key whose algorithm the client accepts.
    pub async fn server_handshake(
        stream: Box<dyn SshStream>,
        software: &str,
        host_keys: &[Arc<dyn HostKey>],
    ) -> PiperResult<Self> {
        if host_keys.is_empty() {
            return Err(PiperError::Config("no host keys configured".to_string()));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader {
            stream: read_half,
            cipher: None,
        };
        let mut writer = PacketWriter {
            stream: write_half,
            cipher: None,
        };

        let local_version = Version::new(software, None).to_string();
        write_version_line(&mut writer.stream, &local_version).await?;
        let peer_version = read_version_line(&mut reader.stream).await?;
        Version::parse(&peer_version)?;
        debug!(peer = %peer_version, "server version exchange complete");

        let mut host_key_algorithms: Vec<String> = Vec::new();
        for key in host_keys {
            let name = key.algorithm_name().to_string();
            if !host_key_algorithms.contains(&name) {
                host_key_algorithms.push(name);
            }
        }

        let our_kexinit = KexInit::new(host_key_algorithms);
        let our_kexinit_bytes = our_kexinit.to_bytes();
        writer.write_packet(&our_kexinit_bytes).await?;
        let peer_kexinit_bytes = read_nontrivial(&mut reader).await?;
        let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;

        let negotiated = Negotiated::negotiate(&peer_kexinit, &our_kexinit)?;
        let host_key = host_keys
            .iter()
            .find(|key| key.algorithm_name() == negotiated.host_key_algorithm)
            .ok_or_else(|| {
                PiperError::Protocol(format!(
                    "no host key for negotiated algorithm {}",
                    negotiated.host_key_algorithm
                ))
            })?;

        let init = read_nontrivial(&mut reader).await?;
        let mut offset = 0;
        if wire::take_u8(&init, &mut offset)? != MessageType::KexEcdhInit as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_KEX_ECDH_INIT".to_string(),
            ));
        }
        let client_public_bytes = wire::take_bytes(&init, &mut offset)?;
        let client_public: [u8; 32] = client_public_bytes.as_slice().try_into().map_err(|_| {
            PiperError::Protocol(format!(
                "curve25519 public key must be 32 bytes, got {}",
                client_public_bytes.len()
            ))
        })?;

        let exchange = Curve25519Exchange::new()?;
        let our_public = *exchange.public_key();
        let shared_secret = exchange.compute_shared_secret(&client_public)?;

        let host_key_blob = host_key.public_key_bytes();
        let exchange_hash = compute_exchange_hash(
            &peer_version,
            &local_version,
            &peer_kexinit_bytes,
            &our_kexinit_bytes,
            &host_key_blob,
            &client_public,
            &our_public,
            &shared_secret,
        );
        let signature_blob = host_key.sign(&exchange_hash)?;

        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::KexEcdhReply as u8);
        wire::put_bytes(&mut reply, &host_key_blob);
        wire::put_bytes(&mut reply, &our_public);
        wire::put_bytes(&mut reply, &signature_blob);
        writer.write_packet(&reply).await?;

        let newkeys = read_nontrivial(&mut reader).await?;
        NewKeys::from_bytes(&newkeys)?;
        writer.write_packet(&NewKeys.to_bytes()).await?;

        // The server encrypts server-to-client ('D') and decrypts
        // client-to-server ('C').
        let session_id = exchange_hash.clone();
        writer.cipher = Some(EncryptionKey::new(
            negotiated.cipher_s2c,
            &derive_key(
                &shared_secret,
                &exchange_hash,
                &session_id,
                b'D',
                negotiated.cipher_s2c.key_size(),
            ),
        )?);
        reader.cipher = Some(DecryptionKey::new(
            negotiated.cipher_c2s,
            &derive_key(
                &shared_secret,
                &exchange_hash,
                &session_id,
                b'C',
                negotiated.cipher_c2s.key_size(),
            ),
        )?);

        debug!(cipher = negotiated.cipher_s2c.name(), "server handshake complete");

        Ok(Self {
            reader,
            writer,
            session_id,
            local_version,
            peer_version,
        })
    }

    /// Reads the next substantive packet payload, skipping IGNORE and
    /// DEBUG and failing on DISCONNECT.
    pub async fn read_packet(&mut self) -> PiperResult<Vec<u8>> {
        loop {
            let payload = self.reader.read_packet().await?;
            match payload.first().copied() {
                Some(code)
                    if code == MessageType::Ignore as u8 || code == MessageType::Debug as u8 =>
                {
                    trace!(code, "skipping trivial message");
                }
                Some(code) if code == MessageType::Disconnect as u8 => {
                    return Err(parse_disconnect(&payload));
                }
                _ => return Ok(payload),
            }
        }
    }

    /// Writes one packet payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> PiperResult<()> {
        self.writer.write_packet(payload).await
    }

    /// Returns the session identifier (the exchange hash).
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Returns the peer's identification string.
    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// Returns our identification string.
    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    /// Splits into the per-direction packet endpoints.
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        (self.reader, self.writer)
    }

    /// Shuts down the write side.
    pub async fn shutdown(&mut self) -> PiperResult<()> {
        self.writer.shutdown().await
    }
}

/// Algorithms settled by a KEXINIT exchange. Arguments follow the
/// negotiation rule: the client's preference list comes first.
struct Negotiated {
    host_key_algorithm: String,
    cipher_c2s: CipherAlgorithm,
    cipher_s2c: CipherAlgorithm,
}

impl Negotiated {
    fn negotiate(client: &KexInit, server: &KexInit) -> PiperResult<Self> {
        let kex = negotiate_algorithm(client.kex_algorithms(), server.kex_algorithms())?;
        if kex != "curve25519-sha256" && kex != "curve25519-sha256@libssh.org" {
            return Err(PiperError::Protocol(format!(
                "unsupported key exchange algorithm: {}",
                kex
            )));
        }

        let host_key_algorithm = negotiate_algorithm(
            client.server_host_key_algorithms(),
            server.server_host_key_algorithms(),
        )?;

        let cipher_c2s = negotiate_cipher(
            client.encryption_client_to_server(),
            server.encryption_client_to_server(),
        )?;
        let cipher_s2c = negotiate_cipher(
            client.encryption_server_to_client(),
            server.encryption_server_to_client(),
        )?;

        Ok(Self {
            host_key_algorithm,
            cipher_c2s,
            cipher_s2c,
        })
    }
}

fn negotiate_cipher(client: &[String], server: &[String]) -> PiperResult<CipherAlgorithm> {
    let name = negotiate_algorithm(client, server)?;
    CipherAlgorithm::from_name(&name)
        .ok_or_else(|| PiperError::Protocol(format!("unsupported cipher: {}", name)))
}

fn parse_disconnect(payload: &[u8]) -> PiperError {
    let mut offset = 1;
    let _reason = wire::take_u32(payload, &mut offset).unwrap_or(0);
    let description = wire::take_string(payload, &mut offset).unwrap_or_default();
    PiperError::Protocol(format!("peer disconnected: {}", description))
}

/// Reads the next packet, skipping IGNORE/DEBUG. Used during the
/// handshake where only substantive messages are expected.
async fn read_nontrivial(reader: &mut PacketReader) -> PiperResult<Vec<u8>> {
    loop {
        let payload = reader.read_packet().await?;
        match payload.first().copied() {
            Some(code)
                if code == MessageType::Ignore as u8 || code == MessageType::Debug as u8 => {}
            Some(code) if code == MessageType::Disconnect as u8 => {
                return Err(parse_disconnect(&payload));
            }
            _ => return Ok(payload),
        }
    }
}

async fn write_version_line(
    stream: &mut WriteHalf<Box<dyn SshStream>>,
    version: &str,
) -> PiperResult<()> {
    stream.write_all(format!("{}\r\n", version).as_bytes()).await?;
    Ok(())
}

async fn read_version_line(stream: &mut ReadHalf<Box<dyn SshStream>>) -> PiperResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_VERSION_LENGTH + 1 {
            return Err(PiperError::Protocol(
                "identification line too long".to_string(),
            ));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| PiperError::Protocol("identification line is not UTF-8".to_string()))
}
