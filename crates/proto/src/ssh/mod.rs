//! SSH protocol implementation (RFC 4251-4254, RFC 4256).
//!
//! The layering mirrors the protocol:
//!
//! 1. **Wire primitives** ([`wire`]) - strings, name-lists, mpints
//! 2. **Packet layer** ([`packet`]) - binary packet framing (RFC 4253 §6)
//! 3. **Transport** ([`transport`]) - version exchange, curve25519 key
//!    exchange, AEAD packet ciphers ([`crypto`], [`kex`], [`kex_dh`],
//!    [`hostkey`])
//! 4. **Authentication** ([`auth`], [`client`], [`server`]) - RFC 4252
//!    messages plus client- and server-side auth drivers
//! 5. **Connection messages** ([`channel`]) - the RFC 4254 types that
//!    per-packet hooks and tests inspect
//!
//! The algorithm surface is deliberately modern-only: curve25519
//! key exchange, ed25519 host keys, and AEAD packet ciphers.

pub mod auth;
pub mod channel;
pub mod client;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod server;
pub mod transport;
pub mod version;
pub mod wire;

pub use client::{ClientAuthMethod, ClientConfig, KeyboardInteractiveResponder};
pub use hostkey::{Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyVerifier};
pub use message::MessageType;
pub use server::{KeyboardInteractiveAuth, ServerConfig, ServerConn};
pub use transport::{PacketReader, PacketWriter, SshStream, Transport};
