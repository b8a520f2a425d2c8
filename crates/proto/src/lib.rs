//! # SshPiper Proto
//!
//! SSH protocol plumbing and the piper core.
//!
//! The crate is split in two layers:
//!
//! 1. [`ssh`] - the transport layer: binary packets, version exchange,
//!    curve25519 key exchange, AEAD packet ciphers, host keys,
//!    authentication messages, and client/server handshake drivers.
//! 2. [`piper`] - the authenticating reverse proxy built on top of it:
//!    terminate a downstream SSH session, select and authenticate to an
//!    upstream on the client's behalf, then pump decrypted packets
//!    between the two transports.
//!
//! # Example
//!
//! Both ends of the pipe must speak this crate's transport profile
//! (the private `@sshpiper.dev` packet ciphers); see
//! `examples/piper.rs` for a runnable end-to-end demo.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sshpiper_proto::piper::{PiperConfig, PiperConn, Upstream, ClientConfig, ClientAuthMethod};
//! use sshpiper_proto::ssh::hostkey::Ed25519HostKey;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = PiperConfig::new(vec![Arc::new(Ed25519HostKey::generate()?)]);
//! config.password_callback = Some(Arc::new(|_meta, password, _ctx| {
//!     Box::pin(async move {
//!         let conn = tokio::net::TcpStream::connect("upstream.internal:2022").await?;
//!         Ok(Upstream {
//!             conn: Box::new(conn),
//!             config: ClientConfig::insecure("root")
//!                 .with_auth(ClientAuthMethod::Password(
//!                     String::from_utf8_lossy(&password).into_owned(),
//!                 )),
//!         })
//!     })
//! }));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:2022").await?;
//! let config = Arc::new(config);
//! let (stream, addr) = listener.accept().await?;
//! let conn = PiperConn::new(Box::new(stream), Some(addr), config.clone()).await?;
//! conn.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod piper;
pub mod ssh;
