//! A self-contained password-passthrough piper demo.
//!
//! Starts three parties in one process, talking over local TCP: an
//! upstream echo server speaking this crate's transport profile, a
//! piper that authenticates downstream clients upstream with the
//! password they presented, and a demo client that connects through
//! the piper and echoes a message.
//!
//! The transport negotiates this crate's private `@sshpiper.dev`
//! packet ciphers, so both ends of the pipe must be built on this
//! crate; stock OpenSSH peers will not negotiate with it.
//!
//! ```text
//! cargo run --example piper
//! ```

use std::sync::Arc;

use sshpiper_platform::PiperResult;
use sshpiper_proto::piper::{ClientAuthMethod, ClientConfig, PiperConfig, PiperConn, Upstream};
use sshpiper_proto::ssh::channel::{ChannelData, ChannelOpen, ChannelOpenConfirmation};
use sshpiper_proto::ssh::client;
use sshpiper_proto::ssh::hostkey::Ed25519HostKey;
use sshpiper_proto::ssh::message::MessageType;
use sshpiper_proto::ssh::server::{ServerConfig, ServerConn};
use sshpiper_proto::ssh::transport::Transport;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Upstream: accepts user "demo" with password "secret", then
    // echoes session channel data.
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let upstream_addr = upstream_listener.local_addr()?;
    tokio::spawn(async move {
        let mut server_config = ServerConfig::new(Arc::new(Ed25519HostKey::generate()?));
        server_config.password_callback =
            Some(Arc::new(|user, password| user == "demo" && password == b"secret"));

        let (stream, _) = upstream_listener.accept().await?;
        let conn = ServerConn::accept(Box::new(stream), &server_config).await?;
        info!(user = conn.username(), "upstream authenticated");
        echo_session(conn.into_transport()).await
    });

    // Piper: terminates the downstream session and replays the
    // presented password against the upstream.
    let mut config = PiperConfig::new(vec![Arc::new(Ed25519HostKey::generate()?)]);
    config.password_callback = Some(Arc::new(move |meta, password, _ctx| {
        Box::pin(async move {
            info!(user = meta.user(), upstream = %upstream_addr, "dialling upstream");
            let conn = tokio::net::TcpStream::connect(upstream_addr).await?;
            Ok(Upstream {
                conn: Box::new(conn),
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::Password(
                    String::from_utf8_lossy(&password).into_owned(),
                )),
            })
        })
    }));
    let config = Arc::new(config);

    let piper_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let piper_addr = piper_listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, addr) = piper_listener.accept().await?;
        let conn = PiperConn::new(Box::new(stream), Some(addr), config).await?;
        info!(
            downstream = conn.downstream_conn_meta().user(),
            upstream = conn.upstream_conn_meta().user(),
            "session piped"
        );
        conn.wait().await
    });

    // Demo client: connect through the piper and echo a message.
    let stream = tokio::net::TcpStream::connect(piper_addr).await?;
    let client_config = ClientConfig::insecure("demo")
        .with_auth(ClientAuthMethod::Password("secret".to_string()));
    let mut transport = Transport::client_handshake(
        Box::new(stream),
        &client_config.version,
        &client_config.host_key_verifier,
    )
    .await?;
    let mut banners = Vec::new();
    client::authenticate(&mut transport, &client_config, &mut banners).await?;
    info!(addr = %piper_addr, "authenticated through the piper");

    transport
        .write_packet(&ChannelOpen::new("session", 1).to_bytes())
        .await?;
    let confirmation = loop {
        let payload = transport.read_packet().await?;
        if payload.first() == Some(&(MessageType::ChannelOpenConfirmation as u8)) {
            break ChannelOpenConfirmation::from_bytes(&payload)?;
        }
    };

    transport
        .write_packet(
            &ChannelData::new(confirmation.sender_channel(), b"hello through the pipe".to_vec())
                .to_bytes(),
        )
        .await?;
    let echoed = loop {
        let payload = transport.read_packet().await?;
        if payload.first() == Some(&(MessageType::ChannelData as u8)) {
            break ChannelData::from_bytes(&payload)?;
        }
    };

    info!(echoed = %String::from_utf8_lossy(echoed.data()), "round trip complete");
    Ok(())
}

/// Minimal session-channel echo loop for the upstream side.
async fn echo_session(mut transport: Transport) -> PiperResult<()> {
    let mut peer_channel = 0u32;
    loop {
        let payload = match transport.read_packet().await {
            Ok(payload) => payload,
            Err(_) => return Ok(()),
        };
        match payload.first().copied() {
            Some(code) if code == MessageType::ChannelOpen as u8 => {
                let open = ChannelOpen::from_bytes(&payload)?;
                peer_channel = open.sender_channel();
                transport
                    .write_packet(&ChannelOpenConfirmation::new(peer_channel, 0).to_bytes())
                    .await?;
            }
            Some(code) if code == MessageType::ChannelData as u8 => {
                let data = ChannelData::from_bytes(&payload)?;
                transport
                    .write_packet(&ChannelData::new(peer_channel, data.data().to_vec()).to_bytes())
                    .await?;
            }
            _ => {}
        }
    }
}
