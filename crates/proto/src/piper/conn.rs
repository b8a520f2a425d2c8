//! The piped connection and its packet pump.

use std::net::SocketAddr;
use std::sync::Arc;

use sshpiper_platform::{PiperError, PiperResult};
use tracing::{debug, trace};

use crate::piper::{auth_bridge, ConnMetadata, PiperConfig};
use crate::ssh::auth::AuthSuccess;
use crate::ssh::transport::{PacketReader, PacketWriter, SshStream, Transport};

/// Transforms one packet payload crossing the pipe. The returned bytes
/// must themselves be a well-formed payload (message code first). An
/// error tears the session down.
pub type PacketHook = Arc<dyn Fn(Vec<u8>) -> PiperResult<Vec<u8>> + Send + Sync>;

/// A fully established piped session: downstream handshaked and
/// authenticated, upstream handshaked and authenticated, packets not
/// yet flowing.
///
/// Once this exists no further auth callbacks fire for the session.
/// Call [`wait`](Self::wait) (or
/// [`wait_with_hooks`](Self::wait_with_hooks)) to pump packets until
/// either side closes; both endpoints are closed by the time it
/// returns.
pub struct PiperConn {
    downstream: Transport,
    upstream: Transport,
    downstream_meta: ConnMetadata,
    upstream_meta: ConnMetadata,
}

impl PiperConn {
    /// Establishes a piped session on an inbound downstream stream:
    /// server handshake, bridged authentication (which dials and
    /// authenticates the upstream via the configured callbacks), and
    /// the final USERAUTH_SUCCESS to the downstream.
    ///
    /// On any failure both the downstream stream and any upstream
    /// stream obtained along the way are closed.
    pub async fn new(
        stream: Box<dyn SshStream>,
        remote_addr: Option<SocketAddr>,
        config: Arc<PiperConfig>,
    ) -> PiperResult<Self> {
        config.validate()?;

        let mut downstream =
            Transport::server_handshake(stream, &config.server_version, &config.host_keys).await?;

        let mut downstream_meta = ConnMetadata {
            user: String::new(),
            remote_addr,
            session_id: downstream.session_id().to_vec(),
            version: downstream.peer_version().to_string(),
        };

        let accepted = auth_bridge::run(&mut downstream, &mut downstream_meta, &config).await?;

        // The downstream learns of success only after the upstream is
        // fully authenticated.
        downstream.write_packet(&AuthSuccess.to_bytes()).await?;

        let upstream_meta = ConnMetadata {
            user: accepted.user,
            remote_addr: None,
            session_id: accepted.transport.session_id().to_vec(),
            version: accepted.transport.peer_version().to_string(),
        };

        debug!(
            downstream_user = %downstream_meta.user,
            upstream_user = %upstream_meta.user,
            "piped session established"
        );

        Ok(Self {
            downstream,
            upstream: accepted.transport,
            downstream_meta,
            upstream_meta,
        })
    }

    /// Metadata of the downstream side.
    pub fn downstream_conn_meta(&self) -> &ConnMetadata {
        &self.downstream_meta
    }

    /// Metadata of the upstream side.
    pub fn upstream_conn_meta(&self) -> &ConnMetadata {
        &self.upstream_meta
    }

    /// Pumps packets in both directions until either side closes, then
    /// closes the other side and returns. Clean EOF is not an error.
    pub async fn wait(self) -> PiperResult<()> {
        self.wait_with_hooks(None, None).await
    }

    /// Like [`wait`](Self::wait), with a transform applied to every
    /// packet crossing in the given direction. The first terminal
    /// error wins; the error induced on the other direction by
    /// shutdown is suppressed.
    pub async fn wait_with_hooks(
        self,
        upstream_to_downstream: Option<PacketHook>,
        downstream_to_upstream: Option<PacketHook>,
    ) -> PiperResult<()> {
        let (downstream_reader, downstream_writer) = self.downstream.into_split();
        let (upstream_reader, upstream_writer) = self.upstream.into_split();

        let d2u = pump(downstream_reader, upstream_writer, downstream_to_upstream);
        let u2d = pump(upstream_reader, downstream_writer, upstream_to_downstream);
        tokio::pin!(d2u);
        tokio::pin!(u2d);

        // Both transports' halves are spread across the two futures,
        // so returning drops every half and closes both streams.
        let result = tokio::select! {
            result = &mut d2u => result,
            result = &mut u2d => result,
        };
        debug!("packet pump finished");
        result
    }

    /// Closes both endpoints without pumping.
    pub async fn close(self) -> PiperResult<()> {
        let (_, mut downstream_writer) = self.downstream.into_split();
        let (_, mut upstream_writer) = self.upstream.into_split();
        let _ = downstream_writer.shutdown().await;
        let _ = upstream_writer.shutdown().await;
        Ok(())
    }
}

/// One pump direction: read, hook, write, until a terminal condition.
async fn pump(
    mut source: PacketReader,
    mut sink: PacketWriter,
    hook: Option<PacketHook>,
) -> PiperResult<()> {
    loop {
        let payload = match source.read_packet().await {
            Ok(payload) => payload,
            Err(err) if is_eof(&err) => return Ok(()),
            Err(err) => return Err(err),
        };
        trace!(code = payload.first().copied(), len = payload.len(), "pumping packet");

        let payload = match &hook {
            Some(hook) => hook(payload).map_err(|err| match err {
                err @ PiperError::Hook(_) => err,
                other => PiperError::Hook(other.to_string()),
            })?,
            None => payload,
        };

        match sink.write_packet(&payload).await {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Whether an error is the peer simply going away.
fn is_eof(err: &PiperError) -> bool {
    matches!(
        err,
        PiperError::Io(io_err) if matches!(
            io_err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
        )
    )
}
