//! The piper: an authenticating SSH reverse proxy core.
//!
//! A piper terminates an inbound ("downstream") SSH session with its
//! own host keys, intercepts the downstream's authentication attempts,
//! and asks the configured callbacks where to go: each callback
//! receives the presented credential and answers with an [`Upstream`]
//! (a live byte-stream plus a [`ClientConfig`]). The piper then
//! handshakes and authenticates to that upstream on the client's
//! behalf - possibly as a different user, with a different credential
//! kind - and once both sides are established, pumps decrypted packets
//! between the two transports until either side closes.
//!
//! Entry point: [`PiperConn::new`], then [`PiperConn::wait`] or
//! [`PiperConn::wait_with_hooks`].
//!
//! Because the two sessions use independent session keys, forwarding
//! is packet-by-packet: read and decrypt on one side, optionally pass
//! through a hook, re-encrypt and write on the other.

mod auth_bridge;
mod conn;

pub use conn::{PacketHook, PiperConn};

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use sshpiper_platform::{PiperError, PiperResult};
use tokio::sync::{mpsc, oneshot};

use crate::ssh::hostkey::HostKey;
use crate::ssh::transport::SshStream;

pub use crate::ssh::client::{ClientAuthMethod, ClientConfig};

/// Read-only facts about one side of a piped session, fixed once
/// authentication starts.
#[derive(Debug, Clone)]
pub struct ConnMetadata {
    pub(crate) user: String,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) session_id: Vec<u8>,
    pub(crate) version: String,
}

impl ConnMetadata {
    /// The user name. For the downstream this is the name from its
    /// first USERAUTH_REQUEST and never changes for the session; for
    /// the upstream it is whatever the callback put in
    /// [`ClientConfig::user`].
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The peer's network address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The session identifier of this side's key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// The peer's identification string.
    pub fn client_version(&self) -> &str {
        &self.version
    }
}

/// Per-session scratchpad shared by every auth callback of one
/// downstream connection.
///
/// Auth callbacks are serialized within a session, so the core needs
/// no locking here; implementations that mutate state through the
/// shared handle must bring their own interior mutability (and it must
/// be `Send + Sync`, e.g. a `Mutex`).
pub trait ChallengeContext: Send + Sync {
    /// A user name established by challenges, if any. May differ from
    /// the downstream's requested name.
    fn challenged_username(&self) -> Option<String> {
        None
    }

    /// Downcast hook for the caller's payload.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to the session's challenge context.
pub type ChallengeCtxRef = Arc<dyn ChallengeContext>;

/// The context used when no factory is configured.
struct EmptyChallengeContext;

impl ChallengeContext for EmptyChallengeContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Where an authenticated downstream should be piped to: an owned,
/// already-dialled byte-stream (not yet SSH-handshaked) and the client
/// configuration to use on it.
///
/// Once returned from a callback the piper owns the stream; if the
/// upstream handshake or authentication fails, the stream is dropped
/// before the downstream sees the failure.
pub struct Upstream {
    /// The dialled byte-stream to the upstream server.
    pub conn: Box<dyn SshStream>,
    /// User, auth methods and host-key policy for the upstream.
    pub config: ClientConfig,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Downstream authentication methods the bridge can gate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethodKind {
    /// The "none" method.
    None,
    /// Password authentication.
    Password,
    /// Public-key authentication.
    PublicKey,
    /// Keyboard-interactive authentication.
    KeyboardInteractive,
}

impl AuthMethodKind {
    /// Returns the method name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethodKind::None => "none",
            AuthMethodKind::Password => "password",
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

/// Future returned by the upstream-selecting callbacks.
pub type UpstreamFuture = BoxFuture<'static, PiperResult<Upstream>>;

/// Creates the per-session challenge context, once per connection,
/// before any auth attempt.
pub type CreateChallengeContextCallback =
    Arc<dyn Fn(&ConnMetadata) -> PiperResult<ChallengeCtxRef> + Send + Sync>;

/// Decides which methods the downstream may try next; drives the
/// "methods that can continue" list in USERAUTH_FAILURE.
pub type NextAuthMethodsCallback =
    Arc<dyn Fn(&ConnMetadata, &ChallengeCtxRef) -> PiperResult<Vec<AuthMethodKind>> + Send + Sync>;

/// Handles a downstream "none" attempt.
pub type NoClientAuthCallback =
    Arc<dyn Fn(ConnMetadata, ChallengeCtxRef) -> UpstreamFuture + Send + Sync>;

/// Handles a downstream password attempt; receives the presented
/// password.
pub type PasswordCallback =
    Arc<dyn Fn(ConnMetadata, Vec<u8>, ChallengeCtxRef) -> UpstreamFuture + Send + Sync>;

/// Handles a downstream public-key attempt; receives the presented key
/// blob (possession already proven against this session).
pub type PublicKeyCallback =
    Arc<dyn Fn(ConnMetadata, Vec<u8>, ChallengeCtxRef) -> UpstreamFuture + Send + Sync>;

/// Handles a downstream keyboard-interactive attempt. The callback
/// drives the client through [`KeyboardInteractiveChallenge::prompt`]
/// as many times as it needs before producing an upstream or an error.
pub type KeyboardInteractiveCallback = Arc<
    dyn Fn(ConnMetadata, KeyboardInteractiveChallenge, ChallengeCtxRef) -> UpstreamFuture
        + Send
        + Sync,
>;

/// Observes upstream authentication failures, typically to narrow the
/// method list returned by [`NextAuthMethodsCallback`].
pub type UpstreamAuthFailureCallback =
    Arc<dyn Fn(&ConnMetadata, AuthMethodKind, &PiperError, &ChallengeCtxRef) + Send + Sync>;

/// Rewrites or suppresses upstream banners before they reach the
/// downstream. `None` suppresses the banner.
pub type BannerCallback = Arc<dyn Fn(String) -> Option<String> + Send + Sync>;

/// Configuration shared by all piped sessions.
///
/// Each auth callback enables its downstream method; an absent
/// callback means the method is disabled, which is distinct from a
/// configured callback returning an error. Callbacks are invoked from
/// many sessions concurrently and must be thread safe; within one
/// session they are serialized.
pub struct PiperConfig {
    /// Host keys presented to the downstream, in preference order.
    pub host_keys: Vec<Arc<dyn HostKey>>,
    /// Software version advertised to the downstream.
    pub server_version: String,
    /// Cap on downstream authentication attempts.
    pub max_auth_attempts: u32,
    /// Per-session challenge context factory.
    pub create_challenge_context: Option<CreateChallengeContextCallback>,
    /// Allowed-methods policy.
    pub next_auth_methods: Option<NextAuthMethodsCallback>,
    /// "none" handler.
    pub no_client_auth_callback: Option<NoClientAuthCallback>,
    /// Password handler.
    pub password_callback: Option<PasswordCallback>,
    /// Public-key handler.
    pub public_key_callback: Option<PublicKeyCallback>,
    /// Keyboard-interactive handler.
    pub keyboard_interactive_callback: Option<KeyboardInteractiveCallback>,
    /// Upstream auth failure observer.
    pub upstream_auth_failure_callback: Option<UpstreamAuthFailureCallback>,
    /// Banner relay policy; `None` relays banners verbatim.
    pub banner_callback: Option<BannerCallback>,
}

impl PiperConfig {
    /// Creates a config with the given host keys and no auth
    /// callbacks. At least one callback must be set before use.
    pub fn new(host_keys: Vec<Arc<dyn HostKey>>) -> Self {
        Self {
            host_keys,
            server_version: format!("SshPiper_{}", env!("CARGO_PKG_VERSION")),
            max_auth_attempts: 6,
            create_challenge_context: None,
            next_auth_methods: None,
            no_client_auth_callback: None,
            password_callback: None,
            public_key_callback: None,
            keyboard_interactive_callback: None,
            upstream_auth_failure_callback: None,
            banner_callback: None,
        }
    }

    /// The methods that have a configured callback.
    pub(crate) fn enabled_methods(&self) -> Vec<AuthMethodKind> {
        let mut methods = Vec::new();
        if self.no_client_auth_callback.is_some() {
            methods.push(AuthMethodKind::None);
        }
        if self.public_key_callback.is_some() {
            methods.push(AuthMethodKind::PublicKey);
        }
        if self.password_callback.is_some() {
            methods.push(AuthMethodKind::Password);
        }
        if self.keyboard_interactive_callback.is_some() {
            methods.push(AuthMethodKind::KeyboardInteractive);
        }
        methods
    }

    pub(crate) fn validate(&self) -> PiperResult<()> {
        if self.host_keys.is_empty() {
            return Err(PiperError::Config("no host keys configured".to_string()));
        }
        if self.enabled_methods().is_empty() {
            return Err(PiperError::Config(
                "no auth callbacks configured".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PiperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiperConfig")
            .field("host_keys", &self.host_keys.len())
            .field("server_version", &self.server_version)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("enabled_methods", &self.enabled_methods())
            .finish_non_exhaustive()
    }
}

pub(crate) struct ChallengeRequest {
    pub(crate) name: String,
    pub(crate) instruction: String,
    pub(crate) prompts: Vec<(String, bool)>,
    pub(crate) reply: oneshot::Sender<PiperResult<Vec<String>>>,
}

/// Handle given to the keyboard-interactive callback for talking to
/// the downstream client.
///
/// Each [`prompt`](Self::prompt) emits one USERAUTH_INFO_REQUEST and
/// blocks the callback until the USERAUTH_INFO_RESPONSE arrives.
/// Prompts within one session happen one at a time.
#[derive(Clone)]
pub struct KeyboardInteractiveChallenge {
    tx: mpsc::Sender<ChallengeRequest>,
}

impl KeyboardInteractiveChallenge {
    pub(crate) fn new(tx: mpsc::Sender<ChallengeRequest>) -> Self {
        Self { tx }
    }

    /// Prompts the downstream client. `prompts` pairs each prompt text
    /// with its echo flag; an empty list shows `instruction` alone
    /// (e.g. as a message of the day) and returns no answers.
    pub async fn prompt(
        &self,
        name: &str,
        instruction: &str,
        prompts: &[(String, bool)],
    ) -> PiperResult<Vec<String>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ChallengeRequest {
                name: name.to_string(),
                instruction: instruction.to_string(),
                prompts: prompts.to_vec(),
                reply,
            })
            .await
            .map_err(|_| {
                PiperError::Protocol("challenge issued outside its auth attempt".to_string())
            })?;
        response.await.map_err(|_| {
            PiperError::Protocol("challenge abandoned by the session".to_string())
        })?
    }
}
