//! Error types for the sshpiper workspace.

use std::fmt;

/// Unified error type for all piper operations.
///
/// The auth bridge distinguishes recoverable failures (the downstream
/// session stays up and may try another method) from fatal ones; see
/// [`PiperError::is_recoverable`].
#[derive(Debug)]
pub enum PiperError {
    /// I/O error on either side of the pipe.
    Io(std::io::Error),

    /// Configuration error (missing host keys, no auth callbacks, ...).
    Config(String),

    /// Malformed or unexpected protocol data.
    Protocol(String),

    /// Cryptographic failure (MAC mismatch, bad signature, ...).
    Security(String),

    /// An auth callback failed to produce an upstream.
    ///
    /// Surfaced to the downstream as USERAUTH_FAILURE; the session
    /// continues.
    UpstreamDial(String),

    /// The upstream rejected the credentials the callback selected.
    ///
    /// Reported through the upstream-auth-failure callback; the session
    /// continues.
    UpstreamAuth(String),

    /// Upstream host-key verification failed.
    UpstreamHostKey(String),

    /// The downstream ran out of authentication attempts.
    AuthRejected(String),

    /// A packet hook returned an error.
    Hook(String),

    /// Sentinel returned by a keyboard-interactive callback: the
    /// challenge round is complete, keep the challenge context and
    /// continue with the next allowed method.
    KeyboardInteractiveFinished,

    /// Other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl PiperError {
    /// Whether the downstream auth loop may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PiperError::UpstreamDial(_)
                | PiperError::UpstreamAuth(_)
                | PiperError::KeyboardInteractiveFinished
        )
    }
}

impl fmt::Display for PiperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PiperError::Io(e) => write!(f, "IO error: {}", e),
            PiperError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PiperError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PiperError::Security(msg) => write!(f, "Security error: {}", msg),
            PiperError::UpstreamDial(msg) => write!(f, "Upstream dial error: {}", msg),
            PiperError::UpstreamAuth(msg) => write!(f, "Upstream auth error: {}", msg),
            PiperError::UpstreamHostKey(msg) => {
                write!(f, "Upstream host key error: {}", msg)
            }
            PiperError::AuthRejected(msg) => write!(f, "Authentication rejected: {}", msg),
            PiperError::Hook(msg) => write!(f, "Hook error: {}", msg),
            PiperError::KeyboardInteractiveFinished => {
                write!(f, "keyboard-interactive finished")
            }
            PiperError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PiperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PiperError::Io(e) => Some(e),
            PiperError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PiperError {
    fn from(err: std::io::Error) -> Self {
        PiperError::Io(err)
    }
}

/// Result type for piper operations.
pub type PiperResult<T> = Result<T, PiperError>;
