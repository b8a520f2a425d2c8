//! Client-side authentication driver.
//!
//! [`authenticate`] runs the RFC 4252 client loop against a
//! handshaked [`Transport`]: it requests the userauth service, then
//! offers the configured methods in order until the server accepts one
//! or the list is exhausted. Banners received along the way are
//! collected for the caller, which in the piper's case relays them to
//! the downstream.
//!
//! The piper uses this module to authenticate to upstreams; the test
//! suite uses it as a downstream client.

use std::sync::Arc;

use sshpiper_platform::{PiperError, PiperResult};
use tracing::debug;

use crate::ssh::auth::{
    self, AuthMethod, AuthBanner, AuthRequest, InfoRequest, InfoResponse,
    SSH_MSG_USERAUTH_INFO_REQUEST,
};
use crate::ssh::hostkey::{insecure_ignore_host_key, HostKey, HostKeyVerifier};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;

/// Answers keyboard-interactive prompts: receives the request name,
/// instruction and `(prompt, echo)` pairs, returns one answer per
/// prompt.
pub type KeyboardInteractiveResponder =
    Arc<dyn Fn(&str, &str, &[(String, bool)]) -> PiperResult<Vec<String>> + Send + Sync>;

/// One authentication method to offer, with its credential material.
#[derive(Clone)]
pub enum ClientAuthMethod {
    /// The "none" method.
    None,
    /// Password authentication.
    Password(String),
    /// Public-key authentication signing with the given key.
    PublicKey(Arc<dyn HostKey>),
    /// Keyboard-interactive, answering prompts with the responder.
    KeyboardInteractive(KeyboardInteractiveResponder),
}

impl ClientAuthMethod {
    /// Returns the method name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientAuthMethod::None => "none",
            ClientAuthMethod::Password(_) => "password",
            ClientAuthMethod::PublicKey(_) => "publickey",
            ClientAuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for ClientAuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the client side of a connection: who to
/// authenticate as, with what, and how to judge the server's host key.
pub struct ClientConfig {
    /// User name to request.
    pub user: String,
    /// Methods to offer, in order.
    pub auth: Vec<ClientAuthMethod>,
    /// Host key acceptance policy.
    pub host_key_verifier: HostKeyVerifier,
    /// Software version advertised in the identification string.
    pub version: String,
}

impl ClientConfig {
    /// Creates a config with the given host key policy and no auth
    /// methods.
    pub fn new(user: &str, host_key_verifier: HostKeyVerifier) -> Self {
        Self {
            user: user.to_string(),
            auth: Vec::new(),
            host_key_verifier,
            version: format!("SshPiper_{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Creates a config that accepts any host key. For tests and lab
    /// setups only.
    pub fn insecure(user: &str) -> Self {
        Self::new(user, insecure_ignore_host_key())
    }

    /// Appends an auth method, builder style.
    pub fn with_auth(mut self, method: ClientAuthMethod) -> Self {
        self.auth.push(method);
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Outcome of one method attempt.
enum Attempt {
    Accepted,
    Rejected,
}

/// Authenticates on a handshaked client transport, offering the
/// configured methods in order. Banners received during authentication
/// are appended to `banners`.
///
/// # Errors
///
/// [`PiperError::UpstreamAuth`] when every configured method was
/// rejected; transport and protocol errors pass through.
pub async fn authenticate(
    transport: &mut Transport,
    config: &ClientConfig,
    banners: &mut Vec<String>,
) -> PiperResult<()> {
    if config.auth.is_empty() {
        return Err(PiperError::UpstreamAuth(
            "no auth methods configured".to_string(),
        ));
    }

    transport
        .write_packet(&auth::service_request(auth::SERVICE_USERAUTH))
        .await?;
    loop {
        let payload = transport.read_packet().await?;
        match payload.first().copied() {
            Some(code) if code == MessageType::ServiceAccept as u8 => break,
            Some(code) if code == MessageType::UserauthBanner as u8 => {
                banners.push(AuthBanner::from_bytes(&payload)?.message().to_string());
            }
            _ => {
                return Err(PiperError::Protocol(
                    "expected SSH_MSG_SERVICE_ACCEPT".to_string(),
                ))
            }
        }
    }

    for method in &config.auth {
        debug!(user = %config.user, method = method.name(), "offering auth method");
        let attempt = match method {
            ClientAuthMethod::None => {
                let request =
                    AuthRequest::new(&config.user, auth::SERVICE_CONNECTION, AuthMethod::None);
                transport.write_packet(&request.to_bytes()).await?;
                await_verdict(transport, banners).await?
            }
            ClientAuthMethod::Password(password) => {
                let request = AuthRequest::new(
                    &config.user,
                    auth::SERVICE_CONNECTION,
                    AuthMethod::Password(password.clone()),
                );
                transport.write_packet(&request.to_bytes()).await?;
                await_verdict(transport, banners).await?
            }
            ClientAuthMethod::PublicKey(key) => {
                attempt_public_key(transport, config, key.as_ref(), banners).await?
            }
            ClientAuthMethod::KeyboardInteractive(responder) => {
                attempt_keyboard_interactive(transport, config, responder, banners).await?
            }
        };

        if matches!(attempt, Attempt::Accepted) {
            debug!(user = %config.user, method = method.name(), "auth accepted");
            return Ok(());
        }
    }

    Err(PiperError::UpstreamAuth(format!(
        "server rejected all configured auth methods for {:?}",
        config.user
    )))
}

/// Sends a signed public-key attempt. The signature covers the
/// session identifier, so possession is proven in one round trip and
/// the query phase is skipped.
async fn attempt_public_key(
    transport: &mut Transport,
    config: &ClientConfig,
    key: &dyn HostKey,
    banners: &mut Vec<String>,
) -> PiperResult<Attempt> {
    let algorithm = key.algorithm_name();
    let public_key_blob = key.public_key_bytes();

    let signed_data = auth::construct_signature_data(
        transport.session_id(),
        &config.user,
        auth::SERVICE_CONNECTION,
        algorithm,
        &public_key_blob,
    );
    let signature = key.sign(&signed_data)?;

    let request = AuthRequest::new(
        &config.user,
        auth::SERVICE_CONNECTION,
        AuthMethod::PublicKey {
            algorithm: algorithm.to_string(),
            public_key: public_key_blob,
            signature: Some(signature),
        },
    );
    transport.write_packet(&request.to_bytes()).await?;
    await_verdict(transport, banners).await
}

async fn attempt_keyboard_interactive(
    transport: &mut Transport,
    config: &ClientConfig,
    responder: &KeyboardInteractiveResponder,
    banners: &mut Vec<String>,
) -> PiperResult<Attempt> {
    let request = AuthRequest::new(
        &config.user,
        auth::SERVICE_CONNECTION,
        AuthMethod::KeyboardInteractive {
            language: String::new(),
            submethods: String::new(),
        },
    );
    transport.write_packet(&request.to_bytes()).await?;

    loop {
        let payload = transport.read_packet().await?;
        match payload.first().copied() {
            Some(SSH_MSG_USERAUTH_INFO_REQUEST) => {
                let info = InfoRequest::from_bytes(&payload)?;
                let answers = responder(info.name(), info.instruction(), info.prompts())?;
                if answers.len() != info.prompts().len() {
                    return Err(PiperError::Protocol(format!(
                        "keyboard-interactive responder returned {} answers for {} prompts",
                        answers.len(),
                        info.prompts().len()
                    )));
                }
                transport
                    .write_packet(&InfoResponse::new(answers).to_bytes())
                    .await?;
            }
            Some(code) if code == MessageType::UserauthSuccess as u8 => {
                return Ok(Attempt::Accepted)
            }
            Some(code) if code == MessageType::UserauthFailure as u8 => {
                return Ok(Attempt::Rejected)
            }
            Some(code) if code == MessageType::UserauthBanner as u8 => {
                banners.push(AuthBanner::from_bytes(&payload)?.message().to_string());
            }
            other => {
                return Err(PiperError::Protocol(format!(
                    "unexpected message {:?} during keyboard-interactive auth",
                    other
                )))
            }
        }
    }
}

/// Reads until the server delivers a success or failure verdict,
/// collecting banners.
async fn await_verdict(
    transport: &mut Transport,
    banners: &mut Vec<String>,
) -> PiperResult<Attempt> {
    loop {
        let payload = transport.read_packet().await?;
        match payload.first().copied() {
            Some(code) if code == MessageType::UserauthSuccess as u8 => {
                return Ok(Attempt::Accepted)
            }
            Some(code) if code == MessageType::UserauthFailure as u8 => {
                return Ok(Attempt::Rejected)
            }
            Some(code) if code == MessageType::UserauthBanner as u8 => {
                banners.push(AuthBanner::from_bytes(&payload)?.message().to_string());
            }
            other => {
                return Err(PiperError::Protocol(format!(
                    "unexpected message {:?} while awaiting auth verdict",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::insecure("testuser")
            .with_auth(ClientAuthMethod::None)
            .with_auth(ClientAuthMethod::Password("secret".to_string()));

        assert_eq!(config.user, "testuser");
        assert_eq!(config.auth.len(), 2);
        assert_eq!(config.auth[0].name(), "none");
        assert_eq!(config.auth[1].name(), "password");
        assert!(config.version.starts_with("SshPiper_"));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ClientAuthMethod::None.name(), "none");
        assert_eq!(
            ClientAuthMethod::Password(String::new()).name(),
            "password"
        );
    }
}
