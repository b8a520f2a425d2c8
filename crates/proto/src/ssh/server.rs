//! Server-side authentication loop.
//!
//! A deliberately small SSH server: handshake, then an RFC 4252 auth
//! loop driven by per-method verifier callbacks. The piper's test
//! suite runs it as the simulated upstream; the piper itself has its
//! own bridging auth loop in [`crate::piper`].

use std::sync::Arc;

use sshpiper_platform::{PiperError, PiperResult};
use tracing::debug;

use crate::ssh::auth::{
    self, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, AuthSuccess, InfoRequest,
    InfoResponse,
};
use crate::ssh::hostkey::{self, HostKey};
use crate::ssh::message::MessageType;
use crate::ssh::transport::{SshStream, Transport};

/// Checks a password for a user.
pub type PasswordCheck = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Checks whether a public key blob is acceptable for a user.
/// Possession is proven separately by signature verification.
pub type PublicKeyCheck = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Checks a user's keyboard-interactive answers.
pub type KeyboardInteractiveCheck = Arc<dyn Fn(&str, &[String]) -> bool + Send + Sync>;

/// One-round keyboard-interactive authentication: the prompts offered
/// to the client and the verifier for its answers.
pub struct KeyboardInteractiveAuth {
    /// Prompts with their echo flags, sent in the info request.
    pub prompts: Vec<(String, bool)>,
    /// Verifies the answers for a user.
    pub check: KeyboardInteractiveCheck,
}

/// Server configuration.
pub struct ServerConfig {
    /// The server's host key.
    pub host_key: Arc<dyn HostKey>,
    /// Software version advertised in the identification string.
    pub version: String,
    /// Accept the "none" method without credentials.
    pub no_client_auth: bool,
    /// Password verifier; absent disables the method.
    pub password_callback: Option<PasswordCheck>,
    /// Public key verifier; absent disables the method.
    pub public_key_callback: Option<PublicKeyCheck>,
    /// Keyboard-interactive prompts and verifier; absent disables the
    /// method.
    pub keyboard_interactive_callback: Option<KeyboardInteractiveAuth>,
    /// Banner sent once at the start of authentication.
    pub banner: Option<String>,
    /// Cap on failed authentication attempts.
    pub max_auth_attempts: u32,
}

impl ServerConfig {
    /// Creates a config that rejects everything; enable methods by
    /// setting their callbacks.
    pub fn new(host_key: Arc<dyn HostKey>) -> Self {
        Self {
            host_key,
            version: format!("SshPiper_{}", env!("CARGO_PKG_VERSION")),
            no_client_auth: false,
            password_callback: None,
            public_key_callback: None,
            keyboard_interactive_callback: None,
            banner: None,
            max_auth_attempts: 6,
        }
    }

    fn advertised_methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        if self.public_key_callback.is_some() {
            methods.push("publickey".to_string());
        }
        if self.password_callback.is_some() {
            methods.push("password".to_string());
        }
        if self.keyboard_interactive_callback.is_some() {
            methods.push("keyboard-interactive".to_string());
        }
        methods
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("version", &self.version)
            .field("no_client_auth", &self.no_client_auth)
            .field("password", &self.password_callback.is_some())
            .field("public_key", &self.public_key_callback.is_some())
            .field(
                "keyboard_interactive",
                &self.keyboard_interactive_callback.is_some(),
            )
            .field("banner", &self.banner)
            .finish_non_exhaustive()
    }
}

/// An accepted, authenticated server-side connection.
pub struct ServerConn {
    transport: Transport,
    user: String,
}

impl ServerConn {
    /// Performs the handshake and authentication loop on an inbound
    /// stream.
    pub async fn accept(stream: Box<dyn SshStream>, config: &ServerConfig) -> PiperResult<Self> {
        let mut transport =
            Transport::server_handshake(stream, &config.version, &[config.host_key.clone()])
                .await?;
        let user = run_auth_loop(&mut transport, config).await?;
        Ok(Self { transport, user })
    }

    /// Returns the authenticated user name.
    pub fn username(&self) -> &str {
        &self.user
    }

    /// Consumes the connection, yielding the transport.
    pub fn into_transport(self) -> Transport {
        self.transport
    }
}

async fn run_auth_loop(transport: &mut Transport, config: &ServerConfig) -> PiperResult<String> {
    // Service negotiation precedes authentication.
    let payload = transport.read_packet().await?;
    if payload.first() != Some(&(MessageType::ServiceRequest as u8)) {
        return Err(PiperError::Protocol(
            "expected SSH_MSG_SERVICE_REQUEST".to_string(),
        ));
    }
    let service = auth::parse_service_name(&payload)?;
    if service != auth::SERVICE_USERAUTH {
        return Err(PiperError::Protocol(format!(
            "unsupported service: {:?}",
            service
        )));
    }
    transport
        .write_packet(&auth::service_accept(auth::SERVICE_USERAUTH))
        .await?;

    if let Some(banner) = &config.banner {
        transport
            .write_packet(&AuthBanner::new(banner.clone()).to_bytes())
            .await?;
    }

    let mut attempts = 0u32;
    loop {
        if attempts >= config.max_auth_attempts {
            return Err(PiperError::AuthRejected(format!(
                "no valid credentials after {} attempts",
                attempts
            )));
        }

        let payload = transport.read_packet().await?;
        if payload.first() != Some(&(MessageType::UserauthRequest as u8)) {
            return Err(PiperError::Protocol(format!(
                "unexpected message {:?} during auth",
                payload.first()
            )));
        }

        let request = AuthRequest::from_bytes(&payload)?;
        let user = request.user_name().to_string();
        debug!(user = %user, method = request.method().name(), "auth attempt");

        match request.method() {
            AuthMethod::None if config.no_client_auth => {
                transport.write_packet(&AuthSuccess.to_bytes()).await?;
                return Ok(user);
            }
            AuthMethod::None => {
                send_failure(transport, config).await?;
            }
            AuthMethod::Password(password) => {
                attempts += 1;
                let accepted = config
                    .password_callback
                    .as_ref()
                    .is_some_and(|check| check(&user, password.as_bytes()));
                if accepted {
                    transport.write_packet(&AuthSuccess.to_bytes()).await?;
                    return Ok(user);
                }
                send_failure(transport, config).await?;
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let Some(check) = config.public_key_callback.as_ref() else {
                    attempts += 1;
                    send_failure(transport, config).await?;
                    continue;
                };
                if algorithm != "ssh-ed25519" || !check(&user, public_key) {
                    attempts += 1;
                    send_failure(transport, config).await?;
                    continue;
                }

                match signature {
                    None => {
                        // Query phase: the key would be acceptable.
                        let pk_ok = AuthPkOk::new(algorithm.clone(), public_key.clone());
                        transport.write_packet(&pk_ok.to_bytes()).await?;
                    }
                    Some(signature) => {
                        attempts += 1;
                        let signed_data = auth::construct_signature_data(
                            transport.session_id(),
                            &user,
                            request.service_name(),
                            algorithm,
                            public_key,
                        );
                        if hostkey::verify_signature_blob(public_key, &signed_data, signature)? {
                            transport.write_packet(&AuthSuccess.to_bytes()).await?;
                            return Ok(user);
                        }
                        send_failure(transport, config).await?;
                    }
                }
            }
            AuthMethod::KeyboardInteractive { .. } => {
                let Some(ki) = config.keyboard_interactive_callback.as_ref() else {
                    attempts += 1;
                    send_failure(transport, config).await?;
                    continue;
                };

                attempts += 1;
                let info = InfoRequest::new("", "", ki.prompts.clone());
                transport.write_packet(&info.to_bytes()).await?;

                let payload = transport.read_packet().await?;
                if payload.first() != Some(&(MessageType::UserauthInfoResponse as u8)) {
                    return Err(PiperError::Protocol(format!(
                        "expected SSH_MSG_USERAUTH_INFO_RESPONSE, got {:?}",
                        payload.first()
                    )));
                }
                let response = InfoResponse::from_bytes(&payload)?;

                if response.answers().len() == ki.prompts.len()
                    && (ki.check)(&user, response.answers())
                {
                    transport.write_packet(&AuthSuccess.to_bytes()).await?;
                    return Ok(user);
                }
                send_failure(transport, config).await?;
            }
        }
    }
}

async fn send_failure(transport: &mut Transport, config: &ServerConfig) -> PiperResult<()> {
    let failure = AuthFailure::new(config.advertised_methods(), false);
    transport.write_packet(&failure.to_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    #[test]
    fn test_advertised_methods() {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let mut config = ServerConfig::new(host_key);
        assert!(config.advertised_methods().is_empty());

        config.password_callback = Some(Arc::new(|_, _| false));
        assert_eq!(config.advertised_methods(), vec!["password".to_string()]);

        config.public_key_callback = Some(Arc::new(|_, _| false));
        assert_eq!(
            config.advertised_methods(),
            vec!["publickey".to_string(), "password".to_string()]
        );

        config.keyboard_interactive_callback = Some(KeyboardInteractiveAuth {
            prompts: vec![("token".to_string(), true)],
            check: Arc::new(|_, _| false),
        });
        assert_eq!(
            config.advertised_methods(),
            vec![
                "publickey".to_string(),
                "password".to_string(),
                "keyboard-interactive".to_string(),
            ]
        );
    }
}
