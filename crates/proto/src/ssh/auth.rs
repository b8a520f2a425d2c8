//! SSH user authentication messages (RFC 4252).
//!
//! Covers USERAUTH_REQUEST for the four methods the piper bridges
//! (`none`, `password`, `publickey`, `keyboard-interactive`), the
//! server responses (FAILURE, SUCCESS, BANNER, PK_OK), the keyboard-
//! interactive INFO_REQUEST / INFO_RESPONSE pair, and the signed-data
//! construction for public-key authentication.

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use sshpiper_platform::{PiperError, PiperResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// SSH_MSG_USERAUTH_INFO_REQUEST shares the number 60 with PK_OK; the
/// method in flight decides the reading.
pub const SSH_MSG_USERAUTH_INFO_REQUEST: u8 = 60;

/// The service started after successful authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// The authentication service requested before the first auth attempt.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Authentication method carried by a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// The "none" method: succeed without credentials or probe the
    /// allowed method list.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication. `signature` is absent during the
    /// query phase and present for the real attempt.
    PublicKey {
        /// Public key algorithm name (e.g. "ssh-ed25519").
        algorithm: String,
        /// Public key blob in SSH wire format.
        public_key: Vec<u8>,
        /// Signature blob, if this is the signed attempt.
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Language tag, normally empty.
        language: String,
        /// Comma-separated submethod hints from the client.
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates an authentication request for the given user and method.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the requested user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the requested service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        wire::put_string(&mut buf, &self.user_name);
        wire::put_string(&mut buf, &self.service_name);
        wire::put_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                wire::put_bool(&mut buf, false); // not a password change
                wire::put_string(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                wire::put_bool(&mut buf, signature.is_some());
                wire::put_string(&mut buf, algorithm);
                wire::put_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    wire::put_bytes(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                wire::put_string(&mut buf, language);
                wire::put_string(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses from message bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Protocol`] for malformed requests or
    /// methods this crate does not speak.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::UserauthRequest as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_REQUEST".to_string(),
            ));
        }

        let user_name = wire::take_string(data, &mut offset)?;
        let service_name = wire::take_string(data, &mut offset)?;
        let method_name = wire::take_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = wire::take_bool(data, &mut offset)?;
                let password = wire::take_string(data, &mut offset)?;
                AuthMethod::Password(password)
            }
            "publickey" => {
                let has_signature = wire::take_bool(data, &mut offset)?;
                let algorithm = wire::take_string(data, &mut offset)?;
                let public_key = wire::take_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(wire::take_bytes(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let language = wire::take_string(data, &mut offset)?;
                let submethods = wire::take_string(data, &mut offset)?;
                AuthMethod::KeyboardInteractive {
                    language,
                    submethods,
                }
            }
            _ => {
                return Err(PiperError::Protocol(format!(
                    "unsupported authentication method: {:?}",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure carrying the methods that can continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns the partial-success flag.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        wire::put_name_list(&mut buf, &self.methods_can_continue);
        wire::put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::UserauthFailure as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_FAILURE".to_string(),
            ));
        }

        let methods_can_continue = wire::take_name_list(data, &mut offset)?;
        let partial_success = wire::take_bool(data, &mut offset)?;

        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS: a single message byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        if data.first() != Some(&(MessageType::UserauthSuccess as u8)) {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_SUCCESS".to_string(),
            ));
        }
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a banner message.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        wire::put_string(&mut buf, &self.message);
        wire::put_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::UserauthBanner as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_BANNER".to_string(),
            ));
        }

        let message = wire::take_string(data, &mut offset)?;
        let language_tag = wire::take_string(data, &mut offset)?;

        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (RFC 4252 Section 7): the server accepts the
/// offered key; the client should now send the signed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a PK_OK response echoing the offered key.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the echoed public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        wire::put_string(&mut buf, &self.algorithm);
        wire::put_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::UserauthPkOk as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_PK_OK".to_string(),
            ));
        }

        let algorithm = wire::take_string(data, &mut offset)?;
        let public_key = wire::take_bytes(data, &mut offset)?;

        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2): prompts sent
/// to the client during keyboard-interactive authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    name: String,
    instruction: String,
    prompts: Vec<(String, bool)>,
}

impl InfoRequest {
    /// Creates an info request. Each prompt pairs the prompt text with
    /// its echo flag.
    pub fn new(name: &str, instruction: &str, prompts: Vec<(String, bool)>) -> Self {
        Self {
            name: name.to_string(),
            instruction: instruction.to_string(),
            prompts,
        }
    }

    /// Returns the request name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instruction text.
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Returns the prompts with their echo flags.
    pub fn prompts(&self) -> &[(String, bool)] {
        &self.prompts
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(SSH_MSG_USERAUTH_INFO_REQUEST);
        wire::put_string(&mut buf, &self.name);
        wire::put_string(&mut buf, &self.instruction);
        wire::put_string(&mut buf, ""); // language tag
        buf.put_u32(self.prompts.len() as u32);
        for (prompt, echo) in &self.prompts {
            wire::put_string(&mut buf, prompt);
            wire::put_bool(&mut buf, *echo);
        }
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != SSH_MSG_USERAUTH_INFO_REQUEST {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_INFO_REQUEST".to_string(),
            ));
        }

        let name = wire::take_string(data, &mut offset)?;
        let instruction = wire::take_string(data, &mut offset)?;
        let _language = wire::take_string(data, &mut offset)?;

        let num_prompts = wire::take_u32(data, &mut offset)? as usize;
        if num_prompts > 64 {
            return Err(PiperError::Protocol(format!(
                "unreasonable prompt count: {}",
                num_prompts
            )));
        }

        let mut prompts = Vec::with_capacity(num_prompts);
        for _ in 0..num_prompts {
            let prompt = wire::take_string(data, &mut offset)?;
            let echo = wire::take_bool(data, &mut offset)?;
            prompts.push((prompt, echo));
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4): the client's
/// answers to an info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    answers: Vec<String>,
}

impl InfoResponse {
    /// Creates an info response.
    pub fn new(answers: Vec<String>) -> Self {
        Self { answers }
    }

    /// Returns the answers.
    pub fn answers(&self) -> &[String] {
        &self.answers
    }

    /// Consumes the response, yielding the answers.
    pub fn into_answers(self) -> Vec<String> {
        self.answers
    }

    /// Serializes to message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.answers.len() as u32);
        for answer in &self.answers {
            wire::put_string(&mut buf, answer);
        }
        buf.to_vec()
    }

    /// Parses from message bytes.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if wire::take_u8(data, &mut offset)? != MessageType::UserauthInfoResponse as u8 {
            return Err(PiperError::Protocol(
                "expected SSH_MSG_USERAUTH_INFO_RESPONSE".to_string(),
            ));
        }

        let num_answers = wire::take_u32(data, &mut offset)? as usize;
        if num_answers > 64 {
            return Err(PiperError::Protocol(format!(
                "unreasonable answer count: {}",
                num_answers
            )));
        }

        let mut answers = Vec::with_capacity(num_answers);
        for _ in 0..num_answers {
            answers.push(wire::take_string(data, &mut offset)?);
        }

        Ok(Self { answers })
    }
}

/// Builds an SSH_MSG_SERVICE_REQUEST for the given service.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    wire::put_string(&mut buf, service);
    buf.to_vec()
}

/// Builds an SSH_MSG_SERVICE_ACCEPT for the given service.
pub fn service_accept(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceAccept as u8);
    wire::put_string(&mut buf, service);
    buf.to_vec()
}

/// Parses the service name out of a SERVICE_REQUEST or SERVICE_ACCEPT.
pub fn parse_service_name(data: &[u8]) -> PiperResult<String> {
    let mut offset = 1;
    if data.is_empty() {
        return Err(PiperError::Protocol("empty service message".to_string()));
    }
    wire::take_string(data, &mut offset)
}

/// Constructs the data signed for public-key authentication
/// (RFC 4252 Section 7).
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();

    wire::put_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    wire::put_string(&mut buf, user_name);
    wire::put_string(&mut buf, service_name);
    wire::put_string(&mut buf, "publickey");
    wire::put_bool(&mut buf, true);
    wire::put_string(&mut buf, algorithm);
    wire::put_bytes(&mut buf, public_key_blob);

    buf.to_vec()
}

/// Compares two secrets in constant time, hashing first so that
/// length differences leak nothing.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    let hash_a = Sha256::digest(a);
    let hash_b = Sha256::digest(b);
    hash_a.ct_eq(&hash_b).into()
}
