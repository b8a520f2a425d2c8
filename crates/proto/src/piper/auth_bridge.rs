//! The authentication bridge.
//!
//! Runs the downstream server-side auth loop and, for each attempt,
//! asks the configured callback for an upstream. Downstream auth
//! packets are never forwarded: the upstream always sees fresh auth
//! requests built from the callback's [`ClientConfig`].
//!
//! States per session: method selection (reject methods missing from
//! the allowed list), callback execution, upstream handshake + auth,
//! and recovery - an upstream auth failure drops that upstream, feeds
//! the failure callback, and returns to method selection with a
//! refreshed allowed list.

use std::sync::Arc;

use sshpiper_platform::{PiperError, PiperResult};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::piper::{
    AuthMethodKind, ChallengeCtxRef, ConnMetadata, EmptyChallengeContext,
    KeyboardInteractiveChallenge, PiperConfig, Upstream,
};
use crate::ssh::auth::{
    self, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoRequest, InfoResponse,
};
use crate::ssh::client;
use crate::ssh::hostkey;
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;

/// A connected, authenticated upstream produced by the bridge.
pub(crate) struct AcceptedUpstream {
    pub(crate) transport: Transport,
    pub(crate) user: String,
}

/// Runs the downstream auth loop to completion. On success the
/// downstream has NOT yet been told: the caller sends
/// USERAUTH_SUCCESS once it has taken ownership of both transports.
pub(crate) async fn run(
    downstream: &mut Transport,
    meta: &mut ConnMetadata,
    config: &Arc<PiperConfig>,
) -> PiperResult<AcceptedUpstream> {
    // Service negotiation precedes authentication.
    let payload = downstream.read_packet().await?;
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
    downstream
        .write_packet(&auth::service_accept(auth::SERVICE_USERAUTH))
        .await?;

    let ctx: ChallengeCtxRef = match &config.create_challenge_context {
        Some(factory) => factory(meta)?,
        None => Arc::new(EmptyChallengeContext),
    };

    let mut attempts = 0u32;
    loop {
        let payload = downstream.read_packet().await?;
        if payload.first() != Some(&(MessageType::UserauthRequest as u8)) {
            return Err(PiperError::Protocol(format!(
                "unexpected message {:?} during auth",
                payload.first()
            )));
        }
        let request = AuthRequest::from_bytes(&payload)?;

        // The session's user name is the one from the first request;
        // later requests cannot change what callbacks observe.
        if meta.user.is_empty() {
            meta.user = request.user_name().to_string();
        }

        let allowed = allowed_methods(config, meta, &ctx)?;
        let kind = method_kind(request.method());

        if !allowed.contains(&kind) {
            debug!(method = kind.name(), "method not allowed, rejecting");
            if kind != AuthMethodKind::None {
                attempts += 1;
            }
            send_failure(downstream, &allowed).await?;
            check_attempts(attempts, config)?;
            continue;
        }

        // Public-key query phase: confirm the key may be offered
        // without invoking the callback; the signed attempt follows.
        if let AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature: None,
        } = request.method()
        {
            if algorithm == "ssh-ed25519" {
                let pk_ok = AuthPkOk::new(algorithm.clone(), public_key.clone());
                downstream.write_packet(&pk_ok.to_bytes()).await?;
            } else {
                send_failure(downstream, &allowed).await?;
            }
            continue;
        }

        attempts += 1;

        let outcome = attempt_method(downstream, meta, config, &ctx, &request, kind).await?;
        match outcome {
            Outcome::Accepted(accepted) => return Ok(accepted),
            Outcome::Rejected => {
                let allowed = allowed_methods(config, meta, &ctx)?;
                send_failure(downstream, &allowed).await?;
                check_attempts(attempts, config)?;
            }
            Outcome::Fatal(err) => {
                // Host-key trouble is reported to the downstream as an
                // ordinary failure before the session dies.
                if matches!(err, PiperError::UpstreamHostKey(_)) {
                    let allowed = allowed_methods(config, meta, &ctx)?;
                    let _ = send_failure(downstream, &allowed).await;
                }
                return Err(err);
            }
        }
    }
}

enum Outcome {
    Accepted(AcceptedUpstream),
    Rejected,
    Fatal(PiperError),
}

/// Runs one credentialed attempt: invoke the callback, and if it
/// yields an upstream, handshake and authenticate to it.
async fn attempt_method(
    downstream: &mut Transport,
    meta: &ConnMetadata,
    config: &Arc<PiperConfig>,
    ctx: &ChallengeCtxRef,
    request: &AuthRequest,
    kind: AuthMethodKind,
) -> PiperResult<Outcome> {
    let selected = match request.method() {
        AuthMethod::None => {
            let callback = config.no_client_auth_callback.as_ref().ok_or_else(|| {
                PiperError::Protocol("none allowed without a callback".to_string())
            })?;
            callback(meta.clone(), ctx.clone()).await
        }
        AuthMethod::Password(password) => {
            let callback = config.password_callback.as_ref().ok_or_else(|| {
                PiperError::Protocol("password allowed without a callback".to_string())
            })?;
            callback(meta.clone(), password.as_bytes().to_vec(), ctx.clone()).await
        }
        AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature,
        } => {
            let callback = config.public_key_callback.as_ref().ok_or_else(|| {
                PiperError::Protocol("publickey allowed without a callback".to_string())
            })?;

            if algorithm != "ssh-ed25519" {
                debug!(algorithm = %algorithm, "unsupported downstream key algorithm");
                return Ok(Outcome::Rejected);
            }

            let signature = signature
                .as_deref()
                .ok_or_else(|| PiperError::Protocol("missing signature".to_string()))?;
            let signed_data = auth::construct_signature_data(
                downstream.session_id(),
                request.user_name(),
                request.service_name(),
                algorithm,
                public_key,
            );
            if !hostkey::verify_signature_blob(public_key, &signed_data, signature)? {
                debug!("downstream public key signature rejected");
                return Ok(Outcome::Rejected);
            }

            callback(meta.clone(), public_key.clone(), ctx.clone()).await
        }
        AuthMethod::KeyboardInteractive { .. } => {
            let callback = config
                .keyboard_interactive_callback
                .as_ref()
                .ok_or_else(|| {
                    PiperError::Protocol(
                        "keyboard-interactive allowed without a callback".to_string(),
                    )
                })?
                .clone();
            run_keyboard_interactive(downstream, &callback, meta, ctx).await
        }
    };

    let mut upstream = match selected {
        Ok(upstream) => upstream,
        Err(PiperError::KeyboardInteractiveFinished) => {
            // The challenge round completed; its context mutations
            // persist and method selection continues.
            debug!("keyboard-interactive round finished, re-selecting method");
            return Ok(Outcome::Rejected);
        }
        Err(err) if err.is_recoverable() => {
            debug!(error = %err, "callback declined to produce an upstream");
            return Ok(Outcome::Rejected);
        }
        Err(PiperError::Other(err)) => {
            debug!(error = %err, "callback failed");
            return Ok(Outcome::Rejected);
        }
        Err(err) => return Ok(Outcome::Fatal(err)),
    };

    // An upstream user left empty means "same as downstream".
    if upstream.config.user.is_empty() {
        upstream.config.user = meta.user.clone();
    }

    // Upstream handshake and authentication. The downstream learns
    // nothing until this either succeeds or fails.
    let mut banners = Vec::new();
    match connect_upstream(upstream, &mut banners).await {
        Ok(accepted) => {
            relay_banners(downstream, config, banners).await?;
            Ok(Outcome::Accepted(accepted))
        }
        Err(err) => {
            relay_banners(downstream, config, banners).await?;
            match err {
                PiperError::UpstreamAuth(_) => {
                    warn!(method = kind.name(), error = %err, "upstream rejected auth");
                    if let Some(callback) = &config.upstream_auth_failure_callback {
                        callback(meta, kind, &err, ctx);
                    }
                    Ok(Outcome::Rejected)
                }
                err => Ok(Outcome::Fatal(err)),
            }
        }
    }
}

/// Handshakes and authenticates the selected upstream. On any error
/// the upstream stream is dropped before returning.
async fn connect_upstream(
    upstream: Upstream,
    banners: &mut Vec<String>,
) -> PiperResult<AcceptedUpstream> {
    let Upstream { conn, config } = upstream;
    let mut transport =
        Transport::client_handshake(conn, &config.version, &config.host_key_verifier).await?;
    client::authenticate(&mut transport, &config, banners).await?;
    Ok(AcceptedUpstream {
        transport,
        user: config.user,
    })
}

/// Drives one keyboard-interactive callback, serving its prompts to
/// the downstream as they are issued.
async fn run_keyboard_interactive(
    downstream: &mut Transport,
    callback: &crate::piper::KeyboardInteractiveCallback,
    meta: &ConnMetadata,
    ctx: &ChallengeCtxRef,
) -> PiperResult<Upstream> {
    let (tx, mut rx) = mpsc::channel(1);
    let challenge = KeyboardInteractiveChallenge::new(tx);
    let mut callback_future = callback(meta.clone(), challenge, ctx.clone());

    let mut fatal = None;
    let mut challenge_closed = false;
    let result = loop {
        if challenge_closed {
            // The callback dropped its challenge handle; nothing more
            // to serve, just let it finish.
            break (&mut callback_future).await;
        }

        tokio::select! {
            result = &mut callback_future => break result,
            request = rx.recv() => match request {
                Some(request) => {
                    match serve_challenge(
                        downstream,
                        &request.name,
                        &request.instruction,
                        &request.prompts,
                    )
                    .await
                    {
                        Ok(answers) => {
                            let _ = request.reply.send(Ok(answers));
                        }
                        Err(err) => {
                            // Let the callback observe the abort and
                            // unwind; the transport error wins.
                            let _ = request.reply.send(Err(PiperError::Protocol(
                                "keyboard-interactive challenge aborted".to_string(),
                            )));
                            fatal = Some(err);
                        }
                    }
                }
                None => challenge_closed = true,
            },
        }
    };

    match fatal {
        Some(err) => Err(err),
        None => result,
    }
}

/// One prompt round trip: USERAUTH_INFO_REQUEST out,
/// USERAUTH_INFO_RESPONSE back.
async fn serve_challenge(
    downstream: &mut Transport,
    name: &str,
    instruction: &str,
    prompts: &[(String, bool)],
) -> PiperResult<Vec<String>> {
    let request = InfoRequest::new(name, instruction, prompts.to_vec());
    downstream.write_packet(&request.to_bytes()).await?;

    let payload = downstream.read_packet().await?;
    if payload.first() != Some(&(MessageType::UserauthInfoResponse as u8)) {
        return Err(PiperError::Protocol(format!(
            "expected SSH_MSG_USERAUTH_INFO_RESPONSE, got {:?}",
            payload.first()
        )));
    }

    let response = InfoResponse::from_bytes(&payload)?;
    if response.answers().len() != prompts.len() {
        return Err(PiperError::Protocol(format!(
            "{} answers for {} prompts",
            response.answers().len(),
            prompts.len()
        )));
    }
    Ok(response.into_answers())
}

fn allowed_methods(
    config: &PiperConfig,
    meta: &ConnMetadata,
    ctx: &ChallengeCtxRef,
) -> PiperResult<Vec<AuthMethodKind>> {
    match &config.next_auth_methods {
        Some(callback) => callback(meta, ctx),
        None => Ok(config.enabled_methods()),
    }
}

fn method_kind(method: &AuthMethod) -> AuthMethodKind {
    match method {
        AuthMethod::None => AuthMethodKind::None,
        AuthMethod::Password(_) => AuthMethodKind::Password,
        AuthMethod::PublicKey { .. } => AuthMethodKind::PublicKey,
        AuthMethod::KeyboardInteractive { .. } => AuthMethodKind::KeyboardInteractive,
    }
}

/// Sends USERAUTH_FAILURE with the allowed continuation list. "none"
/// is never advertised (RFC 4252 Section 5.2).
async fn send_failure(
    downstream: &mut Transport,
    allowed: &[AuthMethodKind],
) -> PiperResult<()> {
    let methods: Vec<String> = allowed
        .iter()
        .filter(|kind| **kind != AuthMethodKind::None)
        .map(|kind| kind.name().to_string())
        .collect();
    downstream
        .write_packet(&AuthFailure::new(methods, false).to_bytes())
        .await
}

fn check_attempts(attempts: u32, config: &PiperConfig) -> PiperResult<()> {
    if attempts >= config.max_auth_attempts {
        return Err(PiperError::AuthRejected(format!(
            "no successful auth after {} attempts",
            attempts
        )));
    }
    Ok(())
}

async fn relay_banners(
    downstream: &mut Transport,
    config: &PiperConfig,
    banners: Vec<String>,
) -> PiperResult<()> {
    for banner in banners {
        let text = match &config.banner_callback {
            Some(policy) => match policy(banner) {
                Some(text) => text,
                None => continue,
            },
            None => banner,
        };
        downstream
            .write_packet(&AuthBanner::new(text).to_bytes())
            .await?;
    }
    Ok(())
}
