//! End-to-end tests for the piper: a simulated downstream client and a
//! simulated upstream server talk through a piped session over
//! in-memory duplex pipes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sshpiper_platform::{PiperError, PiperResult};
use sshpiper_proto::piper::{
    AuthMethodKind, ChallengeContext, ClientAuthMethod, ClientConfig, PiperConfig, PiperConn,
    Upstream,
};
use sshpiper_proto::ssh::channel::{
    ChannelClose, ChannelData, ChannelEof, ChannelOpen, ChannelOpenConfirmation,
};
use sshpiper_proto::ssh::client::{self, KeyboardInteractiveResponder};
use sshpiper_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use sshpiper_proto::ssh::message::MessageType;
use sshpiper_proto::ssh::server::{KeyboardInteractiveAuth, ServerConfig, ServerConn};
use sshpiper_proto::ssh::transport::{SshStream, Transport};
use tokio::time::{timeout, Duration};

fn pipe() -> (Box<dyn SshStream>, Box<dyn SshStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(a), Box::new(b))
}

fn test_host_key() -> Arc<dyn HostKey> {
    Arc::new(Ed25519HostKey::generate().unwrap())
}

/// Spawns a piper serving one connection and returns the downstream's
/// end of the pipe plus the piper task handle.
fn dial_piper(
    config: PiperConfig,
) -> (
    Box<dyn SshStream>,
    tokio::task::JoinHandle<PiperResult<()>>,
) {
    let (downstream_side, piper_side) = pipe();
    let handle = tokio::spawn(async move {
        let conn = PiperConn::new(piper_side, None, Arc::new(config)).await?;
        conn.wait().await
    });
    (downstream_side, handle)
}

/// Spawns a fake upstream server and returns the piper's end of the
/// pipe. The server authenticates per `config`, then echoes session
/// channel data.
fn dial_upstream(config: ServerConfig) -> Box<dyn SshStream> {
    let (piper_side, server_side) = pipe();
    tokio::spawn(async move {
        if let Ok(conn) = ServerConn::accept(server_side, &config).await {
            let _ = echo_session(conn.into_transport()).await;
        }
    });
    piper_side
}

/// Minimal session-channel echo service.
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
            Some(code) if code == MessageType::ChannelEof as u8 => {
                transport
                    .write_packet(&ChannelEof::new(peer_channel).to_bytes())
                    .await?;
                transport
                    .write_packet(&ChannelClose::new(peer_channel).to_bytes())
                    .await?;
            }
            Some(code) if code == MessageType::ChannelClose as u8 => return Ok(()),
            _ => {}
        }
    }
}

/// Connects and authenticates a downstream client, returning the
/// transport and any banners received.
async fn connect_downstream(
    stream: Box<dyn SshStream>,
    config: ClientConfig,
) -> PiperResult<(Transport, Vec<String>)> {
    let mut transport =
        Transport::client_handshake(stream, "TestClient_1", &config.host_key_verifier).await?;
    let mut banners = Vec::new();
    client::authenticate(&mut transport, &config, &mut banners).await?;
    Ok((transport, banners))
}

/// Opens a session channel, sends `data`, and returns the first data
/// packet that comes back.
async fn session_round_trip(transport: &mut Transport, data: &[u8]) -> PiperResult<Vec<u8>> {
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
        .write_packet(&ChannelData::new(confirmation.sender_channel(), data.to_vec()).to_bytes())
        .await?;

    let reply = loop {
        let payload = transport.read_packet().await?;
        if payload.first() == Some(&(MessageType::ChannelData as u8)) {
            break ChannelData::from_bytes(&payload)?;
        }
    };
    Ok(reply.data().to_vec())
}

#[tokio::test]
async fn test_password_passthrough() {
    let upstream_called = Arc::new(AtomicUsize::new(0));
    let upstream_called_in_cb = upstream_called.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.password_callback = Some(Arc::new(move |meta, password, _ctx| {
        let upstream_called = upstream_called_in_cb.clone();
        Box::pin(async move {
            assert_eq!(meta.user(), "testuser");

            let mut server_config = ServerConfig::new(test_host_key());
            server_config.password_callback = Some(Arc::new(move |user, password| {
                upstream_called.fetch_add(1, Ordering::SeqCst);
                user == "testuser" && password == b"password"
            }));
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::Password(
                    String::from_utf8_lossy(&password).into_owned(),
                )),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    let (_transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(upstream_called.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_username_remap() {
    let upstream_called = Arc::new(AtomicUsize::new(0));
    let upstream_called_in_cb = upstream_called.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.password_callback = Some(Arc::new(move |meta, password, _ctx| {
        let upstream_called = upstream_called_in_cb.clone();
        Box::pin(async move {
            assert_eq!(meta.user(), "testuser");

            let mut server_config = ServerConfig::new(test_host_key());
            server_config.password_callback = Some(Arc::new(move |user, _password| {
                upstream_called.fetch_add(1, Ordering::SeqCst);
                user == "mappedname"
            }));
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname").with_auth(
                    ClientAuthMethod::Password(String::from_utf8_lossy(&password).into_owned()),
                ),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(upstream_called.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_password_to_public_key_substitution() {
    let password_hits = Arc::new(AtomicUsize::new(0));
    let pubkey_hits = Arc::new(AtomicUsize::new(0));

    let upstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let upstream_key_blob = upstream_key.public_key_bytes();

    let password_hits_cb = password_hits.clone();
    let pubkey_hits_cb = pubkey_hits.clone();
    let upstream_key_cb = upstream_key.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.password_callback = Some(Arc::new(move |_meta, password, _ctx| {
        assert_eq!(password, b"mypassword");
        let password_hits = password_hits_cb.clone();
        let pubkey_hits = pubkey_hits_cb.clone();
        let upstream_key = upstream_key_cb.clone();
        let upstream_key_blob = upstream_key_blob.clone();
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.password_callback = Some(Arc::new(move |_user, _password| {
                password_hits.fetch_add(1, Ordering::SeqCst);
                true
            }));
            server_config.public_key_callback = Some(Arc::new(move |_user, blob| {
                pubkey_hits.fetch_add(1, Ordering::SeqCst);
                blob == upstream_key_blob
            }));
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("")
                    .with_auth(ClientAuthMethod::PublicKey(upstream_key)),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::Password("mypassword".to_string()));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        password_hits.load(Ordering::SeqCst),
        0,
        "upstream password callback must not fire"
    );
    assert_eq!(pubkey_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_public_key_to_password_substitution() {
    let password_hits = Arc::new(AtomicUsize::new(0));
    let password_hits_cb = password_hits.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.public_key_callback = Some(Arc::new(move |_meta, _key, _ctx| {
        let password_hits = password_hits_cb.clone();
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.password_callback = Some(Arc::new(move |_user, password| {
                password_hits.fetch_add(1, Ordering::SeqCst);
                password == b"mypassword"
            }));
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("")
                    .with_auth(ClientAuthMethod::Password("mypassword".to_string())),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let downstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::PublicKey(downstream_key));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(password_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_banner_relayed() {
    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.password_callback = Some(Arc::new(move |_meta, _password, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.banner = Some("banner".to_string());
            server_config.password_callback = Some(Arc::new(|user, _password| user == "mappedname"));
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname")
                    .with_auth(ClientAuthMethod::Password("mypassword".to_string())),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    let (_transport, banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(banners, vec!["banner".to_string()]);
}

/// Challenge context for the multi-stage keyboard-interactive test: a
/// user name is only established once the challenge round completes.
#[derive(Default)]
struct ChallengedUser {
    user: Mutex<Option<String>>,
}

impl ChallengeContext for ChallengedUser {
    fn challenged_username(&self) -> Option<String> {
        self.user.lock().unwrap().clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn challenged_user(ctx: &Arc<dyn ChallengeContext>) -> Option<String> {
    ctx.as_any()
        .downcast_ref::<ChallengedUser>()
        .and_then(|c| c.user.lock().unwrap().clone())
}

#[tokio::test]
async fn test_multi_stage_keyboard_interactive() {
    let mut config = PiperConfig::new(vec![test_host_key()]);

    config.create_challenge_context =
        Some(Arc::new(|_meta| Ok(Arc::new(ChallengedUser::default()))));

    config.next_auth_methods = Some(Arc::new(|_meta, ctx| {
        Ok(if challenged_user(ctx).is_some() {
            vec![AuthMethodKind::Password]
        } else {
            vec![AuthMethodKind::KeyboardInteractive]
        })
    }));

    config.keyboard_interactive_callback = Some(Arc::new(|meta, challenge, ctx| {
        Box::pin(async move {
            let answers = challenge
                .prompt(
                    "user",
                    "instruction",
                    &[
                        ("question1".to_string(), true),
                        ("question2".to_string(), true),
                    ],
                )
                .await?;

            if meta.user() == "testuser" && answers == ["answer1", "answer2"] {
                challenge.prompt("user", "motd", &[]).await?;
                let ctx = ctx
                    .as_any()
                    .downcast_ref::<ChallengedUser>()
                    .expect("challenge context type");
                *ctx.user.lock().unwrap() = Some("chal".to_string());
                Err(PiperError::KeyboardInteractiveFinished)
            } else {
                Err(PiperError::UpstreamDial(
                    "keyboard-interactive failed".to_string(),
                ))
            }
        })
    }));

    config.password_callback = Some(Arc::new(|_meta, _password, ctx| {
        Box::pin(async move {
            if challenged_user(&ctx).is_none() {
                return Err(PiperError::UpstreamDial(
                    "waiting for additional challenge".to_string(),
                ));
            }

            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);

    let responder: KeyboardInteractiveResponder = Arc::new(|_name, _instruction, prompts| {
        let answers: HashMap<&str, &str> =
            [("question1", "answer1"), ("question2", "answer2")].into();
        Ok(prompts
            .iter()
            .map(|(prompt, _echo)| answers[prompt.as_str()].to_string())
            .collect())
    });

    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::KeyboardInteractive(responder))
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    let (mut transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    // The piped session must be usable end to end.
    let echoed = timeout(
        Duration::from_secs(5),
        session_round_trip(&mut transport, b"hello"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(echoed, b"hello");
}

#[tokio::test]
async fn test_keyboard_interactive_substitution() {
    let upstream_ki_hits = Arc::new(AtomicUsize::new(0));
    let upstream_ki_hits_cb = upstream_ki_hits.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.keyboard_interactive_callback = Some(Arc::new(move |meta, challenge, _ctx| {
        let upstream_ki_hits = upstream_ki_hits_cb.clone();
        Box::pin(async move {
            assert_eq!(meta.user(), "testuser");

            // Challenge the downstream, then present its answer to the
            // upstream's own keyboard-interactive round.
            let answers = challenge
                .prompt("login", "one-time code", &[("code".to_string(), true)])
                .await?;

            let mut server_config = ServerConfig::new(test_host_key());
            server_config.keyboard_interactive_callback = Some(KeyboardInteractiveAuth {
                prompts: vec![("upstream code".to_string(), true)],
                check: Arc::new(move |user, answers| {
                    upstream_ki_hits.fetch_add(1, Ordering::SeqCst);
                    user == "mappedname" && answers.len() == 1 && answers[0] == "42"
                }),
            });
            let conn = dial_upstream(server_config);

            let relayed = answers[0].clone();
            let responder: KeyboardInteractiveResponder =
                Arc::new(move |_name, _instruction, prompts| {
                    Ok(vec![relayed.clone(); prompts.len()])
                });

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname")
                    .with_auth(ClientAuthMethod::KeyboardInteractive(responder)),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);

    let responder: KeyboardInteractiveResponder =
        Arc::new(|_name, _instruction, prompts| Ok(vec!["42".to_string(); prompts.len()]));
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::KeyboardInteractive(responder));

    let (mut transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(upstream_ki_hits.load(Ordering::SeqCst), 1);

    let echoed = timeout(
        Duration::from_secs(5),
        session_round_trip(&mut transport, b"hello"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(echoed, b"hello");
}

#[tokio::test]
async fn test_pump_hook_rewrites_channel_data() {
    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.no_client_auth_callback = Some(Arc::new(|_meta, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream_side, piper_side) = pipe();
    let piper = tokio::spawn(async move {
        let conn = PiperConn::new(piper_side, None, Arc::new(config)).await?;

        conn.wait_with_hooks(
            // upstream -> downstream: the echoed "654" becomes "abcdefg".
            Some(Arc::new(|payload: Vec<u8>| {
                if payload.first() == Some(&(MessageType::ChannelData as u8)) {
                    let data = ChannelData::from_bytes(&payload)?;
                    assert_eq!(data.data(), b"654");
                    return Ok(ChannelData::new(
                        data.recipient_channel(),
                        b"abcdefg".to_vec(),
                    )
                    .to_bytes());
                }
                Ok(payload)
            })),
            // downstream -> upstream: "123456" becomes "654".
            Some(Arc::new(|payload: Vec<u8>| {
                if payload.first() == Some(&(MessageType::ChannelData as u8)) {
                    let data = ChannelData::from_bytes(&payload)?;
                    assert_eq!(data.data(), b"123456");
                    return Ok(
                        ChannelData::new(data.recipient_channel(), b"654".to_vec()).to_bytes()
                    );
                }
                Ok(payload)
            })),
        )
        .await
    });

    let client_config =
        ClientConfig::insecure("testuser").with_auth(ClientAuthMethod::None);
    let (mut transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream_side, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    let echoed = timeout(
        Duration::from_secs(5),
        session_round_trip(&mut transport, b"123456"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(echoed, b"abcdefg");

    drop(transport);
    let _ = timeout(Duration::from_secs(5), piper).await.unwrap();
}

#[tokio::test]
async fn test_conn_metadata_views() {
    let (meta_tx, meta_rx) = tokio::sync::oneshot::channel();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.no_client_auth_callback = Some(Arc::new(|_meta, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("up").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream_side, piper_side) = pipe();
    tokio::spawn(async move {
        let conn = PiperConn::new(piper_side, None, Arc::new(config)).await?;
        let _ = meta_tx.send((
            conn.downstream_conn_meta().user().to_string(),
            conn.upstream_conn_meta().user().to_string(),
        ));
        conn.wait().await
    });

    let client_config = ClientConfig::insecure("down").with_auth(ClientAuthMethod::None);
    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream_side, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    let (downstream_user, upstream_user) =
        timeout(Duration::from_secs(5), meta_rx).await.unwrap().unwrap();
    assert_eq!(downstream_user, "down");
    assert_eq!(upstream_user, "up");
}

#[tokio::test]
async fn test_disallowed_method_never_reaches_callback() {
    let pubkey_callback_hits = Arc::new(AtomicUsize::new(0));
    let pubkey_hits_cb = pubkey_callback_hits.clone();

    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.next_auth_methods =
        Some(Arc::new(|_meta, _ctx| Ok(vec![AuthMethodKind::Password])));
    config.public_key_callback = Some(Arc::new(move |_meta, _key, _ctx| {
        pubkey_hits_cb.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(PiperError::UpstreamDial("unreachable".to_string())) })
    }));
    config.password_callback = Some(Arc::new(|_meta, _password, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let downstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::PublicKey(downstream_key))
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(pubkey_callback_hits.load(Ordering::SeqCst), 0);
}

/// Challenge context tracking which methods remain allowed, narrowed
/// by upstream auth failures.
struct AuthList {
    allowed: Mutex<Vec<AuthMethodKind>>,
}

impl ChallengeContext for AuthList {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[tokio::test]
async fn test_upstream_failure_masks_method_and_username_stays_mapped() {
    let upstream_users: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let masked: Arc<Mutex<Vec<AuthMethodKind>>> = Arc::new(Mutex::new(Vec::new()));

    let downstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let upstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let upstream_key_blob = upstream_key.public_key_bytes();

    // Every piper callback pipes to this dummy upstream: "none" and
    // password are rejected, the configured public key is accepted.
    let dial_dummy_upstream = {
        let upstream_users = upstream_users.clone();
        let upstream_key_blob = upstream_key_blob.clone();
        move || {
            let upstream_users_pw = upstream_users.clone();
            let upstream_users_pk = upstream_users.clone();
            let upstream_key_blob = upstream_key_blob.clone();

            let mut server_config = ServerConfig::new(test_host_key());
            server_config.password_callback = Some(Arc::new(move |user, _password| {
                upstream_users_pw.lock().unwrap().push(user.to_string());
                false
            }));
            server_config.public_key_callback = Some(Arc::new(move |user, blob| {
                upstream_users_pk.lock().unwrap().push(user.to_string());
                blob == upstream_key_blob
            }));
            dial_upstream(server_config)
        }
    };

    let mut config = PiperConfig::new(vec![test_host_key()]);

    config.create_challenge_context = Some(Arc::new(|_meta| {
        Ok(Arc::new(AuthList {
            allowed: Mutex::new(vec![
                AuthMethodKind::None,
                AuthMethodKind::Password,
                AuthMethodKind::PublicKey,
            ]),
        }))
    }));

    config.next_auth_methods = Some(Arc::new(|_meta, ctx| {
        let list = ctx
            .as_any()
            .downcast_ref::<AuthList>()
            .expect("challenge context type");
        Ok(list.allowed.lock().unwrap().clone())
    }));

    let masked_cb = masked.clone();
    config.upstream_auth_failure_callback = Some(Arc::new(move |_meta, method, _err, ctx| {
        masked_cb.lock().unwrap().push(method);
        let list = ctx
            .as_any()
            .downcast_ref::<AuthList>()
            .expect("challenge context type");
        list.allowed.lock().unwrap().retain(|kind| *kind != method);
    }));

    let dial_none = dial_dummy_upstream.clone();
    config.no_client_auth_callback = Some(Arc::new(move |_meta, _ctx| {
        let conn = dial_none();
        Box::pin(async move {
            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let dial_password = dial_dummy_upstream.clone();
    config.password_callback = Some(Arc::new(move |_meta, password, _ctx| {
        let conn = dial_password();
        Box::pin(async move {
            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname").with_auth(
                    ClientAuthMethod::Password(String::from_utf8_lossy(&password).into_owned()),
                ),
            })
        })
    }));

    let dial_pubkey = dial_dummy_upstream.clone();
    let upstream_key_for_cb = upstream_key.clone();
    config.public_key_callback = Some(Arc::new(move |_meta, _key, _ctx| {
        let conn = dial_pubkey();
        let upstream_key = upstream_key_for_cb.clone();
        Box::pin(async move {
            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("mappedname")
                    .with_auth(ClientAuthMethod::PublicKey(upstream_key)),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::None)
        .with_auth(ClientAuthMethod::Password("badpassword".to_string()))
        .with_auth(ClientAuthMethod::PublicKey(downstream_key));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    // The "none" and password upstreams failed and masked their
    // methods; the public key upstream succeeded.
    assert_eq!(
        masked.lock().unwrap().clone(),
        vec![AuthMethodKind::None, AuthMethodKind::Password]
    );
    // Every upstream auth callback observed the remapped user.
    let users = upstream_users.lock().unwrap().clone();
    assert!(!users.is_empty());
    assert!(users.iter().all(|user| user == "mappedname"));
}

#[tokio::test]
async fn test_closing_downstream_ends_wait() {
    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.no_client_auth_callback = Some(Arc::new(|_meta, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream, piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser").with_auth(ClientAuthMethod::None);
    let (transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    // Closing the downstream must end the pump promptly.
    drop(transport);
    let result = timeout(Duration::from_secs(5), piper).await.unwrap().unwrap();
    assert!(result.is_ok(), "pump should treat peer close as clean EOF");
}

#[tokio::test]
async fn test_plain_data_passes_through_unmodified() {
    let mut config = PiperConfig::new(vec![test_host_key()]);
    config.no_client_auth_callback = Some(Arc::new(|_meta, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let client_config = ClientConfig::insecure("testuser").with_auth(ClientAuthMethod::None);
    let (mut transport, _banners) = timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();

    let echoed = timeout(
        Duration::from_secs(5),
        session_round_trip(&mut transport, b"0000"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(echoed, b"0000");
}

#[tokio::test]
async fn test_callback_dial_failure_keeps_session_alive() {
    let mut config = PiperConfig::new(vec![test_host_key()]);

    // The first method fails to dial; the second succeeds.
    config.public_key_callback = Some(Arc::new(|_meta, _key, _ctx| {
        Box::pin(async { Err(PiperError::UpstreamDial("connection refused".to_string())) })
    }));
    config.password_callback = Some(Arc::new(|_meta, _password, _ctx| {
        Box::pin(async move {
            let mut server_config = ServerConfig::new(test_host_key());
            server_config.no_client_auth = true;
            let conn = dial_upstream(server_config);

            Ok(Upstream {
                conn,
                config: ClientConfig::insecure("").with_auth(ClientAuthMethod::None),
            })
        })
    }));

    let (downstream, _piper) = dial_piper(config);
    let downstream_key = Arc::new(Ed25519HostKey::generate().unwrap());
    let client_config = ClientConfig::insecure("testuser")
        .with_auth(ClientAuthMethod::PublicKey(downstream_key))
        .with_auth(ClientAuthMethod::Password("password".to_string()));

    timeout(
        Duration::from_secs(5),
        connect_downstream(downstream, client_config),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_config_without_callbacks_rejected() {
    let (_downstream, piper) = dial_piper(PiperConfig::new(vec![test_host_key()]));
    let result = timeout(Duration::from_secs(5), piper).await.unwrap().unwrap();
    assert!(matches!(result, Err(PiperError::Config(_))));
}
