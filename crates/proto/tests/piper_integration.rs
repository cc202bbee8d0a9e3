//! Integration tests for the piped-connection flow.
//!
//! Each test stands up three parties on the loopback interface:
//!
//! - a scripted upstream SSH server built from the crate's server-role
//!   handshake,
//! - the piper itself,
//! - a downstream client built from the client-role handshake.
//!
//! The scripted upstream records every USERAUTH_REQUEST it receives, so the
//! tests can assert on exactly what crossed the proxy: rewritten usernames,
//! substituted keys, fresh signatures.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use weir_platform::{WeirError, WeirResult};
use weir_proto::ssh::auth::{
    construct_signature_data, parse_public_key_payload, AuthFailure, AuthPkOk, AuthRequest,
    AuthSuccess, InfoRequest, InfoResponse, Prompt,
};
use weir_proto::ssh::handshake::{client_handshake, server_handshake};
use weir_proto::ssh::keys::{Ed25519Keypair, PublicKey, Signature, Signer};
use weir_proto::ssh::piper::{
    ChallengeHook, ConnMetadata, KeyMapHook, KeyboardInteractive, PiperConfig, SshPiperConn,
    UpstreamProvider,
};
use weir_proto::ssh::transport::Transport;
use weir_proto::ssh::version::Version;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How the scripted upstream answers one authentication request.
enum Reply {
    Success,
    Failure(&'static [&'static str]),
    /// Acknowledge a publickey query, echoing the key from the request.
    PkOkEcho,
}

/// Spawns a scripted upstream server on a fresh port.
///
/// The task handshakes in the server role, answers authentication requests
/// per `respond`, records every request it sees, and returns its transport
/// once it has sent USERAUTH_SUCCESS.
fn spawn_upstream(
    respond: impl FnMut(&AuthRequest) -> Reply + Send + 'static,
) -> (
    SocketAddr,
    Arc<Mutex<Vec<AuthRequest>>>,
    JoinHandle<WeirResult<Transport>>,
) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(run_upstream(listener, Box::new(respond), recorded));
    (addr, requests, handle)
}

async fn run_upstream(
    listener: std::net::TcpListener,
    mut respond: Box<dyn FnMut(&AuthRequest) -> Reply + Send>,
    recorded: Arc<Mutex<Vec<AuthRequest>>>,
) -> WeirResult<Transport> {
    let listener = TcpListener::from_std(listener).map_err(WeirError::Io)?;
    let (stream, _) = listener.accept().await.map_err(WeirError::Io)?;

    let host_keys: Vec<Arc<dyn Signer>> = vec![Arc::new(Ed25519Keypair::generate())];
    let mut transport =
        server_handshake(stream, &Version::new("TestUpstream_1.0", None), &host_keys).await?;

    loop {
        let payload = transport.read_packet().await?;
        let request = AuthRequest::from_bytes(&payload)?;
        recorded.lock().unwrap().push(request.clone());

        match respond(&request) {
            Reply::Success => {
                transport
                    .write_packet(&AuthSuccess::new().to_bytes())
                    .await?;
                return Ok(transport);
            }
            Reply::Failure(methods) => {
                let failure =
                    AuthFailure::new(methods.iter().map(|m| m.to_string()).collect(), false);
                transport.write_packet(&failure.to_bytes()).await?;
            }
            Reply::PkOkEcho => {
                let parsed = parse_public_key_payload(request.payload())?;
                let ack = AuthPkOk::new(parsed.key.algorithm(), parsed.key.blob().to_vec());
                transport.write_packet(&ack.to_bytes()).await?;
            }
        }
    }
}

/// Upstream provider that dials the scripted upstream and counts its calls.
struct DialProvider {
    addr: SocketAddr,
    mapped: Option<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl UpstreamProvider for DialProvider {
    async fn find_upstream(
        &self,
        _conn: &ConnMetadata,
    ) -> WeirResult<(TcpStream, Option<String>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let socket = TcpStream::connect(self.addr).await.map_err(WeirError::Io)?;
        Ok((socket, self.mapped.clone()))
    }
}

/// Maps every downstream key to one fixed substitute signer.
struct MapToSigner {
    signer: Arc<Ed25519Keypair>,
}

#[async_trait]
impl KeyMapHook for MapToSigner {
    async fn map_public_key(
        &self,
        _conn: &ConnMetadata,
        _key: &PublicKey,
    ) -> WeirResult<Option<Arc<dyn Signer>>> {
        Ok(Some(self.signer.clone() as Arc<dyn Signer>))
    }
}

/// Maps nothing.
struct MapNothing;

#[async_trait]
impl KeyMapHook for MapNothing {
    async fn map_public_key(
        &self,
        _conn: &ConnMetadata,
        _key: &PublicKey,
    ) -> WeirResult<Option<Arc<dyn Signer>>> {
        Ok(None)
    }
}

/// Rejects every downstream without prompting.
struct DenyChallenge;

#[async_trait]
impl ChallengeHook for DenyChallenge {
    async fn additional_challenge(
        &self,
        _conn: &ConnMetadata,
        _challenger: &mut KeyboardInteractive<'_>,
    ) -> WeirResult<bool> {
        Ok(false)
    }
}

/// Asks for a one-time code and accepts "42".
struct CodeChallenge;

#[async_trait]
impl ChallengeHook for CodeChallenge {
    async fn additional_challenge(
        &self,
        _conn: &ConnMetadata,
        challenger: &mut KeyboardInteractive<'_>,
    ) -> WeirResult<bool> {
        let answers = challenger
            .challenge(
                "MFA",
                "Enter your one-time code",
                vec![Prompt {
                    text: "Code: ".to_string(),
                    echo: false,
                }],
            )
            .await?;
        Ok(answers.len() == 1 && answers[0] == "42")
    }
}

fn base_config(provider: DialProvider) -> PiperConfig {
    let mut config = PiperConfig::new(Arc::new(provider));
    config.add_host_key(Arc::new(Ed25519Keypair::generate()));
    config
}

/// Spawns the piper on a fresh port: accept one connection, establish the
/// pipe, then run it. Setup failures come back as `Err`, the pipe's
/// terminating condition as `Ok`.
fn spawn_piper(config: PiperConfig) -> (SocketAddr, JoinHandle<WeirResult<WeirError>>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let listener = TcpListener::from_std(listener).map_err(WeirError::Io)?;
        let (stream, _) = listener.accept().await.map_err(WeirError::Io)?;
        let conn = SshPiperConn::new(stream, &config).await?;
        Ok(conn.wait().await)
    });

    (addr, handle)
}

async fn connect_downstream(addr: SocketAddr) -> Transport {
    let stream = TcpStream::connect(addr).await.unwrap();
    client_handshake(stream, &Version::new("TestClient_1.0", None))
        .await
        .unwrap()
}

/// Builds the method-specific payload of a password request.
fn password_payload(password: &str) -> Vec<u8> {
    let mut payload = vec![0u8]; // not a password change
    payload.extend_from_slice(&(password.len() as u32).to_be_bytes());
    payload.extend_from_slice(password.as_bytes());
    payload
}

/// Builds a signed publickey request bound to the given session ID.
fn signed_publickey_request(
    user: &str,
    keypair: &Ed25519Keypair,
    session_id: &[u8],
) -> (AuthRequest, Signature) {
    let blob = keypair.public_key_blob();
    let data = construct_signature_data(session_id, user, "ssh-connection", "ssh-ed25519", &blob);
    let signature = keypair.sign(&data).unwrap();
    let request = AuthRequest::publickey(user, "ssh-ed25519", &blob, Some(&signature));
    (request, signature)
}

#[tokio::test]
async fn test_password_passthrough_and_pipe() {
    let (upstream_addr, requests, upstream) =
        spawn_upstream(|req| match req.method() {
            "password" => Reply::Success,
            _ => Reply::Failure(&["password"]),
        });

    let calls = Arc::new(AtomicUsize::new(0));
    let config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: Some("alice_mapped".to_string()),
        calls: calls.clone(),
    });
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;

    let payload = password_payload("hunter2");
    let request = AuthRequest::new("alice", "ssh-connection", "password", payload.clone());
    downstream.write_packet(&request.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, AuthSuccess::new().to_bytes());

    // The upstream saw the identical request, user rewritten.
    let mut upstream_transport = timeout(TEST_TIMEOUT, upstream).await.unwrap().unwrap().unwrap();
    {
        let seen = requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user(), "alice_mapped");
        assert_eq!(seen[0].method(), "password");
        assert_eq!(seen[0].payload(), &payload[..]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "FindUpstream runs once");

    // Post-auth traffic is piped opaquely, both directions.
    let channel_open = vec![90u8, 1, 2, 3, 4, 5];
    downstream.write_packet(&channel_open).await.unwrap();
    let piped = timeout(TEST_TIMEOUT, upstream_transport.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(piped, channel_open);

    let channel_reply = vec![91u8, 9, 8, 7];
    upstream_transport.write_packet(&channel_reply).await.unwrap();
    let piped_back = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(piped_back, channel_reply);

    // Downstream hangs up; the pipe reports the close exactly once.
    downstream.close().await;
    drop(downstream);
    let cause = timeout(TEST_TIMEOUT, piper).await.unwrap().unwrap().unwrap();
    assert!(cause.is_closed(), "expected Closed, got {}", cause);
}

#[tokio::test]
async fn test_publickey_resign_signed_path() {
    let (upstream_addr, requests, upstream) = spawn_upstream(|req| match req.method() {
        "publickey" => Reply::Success,
        _ => Reply::Failure(&["publickey"]),
    });

    let substitute = Arc::new(Ed25519Keypair::generate());
    let mut config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: Some("mapped".to_string()),
        calls: Arc::new(AtomicUsize::new(0)),
    });
    config.map_public_key = Some(Arc::new(MapToSigner {
        signer: substitute.clone(),
    }));
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;

    let downstream_key = Ed25519Keypair::generate();
    let (request, downstream_sig) =
        signed_publickey_request("alice", &downstream_key, downstream.session_id());
    downstream.write_packet(&request.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, AuthSuccess::new().to_bytes());

    let upstream_transport = timeout(TEST_TIMEOUT, upstream).await.unwrap().unwrap().unwrap();
    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user(), "mapped");
    assert_eq!(seen[0].method(), "publickey");

    let parsed = parse_public_key_payload(seen[0].payload()).unwrap();
    assert!(!parsed.is_query);
    assert_eq!(parsed.key.blob(), &substitute.public_key_blob()[..]);

    // The forwarded signature is fresh: made by the substitute key over the
    // upstream session ID. The downstream's own signature never crossed.
    let forwarded_sig = parsed.signature.unwrap();
    assert_ne!(forwarded_sig, downstream_sig);

    let expected_data = construct_signature_data(
        upstream_transport.session_id(),
        "mapped",
        "ssh-connection",
        "ssh-ed25519",
        &substitute.public_key_blob(),
    );
    let substitute_public = substitute.public_key().unwrap();
    assert!(substitute_public
        .verify(&expected_data, &forwarded_sig)
        .unwrap());

    drop(seen);
    drop(downstream);
    let _ = timeout(TEST_TIMEOUT, piper).await.unwrap();
}

#[tokio::test]
async fn test_publickey_query_intercepted() {
    let (upstream_addr, requests, upstream) = spawn_upstream(|req| {
        if req.method() != "publickey" {
            return Reply::Failure(&["publickey"]);
        }
        let parsed = parse_public_key_payload(req.payload()).unwrap();
        if parsed.is_query {
            Reply::PkOkEcho
        } else {
            Reply::Success
        }
    });

    let substitute = Arc::new(Ed25519Keypair::generate());
    let mut config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: Some("mapped".to_string()),
        calls: Arc::new(AtomicUsize::new(0)),
    });
    config.map_public_key = Some(Arc::new(MapToSigner {
        signer: substitute.clone(),
    }));
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;
    let downstream_key = Ed25519Keypair::generate();
    let downstream_blob = downstream_key.public_key_blob();

    // Query round: the downstream probes with its own key and must be told
    // that *its own key* is acceptable, even though the upstream only ever
    // saw the substitute.
    let query = AuthRequest::publickey("alice", "ssh-ed25519", &downstream_blob, None);
    downstream.write_packet(&query.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    let ack = AuthPkOk::from_bytes(&reply).unwrap();
    assert_eq!(ack.algorithm(), "ssh-ed25519");
    assert_eq!(ack.public_key(), &downstream_blob[..]);

    // Signed round completes authentication.
    let (signed, _) =
        signed_publickey_request("alice", &downstream_key, downstream.session_id());
    downstream.write_packet(&signed.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, AuthSuccess::new().to_bytes());

    let _upstream_transport = timeout(TEST_TIMEOUT, upstream).await.unwrap().unwrap().unwrap();
    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 2, "one probe, one signed attempt");
    for request in seen.iter() {
        let parsed = parse_public_key_payload(request.payload()).unwrap();
        assert_eq!(
            parsed.key.blob(),
            &substitute.public_key_blob()[..],
            "the downstream key must never reach the upstream"
        );
    }
    assert!(parse_public_key_payload(seen[0].payload()).unwrap().is_query);
    assert!(!parse_public_key_payload(seen[1].payload()).unwrap().is_query);

    drop(seen);
    drop(downstream);
    let _ = timeout(TEST_TIMEOUT, piper).await.unwrap();
}

#[tokio::test]
async fn test_publickey_unmapped_becomes_none() {
    let (upstream_addr, requests, _upstream) = spawn_upstream(|req| match req.method() {
        "none" => Reply::Failure(&["publickey", "password"]),
        _ => Reply::Failure(&["publickey"]),
    });

    let mut config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: Some("mapped".to_string()),
        calls: Arc::new(AtomicUsize::new(0)),
    });
    config.map_public_key = Some(Arc::new(MapNothing));
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;
    let downstream_key = Ed25519Keypair::generate();
    let (request, _) =
        signed_publickey_request("alice", &downstream_key, downstream.session_id());
    downstream.write_packet(&request.to_bytes()).await.unwrap();

    // The downstream sees whatever the upstream said about the "none"
    // attempt: a plain failure, with no hint that mapping was involved.
    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    let failure = AuthFailure::from_bytes(&reply).unwrap();
    assert_eq!(
        failure.methods_can_continue(),
        &["publickey".to_string(), "password".to_string()]
    );

    {
        let seen = requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method(), "none");
        assert_eq!(seen[0].user(), "mapped");
        assert!(seen[0].payload().is_empty());
    }

    // Give up: the session never authenticates and the piper reports the
    // downstream close.
    downstream.close().await;
    drop(downstream);
    let result = timeout(TEST_TIMEOUT, piper).await.unwrap().unwrap();
    match result {
        Err(e) => assert!(e.is_closed(), "expected Closed, got {}", e),
        Ok(cause) => panic!("pipe should never have started, got {}", cause),
    }
}

#[tokio::test]
async fn test_additional_challenge_failure_aborts_before_lookup() {
    // The upstream should never even be dialed; give the provider a dead
    // address and count calls.
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = base_config(DialProvider {
        addr: "127.0.0.1:1".parse().unwrap(),
        mapped: None,
        calls: calls.clone(),
    });
    config.additional_challenge = Some(Arc::new(DenyChallenge));
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;

    // Any first method gets herded toward keyboard-interactive.
    let request = AuthRequest::new(
        "alice",
        "ssh-connection",
        "password",
        password_payload("pw"),
    );
    downstream.write_packet(&request.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    let failure = AuthFailure::from_bytes(&reply).unwrap();
    assert_eq!(
        failure.methods_can_continue(),
        &["keyboard-interactive".to_string()]
    );

    let kbdint = AuthRequest::new("alice", "ssh-connection", "keyboard-interactive", vec![]);
    downstream.write_packet(&kbdint.to_bytes()).await.unwrap();

    let result = timeout(TEST_TIMEOUT, piper).await.unwrap().unwrap();
    match result {
        Err(WeirError::Challenge(_)) => {}
        other => panic!("expected ChallengeFailed, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no lookup after a failed challenge");
}

#[tokio::test]
async fn test_additional_challenge_pass_then_password() {
    let (upstream_addr, requests, _upstream) = spawn_upstream(|req| match req.method() {
        "password" => Reply::Success,
        _ => Reply::Failure(&["password"]),
    });

    let mut config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: Some("mapped".to_string()),
        calls: Arc::new(AtomicUsize::new(0)),
    });
    config.additional_challenge = Some(Arc::new(CodeChallenge));
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;

    let kbdint = AuthRequest::new("alice", "ssh-connection", "keyboard-interactive", vec![]);
    downstream.write_packet(&kbdint.to_bytes()).await.unwrap();

    // Answer the proxy's own prompt round.
    let prompt_payload = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    let prompt = InfoRequest::from_bytes(&prompt_payload).unwrap();
    assert_eq!(prompt.prompts.len(), 1);
    let answer = InfoResponse {
        answers: vec!["42".to_string()],
    };
    downstream.write_packet(&answer.to_bytes()).await.unwrap();

    // The keyboard-interactive attempt is relayed upstream once the
    // challenge passes; the upstream steers the client to password.
    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    let failure = AuthFailure::from_bytes(&reply).unwrap();
    assert_eq!(failure.methods_can_continue(), &["password".to_string()]);

    let password = AuthRequest::new(
        "alice",
        "ssh-connection",
        "password",
        password_payload("hunter2"),
    );
    downstream.write_packet(&password.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, AuthSuccess::new().to_bytes());

    {
        let seen = requests.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method(), "keyboard-interactive");
        assert_eq!(seen[0].user(), "mapped");
        assert_eq!(seen[1].method(), "password");
        assert_eq!(seen[1].user(), "mapped");
    }

    drop(downstream);
    let _ = timeout(TEST_TIMEOUT, piper).await.unwrap();
}

#[tokio::test]
async fn test_upstream_half_close_ends_pipe() {
    let (upstream_addr, _requests, upstream) = spawn_upstream(|req| match req.method() {
        "password" => Reply::Success,
        _ => Reply::Failure(&["password"]),
    });

    let config = base_config(DialProvider {
        addr: upstream_addr,
        mapped: None,
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let (piper_addr, piper) = spawn_piper(config);

    let mut downstream = connect_downstream(piper_addr).await;
    let request = AuthRequest::new(
        "alice",
        "ssh-connection",
        "password",
        password_payload("pw"),
    );
    downstream.write_packet(&request.to_bytes()).await.unwrap();

    let reply = timeout(TEST_TIMEOUT, downstream.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, AuthSuccess::new().to_bytes());

    // Upstream goes away mid-session.
    let upstream_transport = timeout(TEST_TIMEOUT, upstream).await.unwrap().unwrap().unwrap();
    drop(upstream_transport);

    // wait() reports the close exactly once...
    let cause = timeout(TEST_TIMEOUT, piper).await.unwrap().unwrap().unwrap();
    assert!(cause.is_closed(), "expected Closed, got {}", cause);

    // ...and the teardown reaches the downstream too.
    match timeout(TEST_TIMEOUT, downstream.read_packet()).await.unwrap() {
        Err(WeirError::Closed) => {}
        other => panic!("expected downstream close, got {:?}", other),
    }
}
