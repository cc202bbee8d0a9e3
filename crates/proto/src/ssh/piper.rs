//! The piped-connection coordinator.
//!
//! [`SshPiperConn::new`] drives one proxied session end to end:
//!
//! 1. Server-role handshake on the inbound socket.
//! 2. Read the first downstream USERAUTH_REQUEST; its username becomes the
//!    connection metadata handed to every hook.
//! 3. If an additional challenge is configured, force the downstream onto
//!    keyboard-interactive and run the challenge. Nothing is dialed until
//!    it passes.
//! 4. Ask the [`UpstreamProvider`] for a socket and an optional mapped
//!    username (empty means: keep the downstream's).
//! 5. Client-role handshake on the upstream socket.
//! 6. Run the authentication relay until the upstream accepts.
//!
//! The returned handle then pipes raw packets both ways ([`SshPiperConn::wait`])
//! until either side goes away. The pipe never looks inside a packet:
//! channels, rekeys and disconnects are all just bytes to it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};
use weir_platform::{WeirError, WeirResult};

use crate::ssh::auth::{AuthFailure, InfoRequest, InfoResponse, Prompt};
use crate::ssh::handshake::{client_handshake, server_handshake};
use crate::ssh::keys::{PublicKey, Signer};
use crate::ssh::relay::{next_auth_request, AuthRelay};
use crate::ssh::transport::{Transport, TransportReader, TransportWriter};
use crate::ssh::version::Version;

/// What the proxy knows about a downstream connection when hooks run.
#[derive(Debug, Clone)]
pub struct ConnMetadata {
    user: String,
    remote_addr: SocketAddr,
    session_id: Vec<u8>,
}

impl ConnMetadata {
    /// The username from the downstream's first authentication request.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The downstream's remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The downstream transport's session ID.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }
}

/// Chooses the upstream for a downstream connection. Required.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Returns a connected socket to the chosen upstream and, optionally, a
    /// username to authenticate as. `None` (or an empty string) keeps the
    /// downstream username.
    ///
    /// Called at most once per session, and never before a configured
    /// additional challenge has passed.
    async fn find_upstream(
        &self,
        conn: &ConnMetadata,
    ) -> WeirResult<(TcpStream, Option<String>)>;
}

/// An extra gate in front of upstream selection. Optional.
#[async_trait]
pub trait ChallengeHook: Send + Sync {
    /// Interrogates the downstream through keyboard-interactive prompts.
    /// Returning `false` (or an error) aborts the session before any
    /// upstream contact.
    async fn additional_challenge(
        &self,
        conn: &ConnMetadata,
        challenger: &mut KeyboardInteractive<'_>,
    ) -> WeirResult<bool>;
}

/// Maps a downstream public key to a signing identity for the upstream.
/// Optional; without it, publickey requests pass through untouched (aside
/// from the username).
#[async_trait]
pub trait KeyMapHook: Send + Sync {
    /// Returns the signer to impersonate the downstream key with, or `None`
    /// if the key has no mapping.
    ///
    /// May be called twice for the same key - once for the query round and
    /// once for the signed attempt - and must return signers for the same
    /// public key both times.
    async fn map_public_key(
        &self,
        conn: &ConnMetadata,
        key: &PublicKey,
    ) -> WeirResult<Option<Arc<dyn Signer>>>;
}

/// Drives keyboard-interactive prompt rounds on the downstream transport
/// on behalf of a [`ChallengeHook`] (RFC 4256).
pub struct KeyboardInteractive<'a> {
    transport: &'a mut Transport,
}

impl<'a> KeyboardInteractive<'a> {
    fn new(transport: &'a mut Transport) -> Self {
        Self { transport }
    }

    /// Sends one prompt round and collects the answers.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] if the downstream answers with the
    /// wrong message or the wrong number of answers.
    pub async fn challenge(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: Vec<Prompt>,
    ) -> WeirResult<Vec<String>> {
        let expected = prompts.len();
        let request = InfoRequest {
            name: name.to_string(),
            instruction: instruction.to_string(),
            prompts,
        };
        self.transport.write_packet(&request.to_bytes()).await?;

        let payload = self.transport.read_packet().await?;
        let response = InfoResponse::from_bytes(&payload)?;
        if response.answers.len() != expected {
            return Err(WeirError::Protocol(format!(
                "Expected {} keyboard-interactive answers, got {}",
                expected,
                response.answers.len()
            )));
        }

        Ok(response.answers)
    }
}

/// Configuration for accepting piped connections.
pub struct PiperConfig {
    /// Banner announced to the downstream and upstream.
    pub version: Version,
    /// Host keys presented to downstream clients.
    host_keys: Vec<Arc<dyn Signer>>,
    /// Upstream selection. Required.
    upstream: Arc<dyn UpstreamProvider>,
    /// Pre-upstream challenge. Optional.
    pub additional_challenge: Option<Arc<dyn ChallengeHook>>,
    /// Publickey substitution. Optional.
    pub map_public_key: Option<Arc<dyn KeyMapHook>>,
}

impl PiperConfig {
    /// Creates a configuration around the one required hook.
    pub fn new(upstream: Arc<dyn UpstreamProvider>) -> Self {
        Self {
            version: Version::default_weir(),
            host_keys: Vec::new(),
            upstream,
            additional_challenge: None,
            map_public_key: None,
        }
    }

    /// Adds a host key. A key whose algorithm matches an existing one
    /// replaces it. At least one host key is required to accept
    /// connections.
    pub fn add_host_key(&mut self, key: Arc<dyn Signer>) {
        for existing in self.host_keys.iter_mut() {
            if existing.algorithm_name() == key.algorithm_name() {
                *existing = key;
                return;
            }
        }
        self.host_keys.push(key);
    }

    /// Returns the configured host keys.
    pub fn host_keys(&self) -> &[Arc<dyn Signer>] {
        &self.host_keys
    }
}

impl std::fmt::Debug for PiperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiperConfig")
            .field("version", &self.version)
            .field("host_keys", &self.host_keys.len())
            .field(
                "additional_challenge",
                &self.additional_challenge.as_ref().map(|_| "<hook>"),
            )
            .field(
                "map_public_key",
                &self.map_public_key.as_ref().map(|_| "<hook>"),
            )
            .finish()
    }
}

/// A piped SSH connection: the downstream has been authenticated by the
/// upstream (and by the additional challenge, if any), and both transports
/// are ready for the packet pipe.
pub struct SshPiperConn {
    downstream: Transport,
    upstream: Transport,
    meta: ConnMetadata,
}

impl SshPiperConn {
    /// Accepts one downstream connection and establishes the full pipe as
    /// described in the module docs.
    ///
    /// On any failure both sockets are closed and the error is returned;
    /// nothing of the session survives.
    pub async fn new(stream: TcpStream, config: &PiperConfig) -> WeirResult<Self> {
        let remote_addr = stream.peer_addr().map_err(WeirError::Io)?;

        let mut downstream =
            server_handshake(stream, &config.version, config.host_keys()).await?;

        let mut first = next_auth_request(&mut downstream).await?;
        let meta = ConnMetadata {
            user: first.user().to_string(),
            remote_addr,
            session_id: downstream.session_id().to_vec(),
        };
        debug!(user = %meta.user(), addr = %remote_addr, "downstream authenticated request received");

        // The challenge gate runs before any upstream contact. The
        // downstream is pushed onto keyboard-interactive by answering every
        // other method with a failure that only offers it.
        if let Some(challenge) = &config.additional_challenge {
            let only_kbdint =
                AuthFailure::new(vec!["keyboard-interactive".to_string()], false);
            while first.method() != "keyboard-interactive" {
                downstream.write_packet(&only_kbdint.to_bytes()).await?;
                first = next_auth_request(&mut downstream).await?;
            }

            let mut challenger = KeyboardInteractive::new(&mut downstream);
            let passed = challenge
                .additional_challenge(&meta, &mut challenger)
                .await
                .map_err(|e| WeirError::Challenge(e.to_string()))?;
            if !passed {
                return Err(WeirError::Challenge(
                    "additional challenge failed".to_string(),
                ));
            }
            debug!(user = %meta.user(), "additional challenge passed");
        }

        let (upstream_socket, mapped) = config
            .upstream
            .find_upstream(&meta)
            .await
            .map_err(|e| WeirError::Lookup(e.to_string()))?;

        let mapped_user = match mapped {
            Some(user) if !user.is_empty() => user,
            _ => meta.user().to_string(),
        };

        let mut upstream = client_handshake(upstream_socket, &config.version).await?;

        AuthRelay::new(
            &mut downstream,
            &mut upstream,
            mapped_user.clone(),
            config.map_public_key.clone(),
            &meta,
        )
        .run(first)
        .await?;

        info!(
            user = %meta.user(),
            mapped_user = %mapped_user,
            addr = %remote_addr,
            "piped connection established"
        );

        Ok(Self {
            downstream,
            upstream,
            meta,
        })
    }

    /// Returns the downstream connection metadata.
    pub fn metadata(&self) -> &ConnMetadata {
        &self.meta
    }

    /// Pipes packets both ways until either side fails or closes, then
    /// tears down both transports and returns the terminating condition.
    /// A clean EOF surfaces as [`WeirError::Closed`].
    pub async fn wait(self) -> WeirError {
        let SshPiperConn {
            downstream,
            upstream,
            meta,
        } = self;

        let (down_rd, down_wr) = downstream.into_split();
        let (up_rd, up_wr) = upstream.into_split();

        let mut down_to_up = tokio::spawn(copy_packets(down_rd, up_wr));
        let mut up_to_down = tokio::spawn(copy_packets(up_rd, down_wr));

        // First copier to stop wins; the other is cancelled and its halves
        // dropped, which closes whatever the winner's shutdown left open.
        let err = tokio::select! {
            res = &mut down_to_up => {
                up_to_down.abort();
                let _ = (&mut up_to_down).await;
                flatten(res)
            }
            res = &mut up_to_down => {
                down_to_up.abort();
                let _ = (&mut down_to_up).await;
                flatten(res)
            }
        };

        debug!(user = %meta.user(), cause = %err, "packet pipe shut down");
        err
    }

    /// Tears the pipe down without running it.
    pub async fn close(mut self) {
        self.downstream.close().await;
        self.upstream.close().await;
    }
}

/// One direction of the packet pipe: read a packet, write it, repeat.
///
/// No parsing, no logging of contents. On a read failure the destination's
/// write side is shut down so the opposite copier fails promptly too.
async fn copy_packets(mut src: TransportReader, mut dst: TransportWriter) -> WeirError {
    loop {
        let packet = match src.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                dst.close().await;
                return e;
            }
        };
        if let Err(e) = dst.write_packet(&packet).await {
            return e;
        }
    }
}

fn flatten(res: Result<WeirError, tokio::task::JoinError>) -> WeirError {
    match res {
        Ok(err) => err,
        Err(join) => WeirError::Other(Box::new(join)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::keys::Ed25519Keypair;

    struct RejectAll;

    #[async_trait]
    impl UpstreamProvider for RejectAll {
        async fn find_upstream(
            &self,
            _conn: &ConnMetadata,
        ) -> WeirResult<(TcpStream, Option<String>)> {
            Err(WeirError::Lookup("no upstream for anyone".to_string()))
        }
    }

    #[test]
    fn test_add_host_key_replaces_same_algorithm() {
        let mut config = PiperConfig::new(Arc::new(RejectAll));

        let first = Arc::new(Ed25519Keypair::generate());
        let second = Arc::new(Ed25519Keypair::generate());
        let first_blob = first.public_key_blob();

        config.add_host_key(first);
        assert_eq!(config.host_keys().len(), 1);

        config.add_host_key(second.clone());
        assert_eq!(config.host_keys().len(), 1, "same algorithm must replace");
        assert_ne!(config.host_keys()[0].public_key_blob(), first_blob);
        assert_eq!(
            config.host_keys()[0].public_key_blob(),
            second.public_key_blob()
        );
    }

    #[test]
    fn test_config_debug_hides_hooks() {
        let mut config = PiperConfig::new(Arc::new(RejectAll));
        config.add_host_key(Arc::new(Ed25519Keypair::generate()));
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("host_keys: 1"));
        assert!(!rendered.contains("Ed25519"));
    }
}
