//! Transport establishment for one half of a piped connection.
//!
//! Each proxied flow needs two handshakes: a server-role one toward the
//! downstream client and a client-role one toward the upstream server. Both
//! run version exchange, Curve25519 key exchange and the `ssh-userauth`
//! service negotiation, then stop dead: no userauth message is read or
//! written here. The authentication relay takes over from that point.
//!
//! Any failure closes the socket (by dropping it) and surfaces as
//! [`WeirError::Handshake`] tagged with the side that failed.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use weir_platform::{HandshakeSide, WeirError, WeirResult};

use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
use crate::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
use crate::ssh::kex_dh::{derive_key, encode_mpint, Curve25519Exchange};
use crate::ssh::keys::{read_string, write_string, PublicKey, Signature, Signer};
use crate::ssh::message::MessageType;
use crate::ssh::transport::{ServiceAccept, ServiceRequest, Transport, SERVICE_USERAUTH};
use crate::ssh::version::Version;

/// Runs the server-role handshake toward a downstream client.
///
/// 1. Banner exchange
/// 2. KEXINIT + Curve25519 key exchange, signing H with the negotiated
///    host key
/// 3. NEWKEYS, key installation
/// 4. Read SERVICE_REQUEST, require "ssh-userauth", reply SERVICE_ACCEPT
///
/// Stops before userauth. The first SSH_MSG_USERAUTH_REQUEST is still in
/// the returned transport.
pub async fn server_handshake(
    stream: TcpStream,
    version: &Version,
    host_keys: &[Arc<dyn Signer>],
) -> WeirResult<Transport> {
    run_server(stream, version, host_keys)
        .await
        .map_err(|e| WeirError::handshake(HandshakeSide::Downstream, e))
}

/// Runs the client-role handshake toward an upstream server.
///
/// 1. Banner exchange
/// 2. KEXINIT + Curve25519 key exchange, verifying the upstream's host key
///    signature over H
/// 3. NEWKEYS, key installation
/// 4. Send SERVICE_REQUEST("ssh-userauth"), read SERVICE_ACCEPT
///
/// Stops before userauth: no USERAUTH_REQUEST is sent here.
pub async fn client_handshake(stream: TcpStream, version: &Version) -> WeirResult<Transport> {
    run_client(stream, version)
        .await
        .map_err(|e| WeirError::handshake(HandshakeSide::Upstream, e))
}

async fn run_server(
    mut stream: TcpStream,
    version: &Version,
    host_keys: &[Arc<dyn Signer>],
) -> WeirResult<Transport> {
    if host_keys.is_empty() {
        return Err(WeirError::Config("No host keys configured".to_string()));
    }

    let server_version = format!("{}", version);
    let peer = exchange_versions(&mut stream, version).await?;
    let client_version = format!("{}", peer);
    debug!(peer = %client_version, "downstream version exchanged");

    let mut transport = Transport::new(stream);

    // KEXINIT, advertising exactly the configured host key algorithms.
    let our_kexinit = KexInit::new_default().with_server_host_key_algorithms(
        host_keys
            .iter()
            .map(|k| k.algorithm_name().to_string())
            .collect(),
    );
    let server_kexinit_payload = our_kexinit.to_bytes();
    transport.write_packet(&server_kexinit_payload).await?;

    let client_kexinit_payload = transport.read_packet().await?;
    let peer_kexinit = KexInit::from_bytes(&client_kexinit_payload)?;

    let kex_alg = negotiate_algorithm(peer_kexinit.kex_algorithms(), our_kexinit.kex_algorithms())?;
    require_curve25519(&kex_alg)?;

    let hostkey_alg = negotiate_algorithm(
        peer_kexinit.server_host_key_algorithms(),
        our_kexinit.server_host_key_algorithms(),
    )?;
    let host_key = host_keys
        .iter()
        .find(|k| k.algorithm_name() == hostkey_alg)
        .ok_or_else(|| {
            WeirError::Config(format!("No host key for negotiated '{}'", hostkey_alg))
        })?;

    let cipher_c2s = negotiate_cipher(
        peer_kexinit.encryption_client_to_server(),
        our_kexinit.encryption_client_to_server(),
    )?;
    let cipher_s2c = negotiate_cipher(
        peer_kexinit.encryption_server_to_client(),
        our_kexinit.encryption_server_to_client(),
    )?;
    debug!(kex = %kex_alg, hostkey = %hostkey_alg, "downstream algorithms negotiated");

    // Curve25519: receive the client's ephemeral key, reply with ours plus
    // a host key signature over the exchange hash.
    let init_payload = transport.read_packet().await?;
    let client_public = parse_kexdh_init(&init_payload)?;

    let our_exchange = Curve25519Exchange::new()?;
    let server_public = *our_exchange.public_key();
    let shared_secret = our_exchange.compute_shared_secret(&client_public)?;

    let host_key_blob = host_key.public_key_blob();
    let exchange_hash = compute_exchange_hash(
        &client_version,
        &server_version,
        &client_kexinit_payload,
        &server_kexinit_payload,
        &host_key_blob,
        &client_public,
        &server_public,
        &shared_secret,
    );

    let signature = host_key.sign(&exchange_hash)?;

    let mut reply = vec![MessageType::KexdhReply as u8];
    write_string(&mut reply, &host_key_blob);
    write_string(&mut reply, &server_public);
    write_string(&mut reply, &signature.to_wire());
    transport.write_packet(&reply).await?;

    // NEWKEYS: client first, then us.
    expect_newkeys(transport.read_packet().await?)?;
    transport.write_packet(&NewKeys::new().to_bytes()).await?;

    install_transport_keys(
        &mut transport,
        &shared_secret,
        &exchange_hash,
        cipher_c2s,
        cipher_s2c,
        false,
    )?;
    transport.set_session_id(exchange_hash);

    // Service negotiation: the client must ask for ssh-userauth before
    // anything else.
    let request = ServiceRequest::from_bytes(&transport.read_packet().await?)?;
    if request.service() != SERVICE_USERAUTH {
        return Err(WeirError::Protocol(format!(
            "Service '{}' requested before authentication",
            request.service()
        )));
    }
    transport
        .write_packet(&ServiceAccept::new(SERVICE_USERAUTH).to_bytes())
        .await?;

    Ok(transport)
}

async fn run_client(mut stream: TcpStream, version: &Version) -> WeirResult<Transport> {
    let client_version = format!("{}", version);
    let peer = exchange_versions(&mut stream, version).await?;
    let server_version = format!("{}", peer);
    debug!(peer = %server_version, "upstream version exchanged");

    let mut transport = Transport::new(stream);

    let our_kexinit = KexInit::new_default();
    let client_kexinit_payload = our_kexinit.to_bytes();
    transport.write_packet(&client_kexinit_payload).await?;

    let server_kexinit_payload = transport.read_packet().await?;
    let peer_kexinit = KexInit::from_bytes(&server_kexinit_payload)?;

    let kex_alg = negotiate_algorithm(our_kexinit.kex_algorithms(), peer_kexinit.kex_algorithms())?;
    require_curve25519(&kex_alg)?;

    let cipher_c2s = negotiate_cipher(
        our_kexinit.encryption_client_to_server(),
        peer_kexinit.encryption_client_to_server(),
    )?;
    let cipher_s2c = negotiate_cipher(
        our_kexinit.encryption_server_to_client(),
        peer_kexinit.encryption_server_to_client(),
    )?;

    // Curve25519: send our ephemeral key, read the server's reply.
    let our_exchange = Curve25519Exchange::new()?;
    let client_public = *our_exchange.public_key();

    let mut init = vec![MessageType::KexdhInit as u8];
    write_string(&mut init, &client_public);
    transport.write_packet(&init).await?;

    let reply_payload = transport.read_packet().await?;
    let (host_key_blob, server_public, signature) = parse_kexdh_reply(&reply_payload)?;

    let shared_secret = our_exchange.compute_shared_secret(&server_public)?;
    let exchange_hash = compute_exchange_hash(
        &client_version,
        &server_version,
        &client_kexinit_payload,
        &server_kexinit_payload,
        &host_key_blob,
        &client_public,
        &server_public,
        &shared_secret,
    );

    // Verify the server's proof of possession. Upstream selection is the
    // host's policy decision, so the key itself is accepted as presented;
    // the fingerprint goes to the log.
    let host_key = PublicKey::from_wire(&host_key_blob)?;
    if !host_key.verify(&exchange_hash, &signature)? {
        return Err(WeirError::Security(
            "Host key signature verification failed".to_string(),
        ));
    }
    debug!(fingerprint = %host_key.fingerprint(), "upstream host key verified");

    // NEWKEYS: we send first, then read the server's.
    transport.write_packet(&NewKeys::new().to_bytes()).await?;
    expect_newkeys(transport.read_packet().await?)?;

    install_transport_keys(
        &mut transport,
        &shared_secret,
        &exchange_hash,
        cipher_c2s,
        cipher_s2c,
        true,
    )?;
    transport.set_session_id(exchange_hash);

    // Ask for ssh-userauth and stop there.
    transport
        .write_packet(&ServiceRequest::new(SERVICE_USERAUTH).to_bytes())
        .await?;
    let accept = ServiceAccept::from_bytes(&transport.read_packet().await?)?;
    if accept.service() != SERVICE_USERAUTH {
        return Err(WeirError::Protocol(format!(
            "Server accepted unexpected service '{}'",
            accept.service()
        )));
    }

    Ok(transport)
}

/// Sends our identification line and reads the peer's.
async fn exchange_versions(stream: &mut TcpStream, ours: &Version) -> WeirResult<Version> {
    stream
        .write_all(&ours.to_wire_format())
        .await
        .map_err(WeirError::Io)?;

    // Read the peer's line one byte at a time up to the LF. RFC 4253 caps
    // the identification line at 255 characters including CR LF.
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    while line.last() != Some(&b'\n') {
        if line.len() > 255 {
            return Err(WeirError::Protocol(
                "Peer identification line exceeds 255 bytes".to_string(),
            ));
        }
        stream.read_exact(&mut byte).await.map_err(WeirError::Io)?;
        line.push(byte[0]);
    }

    Version::parse(&String::from_utf8_lossy(&line))
}

fn require_curve25519(kex_alg: &str) -> WeirResult<()> {
    if kex_alg == "curve25519-sha256" || kex_alg == "curve25519-sha256@libssh.org" {
        Ok(())
    } else {
        Err(WeirError::Protocol(format!(
            "Negotiated KEX '{}' is not a curve25519 variant",
            kex_alg
        )))
    }
}

fn negotiate_cipher(
    client_list: &[String],
    server_list: &[String],
) -> WeirResult<CipherAlgorithm> {
    let name = negotiate_algorithm(client_list, server_list)?;
    CipherAlgorithm::from_name(&name)
        .ok_or_else(|| WeirError::Protocol(format!("Unsupported cipher: {}", name)))
}

/// Parses SSH_MSG_KEXDH_INIT: the client's 32-byte ephemeral public key.
fn parse_kexdh_init(payload: &[u8]) -> WeirResult<[u8; 32]> {
    if payload.is_empty() || payload[0] != MessageType::KexdhInit as u8 {
        return Err(WeirError::Protocol(
            "First KEX packet is not SSH_MSG_KEX_ECDH_INIT".to_string(),
        ));
    }

    let mut offset = 1;
    let public = read_string(payload, &mut offset)?;
    if public.len() != 32 {
        return Err(WeirError::Protocol(format!(
            "X25519 public key must be 32 bytes, got {}",
            public.len()
        )));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&public);
    Ok(out)
}

/// Parses SSH_MSG_KEXDH_REPLY: host key blob, server ephemeral key,
/// signature over the exchange hash.
fn parse_kexdh_reply(payload: &[u8]) -> WeirResult<(Vec<u8>, [u8; 32], Signature)> {
    if payload.is_empty() || payload[0] != MessageType::KexdhReply as u8 {
        return Err(WeirError::Protocol(
            "Reply is not SSH_MSG_KEX_ECDH_REPLY".to_string(),
        ));
    }

    let mut offset = 1;
    let host_key_blob = read_string(payload, &mut offset)?;
    let server_public_bytes = read_string(payload, &mut offset)?;
    let signature_wire = read_string(payload, &mut offset)?;

    if server_public_bytes.len() != 32 {
        return Err(WeirError::Protocol(format!(
            "X25519 public key must be 32 bytes, got {}",
            server_public_bytes.len()
        )));
    }
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&server_public_bytes);

    let signature = Signature::from_wire(&signature_wire)?;

    Ok((host_key_blob, server_public, signature))
}

fn expect_newkeys(payload: Vec<u8>) -> WeirResult<()> {
    NewKeys::from_bytes(&payload).map(|_| ())
}

/// Computes the exchange hash H (RFC 4253 Section 8):
///
/// ```text
/// H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)
/// ```
///
/// where versions, KEXINIT payloads, host key blob and ephemeral keys are
/// length-prefixed strings and K is an mpint.
#[allow(clippy::too_many_arguments)]
fn compute_exchange_hash(
    client_version: &str,
    server_version: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();

    let hash_string = |h: &mut Sha256, s: &[u8]| {
        h.update((s.len() as u32).to_be_bytes());
        h.update(s);
    };

    hash_string(&mut hasher, client_version.trim_end_matches("\r\n").as_bytes());
    hash_string(&mut hasher, server_version.trim_end_matches("\r\n").as_bytes());
    hash_string(&mut hasher, client_kexinit);
    hash_string(&mut hasher, server_kexinit);
    hash_string(&mut hasher, host_key_blob);
    hash_string(&mut hasher, client_public);
    hash_string(&mut hasher, server_public);
    hasher.update(encode_mpint(shared_secret));

    hasher.finalize().to_vec()
}

/// Derives directional keys and installs them on the transport.
///
/// The c2s key encrypts what the client sends, so which derived key goes
/// into the sealing slot depends on the role.
fn install_transport_keys(
    transport: &mut Transport,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    cipher_c2s: CipherAlgorithm,
    cipher_s2c: CipherAlgorithm,
    is_client: bool,
) -> WeirResult<()> {
    // The session id equals H on the first (and, for the proxy, only)
    // exchange of each transport.
    let session_id = exchange_hash;

    let key_c2s = derive_key(
        shared_secret,
        exchange_hash,
        session_id,
        b'C',
        cipher_c2s.key_size(),
    );
    let key_s2c = derive_key(
        shared_secret,
        exchange_hash,
        session_id,
        b'D',
        cipher_s2c.key_size(),
    );

    let (encryption, decryption) = if is_client {
        (
            EncryptionKey::new(cipher_c2s, &key_c2s)?,
            DecryptionKey::new(cipher_s2c, &key_s2c)?,
        )
    } else {
        (
            EncryptionKey::new(cipher_s2c, &key_s2c)?,
            DecryptionKey::new(cipher_c2s, &key_c2s)?,
        )
    };

    transport.install_keys(encryption, decryption);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::keys::Ed25519Keypair;
    use tokio::net::TcpListener;

    fn test_host_keys() -> Vec<Arc<dyn Signer>> {
        vec![Arc::new(Ed25519Keypair::generate()) as Arc<dyn Signer>]
    }

    async fn handshake_pair() -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host_keys = test_host_keys();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            server_handshake(stream, &Version::default_weir(), &host_keys).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = client_handshake(stream, &Version::default_weir())
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        (server, client)
    }

    #[tokio::test]
    async fn test_handshake_completes_both_roles() {
        let (server, client) = handshake_pair().await;
        assert_eq!(server.session_id().len(), 32);
        assert_eq!(server.session_id(), client.session_id());
    }

    #[tokio::test]
    async fn test_handshake_traffic_flows_encrypted() {
        let (mut server, mut client) = handshake_pair().await;

        client.write_packet(b"after userauth accept").await.unwrap();
        assert_eq!(server.read_packet().await.unwrap(), b"after userauth accept");

        server.write_packet(b"and back").await.unwrap();
        assert_eq!(client.read_packet().await.unwrap(), b"and back");
    }

    #[tokio::test]
    async fn test_independent_handshakes_have_distinct_session_ids() {
        let (one, _keep_one) = handshake_pair().await;
        let (two, _keep_two) = handshake_pair().await;
        assert_ne!(one.session_id(), two.session_id());
    }

    #[tokio::test]
    async fn test_server_handshake_requires_host_keys() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            server_handshake(stream, &Version::default_weir(), &[]).await
        });

        let _client = TcpStream::connect(addr).await.unwrap();
        let result = server.await.unwrap();
        assert!(matches!(result, Err(WeirError::Handshake { .. })));
    }

    #[test]
    fn test_exchange_hash_binds_all_inputs() {
        let base = compute_exchange_hash(
            "SSH-2.0-a",
            "SSH-2.0-b",
            &[1],
            &[2],
            &[3],
            &[4; 32],
            &[5; 32],
            &[6; 32],
        );
        let changed = compute_exchange_hash(
            "SSH-2.0-a",
            "SSH-2.0-b",
            &[1],
            &[2],
            &[3],
            &[4; 32],
            &[5; 32],
            &[7; 32],
        );
        assert_eq!(base.len(), 32);
        assert_ne!(base, changed);
    }

    #[test]
    fn test_parse_kexdh_init_length_check() {
        let mut payload = vec![MessageType::KexdhInit as u8];
        write_string(&mut payload, &[0u8; 16]);
        assert!(parse_kexdh_init(&payload).is_err());

        let mut payload = vec![MessageType::KexdhInit as u8];
        write_string(&mut payload, &[0u8; 32]);
        assert!(parse_kexdh_init(&payload).is_ok());
    }
}
