//! Curve25519 key exchange and key derivation (RFC 8731, RFC 4253).
//!
//! The proxy negotiates curve25519-sha256 on both halves of a piped
//! connection. Each half runs its own ephemeral exchange, so the two sides
//! never share key material or exchange hashes.
//!
//! # Security
//!
//! - X25519 via `ring`, constant-time
//! - Ephemeral private keys are consumed by the agreement and never exposed

use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use weir_platform::{WeirError, WeirResult};

/// Curve25519 ephemeral key exchange.
///
/// Implements curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731).
pub struct Curve25519Exchange {
    /// Ephemeral secret, consumed by the agreement
    secret: EphemeralPrivateKey,
    /// Our public point (32 bytes)
    public: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new ephemeral exchange.
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::kex_dh::Curve25519Exchange;
    ///
    /// let exchange = Curve25519Exchange::new().unwrap();
    /// assert_eq!(exchange.public_key().len(), 32);
    /// ```
    pub fn new() -> WeirResult<Self> {
        let rng = SystemRandom::new();
        let secret = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| WeirError::Security("X25519 keypair generation failed".to_string()))?;

        let computed = secret
            .compute_public_key()
            .map_err(|_| WeirError::Security("X25519 public key derivation failed".to_string()))?;

        let mut public = [0u8; 32];
        public.copy_from_slice(computed.as_ref());

        Ok(Self { secret, public })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Computes the shared secret, consuming the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] if key agreement fails (e.g. the peer
    /// sent a low-order point).
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::kex_dh::Curve25519Exchange;
    ///
    /// let client = Curve25519Exchange::new().unwrap();
    /// let server = Curve25519Exchange::new().unwrap();
    ///
    /// let client_public = *client.public_key();
    /// let server_public = *server.public_key();
    ///
    /// let client_secret = client.compute_shared_secret(&server_public).unwrap();
    /// let server_secret = server.compute_shared_secret(&client_public).unwrap();
    /// assert_eq!(client_secret, server_secret);
    /// ```
    pub fn compute_shared_secret(self, peer_public: &[u8; 32]) -> WeirResult<Vec<u8>> {
        let peer = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.secret, &peer, |shared| shared.to_vec())
            .map_err(|_| WeirError::Security("Peer supplied an invalid X25519 point".to_string()))
    }
}

/// Derives SSH session keys from the shared secret (RFC 4253 Section 7.2).
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// K is the shared secret (mpint-encoded), H the exchange hash, and
/// session_id the exchange hash of the first key exchange. When more than
/// one hash block is needed the output grows as K1 || K2 || ... with
/// K(n) = HASH(K || H || K1 || ... || K(n-1)).
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let secret = encode_mpint(shared_secret);
    let mut output: Vec<u8> = Vec::with_capacity(key_length + 32);

    while output.len() < key_length {
        let mut digest = Sha256::new();
        digest.update(&secret);
        digest.update(exchange_hash);
        if output.is_empty() {
            digest.update([key_type]);
            digest.update(session_id);
        } else {
            digest.update(&output);
        }
        output.extend_from_slice(&digest.finalize());
    }

    output.truncate(key_length);
    output
}

/// Encodes a big-endian integer as an SSH mpint (RFC 4251 Section 5).
///
/// Format: uint32 length + magnitude bytes, with a leading 0x00 whenever the
/// high bit of the magnitude is set. Zero encodes as length 0.
pub(crate) fn encode_mpint(value: &[u8]) -> Vec<u8> {
    let first_nonzero = value
        .iter()
        .position(|&byte| byte != 0)
        .unwrap_or(value.len());
    let magnitude = &value[first_nonzero..];

    let mut out = Vec::with_capacity(4 + magnitude.len() + 1);
    if magnitude.is_empty() {
        out.extend_from_slice(&0u32.to_be_bytes());
        return out;
    }

    let sign_pad = magnitude[0] & 0x80 != 0;
    out.extend_from_slice(&((magnitude.len() + usize::from(sign_pad)) as u32).to_be_bytes());
    if sign_pad {
        out.push(0x00);
    }
    out.extend_from_slice(magnitude);
    out
}
