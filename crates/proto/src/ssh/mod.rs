//! SSH reverse proxy implementation.
//!
//! # Architecture
//!
//! The proxy is layered the way the RFCs split the protocol, with the piper
//! on top:
//!
//! 1. **Packet layer** ([`packet`]) - binary packet protocol (RFC 4253
//!    Section 6)
//! 2. **Transport layer** ([`transport`], [`handshake`], [`kex`],
//!    [`kex_dh`], [`crypto`]) - version exchange, Curve25519 key exchange,
//!    AEAD encryption
//! 3. **Authentication layer** ([`auth`], [`keys`], [`relay`]) - userauth
//!    codecs and the downstream-to-upstream authentication relay
//! 4. **Piper** ([`piper`]) - couples one downstream and one upstream
//!    transport into a piped connection and runs the packet pipe
//!
//! Every proxied flow owns two complete, independent transports. The
//! downstream half speaks in the server role, the upstream half in the
//! client role, and no key material crosses between them. That independence
//! is load-bearing: publickey signatures bind to a transport's session ID,
//! so the relay must verify against one and re-sign against the other.
//!
//! # Security Considerations
//!
//! - All packet parsing validates size limits (max 35000 bytes)
//! - Downstream signatures are verified before anything is re-signed, and
//!   are never forwarded upstream
//! - Verification failures are indistinguishable from unmapped keys on the
//!   wire; the upstream dictates what a rejection looks like
//! - Secrets are zeroized on drop using [`zeroize`]; no `unsafe` anywhere
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::net::{TcpListener, TcpStream};
//! use weir_platform::WeirResult;
//! use weir_proto::ssh::keys::Ed25519Keypair;
//! use weir_proto::ssh::piper::{ConnMetadata, PiperConfig, SshPiperConn, UpstreamProvider};
//!
//! struct StaticUpstream;
//!
//! #[async_trait::async_trait]
//! impl UpstreamProvider for StaticUpstream {
//!     async fn find_upstream(
//!         &self,
//!         _conn: &ConnMetadata,
//!     ) -> WeirResult<(TcpStream, Option<String>)> {
//!         let socket = TcpStream::connect("10.0.0.1:22").await?;
//!         Ok((socket, None))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = PiperConfig::new(Arc::new(StaticUpstream));
//! config.add_host_key(Arc::new(Ed25519Keypair::generate()));
//!
//! let listener = TcpListener::bind("0.0.0.0:2222").await?;
//! let (stream, _) = listener.accept().await?;
//! let conn = SshPiperConn::new(stream, &config).await?;
//! let cause = conn.wait().await;
//! println!("pipe ended: {}", cause);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication

pub mod auth;
pub mod crypto;
pub mod handshake;
pub mod kex;
pub mod kex_dh;
pub mod keys;
pub mod message;
pub mod packet;
pub mod piper;
pub(crate) mod relay;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{
    construct_signature_data, parse_public_key_payload, AuthBanner, AuthFailure, AuthPkOk,
    AuthRequest, AuthSuccess, InfoRequest, InfoResponse, Prompt, PublicKeyPayload,
};
pub use crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
pub use handshake::{client_handshake, server_handshake};
pub use kex::{negotiate_algorithm, KexInit, NewKeys};
pub use kex_dh::{derive_key, Curve25519Exchange};
pub use keys::{
    is_acceptable_algo, Ed25519Keypair, PublicKey, RsaHash, RsaKeypair, Signature, Signer,
    ACCEPTABLE_ALGORITHMS,
};
pub use message::MessageType;
pub use packet::Packet;
pub use piper::{
    ChallengeHook, ConnMetadata, KeyMapHook, KeyboardInteractive, PiperConfig, SshPiperConn,
    UpstreamProvider,
};
pub use transport::{ServiceAccept, ServiceRequest, Transport, TransportReader, TransportWriter};
pub use version::Version;
