//! Protocol core of the Weir SSH reverse proxy.
//!
//! Weir sits between an SSH client (the *downstream*) and an SSH server
//! chosen at connection time (the *upstream*). Both sides get a full,
//! independent SSH transport; authentication from the downstream is relayed
//! to the upstream, rewriting usernames and re-signing publickey attempts
//! along the way; after authentication succeeds, packets are piped in both
//! directions without inspection.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH transport stack and the piper core
//!
//! # Example
//!
//! ```rust
//! use weir_proto::ssh::Packet;
//!
//! // Create and serialize an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`)
//! - Secret key material is zeroized on drop with `zeroize`
//! - The packet pipe never interprets or logs relayed payloads
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
