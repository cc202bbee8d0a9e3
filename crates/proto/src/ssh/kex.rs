//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module carries the negotiation messages and the matching rule; the
//! actual Curve25519 exchange lives in [`kex_dh`](crate::ssh::kex_dh).
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. ECDH exchange
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to encrypted communication
//!
//! The proxy runs this flow twice per piped connection, once in each role,
//! and the two negotiations are fully independent.

use rand::RngCore;
use weir_platform::{WeirError, WeirResult};

// Preference tables, most preferred first. These advertise exactly what the
// transport can actually run; there is no point offering algorithms the
// handshake would have to reject afterwards.
const KEX_ALGORITHMS: &[&str] = &["curve25519-sha256", "curve25519-sha256@libssh.org"];
const HOST_KEY_ALGORITHMS: &[&str] = &["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256"];
const CIPHER_ALGORITHMS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
];
const MAC_ALGORITHMS: &[&str] = &["hmac-sha2-256"];
const COMPRESSION_ALGORITHMS: &[&str] = &["none"];

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// A pair of name-lists, one per traffic direction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Directional {
    client_to_server: Vec<String>,
    server_to_client: Vec<String>,
}

impl Directional {
    fn symmetric(names: &[&str]) -> Self {
        Self {
            client_to_server: owned(names),
            server_to_client: owned(names),
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms, per direction
    encryption: Directional,
    /// MAC algorithms, per direction
    mac: Directional,
    /// Compression algorithms, per direction
    compression: Directional,
    /// Language tags, per direction (usually empty)
    languages: Directional,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT advertising the algorithms the proxy supports:
    /// curve25519 key exchange, ed25519/RSA host keys, AEAD ciphers,
    /// no compression.
    pub fn new_default() -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: owned(KEX_ALGORITHMS),
            server_host_key_algorithms: owned(HOST_KEY_ALGORITHMS),
            encryption: Directional::symmetric(CIPHER_ALGORITHMS),
            mac: Directional::symmetric(MAC_ALGORITHMS),
            compression: Directional::symmetric(COMPRESSION_ALGORITHMS),
            languages: Directional::symmetric(&[]),
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the advertised host key algorithms.
    ///
    /// The server role advertises exactly the algorithms of its configured
    /// host keys, in insertion order.
    pub fn with_server_host_key_algorithms(mut self, algorithms: Vec<String>) -> Self {
        self.server_host_key_algorithms = algorithms;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms for client-to-server traffic.
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption.client_to_server
    }

    /// Returns the encryption algorithms for server-to-client traffic.
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption.server_to_client
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms (x2)
    /// name-list    mac_algorithms (x2)
    /// name-list    compression_algorithms (x2)
    /// name-list    languages (x2)
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut wire = vec![20u8];
        wire.extend_from_slice(&self.cookie);

        for list in [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption.client_to_server,
            &self.encryption.server_to_client,
            &self.mac.client_to_server,
            &self.mac.server_to_client,
            &self.compression.client_to_server,
            &self.compression.server_to_client,
            &self.languages.client_to_server,
            &self.languages.server_to_client,
        ] {
            put_name_list(&mut wire, list);
        }

        wire.push(self.first_kex_packet_follows as u8);
        wire.extend_from_slice(&0u32.to_be_bytes()); // reserved
        wire
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] if the message is truncated or is not
    /// SSH_MSG_KEXINIT.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        let mut reader = Reader::new(data);

        let id = reader.byte()?;
        if id != 20 {
            return Err(WeirError::Protocol(format!(
                "First byte {} is not SSH_MSG_KEXINIT (20)",
                id
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.take(16)?);

        let kex_algorithms = reader.name_list()?;
        let server_host_key_algorithms = reader.name_list()?;
        let encryption = Directional {
            client_to_server: reader.name_list()?,
            server_to_client: reader.name_list()?,
        };
        let mac = Directional {
            client_to_server: reader.name_list()?,
            server_to_client: reader.name_list()?,
        };
        let compression = Directional {
            client_to_server: reader.name_list()?,
            server_to_client: reader.name_list()?,
        };
        let languages = Directional {
            client_to_server: reader.name_list()?,
            server_to_client: reader.name_list()?,
        };

        let first_kex_packet_follows = reader.byte()? != 0;
        reader.take(4)?; // reserved

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption,
            mac,
            compression,
            languages,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// Single-byte message signalling the switch to the freshly negotiated keys.
/// The packet sequence number is not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![21]
    }

    /// Parses a NEWKEYS message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] unless the message starts with
    /// SSH_MSG_NEWKEYS (21).
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        match data.first().copied() {
            Some(21) => Ok(Self),
            Some(other) => Err(WeirError::Protocol(format!(
                "Expected SSH_MSG_NEWKEYS (21), got message {}",
                other
            ))),
            None => Err(WeirError::Protocol("Empty NEWKEYS message".to_string())),
        }
    }
}

impl Default for NewKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked cursor over a KEXINIT body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> WeirResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                WeirError::Protocol(format!("KEXINIT truncated at byte {}", self.pos))
            })?;
        let chunk = &self.data[self.pos..end];
        self.pos = end;
        Ok(chunk)
    }

    fn byte(&mut self) -> WeirResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads one name-list (RFC 4251 Section 5): uint32 length followed by
    /// comma-separated names.
    fn name_list(&mut self) -> WeirResult<Vec<String>> {
        let len_bytes = self.take(4)?;
        let len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let raw = self.take(len)?;

        let text = std::str::from_utf8(raw)
            .map_err(|_| WeirError::Protocol("Name-list is not valid UTF-8".to_string()))?;

        if text.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(text.split(',').map(str::to_string).collect())
        }
    }
}

/// Writes one name-list: uint32 length followed by comma-separated names.
fn put_name_list(wire: &mut Vec<u8>, names: &[String]) {
    let joined = names.join(",");
    wire.extend_from_slice(&(joined.len() as u32).to_be_bytes());
    wire.extend_from_slice(joined.as_bytes());
}

/// Negotiates one algorithm between client and server lists.
///
/// The winner is the client's most preferred algorithm that the server also
/// lists (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`WeirError::Protocol`] if the lists share nothing.
///
/// # Example
///
/// ```rust
/// use weir_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["curve25519-sha256".to_string()];
/// let server = vec![
///     "diffie-hellman-group14-sha256".to_string(),
///     "curve25519-sha256".to_string(),
/// ];
///
/// assert_eq!(
///     negotiate_algorithm(&client, &server).unwrap(),
///     "curve25519-sha256"
/// );
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> WeirResult<String> {
    client_list
        .iter()
        .find(|candidate| server_list.iter().any(|offered| offered == *candidate))
        .cloned()
        .ok_or_else(|| {
            WeirError::Protocol(format!(
                "No algorithm shared by both sides (client offered {:?}, server offered {:?})",
                client_list, server_list
            ))
        })
}
