//! AEAD ciphers for the SSH transport.
//!
//! Both halves of a piped connection negotiate an AEAD cipher:
//! ChaCha20-Poly1305 or AES-256-GCM, via `ring`. The packet sequence number
//! doubles as the nonce, so every key is used for exactly one direction of
//! exactly one transport.
//!
//! # Security
//!
//! - Nonces are derived from a monotonically advancing 64-bit counter
//! - Keys are created from RFC 4253 Section 7.2 derivation output
//! - Key material is owned by `ring` and wiped on drop

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
    CHACHA20_POLY1305,
};
use weir_platform::{WeirError, WeirResult};

/// Per-direction nonce source: the SSH packet sequence number, big-endian,
/// in the low eight bytes of the twelve-byte nonce.
#[derive(Default)]
struct PacketNonce {
    sequence: u64,
}

impl NonceSequence for PacketNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.sequence.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce)
    }
}

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher
    ChaCha20Poly1305,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        32
    }

    /// Returns the authentication tag size in bytes.
    pub fn tag_size(&self) -> usize {
        16
    }

    /// Parses a cipher algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            _ => None,
        }
    }

    fn ring_algorithm(&self) -> &'static ring::aead::Algorithm {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
        }
    }
}

/// Binds derivation output to a `ring` key, taking exactly as many bytes as
/// the cipher wants.
fn bind_key_material(algorithm: CipherAlgorithm, material: &[u8]) -> WeirResult<UnboundKey> {
    let wanted = algorithm.key_size();
    let material = material.get(..wanted).ok_or_else(|| {
        WeirError::Security(format!(
            "{} wants {} key bytes, only {} were derived",
            algorithm.name(),
            wanted,
            material.len()
        ))
    })?;

    UnboundKey::new(algorithm.ring_algorithm(), material).map_err(|_| {
        WeirError::Security(format!("{} rejected the derived key", algorithm.name()))
    })
}

/// Sealing key for one outgoing packet direction.
pub struct EncryptionKey {
    algorithm: CipherAlgorithm,
    key: SealingKey<PacketNonce>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EncryptionKey {
    /// Creates a new encryption key from derived key material.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] if there is not enough key material.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> WeirResult<Self> {
        let unbound = bind_key_material(algorithm, key_material)?;
        Ok(Self {
            algorithm,
            key: SealingKey::new(unbound, PacketNonce::default()),
        })
    }

    /// Encrypts data in place, appending the authentication tag.
    pub fn encrypt(&mut self, data: &mut Vec<u8>) -> WeirResult<()> {
        self.key
            .seal_in_place_append_tag(Aad::empty(), data)
            .map_err(|_| WeirError::Security("AEAD seal failed".to_string()))
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Opening key for one incoming packet direction.
pub struct DecryptionKey {
    algorithm: CipherAlgorithm,
    key: OpeningKey<PacketNonce>,
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DecryptionKey {
    /// Creates a new decryption key from derived key material.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] if there is not enough key material.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> WeirResult<Self> {
        let unbound = bind_key_material(algorithm, key_material)?;
        Ok(Self {
            algorithm,
            key: OpeningKey::new(unbound, PacketNonce::default()),
        })
    }

    /// Decrypts data in place, verifying and stripping the tag.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] on tag mismatch.
    pub fn decrypt(&mut self, data: &mut Vec<u8>) -> WeirResult<()> {
        let opened_len = self
            .key
            .open_in_place(Aad::empty(), data)
            .map_err(|_| {
                WeirError::Security("AEAD open failed: bad tag or corrupted frame".to_string())
            })?
            .len();
        data.truncate(opened_len);
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}
