//! Public keys, signatures, and signing identities.
//!
//! Three things meet in this module:
//!
//! - [`PublicKey`] - an SSH wire-format public key with a verification
//!   operation, parsed out of downstream authentication requests.
//! - [`Signature`] - the `{format, blob}` pair carried by publickey
//!   authentication and host key proofs.
//! - [`Signer`] - a signing identity. The proxy's host keys are signers,
//!   and so are the substitute keys returned by the public key mapping
//!   hook: when the proxy re-signs a downstream publickey attempt for the
//!   upstream, it signs with one of these.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - sign and verify (ed25519-dalek)
//! - `rsa-sha2-256`, `rsa-sha2-512` - sign and verify (ring)
//! - `ecdsa-sha2-nistp256/384/521` - accepted on the wire, no verifier;
//!   verification reports false and the relay degrades to a `none` attempt
//!
//! # Security
//!
//! - Ed25519 secret seeds are wrapped in [`Zeroizing`] when exposed
//! - Verification failures carry no detail about why

use base64::Engine;
use ed25519_dalek::{Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use ring::signature::{
    RsaKeyPair, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512, RSA_PKCS1_SHA256,
    RSA_PKCS1_SHA512,
};
use sha2::{Digest, Sha256};
use weir_platform::{WeirError, WeirResult};
use zeroize::Zeroizing;

/// Public key algorithms the proxy will accept in authentication requests.
///
/// Requests naming anything else are rejected during payload parsing.
pub const ACCEPTABLE_ALGORITHMS: &[&str] = &[
    "ssh-rsa",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// Returns true if the algorithm is on the accept list.
pub fn is_acceptable_algo(name: &str) -> bool {
    ACCEPTABLE_ALGORITHMS.contains(&name)
}

/// An SSH signature: algorithm format name plus the raw signature bytes.
///
/// Wire layout (RFC 4253 Section 6.6):
///
/// ```text
/// string    format name (e.g. "ssh-ed25519")
/// string    signature bytes
/// ```
///
/// Equality is byte equality on both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signature format name
    format: String,
    /// Raw signature bytes
    blob: Vec<u8>,
}

impl Signature {
    /// Creates a signature from its parts.
    pub fn new(format: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            blob,
        }
    }

    /// Returns the format name.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Returns the raw signature bytes.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Serializes to SSH wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.format.len() + self.blob.len());
        out.extend_from_slice(&(self.format.len() as u32).to_be_bytes());
        out.extend_from_slice(self.format.as_bytes());
        out.extend_from_slice(&(self.blob.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.blob);
        out
    }

    /// Parses a signature from SSH wire format.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] on truncation or trailing bytes.
    pub fn from_wire(data: &[u8]) -> WeirResult<Self> {
        let mut offset = 0;
        let format_bytes = read_string(data, &mut offset)?;
        let format = String::from_utf8(format_bytes)
            .map_err(|_| WeirError::Protocol("Signature format is not UTF-8".to_string()))?;
        let blob = read_string(data, &mut offset)?;
        if offset != data.len() {
            return Err(WeirError::Protocol(
                "Trailing bytes after signature".to_string(),
            ));
        }
        Ok(Self { format, blob })
    }
}

/// An SSH wire-format public key.
///
/// Holds the algorithm name and the full key blob (which embeds the name
/// again, per RFC 4253 Section 6.6). Verification dispatches on the
/// signature's format name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Algorithm name (e.g. "ssh-ed25519")
    algorithm: String,
    /// Full key blob in SSH wire format
    blob: Vec<u8>,
}

impl PublicKey {
    /// Parses a public key from its SSH wire blob.
    ///
    /// The blob's leading string names the algorithm; it must be on the
    /// accept list.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] on malformed blobs and
    /// [`WeirError::Security`] for algorithms not on the accept list.
    pub fn from_wire(blob: &[u8]) -> WeirResult<Self> {
        let mut offset = 0;
        let name_bytes = read_string(blob, &mut offset)?;
        let algorithm = String::from_utf8(name_bytes)
            .map_err(|_| WeirError::Protocol("Key algorithm name is not UTF-8".to_string()))?;

        if !is_acceptable_algo(&algorithm) {
            return Err(WeirError::Security(format!(
                "Public key algorithm '{}' not accepted",
                algorithm
            )));
        }

        // The rest of the blob is algorithm-specific; keep it opaque.
        if offset >= blob.len() {
            return Err(WeirError::Protocol(
                "Public key blob has no key material".to_string(),
            ));
        }

        Ok(Self {
            algorithm,
            blob: blob.to_vec(),
        })
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the full wire blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Returns a SHA-256 fingerprint suitable for logging.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }

    /// Verifies a signature over `data` with this key.
    ///
    /// Returns `Ok(false)` for bad signatures, signature formats not on the
    /// accept list, and algorithms without a verifier; the caller cannot
    /// distinguish these cases.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] only if the key blob itself is
    /// malformed for its declared algorithm.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> WeirResult<bool> {
        if !is_acceptable_algo(signature.format()) {
            return Ok(false);
        }

        match signature.format() {
            "ssh-ed25519" => {
                let key_material = self.second_string()?;
                if key_material.len() != 32 || signature.blob().len() != 64 {
                    return Ok(false);
                }

                let mut key_bytes = [0u8; 32];
                key_bytes.copy_from_slice(&key_material);
                let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
                    Ok(k) => k,
                    Err(_) => return Ok(false),
                };

                let mut sig_bytes = [0u8; 64];
                sig_bytes.copy_from_slice(signature.blob());
                let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);

                Ok(verifying_key.verify(data, &sig).is_ok())
            }
            "rsa-sha2-256" => {
                let der = self.second_string()?;
                let key = ring::signature::UnparsedPublicKey::new(
                    &RSA_PKCS1_2048_8192_SHA256,
                    der.as_slice(),
                );
                Ok(key.verify(data, signature.blob()).is_ok())
            }
            "rsa-sha2-512" => {
                let der = self.second_string()?;
                let key = ring::signature::UnparsedPublicKey::new(
                    &RSA_PKCS1_2048_8192_SHA512,
                    der.as_slice(),
                );
                Ok(key.verify(data, signature.blob()).is_ok())
            }
            // On the accept list but no verifier wired up.
            _ => Ok(false),
        }
    }

    /// Returns the second string of the blob (the key material).
    fn second_string(&self) -> WeirResult<Vec<u8>> {
        let mut offset = 0;
        let _name = read_string(&self.blob, &mut offset)?;
        read_string(&self.blob, &mut offset)
    }
}

/// A signing identity: the proxy's host keys and the substitute keys used
/// to re-sign publickey authentication toward the upstream.
///
/// The mapping hook may be asked for a signer twice per downstream key
/// (once for the query round, once for the signed attempt); both calls must
/// return signers for the same public key.
pub trait Signer: Send + Sync {
    /// Returns the algorithm name (e.g. "ssh-ed25519").
    fn algorithm_name(&self) -> &'static str;

    /// Returns the public key in SSH wire format.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs data, returning the signature in `{format, blob}` form.
    fn sign(&self, data: &[u8]) -> WeirResult<Signature>;

    /// Returns the public half as a [`PublicKey`].
    fn public_key(&self) -> WeirResult<PublicKey> {
        PublicKey::from_wire(&self.public_key_blob())
    }
}

/// Ed25519 signing identity (ssh-ed25519).
#[derive(Clone)]
pub struct Ed25519Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; 32] = rand::Rng::gen(&mut csprng);
        Self::from_seed(secret_bytes)
    }

    /// Builds a keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Builds a keypair from raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] unless exactly 32 bytes are given.
    pub fn from_bytes(secret_bytes: &[u8]) -> WeirResult<Self> {
        if secret_bytes.len() != 32 {
            return Err(WeirError::Security(
                "An Ed25519 seed is exactly 32 bytes".to_string(),
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(secret_bytes);
        Ok(Self::from_seed(seed))
    }

    /// Returns the secret seed. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Returns the verifying key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl Signer for Ed25519Keypair {
    fn algorithm_name(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        write_string(&mut blob, b"ssh-ed25519");
        write_string(&mut blob, self.verifying_key.as_bytes());
        blob
    }

    fn sign(&self, data: &[u8]) -> WeirResult<Signature> {
        let signature = self.signing_key.sign(data);
        Ok(Signature::new(
            "ssh-ed25519",
            signature.to_bytes().to_vec(),
        ))
    }
}

impl std::fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("algorithm", &"ssh-ed25519")
            .finish_non_exhaustive()
    }
}

/// Hash flavor for RSA signing identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaHash {
    /// rsa-sha2-256
    Sha256,
    /// rsa-sha2-512
    Sha512,
}

/// RSA signing identity (rsa-sha2-256 / rsa-sha2-512).
///
/// Built from a PKCS#8 DER private key; the public blob carries the DER
/// public key so [`PublicKey::verify`] can hand it straight to `ring`.
pub struct RsaKeypair {
    key_pair: RsaKeyPair,
    public_key_der: Vec<u8>,
    hash: RsaHash,
}

impl RsaKeypair {
    /// Creates a keypair from a PKCS#8 DER private key.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Security`] if the key does not parse or is too
    /// small for `ring` (< 2048 bits).
    pub fn from_pkcs8(private_key_der: &[u8], hash: RsaHash) -> WeirResult<Self> {
        let key_pair = RsaKeyPair::from_pkcs8(private_key_der)
            .map_err(|e| WeirError::Security(format!("RSA private key rejected: {:?}", e)))?;

        let public_key_der = key_pair.public().as_ref().to_vec();

        Ok(Self {
            key_pair,
            public_key_der,
            hash,
        })
    }

    /// Returns the public key in DER form.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }
}

impl Signer for RsaKeypair {
    fn algorithm_name(&self) -> &'static str {
        match self.hash {
            RsaHash::Sha256 => "rsa-sha2-256",
            RsaHash::Sha512 => "rsa-sha2-512",
        }
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        write_string(&mut blob, self.algorithm_name().as_bytes());
        write_string(&mut blob, &self.public_key_der);
        blob
    }

    fn sign(&self, data: &[u8]) -> WeirResult<Signature> {
        let padding = match self.hash {
            RsaHash::Sha256 => &RSA_PKCS1_SHA256,
            RsaHash::Sha512 => &RSA_PKCS1_SHA512,
        };

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        let rng = ring::rand::SystemRandom::new();
        self.key_pair
            .sign(padding, &rng, data, &mut signature)
            .map_err(|e| WeirError::Security(format!("RSA signature could not be produced: {:?}", e)))?;

        Ok(Signature::new(self.algorithm_name(), signature))
    }
}

impl std::fmt::Debug for RsaKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeypair")
            .field("algorithm", &self.algorithm_name())
            .field("key_size_bits", &(self.key_pair.public().modulus_len() * 8))
            .finish_non_exhaustive()
    }
}

// SSH string helpers shared by the key codecs.

pub(crate) fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn read_string(data: &[u8], offset: &mut usize) -> WeirResult<Vec<u8>> {
    let len_field = data.get(*offset..*offset + 4).ok_or_else(|| {
        WeirError::Protocol(format!("String length field missing at offset {}", offset))
    })?;
    let length =
        u32::from_be_bytes([len_field[0], len_field[1], len_field[2], len_field[3]]) as usize;

    let start = *offset + 4;
    let bytes = data.get(start..start + length).ok_or_else(|| {
        WeirError::Protocol(format!(
            "String of {} bytes at offset {} runs past the buffer",
            length, start
        ))
    })?;

    *offset = start + length;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptable_algorithms() {
        assert!(is_acceptable_algo("ssh-ed25519"));
        assert!(is_acceptable_algo("rsa-sha2-256"));
        assert!(is_acceptable_algo("ecdsa-sha2-nistp256"));
        assert!(!is_acceptable_algo("ssh-dss"));
        assert!(!is_acceptable_algo(""));
    }

    #[test]
    fn test_signature_wire_round_trip() {
        let sig = Signature::new("ssh-ed25519", vec![0xab; 64]);
        let parsed = Signature::from_wire(&sig.to_wire()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_signature_trailing_bytes_rejected() {
        let mut wire = Signature::new("ssh-ed25519", vec![1, 2, 3]).to_wire();
        wire.push(0x00);
        assert!(Signature::from_wire(&wire).is_err());
    }

    #[test]
    fn test_public_key_from_wire() {
        let keypair = Ed25519Keypair::generate();
        let key = PublicKey::from_wire(&keypair.public_key_blob()).unwrap();
        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.blob(), &keypair.public_key_blob()[..]);
    }

    #[test]
    fn test_public_key_unacceptable_algorithm() {
        let mut blob = Vec::new();
        write_string(&mut blob, b"ssh-dss");
        write_string(&mut blob, &[0u8; 16]);
        assert!(matches!(
            PublicKey::from_wire(&blob),
            Err(WeirError::Security(_))
        ));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let keypair = Ed25519Keypair::generate();
        let key = keypair.public_key().unwrap();

        let data = b"session binding payload";
        let sig = keypair.sign(data).unwrap();
        assert_eq!(sig.format(), "ssh-ed25519");
        assert_eq!(sig.blob().len(), 64);

        assert!(key.verify(data, &sig).unwrap());
        assert!(!key.verify(b"different payload", &sig).unwrap());
    }

    #[test]
    fn test_ed25519_verify_wrong_key() {
        let signer = Ed25519Keypair::generate();
        let other = Ed25519Keypair::generate().public_key().unwrap();

        let sig = signer.sign(b"data").unwrap();
        assert!(!other.verify(b"data", &sig).unwrap());
    }

    #[test]
    fn test_verify_rejects_off_list_format() {
        let keypair = Ed25519Keypair::generate();
        let key = keypair.public_key().unwrap();
        let sig = Signature::new("ssh-dss", vec![0u8; 64]);
        assert!(!key.verify(b"data", &sig).unwrap());
    }

    #[test]
    fn test_verify_no_verifier_reports_false() {
        // ECDSA is on the accept list but has no verifier; the relay treats
        // this as an ordinary verification failure.
        let keypair = Ed25519Keypair::generate();
        let key = keypair.public_key().unwrap();
        let sig = Signature::new("ecdsa-sha2-nistp256", vec![0u8; 72]);
        assert!(!key.verify(b"data", &sig).unwrap());
    }

    #[test]
    fn test_ed25519_from_seed_deterministic() {
        let seed = [7u8; 32];
        let a = Ed25519Keypair::from_seed(seed);
        let b = Ed25519Keypair::from_seed(seed);
        assert_eq!(a.public_key_blob(), b.public_key_blob());
    }

    #[test]
    fn test_ed25519_from_bytes_length_check() {
        assert!(Ed25519Keypair::from_bytes(&[0u8; 31]).is_err());
        assert!(Ed25519Keypair::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_fingerprint_format() {
        let keypair = Ed25519Keypair::generate();
        let key = keypair.public_key().unwrap();
        assert!(key.fingerprint().starts_with("SHA256:"));
    }
}
