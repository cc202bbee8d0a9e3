//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! ```
//!
//! The proxy frames every message it originates with this layout, on both
//! halves of a flow. AEAD authentication tags are handled one layer up, in
//! the transport; the packet itself stays cipher-agnostic.
//!
//! # Constraints
//!
//! - `packet_length` does not include the length field itself
//! - padding is 4-255 bytes of cryptographically random data
//! - `packet_length` + 4 must be a multiple of the 8-byte block size
//! - total size is capped at 35000 bytes (RFC 4253 Section 6.1)

use rand::RngCore;
use weir_platform::{WeirError, WeirResult};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum packet size in bytes, after block alignment.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Cipher block size every frame is aligned to.
const BLOCK_SIZE: usize = 8;

/// An SSH binary packet: payload plus random padding.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - Total packet size (including all fields) is at most 35000 bytes
/// - The packet is aligned to the 8-byte cipher block size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a new SSH packet with the given payload, padded to meet the
    /// alignment and minimum-padding requirements. Padding bytes come from
    /// the thread RNG.
    ///
    /// # Panics
    ///
    /// Panics if the payload is too large to frame (> 35000 bytes).
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"Hello, SSH!".to_vec());
    /// assert_eq!(packet.payload(), b"Hello, SSH!");
    /// ```
    pub fn new(payload: Vec<u8>) -> Self {
        // Everything before the padding: length field, padding-length byte,
        // payload. The shortest aligned padding of at least four bytes
        // follows directly from the remainder.
        let prefix = 4 + 1 + payload.len();
        let mut pad_len = BLOCK_SIZE - prefix % BLOCK_SIZE;
        if pad_len < MIN_PADDING_LEN as usize {
            pad_len += BLOCK_SIZE;
        }

        assert!(
            prefix + pad_len <= MAX_PACKET_SIZE,
            "Cannot frame a {} byte payload within the {} byte packet ceiling",
            payload.len(),
            MAX_PACKET_SIZE
        );

        let mut padding = vec![0u8; pad_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes this packet to wire format.
    ///
    /// ```text
    /// uint32    packet_length (big-endian)
    /// byte      padding_length
    /// byte[n1]  payload
    /// byte[n2]  random padding
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let declared = 1 + self.payload.len() + self.padding.len();
        let mut wire = Vec::with_capacity(4 + declared);
        wire.extend_from_slice(&(declared as u32).to_be_bytes());
        wire.push(self.padding.len() as u8);
        wire.extend_from_slice(&self.payload);
        wire.extend_from_slice(&self.padding);
        wire
    }

    /// Parses a packet from wire format.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] when the buffer is shorter than the
    /// declared length, the declared length breaks the size ceiling, or the
    /// padding accounting does not add up.
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::Packet;
    ///
    /// let original = Packet::new(b"test".to_vec());
    /// let parsed = Packet::from_bytes(&original.to_bytes()).unwrap();
    /// assert_eq!(parsed.payload(), b"test");
    /// ```
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        let header = data.get(..5).ok_or_else(|| {
            WeirError::Protocol(format!(
                "Frame shorter than the packet header: {} bytes",
                data.len()
            ))
        })?;

        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let pad_len = header[4] as usize;

        if declared > MAX_PACKET_SIZE {
            return Err(WeirError::Protocol(format!(
                "Declared packet length {} exceeds the {} byte ceiling",
                declared, MAX_PACKET_SIZE
            )));
        }

        let body = data.get(4..4 + declared).ok_or_else(|| {
            WeirError::Protocol(format!(
                "Declared packet length {} overruns the {} bytes on hand",
                declared,
                data.len().saturating_sub(4)
            ))
        })?;

        if pad_len < MIN_PADDING_LEN as usize {
            return Err(WeirError::Protocol(format!(
                "Only {} padding bytes; RFC 4253 requires at least {}",
                pad_len, MIN_PADDING_LEN
            )));
        }

        // declared = padding-length byte + payload + padding
        let payload_len = declared.checked_sub(1 + pad_len).ok_or_else(|| {
            WeirError::Protocol(format!(
                "{} padding bytes do not fit a {} byte packet",
                pad_len, declared
            ))
        })?;

        let (payload, padding) = body[1..].split_at(payload_len);
        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_new() {
        let payload = b"Hello, SSH!".to_vec();
        let packet = Packet::new(payload.clone());

        assert_eq!(packet.payload(), &payload[..]);
        assert!(packet.padding().len() >= MIN_PADDING_LEN as usize);
        assert!(packet.padding().len() <= MAX_PADDING_LEN as usize);
    }

    #[test]
    fn test_packet_alignment() {
        for len in [0usize, 1, 7, 8, 9, 100, 1000] {
            let packet = Packet::new(vec![0x2a; len]);
            let total_size = 4 + 1 + packet.payload().len() + packet.padding().len();
            assert_eq!(total_size % 8, 0, "not aligned for payload len {}", len);
        }
    }

    #[test]
    fn test_packet_round_trip() {
        let payload = b"relayed auth request".to_vec();
        let packet = Packet::new(payload.clone());

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.payload(), &payload[..]);
        assert_eq!(parsed.padding(), packet.padding());
    }

    #[test]
    fn test_packet_minimum_size() {
        let packet = Packet::new(b"x".to_vec());
        assert!(packet.to_bytes().len() >= MIN_PACKET_SIZE);
    }

    #[test]
    fn test_packet_invalid_too_short() {
        let data = vec![0, 0, 0, 10]; // only the length field
        assert!(matches!(
            Packet::from_bytes(&data),
            Err(WeirError::Protocol(_))
        ));
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![
            0, 0, 0, 8, // packet_length = 8
            2, // padding_length = 2 (< 4)
            0x48, 0x65, 0x6c, 0x6c, 0x6f, // payload
            0x00, 0x00, // padding
        ];
        match Packet::from_bytes(&data) {
            Err(WeirError::Protocol(msg)) => assert!(msg.contains("padding bytes")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_invalid_incomplete() {
        let data = vec![
            0, 0, 0, 20, // packet_length = 20
            4,  // padding_length
            0x48, 0x65, // truncated
        ];
        match Packet::from_bytes(&data) {
            Err(WeirError::Protocol(msg)) => assert!(msg.contains("overruns")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_declared_length_too_large() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&(40000u32).to_be_bytes());
        match Packet::from_bytes(&data) {
            Err(WeirError::Protocol(msg)) => assert!(msg.contains("ceiling")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_padding_exceeding_declared_length() {
        let data = vec![
            0, 0, 0, 5, // packet_length = 5
            250, // padding_length far beyond the declared length
            0, 0, 0, 0,
        ];
        match Packet::from_bytes(&data) {
            Err(WeirError::Protocol(msg)) => assert!(msg.contains("do not fit")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "Cannot frame")]
    fn test_packet_exceeds_max_size() {
        let _packet = Packet::new(vec![0u8; MAX_PACKET_SIZE + 1000]);
    }
}
