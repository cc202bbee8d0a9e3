//! The encrypted packet channel each half of a piped connection runs on.
//!
//! A [`Transport`] owns one TCP stream, the AEAD keys negotiated for it, and
//! the session ID (the exchange hash of its first key exchange). The proxy
//! holds two of these per flow - one in the server role toward the
//! downstream, one in the client role toward the upstream - and they share
//! no key material whatsoever. Anything signed against one transport's
//! session ID is meaningless on the other; that asymmetry is what forces
//! the authentication relay to re-sign publickey attempts.
//!
//! During handshake and authentication a transport is driven sequentially
//! through `&mut` access. Once authentication has succeeded it is torn into
//! a [`TransportReader`] / [`TransportWriter`] pair so the packet pipe can
//! service both directions concurrently.
//!
//! # Wire framing
//!
//! Before keys are installed, packets travel as plain RFC 4253 binary
//! packets. After NEWKEYS, the 4-byte length stays in the clear and the
//! remainder (padding length, payload, padding) is sealed with the
//! negotiated AEAD cipher, tag appended.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use weir_platform::{WeirError, WeirResult};

use crate::ssh::crypto::{DecryptionKey, EncryptionKey};
use crate::ssh::message::MessageType;
use crate::ssh::packet::{Packet, MAX_PACKET_SIZE};

/// The service name userauth runs under.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Reading half of a transport: TCP read side plus the opening key.
pub struct TransportReader {
    rd: OwnedReadHalf,
    cipher: Option<DecryptionKey>,
}

/// Writing half of a transport: TCP write side plus the sealing key.
pub struct TransportWriter {
    wr: OwnedWriteHalf,
    cipher: Option<EncryptionKey>,
    closed: bool,
}

/// An authenticated, encrypted SSH packet channel.
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
    session_id: Vec<u8>,
}

impl Transport {
    /// Wraps a connected TCP stream. No keys are installed and the session
    /// ID is empty until the handshake fills them in.
    pub fn new(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: TransportReader { rd, cipher: None },
            writer: TransportWriter {
                wr,
                cipher: None,
                closed: false,
            },
            session_id: Vec::new(),
        }
    }

    /// Installs the negotiated AEAD keys. Called once, right after NEWKEYS.
    pub fn install_keys(&mut self, encryption: EncryptionKey, decryption: DecryptionKey) {
        self.writer.cipher = Some(encryption);
        self.reader.cipher = Some(decryption);
    }

    /// Records the session ID (exchange hash H of the first key exchange).
    pub(crate) fn set_session_id(&mut self, session_id: Vec<u8>) {
        if self.session_id.is_empty() {
            self.session_id = session_id;
        }
    }

    /// Returns the session ID. Empty before the handshake completes.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Reads one packet and returns its payload.
    pub async fn read_packet(&mut self) -> WeirResult<Vec<u8>> {
        self.reader.read_packet().await
    }

    /// Frames and writes one payload as a packet.
    pub async fn write_packet(&mut self, payload: &[u8]) -> WeirResult<()> {
        self.writer.write_packet(payload).await
    }

    /// Shuts down the write side. Idempotent.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Tears the transport into its two directional halves for the packet
    /// pipe.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

impl TransportReader {
    /// Reads one packet and returns its payload.
    ///
    /// # Errors
    ///
    /// - [`WeirError::Closed`] on a clean EOF at a packet boundary
    /// - [`WeirError::Io`] on any other read failure (including EOF inside
    ///   a packet)
    /// - [`WeirError::Security`] if AEAD tag verification fails
    /// - [`WeirError::Protocol`] if the frame itself is malformed
    pub async fn read_packet(&mut self) -> WeirResult<Vec<u8>> {
        // Length prefix, always in the clear.
        let mut length_bytes = [0u8; 4];
        match self.rd.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WeirError::Closed)
            }
            Err(e) => return Err(WeirError::Io(e)),
        }

        let packet_length = u32::from_be_bytes(length_bytes) as usize;
        if packet_length > MAX_PACKET_SIZE {
            return Err(WeirError::Protocol(format!(
                "Declared packet length {} exceeds the {} byte ceiling",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length < 5 {
            return Err(WeirError::Protocol(format!(
                "Declared packet length {} is below the 5 byte minimum",
                packet_length
            )));
        }

        let bytes_to_read = match &self.cipher {
            Some(key) => packet_length + key.algorithm().tag_size(),
            None => packet_length,
        };

        let mut body = vec![0u8; bytes_to_read];
        self.rd.read_exact(&mut body).await.map_err(WeirError::Io)?;

        if let Some(key) = &mut self.cipher {
            key.decrypt(&mut body)?;
        }

        let mut full = Vec::with_capacity(4 + body.len());
        full.extend_from_slice(&length_bytes);
        full.extend_from_slice(&body);

        Ok(Packet::from_bytes(&full)?.into_payload())
    }
}

impl TransportWriter {
    /// Frames and writes one payload as a packet.
    pub async fn write_packet(&mut self, payload: &[u8]) -> WeirResult<()> {
        let packet = Packet::new(payload.to_vec());
        let mut bytes = packet.to_bytes();

        if let Some(key) = &mut self.cipher {
            // Length stays in the clear; the rest is sealed.
            let mut body = bytes.split_off(4);
            key.encrypt(&mut body)?;
            bytes.extend_from_slice(&body);
        }

        self.wr.write_all(&bytes).await.map_err(WeirError::Io)?;
        Ok(())
    }

    /// Shuts down the write side. Idempotent; errors from the OS are
    /// ignored because the peer may already be gone.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.wr.shutdown().await;
        }
    }
}

/// SSH_MSG_SERVICE_REQUEST (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name.
    service: String,
}

impl ServiceRequest {
    /// Creates a request for the given service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Returns the requested service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![MessageType::ServiceRequest as u8];
        out.extend_from_slice(&(self.service.len() as u32).to_be_bytes());
        out.extend_from_slice(self.service.as_bytes());
        out
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::ServiceRequest as u8 {
            return Err(WeirError::Protocol(
                "Invalid SERVICE_REQUEST message".to_string(),
            ));
        }
        let mut offset = 1;
        let service = read_utf8(data, &mut offset)?;
        Ok(Self { service })
    }
}

/// SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name.
    service: String,
}

impl ServiceAccept {
    /// Creates an accept for the given service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Returns the accepted service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![MessageType::ServiceAccept as u8];
        out.extend_from_slice(&(self.service.len() as u32).to_be_bytes());
        out.extend_from_slice(self.service.as_bytes());
        out
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::ServiceAccept as u8 {
            return Err(WeirError::Protocol(
                "Invalid SERVICE_ACCEPT message".to_string(),
            ));
        }
        let mut offset = 1;
        let service = read_utf8(data, &mut offset)?;
        Ok(Self { service })
    }
}

fn read_utf8(data: &[u8], offset: &mut usize) -> WeirResult<String> {
    let bytes = crate::ssh::keys::read_string(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| WeirError::Protocol("Service name is not valid UTF-8".to_string()))
}
