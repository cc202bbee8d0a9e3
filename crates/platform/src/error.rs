//! Error types for Weir

use std::fmt;

/// Which half of a proxied flow a handshake error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// The SSH client that connected to the proxy.
    Downstream,
    /// The SSH server the proxy dialed on the client's behalf.
    Upstream,
}

impl fmt::Display for HandshakeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeSide::Downstream => write!(f, "downstream"),
            HandshakeSide::Upstream => write!(f, "upstream"),
        }
    }
}

/// Unified error type for all Weir operations
#[derive(Debug)]
pub enum WeirError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed packet, unexpected message type)
    Protocol(String),

    /// Security error (key material, signature, cipher failures)
    Security(String),

    /// Version exchange, key exchange or service negotiation failed on
    /// one half of a proxied flow
    Handshake {
        /// Which half failed
        side: HandshakeSide,
        /// Underlying cause
        cause: Box<WeirError>,
    },

    /// The additional challenge rejected the downstream
    Challenge(String),

    /// Upstream lookup failed
    Lookup(String),

    /// Clean end of stream on a transport
    Closed,

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WeirError {
    /// Wraps an error as a handshake failure on the given side.
    pub fn handshake(side: HandshakeSide, cause: WeirError) -> Self {
        WeirError::Handshake {
            side,
            cause: Box::new(cause),
        }
    }

    /// Returns true for a clean end-of-stream condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, WeirError::Closed)
    }
}

impl fmt::Display for WeirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeirError::Io(e) => write!(f, "IO error: {}", e),
            WeirError::Config(msg) => write!(f, "Configuration error: {}", msg),
            WeirError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            WeirError::Security(msg) => write!(f, "Security error: {}", msg),
            WeirError::Handshake { side, cause } => {
                write!(f, "Handshake failed ({}): {}", side, cause)
            }
            WeirError::Challenge(msg) => write!(f, "Challenge failed: {}", msg),
            WeirError::Lookup(msg) => write!(f, "Upstream lookup failed: {}", msg),
            WeirError::Closed => write!(f, "Connection closed"),
            WeirError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for WeirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeirError::Io(e) => Some(e),
            WeirError::Handshake { cause, .. } => Some(cause.as_ref()),
            WeirError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WeirError {
    fn from(err: std::io::Error) -> Self {
        WeirError::Io(err)
    }
}

/// Result type for Weir operations
pub type WeirResult<T> = Result<T, WeirError>;
