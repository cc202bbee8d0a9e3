//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Every SSH connection opens with an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The proxy sends one such line on each half: the server-role banner toward
//! the downstream client and the client-role banner toward the upstream
//! server. Both are configurable; the defaults carry the crate name.
//!
//! # Security
//!
//! - Maximum line length: 255 characters (DoS prevention)
//! - Only protocol versions "2.0" and "1.99" are accepted
//! - No null bytes allowed in version strings

use weir_platform::{WeirError, WeirResult};

/// Maximum length of an SSH identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH identification string exchanged at connection start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Weir_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Weir_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Weir_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Weir banner.
    pub fn default_weir() -> Self {
        Self::new(&format!("Weir_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line (with or without the CR LF).
    ///
    /// The line decomposes as `SSH-` + protocol version + `-` + software
    /// version, with everything after the first space (if any) kept as
    /// comments.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] for oversized lines, embedded NUL
    /// bytes, a missing `SSH-` prefix, or a protocol version this proxy
    /// cannot speak.
    ///
    /// # Example
    ///
    /// ```rust
    /// use weir_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-2.0-OpenSSH_9.6\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_9.6");
    /// ```
    pub fn parse(line: &str) -> WeirResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(WeirError::Protocol(format!(
                "Identification line is {} bytes, limit is {}",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.bytes().any(|b| b == 0) {
            return Err(WeirError::Protocol(
                "Identification line contains a NUL byte".to_string(),
            ));
        }

        let after_prefix = line.strip_prefix("SSH-").ok_or_else(|| {
            WeirError::Protocol(format!(
                "Identification line does not begin with SSH-: '{}'",
                line
            ))
        })?;

        let (proto_version, software_part) = after_prefix.split_once('-').ok_or_else(|| {
            WeirError::Protocol(format!("Malformed identification line: '{}'", line))
        })?;

        if !matches!(proto_version, "2.0" | "1.99") {
            return Err(WeirError::Protocol(format!(
                "Cannot interoperate with SSH protocol version '{}'",
                proto_version
            )));
        }

        let (software_version, comments) = match software_part.split_once(' ') {
            Some((software, comments)) => {
                (software.to_string(), Some(comments.trim().to_string()))
            }
            None => (software_part.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Weir_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}
