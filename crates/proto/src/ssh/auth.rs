//! User authentication message codecs (RFC 4252, RFC 4256).
//!
//! The proxy never authenticates anyone itself; it rewrites downstream
//! authentication requests into upstream ones. That shapes this codec in two
//! ways:
//!
//! - [`AuthRequest`] keeps the method-specific payload as opaque bytes, so
//!   any method (password, keyboard-interactive, gssapi, ...) survives the
//!   user rewrite byte-for-byte.
//! - The publickey payload gets its own structured codec
//!   ([`parse_public_key_payload`]) because publickey is the one method the
//!   proxy must take apart: signatures are bound to a session ID and have to
//!   be re-created for the upstream's.
//!
//! # Example
//!
//! ```rust
//! use weir_proto::ssh::auth::AuthRequest;
//!
//! let req = AuthRequest::none("alice");
//! assert_eq!(req.method(), "none");
//! assert_eq!(req.user(), "alice");
//! ```

use bytes::{BufMut, BytesMut};
use weir_platform::{WeirError, WeirResult};

use crate::ssh::keys::{is_acceptable_algo, PublicKey, Signature};
use crate::ssh::message::MessageType;

/// The only service userauth may request through the proxy.
pub const SERVICE_SSH_CONNECTION: &str = "ssh-connection";

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
///
/// ```text
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    method name
/// ....      method specific fields (kept verbatim)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name
    user: String,
    /// Service name (always "ssh-connection" through the proxy)
    service: String,
    /// Authentication method name
    method: String,
    /// Method-specific fields, verbatim
    payload: Vec<u8>,
}

impl AuthRequest {
    /// Creates an authentication request from its parts.
    pub fn new(
        user: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            user: user.into(),
            service: service.into(),
            method: method.into(),
            payload,
        }
    }

    /// Creates a `"none"` method request: an empty-payload probe that makes
    /// the server answer with its authentication failure list.
    pub fn none(user: impl Into<String>) -> Self {
        Self::new(user, SERVICE_SSH_CONNECTION, "none", Vec::new())
    }

    /// Creates a publickey request. `signature` present means the signed
    /// form (first payload byte 1), absent means the query form (0).
    pub fn publickey(
        user: impl Into<String>,
        algorithm: &str,
        key_blob: &[u8],
        signature: Option<&Signature>,
    ) -> Self {
        let payload = encode_public_key_payload(algorithm, key_blob, signature);
        Self::new(user, SERVICE_SSH_CONNECTION, "publickey", payload)
    }

    /// Returns the user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Overwrites the user name, leaving everything else untouched.
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = user.into();
    }

    /// Returns the service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the method-specific payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, self.user.as_bytes());
        write_string(&mut buf, self.service.as_bytes());
        write_string(&mut buf, self.method.as_bytes());
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses an authentication request.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Protocol`] if the message is truncated or not
    /// SSH_MSG_USERAUTH_REQUEST.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        match data.first().copied() {
            Some(b) if b == MessageType::UserauthRequest as u8 => {}
            Some(other) => {
                return Err(WeirError::Protocol(format!(
                    "Message {} where SSH_MSG_USERAUTH_REQUEST (50) was expected",
                    other
                )))
            }
            None => {
                return Err(WeirError::Protocol(
                    "Empty USERAUTH_REQUEST message".to_string(),
                ))
            }
        }

        let mut offset = 1;
        let user = read_utf8(data, &mut offset)?;
        let service = read_utf8(data, &mut offset)?;
        let method = read_utf8(data, &mut offset)?;
        let payload = data[offset..].to_vec();

        Ok(Self {
            user,
            service,
            method,
            payload,
        })
    }
}

/// Decomposed publickey method payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPayload {
    /// True for the query form (first byte 0): the client is probing
    /// whether the key would be accepted. False for the signed form.
    pub is_query: bool,
    /// The public key carried by the request.
    pub key: PublicKey,
    /// The signature; present exactly when `is_query` is false.
    pub signature: Option<Signature>,
}

/// Parses the payload of a publickey USERAUTH_REQUEST.
///
/// ```text
/// boolean   FALSE = query, TRUE = signed
/// string    public key algorithm name
/// string    public key blob
/// [string   signature]            (signed form only)
/// ```
///
/// The query form must end after the key blob; the signed form must end
/// after the signature.
///
/// # Errors
///
/// - [`WeirError::Protocol`] on truncation or trailing bytes
/// - [`WeirError::Security`] if the algorithm is not on the accept list
pub fn parse_public_key_payload(payload: &[u8]) -> WeirResult<PublicKeyPayload> {
    if payload.is_empty() {
        return Err(WeirError::Protocol(
            "publickey payload is empty".to_string(),
        ));
    }

    let is_query = payload[0] == 0;
    let mut offset = 1;

    let algo_bytes = read_string(payload, &mut offset)?;
    let algorithm = String::from_utf8(algo_bytes)
        .map_err(|_| WeirError::Protocol("publickey algorithm is not UTF-8".to_string()))?;

    if !is_acceptable_algo(&algorithm) {
        return Err(WeirError::Security(format!(
            "Public key algorithm '{}' not accepted",
            algorithm
        )));
    }

    let key_blob = read_string(payload, &mut offset)?;
    let key = PublicKey::from_wire(&key_blob)?;

    let signature = if is_query {
        None
    } else {
        let sig_bytes = read_string(payload, &mut offset)?;
        Some(Signature::from_wire(&sig_bytes)?)
    };

    if offset != payload.len() {
        return Err(WeirError::Protocol(
            "Trailing bytes in publickey payload".to_string(),
        ));
    }

    Ok(PublicKeyPayload {
        is_query,
        key,
        signature,
    })
}

/// Encodes a publickey method payload; the inverse of
/// [`parse_public_key_payload`].
pub fn encode_public_key_payload(
    algorithm: &str,
    key_blob: &[u8],
    signature: Option<&Signature>,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(if signature.is_some() { 1 } else { 0 });
    write_string(&mut buf, algorithm.as_bytes());
    write_string(&mut buf, key_blob);
    if let Some(sig) = signature {
        write_string(&mut buf, &sig.to_wire());
    }
    buf.to_vec()
}

/// Builds the bytes a publickey signature covers (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
///
/// The leading session identifier is what binds a signature to one
/// transport: the downstream's signature is checked against the downstream
/// session ID and the re-signed upstream attempt covers the upstream's.
pub fn construct_signature_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_string(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user.as_bytes());
    write_string(&mut buf, service.as_bytes());
    write_string(&mut buf, b"publickey");
    buf.put_u8(1);
    write_string(&mut buf, algorithm.as_bytes());
    write_string(&mut buf, public_key_blob);
    buf.to_vec()
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Authentications that can continue
    methods_can_continue: Vec<String>,
    /// Partial success flag
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        write_string(&mut buf, self.methods_can_continue.join(",").as_bytes());
        buf.put_u8(if self.partial_success { 1 } else { 0 });
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthFailure as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_FAILURE message".to_string(),
            ));
        }

        let mut offset = 1;
        let methods_str = read_utf8(data, &mut offset)?;
        let methods_can_continue: Vec<String> = if methods_str.is_empty() {
            vec![]
        } else {
            methods_str.split(',').map(String::from).collect()
        };

        if offset >= data.len() {
            return Err(WeirError::Protocol(
                "USERAUTH_FAILURE ends before the partial-success flag".to_string(),
            ));
        }
        let partial_success = data[offset] != 0;

        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS (RFC 4252 Section 5.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Creates a new authentication success message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthSuccess as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_SUCCESS message".to_string(),
            ));
        }
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner message
    message: String,
    /// Language tag (usually "")
    language_tag: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        write_string(&mut buf, self.message.as_bytes());
        write_string(&mut buf, self.language_tag.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthBanner as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_BANNER message".to_string(),
            ));
        }

        let mut offset = 1;
        let message = read_utf8(data, &mut offset)?;
        let language_tag = read_utf8(data, &mut offset)?;

        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (RFC 4252 Section 7).
///
/// The server's acknowledgement that a queried public key would be
/// acceptable. The proxy synthesizes this toward the downstream, echoing
/// the downstream's own key, after probing the upstream with the substitute
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Public key algorithm name
    algorithm: String,
    /// Public key blob
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new SSH_MSG_USERAUTH_PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        write_string(&mut buf, self.algorithm.as_bytes());
        write_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_PK_OK message".to_string(),
            ));
        }

        let mut offset = 1;
        let algorithm = read_utf8(data, &mut offset)?;
        let public_key = read_string(data, &mut offset)?;

        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text shown to the user.
    pub text: String,
    /// Whether the user's input should be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
///
/// Shares message number 60 with PK_OK; during a keyboard-interactive
/// exchange it is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Challenge name.
    pub name: String,
    /// Challenge instruction.
    pub instruction: String,
    /// Prompts to show.
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8); // 60, INFO_REQUEST
        write_string(&mut buf, self.name.as_bytes());
        write_string(&mut buf, self.instruction.as_bytes());
        write_string(&mut buf, b""); // language tag
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            write_string(&mut buf, prompt.text.as_bytes());
            buf.put_u8(if prompt.echo { 1 } else { 0 });
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_INFO_REQUEST message".to_string(),
            ));
        }

        let mut offset = 1;
        let name = read_utf8(data, &mut offset)?;
        let instruction = read_utf8(data, &mut offset)?;
        let _language = read_utf8(data, &mut offset)?;

        if offset + 4 > data.len() {
            return Err(WeirError::Protocol(
                "USERAUTH_INFO_REQUEST truncated".to_string(),
            ));
        }
        let num_prompts = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        offset += 4;

        let mut prompts = Vec::with_capacity(num_prompts);
        for _ in 0..num_prompts {
            let text = read_utf8(data, &mut offset)?;
            if offset >= data.len() {
                return Err(WeirError::Protocol(
                    "USERAUTH_INFO_REQUEST truncated (missing echo flag)".to_string(),
                ));
            }
            let echo = data[offset] != 0;
            offset += 1;
            prompts.push(Prompt { text, echo });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Answers, one per prompt.
    pub answers: Vec<String>,
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.answers.len() as u32);
        for answer in &self.answers {
            write_string(&mut buf, answer.as_bytes());
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> WeirResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthInfoResponse as u8 {
            return Err(WeirError::Protocol(
                "Invalid USERAUTH_INFO_RESPONSE message".to_string(),
            ));
        }

        let mut offset = 1;
        if offset + 4 > data.len() {
            return Err(WeirError::Protocol(
                "USERAUTH_INFO_RESPONSE truncated".to_string(),
            ));
        }
        let num_answers = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        offset += 4;

        let mut answers = Vec::with_capacity(num_answers);
        for _ in 0..num_answers {
            answers.push(read_utf8(data, &mut offset)?);
        }

        Ok(Self { answers })
    }
}

// String helpers (RFC 4251 Section 5).

fn write_string(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn read_string(data: &[u8], offset: &mut usize) -> WeirResult<Vec<u8>> {
    crate::ssh::keys::read_string(data, offset)
}

fn read_utf8(data: &[u8], offset: &mut usize) -> WeirResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| WeirError::Protocol("String field is not valid UTF-8".to_string()))
}
