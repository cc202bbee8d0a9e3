//! The authentication relay between the two halves of a piped connection.
//!
//! Downstream authentication attempts cannot be forwarded as-is: the
//! username usually changes, and a publickey signature is bound to the
//! session ID of the transport it was made for, which the upstream has
//! never seen. The relay translates each downstream USERAUTH_REQUEST into a
//! valid upstream one:
//!
//! - Non-publickey methods pass through with only the username rewritten.
//! - Publickey queries are intercepted: the proxy probes the upstream with
//!   the *substitute* key and, on acceptance, tells the downstream its own
//!   key is fine.
//! - Signed publickey attempts are verified against the downstream session
//!   ID, then re-signed with the substitute key over the upstream session
//!   ID.
//! - Unmapped or unverifiable keys degrade to a `"none"` attempt, so the
//!   upstream produces the rejection and the downstream learns nothing
//!   about why.
//!
//! The relay is strictly sequential: one outstanding upstream request at a
//! time, every downstream packet answered before the next is read.

use std::sync::Arc;

use tracing::{debug, trace};
use weir_platform::{WeirError, WeirResult};

use crate::ssh::auth::{
    construct_signature_data, parse_public_key_payload, AuthPkOk, AuthRequest, PublicKeyPayload,
    SERVICE_SSH_CONNECTION,
};
use crate::ssh::keys::Signer;
use crate::ssh::message::MessageType;
use crate::ssh::piper::{ConnMetadata, KeyMapHook};
use crate::ssh::transport::Transport;

/// Outcome of transforming one downstream authentication request.
enum Transformed {
    /// Forward this (rewritten) request to the upstream and relay the reply.
    Forward(AuthRequest),
    /// Already answered the downstream directly; read its next request.
    Handled,
}

/// Relays authentication until the upstream accepts.
pub(crate) struct AuthRelay<'a> {
    downstream: &'a mut Transport,
    upstream: &'a mut Transport,
    mapped_user: String,
    key_map: Option<Arc<dyn KeyMapHook>>,
    meta: &'a ConnMetadata,
}

impl<'a> AuthRelay<'a> {
    pub(crate) fn new(
        downstream: &'a mut Transport,
        upstream: &'a mut Transport,
        mapped_user: String,
        key_map: Option<Arc<dyn KeyMapHook>>,
        meta: &'a ConnMetadata,
    ) -> Self {
        Self {
            downstream,
            upstream,
            mapped_user,
            key_map,
            meta,
        }
    }

    /// Runs the relay loop, starting from an already-read downstream
    /// request. Returns once the upstream reports success; the success
    /// packet has already been forwarded downstream at that point.
    pub(crate) async fn run(mut self, first: AuthRequest) -> WeirResult<()> {
        let mut request = first;

        loop {
            match self.process(request).await? {
                Transformed::Forward(rewritten) => {
                    debug!(
                        method = %rewritten.method(),
                        user = %rewritten.user(),
                        "forwarding auth request upstream"
                    );
                    self.upstream.write_packet(&rewritten.to_bytes()).await?;

                    let reply = self.upstream.read_packet().await?;
                    let success =
                        reply.first() == Some(&(MessageType::UserauthSuccess as u8));

                    self.downstream.write_packet(&reply).await?;

                    if success {
                        debug!(user = %self.mapped_user, "upstream accepted authentication");
                        return Ok(());
                    }
                    // FAILURE, BANNER and PK_OK all mean: keep relaying.
                }
                Transformed::Handled => {
                    trace!("request handled locally, awaiting next downstream attempt");
                }
            }

            request = next_auth_request(self.downstream).await?;
        }
    }

    /// Transforms one downstream request into its upstream form.
    async fn process(&mut self, mut request: AuthRequest) -> WeirResult<Transformed> {
        // Everything except publickey-with-remapping passes through with
        // only the username rewritten; the payload bytes stay untouched.
        let key_map = match &self.key_map {
            Some(hook) if request.method() == "publickey" => hook.clone(),
            _ => {
                request.set_user(self.mapped_user.as_str());
                return Ok(Transformed::Forward(request));
            }
        };

        let parsed = parse_public_key_payload(request.payload())?;

        let signer = match key_map.map_public_key(self.meta, &parsed.key).await {
            Ok(Some(signer)) => signer,
            // No mapping (or a failing hook): let the upstream reject a
            // "none" attempt instead of explaining ourselves.
            _ => {
                debug!(
                    fingerprint = %parsed.key.fingerprint(),
                    "downstream key has no upstream mapping"
                );
                return Ok(Transformed::Forward(AuthRequest::none(self.mapped_user.as_str())));
            }
        };

        if parsed.is_query {
            self.answer_query(&parsed, signer.as_ref()).await
        } else {
            self.resign(&request, &parsed, signer.as_ref()).await
        }
    }

    /// Handles the query form: probe the upstream with the substitute key
    /// and acknowledge the downstream's own key if it is acceptable.
    ///
    /// Forwarding the query unchanged would offer the upstream a key whose
    /// private half the proxy does not hold, so the probe is made out of
    /// band and the downstream is answered directly.
    async fn answer_query(
        &mut self,
        parsed: &PublicKeyPayload,
        signer: &dyn Signer,
    ) -> WeirResult<Transformed> {
        if self.probe_upstream(signer).await? {
            let ack = AuthPkOk::new(parsed.key.algorithm(), parsed.key.blob().to_vec());
            self.downstream.write_packet(&ack.to_bytes()).await?;
            debug!(
                fingerprint = %parsed.key.fingerprint(),
                "acknowledged downstream key query"
            );
            return Ok(Transformed::Handled);
        }

        Ok(Transformed::Forward(AuthRequest::none(self.mapped_user.as_str())))
    }

    /// Asks the upstream whether it would accept the substitute key.
    async fn probe_upstream(&mut self, signer: &dyn Signer) -> WeirResult<bool> {
        let query = AuthRequest::publickey(
            self.mapped_user.as_str(),
            signer.algorithm_name(),
            &signer.public_key_blob(),
            None,
        );
        self.upstream.write_packet(&query.to_bytes()).await?;

        loop {
            let reply = self.upstream.read_packet().await?;
            match reply.first().copied() {
                Some(b) if b == MessageType::UserauthPkOk as u8 => return Ok(true),
                Some(b) if b == MessageType::UserauthFailure as u8 => return Ok(false),
                // Banners may arrive at any time; pass them along.
                Some(b) if b == MessageType::UserauthBanner as u8 => {
                    self.downstream.write_packet(&reply).await?;
                }
                other => {
                    return Err(WeirError::Protocol(format!(
                        "Unexpected reply {:?} to publickey query",
                        other
                    )))
                }
            }
        }
    }

    /// Handles the signed form: verify the downstream's signature against
    /// the downstream session ID, then produce a fresh signature with the
    /// substitute key over the upstream session ID.
    async fn resign(
        &mut self,
        request: &AuthRequest,
        parsed: &PublicKeyPayload,
        signer: &dyn Signer,
    ) -> WeirResult<Transformed> {
        let signature = match &parsed.signature {
            Some(sig) => sig,
            None => {
                return Err(WeirError::Protocol(
                    "Signed publickey request without signature".to_string(),
                ))
            }
        };

        // The downstream signed over its own session ID and its own user
        // name; anything that does not check out degrades to "none".
        let signed_data = construct_signature_data(
            self.downstream.session_id(),
            request.user(),
            SERVICE_SSH_CONNECTION,
            parsed.key.algorithm(),
            parsed.key.blob(),
        );
        let verified = parsed
            .key
            .verify(&signed_data, signature)
            .unwrap_or(false);
        if !verified {
            debug!(
                fingerprint = %parsed.key.fingerprint(),
                "downstream signature rejected"
            );
            return Ok(Transformed::Forward(AuthRequest::none(self.mapped_user.as_str())));
        }

        // Fresh signature, bound to the upstream's session ID. The
        // downstream's signature is never forwarded.
        let substitute_blob = signer.public_key_blob();
        let upstream_data = construct_signature_data(
            self.upstream.session_id(),
            &self.mapped_user,
            SERVICE_SSH_CONNECTION,
            signer.algorithm_name(),
            &substitute_blob,
        );
        let new_signature = signer.sign(&upstream_data)?;

        let rewritten = AuthRequest::publickey(
            self.mapped_user.as_str(),
            signer.algorithm_name(),
            &substitute_blob,
            Some(&new_signature),
        );

        Ok(Transformed::Forward(rewritten))
    }
}

/// Reads the next USERAUTH_REQUEST from a transport.
///
/// Every request must name the `ssh-connection` service; anything else is a
/// protocol violation (RFC 4252 Section 5).
pub(crate) async fn next_auth_request(transport: &mut Transport) -> WeirResult<AuthRequest> {
    let payload = transport.read_packet().await?;
    let request = AuthRequest::from_bytes(&payload)?;

    if request.service() != SERVICE_SSH_CONNECTION {
        return Err(WeirError::Protocol(format!(
            "Client attempted to negotiate for unknown service: {}",
            request.service()
        )));
    }

    Ok(request)
}
