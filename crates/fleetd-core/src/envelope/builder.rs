//! Outbound envelope construction.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::{Envelope, EnvelopeError, MessageKind, now_timestamp};
use crate::crypto::Signer;
use crate::sequence::SequenceCounter;

/// `from` role used by device agents.
pub const ROLE_AGENT: &str = "agent";

/// `from` role used by the backend.
pub const ROLE_CONTROLLER: &str = "controller";

/// Stamps outbound envelopes: fresh UUIDv4 message id, next durable
/// sequence value, UTC timestamp, current session id, signature.
///
/// The builder holds the session id so callers cannot forget to attach
/// it after authentication; [`EnvelopeBuilder::set_session`] is called
/// once when `AUTH_ACK` arrives and again (with `None`) if the session
/// is torn down.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    role: String,
    device_id: String,
    signer: Arc<Signer>,
    sequence: Arc<SequenceCounter>,
    session_id: Option<String>,
}

impl EnvelopeBuilder {
    /// Builder for an agent identity. Sequence values are consumed from
    /// `sequence`, one per envelope, including envelopes that later fail
    /// to send.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        signer: Arc<Signer>,
        sequence: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            role: ROLE_AGENT.to_string(),
            device_id: device_id.into(),
            signer,
            sequence,
            session_id: None,
        }
    }

    /// Overrides the sender role (the backend test harness uses
    /// [`ROLE_CONTROLLER`]).
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets or clears the session id attached to subsequent envelopes.
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// The session id currently attached to outbound envelopes.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Builds and signs one envelope around `body`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the body does not
    /// serialize, or [`EnvelopeError::Canonical`] if it contains values
    /// with no canonical form (floats).
    pub fn build<B: Serialize>(&self, kind: MessageKind, body: &B) -> Result<Envelope, EnvelopeError> {
        let body = serde_json::to_value(body).map_err(|err| EnvelopeError::Malformed {
            reason: format!("body serialization failed: {err}"),
        })?;

        let mut envelope = Envelope {
            kind,
            from: self.role.clone(),
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            seq: self.sequence.next(),
            timestamp: now_timestamp(),
            body,
            sig: None,
        };
        let input = envelope.signing_input()?;
        envelope.sig = Some(self.signer.sign_b64(input.as_bytes()));
        Ok(envelope)
    }
}
