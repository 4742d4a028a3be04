//! Signed backend envelopes.
//!
//! Every message between agent and backend travels in one envelope shape
//! with a fixed field set. Three rules make the signature unambiguous:
//!
//! - The signed bytes are the canonical encoding
//!   ([`crate::canonical::encode`]) of the envelope with the `sig` field
//!   **removed entirely** (not set to `null`).
//! - Absent optional fields (`session_id` before authentication) are
//!   explicit `null` on the wire, never omitted.
//! - `sig` itself is an untagged base64 Ed25519 signature.
//!
//! [`EnvelopeBuilder`] stamps outbound envelopes (fresh UUID message id,
//! next durable sequence value, UTC timestamp, signature).
//! [`EnvelopeVerifier`] checks inbound ones (signature first, then
//! timestamp skew if configured, then the per-peer replay floor) and
//! rejects without partial effect: an envelope that fails any check
//! leaves the replay floor untouched.

pub mod body;

mod builder;
mod verifier;

pub use builder::{EnvelopeBuilder, ROLE_AGENT, ROLE_CONTROLLER};
pub use verifier::EnvelopeVerifier;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{self, CanonicalError};

/// Wire timestamp format: UTC, second resolution, literal trailing `Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Formats an instant for the wire.
#[must_use]
pub fn format_timestamp(when: DateTime<Utc>) -> String {
    when.format(TIMESTAMP_FORMAT).to_string()
}

/// The current instant in wire format.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parses a wire timestamp.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] if the text does not match
/// [`TIMESTAMP_FORMAT`].
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, EnvelopeError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| EnvelopeError::Malformed {
            reason: format!("bad timestamp {text:?}: {err}"),
        })
}

/// Errors from envelope construction, parsing, and verification.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Canonical encoding or strict parsing failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// A required envelope field is absent. The protocol encodes absent
    /// optionals as explicit `null`, so omission is always an error.
    #[error("envelope field {field:?} is missing; absent values must be explicit null")]
    MissingField {
        /// The missing field name.
        field: &'static str,
    },

    /// The document is not a well-formed envelope.
    #[error("malformed envelope: {reason}")]
    Malformed {
        /// What was wrong with it.
        reason: String,
    },

    /// The body does not match the shape its `type` demands.
    #[error("{kind} body has the wrong shape: {reason}")]
    BodyShape {
        /// Envelope type whose body failed to decode.
        kind: MessageKind,
        /// Decoder diagnostic.
        reason: String,
    },

    /// An operation needing a signed envelope got an unsigned one.
    #[error("envelope is not signed")]
    Unsigned,

    /// The signature does not verify over the canonical signing input.
    #[error("envelope signature does not verify")]
    SignatureInvalid,

    /// The sequence value does not advance past the peer's replay floor.
    #[error("sequence {seq} does not advance past {last}; dropping as replay")]
    SequenceReplayed {
        /// Sequence value on the rejected envelope.
        seq: u64,
        /// Highest value already accepted from this peer.
        last: u64,
    },

    /// The timestamp is further from local time than the verifier allows.
    #[error("timestamp {timestamp:?} is outside the permitted {max_skew_secs}s skew")]
    TimestampSkew {
        /// The rejected timestamp.
        timestamp: String,
        /// The configured bound.
        max_skew_secs: i64,
    },
}

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Agent credentials presentation; the only pre-session message.
    Auth,
    /// Backend session grant.
    AuthAck,
    /// Agent liveness beacon.
    Heartbeat,
    /// Agent metrics report.
    Telemetry,
    /// Backend command for the device.
    CommandDelivery,
    /// Agent receipt acknowledgement, sent before execution.
    CommandAck,
    /// Agent terminal command outcome.
    CommandResult,
    /// Backend update offer.
    UpdateAnnounce,
    /// Agent update lifecycle report.
    UpdateStatus,
    /// Backend policy rotation and quarantine control.
    PolicyUpdate,
}

impl MessageKind {
    /// Wire string for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::AuthAck => "AUTH_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::Telemetry => "TELEMETRY",
            Self::CommandDelivery => "COMMAND_DELIVERY",
            Self::CommandAck => "COMMAND_ACK",
            Self::CommandResult => "COMMAND_RESULT",
            Self::UpdateAnnounce => "UPDATE_ANNOUNCE",
            Self::UpdateStatus => "UPDATE_STATUS",
            Self::PolicyUpdate => "POLICY_UPDATE",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol envelope.
///
/// `deny_unknown_fields` keeps the struct in one-to-one correspondence
/// with the wire document, so re-serializing a parsed envelope cannot
/// silently drop fields that were part of the signed bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender role: `"agent"` or `"controller"`.
    pub from: String,
    /// Stable device identifier.
    pub device_id: String,
    /// Session id; `null` only on `AUTH` (and its wire form is literal
    /// `null`, never omitted).
    pub session_id: Option<String>,
    /// Unique message id (UUIDv4).
    pub message_id: String,
    /// Strictly increasing per-sender sequence value.
    pub seq: u64,
    /// UTC timestamp in [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    /// Type-specific payload; see [`body`].
    pub body: Value,
    /// Untagged base64 Ed25519 signature; `None` only mid-construction.
    pub sig: Option<String>,
}

impl Envelope {
    /// Every field the wire document must carry, in canonical order.
    pub const REQUIRED_FIELDS: [&'static str; 9] = [
        "body",
        "device_id",
        "from",
        "message_id",
        "seq",
        "session_id",
        "sig",
        "timestamp",
        "type",
    ];

    /// Parses an envelope from wire text with strict hygiene (duplicate
    /// keys and depth bombs rejected, all nine fields required).
    ///
    /// Does **not** verify the signature; that is
    /// [`EnvelopeVerifier`]'s job.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Canonical`] for hygiene violations,
    /// [`EnvelopeError::MissingField`] for omitted fields, and
    /// [`EnvelopeError::Malformed`] for type mismatches.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value = canonical::parse_strict(text)?;
        let Some(map) = value.as_object() else {
            return Err(EnvelopeError::Malformed {
                reason: "envelope must be a JSON object".to_string(),
            });
        };
        for field in Self::REQUIRED_FIELDS {
            if !map.contains_key(field) {
                return Err(EnvelopeError::MissingField { field });
            }
        }
        serde_json::from_value(value).map_err(|err| EnvelopeError::Malformed {
            reason: err.to_string(),
        })
    }

    /// The canonical bytes the sender signs: this envelope with `sig`
    /// removed entirely.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Canonical`] if the body cannot be
    /// canonically encoded (e.g. it contains floats).
    pub fn signing_input(&self) -> Result<String, EnvelopeError> {
        let mut value = self.to_value()?;
        if let Some(map) = value.as_object_mut() {
            map.remove("sig");
        }
        Ok(canonical::encode(&value)?)
    }

    /// Canonical wire text of the signed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Unsigned`] if no signature is attached
    /// yet, plus the failure modes of [`Envelope::signing_input`].
    pub fn to_wire(&self) -> Result<String, EnvelopeError> {
        if self.sig.is_none() {
            return Err(EnvelopeError::Unsigned);
        }
        let value = self.to_value()?;
        Ok(canonical::encode(&value)?)
    }

    /// Decodes the body into its typed shape.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::BodyShape`] if the body does not decode
    /// as `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.body.clone()).map_err(|err| EnvelopeError::BodyShape {
            kind: self.kind,
            reason: err.to_string(),
        })
    }

    fn to_value(&self) -> Result<Value, EnvelopeError> {
        serde_json::to_value(self).map_err(|err| EnvelopeError::Malformed {
            reason: err.to_string(),
        })
    }
}
