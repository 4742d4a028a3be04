//! Inbound envelope verification.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use ed25519_dalek::VerifyingKey;

use super::{Envelope, EnvelopeError, parse_timestamp};
use crate::crypto;

/// Verifies inbound envelopes and tracks per-peer replay floors.
///
/// Checks run in strict order: signature, then timestamp skew (when
/// configured), then the replay floor. The floor is only advanced after
/// everything else passed, so a rejected envelope has no effect at all;
/// a forged sequence value cannot poison the floor.
///
/// Peers are keyed by `(from, device_id)`. Floors start at zero and
/// sequence counters start issuing at one, so the first envelope from a
/// fresh peer always passes.
#[derive(Debug)]
pub struct EnvelopeVerifier {
    key: VerifyingKey,
    max_skew_secs: Option<i64>,
    floors: Mutex<HashMap<(String, String), u64>>,
}

impl EnvelopeVerifier {
    /// Verifier trusting `key`, with no timestamp skew enforcement.
    #[must_use]
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key,
            max_skew_secs: None,
            floors: Mutex::new(HashMap::new()),
        }
    }

    /// Enables timestamp skew enforcement with the given bound.
    #[must_use]
    pub const fn with_max_skew_secs(mut self, max_skew_secs: i64) -> Self {
        self.max_skew_secs = Some(max_skew_secs);
        self
    }

    /// Parses and verifies wire text in one step.
    ///
    /// # Errors
    ///
    /// All failure modes of [`Envelope::parse`] and
    /// [`EnvelopeVerifier::verify`].
    pub fn verify_text(&self, text: &str) -> Result<Envelope, EnvelopeError> {
        self.verify(Envelope::parse(text)?)
    }

    /// Verifies a parsed envelope and advances the peer's replay floor.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Unsigned`],
    /// [`EnvelopeError::SignatureInvalid`],
    /// [`EnvelopeError::TimestampSkew`], or
    /// [`EnvelopeError::SequenceReplayed`].
    pub fn verify(&self, envelope: Envelope) -> Result<Envelope, EnvelopeError> {
        let Some(sig) = envelope.sig.as_deref() else {
            return Err(EnvelopeError::Unsigned);
        };

        let input = envelope.signing_input()?;
        crypto::verify_b64(input.as_bytes(), sig, &self.key)
            .map_err(|_| EnvelopeError::SignatureInvalid)?;

        if let Some(max_skew_secs) = self.max_skew_secs {
            let stamped = parse_timestamp(&envelope.timestamp)?;
            let skew = (Utc::now() - stamped).num_seconds().abs();
            if skew > max_skew_secs {
                return Err(EnvelopeError::TimestampSkew {
                    timestamp: envelope.timestamp.clone(),
                    max_skew_secs,
                });
            }
        }

        let mut floors = self.lock();
        let floor = floors
            .entry((envelope.from.clone(), envelope.device_id.clone()))
            .or_insert(0);
        if envelope.seq <= *floor {
            return Err(EnvelopeError::SequenceReplayed {
                seq: envelope.seq,
                last: *floor,
            });
        }
        *floor = envelope.seq;
        drop(floors);

        Ok(envelope)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), u64>> {
        self.floors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
