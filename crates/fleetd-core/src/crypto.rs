//! Signing, verification, and key handling.
//!
//! Two signature shapes exist in the protocol:
//!
//! - Backend envelopes carry an **untagged** base64 Ed25519 signature in
//!   their `sig` field; both sides know the algorithm a priori.
//! - Kernel responses carry a **tagged** [`SignatureStamp`]
//!   (`ed25519:<base64>` or `blake3:<hex>`), because the kernel service
//!   signs when it has a key and falls back to an integrity hash when it
//!   does not. The relay treats the two with different assurance.
//!
//! Seeds are 32 bytes, stored base64-encoded at rest in files with mode
//! 0600, and wiped from intermediate buffers after key construction.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq as _;
use tracing::info;
use zeroize::{Zeroize as _, Zeroizing};

use crate::fs_safe::{self, FsSafeError};

/// Ed25519 seed length in bytes.
pub const SEED_LEN: usize = 32;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Upper bound on key file size; a base64 seed plus whitespace is far
/// below this.
const MAX_KEY_FILE_LEN: u64 = 4096;

/// Prefix tag for Ed25519 signature stamps.
const STAMP_TAG_ED25519: &str = "ed25519:";

/// Prefix tag for BLAKE3 integrity stamps.
const STAMP_TAG_BLAKE3: &str = "blake3:";

/// Errors from signing, verification, and key loading.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A seed could not be decoded into a 32-byte Ed25519 seed.
    #[error("invalid signing seed: {reason}")]
    InvalidSeed {
        /// What was wrong with it.
        reason: String,
    },

    /// A public key could not be decoded.
    #[error("invalid verifying key: {reason}")]
    InvalidKey {
        /// What was wrong with it.
        reason: String,
    },

    /// A signature could not be decoded into signature bytes.
    #[error("invalid signature encoding: {reason}")]
    InvalidSignature {
        /// What was wrong with it.
        reason: String,
    },

    /// The signature decoded but does not verify over the message.
    #[error("signature does not verify")]
    SignatureMismatch,

    /// A BLAKE3 integrity stamp does not match the message.
    #[error("integrity hash does not match")]
    HashMismatch,

    /// A key file is readable by group or other.
    #[error("key file {} has mode {mode:o}; refusing anything wider than 0600", path.display())]
    KeyFilePermissions {
        /// The offending file.
        path: PathBuf,
        /// Its current mode bits.
        mode: u32,
    },

    /// A signature stamp carried an unrecognized tag.
    #[error("unrecognized signature stamp format: {got:?}")]
    UnknownStampFormat {
        /// The stamp text up to the first colon (or all of it).
        got: String,
    },

    /// An Ed25519 stamp arrived but no verifying key is configured.
    #[error("no verifying key available for signature check")]
    VerifyingKeyUnavailable,

    /// Key file I/O failed.
    #[error(transparent)]
    Fs(#[from] FsSafeError),
}

/// An Ed25519 signing identity.
///
/// Wraps the private key so signing is the only operation that can touch
/// it; `Debug` prints the public half only.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Builds a signer from a base64-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSeed`] if the text is not base64 or
    /// does not decode to exactly 32 bytes.
    pub fn from_seed_b64(text: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(BASE64.decode(text.trim().as_bytes()).map_err(|err| {
            CryptoError::InvalidSeed {
                reason: err.to_string(),
            }
        })?);
        if decoded.len() != SEED_LEN {
            return Err(CryptoError::InvalidSeed {
                reason: format!("expected {SEED_LEN}-byte seed, got {}", decoded.len()),
            });
        }
        let mut seed = [0_u8; SEED_LEN];
        seed.copy_from_slice(&decoded);
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(Self { key })
    }

    /// Loads a signer from a key file containing a base64 seed.
    ///
    /// The file must not be a symlink and must not be readable by group
    /// or other.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFilePermissions`] on overly permissive
    /// files, plus the failure modes of [`Signer::from_seed_b64`].
    pub fn from_seed_file(path: &Path) -> Result<Self, CryptoError> {
        check_key_file_mode(path)?;
        let bytes = Zeroizing::new(fs_safe::bounded_read(path, MAX_KEY_FILE_LEN)?);
        let text = std::str::from_utf8(&bytes).map_err(|_| CryptoError::InvalidSeed {
            reason: "key file is not UTF-8".to_string(),
        })?;
        Self::from_seed_b64(text)
    }

    /// Loads the signer at `path`, generating and persisting a new one if
    /// the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Signer::from_seed_file`] and
    /// [`fs_safe::atomic_write`].
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match Self::from_seed_file(path) {
            Ok(signer) => Ok(signer),
            Err(CryptoError::Fs(ref fs_err)) if fs_safe::is_not_found(fs_err) => {
                let signer = Self::generate();
                fs_safe::atomic_write(path, signer.seed_b64().as_bytes())?;
                info!(
                    key_path = %path.display(),
                    public_key = %signer.verifying_key_b64(),
                    "generated new persistent signing key"
                );
                Ok(signer)
            }
            Err(err) => Err(err),
        }
    }

    /// Signs a message, returning the untagged base64 signature used in
    /// envelope `sig` fields.
    #[must_use]
    pub fn sign_b64(&self, message: &[u8]) -> String {
        BASE64.encode(self.key.sign(message).to_bytes())
    }

    /// The public half of this identity.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// The public half, base64-encoded for transport and logs.
    #[must_use]
    pub fn verifying_key_b64(&self) -> String {
        BASE64.encode(self.key.verifying_key().to_bytes())
    }

    fn seed_b64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.key.to_bytes()))
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &self.verifying_key_b64())
            .finish_non_exhaustive()
    }
}

/// Where a signing identity comes from, in configuration precedence
/// order: inline seed, key file, then the platform key store (file-backed
/// under the daemon state directory, generated on first use).
#[derive(Clone)]
pub enum KeySource {
    /// Base64 seed supplied directly, normally via environment.
    Inline(String),
    /// Path to a key file holding a base64 seed (mode 0600 enforced).
    File(PathBuf),
    /// Labelled slot in the platform key store.
    Platform {
        /// Key store directory.
        dir: PathBuf,
        /// Slot name; the seed lives at `<dir>/<label>.key`.
        label: String,
    },
}

impl KeySource {
    /// Resolves the source into a usable [`Signer`].
    ///
    /// # Errors
    ///
    /// Propagates decode, permission, and I/O failures from the
    /// underlying loader.
    pub fn load(&self) -> Result<Signer, CryptoError> {
        match self {
            Self::Inline(seed_b64) => Signer::from_seed_b64(seed_b64),
            Self::File(path) => Signer::from_seed_file(path),
            Self::Platform { dir, label } => {
                Signer::load_or_generate(&dir.join(format!("{label}.key")))
            }
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("KeySource::Inline(<redacted>)"),
            Self::File(path) => f.debug_tuple("KeySource::File").field(path).finish(),
            Self::Platform { dir, label } => f
                .debug_struct("KeySource::Platform")
                .field("dir", dir)
                .field("label", label)
                .finish(),
        }
    }
}

/// Decodes a base64 Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the text is not base64, is the
/// wrong length, or is not a valid curve point.
pub fn parse_verifying_key_b64(text: &str) -> Result<VerifyingKey, CryptoError> {
    let decoded = BASE64
        .decode(text.trim().as_bytes())
        .map_err(|err| CryptoError::InvalidKey {
            reason: err.to_string(),
        })?;
    let bytes: [u8; 32] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey {
            reason: format!("expected 32-byte key, got {}", decoded.len()),
        })?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| CryptoError::InvalidKey {
        reason: err.to_string(),
    })
}

/// Verifies an untagged base64 Ed25519 signature over `message`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidSignature`] on decode failure or
/// [`CryptoError::SignatureMismatch`] if the signature does not verify.
pub fn verify_b64(
    message: &[u8],
    signature_b64: &str,
    key: &VerifyingKey,
) -> Result<(), CryptoError> {
    let decoded =
        BASE64
            .decode(signature_b64.as_bytes())
            .map_err(|err| CryptoError::InvalidSignature {
                reason: err.to_string(),
            })?;
    let bytes: [u8; SIGNATURE_LEN] =
        decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature {
                reason: format!("expected {SIGNATURE_LEN}-byte signature, got {}", decoded.len()),
            })?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// Compares two byte strings in constant time.
///
/// Used wherever an attacker-supplied value is compared against a pinned
/// secret-adjacent value (policy hashes, integrity digests). Lengths are
/// compared first; length is not secret here.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// What a successful stamp verification actually proved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampAssurance {
    /// An Ed25519 signature verified against a configured key: the
    /// message is authentic.
    Signed,
    /// Only a BLAKE3 hash matched: the message was not corrupted in
    /// transit, but anyone could have produced it.
    IntegrityOnly,
}

/// Tagged signature stamp carried on kernel responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStamp {
    /// `ed25519:<base64 signature>`.
    Ed25519(String),
    /// `blake3:<hex digest>` integrity fallback.
    Blake3(String),
}

impl SignatureStamp {
    /// Signs `message` and wraps the signature in a tagged stamp.
    #[must_use]
    pub fn ed25519(signer: &Signer, message: &[u8]) -> Self {
        Self::Ed25519(signer.sign_b64(message))
    }

    /// Hashes `message` into an integrity-only stamp.
    #[must_use]
    pub fn blake3(message: &[u8]) -> Self {
        Self::Blake3(hex::encode(blake3::hash(message).as_bytes()))
    }

    /// Parses a tagged stamp from wire text.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownStampFormat`] for unrecognized tags.
    pub fn parse(text: &str) -> Result<Self, CryptoError> {
        if let Some(payload) = text.strip_prefix(STAMP_TAG_ED25519) {
            Ok(Self::Ed25519(payload.to_string()))
        } else if let Some(payload) = text.strip_prefix(STAMP_TAG_BLAKE3) {
            Ok(Self::Blake3(payload.to_string()))
        } else {
            let got = text.split(':').next().unwrap_or(text).to_string();
            Err(CryptoError::UnknownStampFormat { got })
        }
    }

    /// Verifies the stamp over `message`.
    ///
    /// Ed25519 stamps require `key`; BLAKE3 stamps are recomputed and
    /// compared in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::VerifyingKeyUnavailable`] for an Ed25519
    /// stamp with no key, [`CryptoError::SignatureMismatch`] or
    /// [`CryptoError::HashMismatch`] when the stamp does not match, and
    /// decode errors for malformed payloads.
    pub fn verify(
        &self,
        message: &[u8],
        key: Option<&VerifyingKey>,
    ) -> Result<StampAssurance, CryptoError> {
        match self {
            Self::Ed25519(signature_b64) => {
                let key = key.ok_or(CryptoError::VerifyingKeyUnavailable)?;
                verify_b64(message, signature_b64, key)?;
                Ok(StampAssurance::Signed)
            }
            Self::Blake3(digest_hex) => {
                let decoded =
                    hex::decode(digest_hex).map_err(|err| CryptoError::InvalidSignature {
                        reason: err.to_string(),
                    })?;
                let expected: [u8; 32] =
                    decoded
                        .as_slice()
                        .try_into()
                        .map_err(|_| CryptoError::InvalidSignature {
                            reason: format!("expected 32-byte digest, got {}", decoded.len()),
                        })?;
                if constant_time_eq(&expected, blake3::hash(message).as_bytes()) {
                    Ok(StampAssurance::IntegrityOnly)
                } else {
                    Err(CryptoError::HashMismatch)
                }
            }
        }
    }
}

impl fmt::Display for SignatureStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519(payload) => write!(f, "{STAMP_TAG_ED25519}{payload}"),
            Self::Blake3(payload) => write!(f, "{STAMP_TAG_BLAKE3}{payload}"),
        }
    }
}

#[cfg(unix)]
fn check_key_file_mode(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path).map_err(|err| {
        CryptoError::Fs(FsSafeError::Io {
            path: path.to_path_buf(),
            source: err,
        })
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CryptoError::KeyFilePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_file_mode(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let signer = Signer::generate();
        let sig = signer.sign_b64(b"payload");
        verify_b64(b"payload", &sig, &signer.verifying_key()).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let signer = Signer::generate();
        let sig = signer.sign_b64(b"payload");
        let err = verify_b64(b"payloaD", &sig, &signer.verifying_key()).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureMismatch));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signer = Signer::generate();
        let other = Signer::generate();
        let sig = signer.sign_b64(b"payload");
        let err = verify_b64(b"payload", &sig, &other.verifying_key()).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureMismatch));
    }

    #[test]
    fn seed_b64_roundtrip_preserves_identity() {
        let signer = Signer::generate();
        let restored = Signer::from_seed_b64(&signer.seed_b64()).unwrap();
        assert_eq!(signer.verifying_key_b64(), restored.verifying_key_b64());
    }

    #[test]
    fn seed_must_be_exactly_32_bytes() {
        use base64::Engine as _;
        let short = base64::engine::general_purpose::STANDARD.encode([7_u8; 16]);
        let err = Signer::from_seed_b64(&short).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSeed { .. }));
    }

    #[test]
    fn load_or_generate_persists_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("agent.key");

        let first = Signer::load_or_generate(&path).unwrap();
        let second = Signer::load_or_generate(&path).unwrap();
        assert_eq!(first.verifying_key_b64(), second.verifying_key_b64());
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_key_file_is_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.key");
        let signer = Signer::generate();
        std::fs::write(&path, signer.seed_b64().as_bytes()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = Signer::from_seed_file(&path).unwrap_err();
        assert!(matches!(err, CryptoError::KeyFilePermissions { .. }));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        Signer::from_seed_file(&path).unwrap();
    }

    #[test]
    fn key_source_precedence_variants_load() {
        let dir = TempDir::new().unwrap();
        let signer = Signer::generate();

        let inline = KeySource::Inline(signer.seed_b64().to_string());
        assert_eq!(
            inline.load().unwrap().verifying_key_b64(),
            signer.verifying_key_b64()
        );

        let platform = KeySource::Platform {
            dir: dir.path().join("keys"),
            label: "kernel".to_string(),
        };
        let generated = platform.load().unwrap();
        let reloaded = platform.load().unwrap();
        assert_eq!(
            generated.verifying_key_b64(),
            reloaded.verifying_key_b64()
        );
    }

    #[test]
    fn stamp_parse_display_roundtrip() {
        for text in ["ed25519:c2ln", "blake3:00ff"] {
            let stamp = SignatureStamp::parse(text).unwrap();
            assert_eq!(stamp.to_string(), text);
        }
        let err = SignatureStamp::parse("hmac:deadbeef").unwrap_err();
        assert!(matches!(err, CryptoError::UnknownStampFormat { got } if got == "hmac"));
    }

    #[test]
    fn ed25519_stamp_verifies_with_key_only() {
        let signer = Signer::generate();
        let stamp = SignatureStamp::ed25519(&signer, b"resp");

        let assurance = stamp.verify(b"resp", Some(&signer.verifying_key())).unwrap();
        assert_eq!(assurance, StampAssurance::Signed);

        let err = stamp.verify(b"resp", None).unwrap_err();
        assert!(matches!(err, CryptoError::VerifyingKeyUnavailable));
    }

    #[test]
    fn blake3_stamp_detects_corruption() {
        let stamp = SignatureStamp::blake3(b"resp");
        assert_eq!(
            stamp.verify(b"resp", None).unwrap(),
            StampAssurance::IntegrityOnly
        );
        let err = stamp.verify(b"resP", None).unwrap_err();
        assert!(matches!(err, CryptoError::HashMismatch));
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
