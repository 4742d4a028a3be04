//! Canonical JSON encoding for signed payloads.
//!
//! Every signature in the fleetd protocol is computed over the canonical
//! encoding of a JSON document, so both sides of every channel must produce
//! identical bytes for equal documents. The rules:
//!
//! - Object keys are sorted by byte-wise lexicographic comparison of their
//!   UTF-8 encoding, recursively at every nesting level.
//! - Compact separators only: `,` between items, `:` between key and value,
//!   no whitespace anywhere.
//! - Numbers must be integers (`i64`/`u64` range). Floating-point values
//!   have no canonical decimal form and are rejected outright.
//! - Strings escape `"`, `\`, and control characters below U+0020 (using
//!   the short forms `\b`, `\f`, `\n`, `\r`, `\t` where they exist, `\uXXXX`
//!   otherwise). All other characters pass through as raw UTF-8.
//! - `null` is emitted literally; callers encode absent optional fields as
//!   explicit `null`, never by omission.
//!
//! [`parse_strict`] is the inbound counterpart: it rejects documents with
//! duplicate object keys or pathological nesting before they reach
//! signature verification, so a verified document always has exactly one
//! canonical form.

use std::fmt::Write as _;

use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde_json::Value;

/// Maximum object/array nesting depth accepted by [`parse_strict`] and
/// produced by [`encode`]. Protocol documents are at most a handful of
/// levels deep; anything near this bound is hostile or corrupt.
pub const MAX_CANONICAL_DEPTH: usize = 64;

/// Marker embedded in deserializer errors for duplicate keys, recovered by
/// [`classify_parse_error`].
const DUPLICATE_KEY_MARKER: &str = "duplicate object key";

/// Marker embedded in deserializer errors for depth violations.
const DEPTH_MARKER: &str = "nesting depth limit";

/// Errors produced by canonical encoding and strict parsing.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The document contains a floating-point number, which has no
    /// canonical representation.
    #[error("number {value} is not an integer and has no canonical form")]
    FloatRejected {
        /// Textual form of the offending number.
        value: String,
    },

    /// The document nests containers deeper than [`MAX_CANONICAL_DEPTH`].
    #[error("document exceeds nesting depth limit of {max}")]
    DepthExceeded {
        /// The enforced depth bound.
        max: usize,
    },

    /// An object repeats a key. Duplicate keys make the signed bytes
    /// ambiguous, so the whole document is rejected.
    #[error("duplicate object key {key:?}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
    },

    /// The input is not a single well-formed JSON document.
    #[error("malformed JSON document: {reason}")]
    Parse {
        /// Underlying parser diagnostic.
        reason: String,
    },
}

/// Encodes a JSON value into its canonical textual form.
///
/// # Errors
///
/// Returns [`CanonicalError::FloatRejected`] if any number in the document
/// is not an integer, or [`CanonicalError::DepthExceeded`] if containers
/// nest beyond [`MAX_CANONICAL_DEPTH`].
pub fn encode(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::with_capacity(128);
    emit_value(value, &mut out, 0)?;
    Ok(out)
}

/// Encodes a JSON value into canonical bytes, ready for signing.
///
/// # Errors
///
/// Same failure modes as [`encode`].
pub fn encode_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    encode(value).map(String::into_bytes)
}

/// Parses a single JSON document, rejecting duplicate object keys,
/// excessive nesting, and trailing input.
///
/// This is the only parse entry point for data that will be fed to
/// signature verification: an accepted document is guaranteed to have
/// exactly one canonical encoding.
///
/// # Errors
///
/// Returns [`CanonicalError::DuplicateKey`], [`CanonicalError::DepthExceeded`],
/// or [`CanonicalError::Parse`] for syntax errors and trailing garbage.
pub fn parse_strict(input: &str) -> Result<Value, CanonicalError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let value = ValueSeed { depth: 0 }
        .deserialize(&mut deserializer)
        .map_err(|err| classify_parse_error(&err))?;
    deserializer
        .end()
        .map_err(|err| classify_parse_error(&err))?;
    Ok(value)
}

/// Returns `true` if `input` parses strictly and is already in canonical
/// form (re-encoding reproduces the input bytes exactly).
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    parse_strict(input)
        .and_then(|value| encode(&value))
        .is_ok_and(|encoded| encoded == input)
}

fn emit_value(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_CANONICAL_DEPTH {
        return Err(CanonicalError::DepthExceeded {
            max: MAX_CANONICAL_DEPTH,
        });
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => emit_number(number, out)?,
        Value::String(text) => emit_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                emit_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // String's Ord is byte-wise lexicographic over UTF-8, which is
            // exactly the sort order the protocol requires.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&map[key.as_str()], out, depth + 1)?;
            }
            out.push('}');
        }
    }

    Ok(())
}

fn emit_number(number: &serde_json::Number, out: &mut String) -> Result<(), CanonicalError> {
    if !number.is_i64() && !number.is_u64() {
        return Err(CanonicalError::FloatRejected {
            value: number.to_string(),
        });
    }
    // Display for integer Numbers is minimal decimal: no sign for zero, no
    // leading zeros, no exponent.
    out.push_str(&number.to_string());
    Ok(())
}

fn emit_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if ch < '\u{20}' => {
                // Remaining C0 controls take the long escape. The write
                // cannot fail on a String.
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

fn classify_parse_error(err: &serde_json::Error) -> CanonicalError {
    let reason = err.to_string();
    if reason.contains(DUPLICATE_KEY_MARKER) {
        let key = reason.split('"').nth(1).unwrap_or_default().to_string();
        CanonicalError::DuplicateKey { key }
    } else if reason.contains(DEPTH_MARKER) {
        CanonicalError::DepthExceeded {
            max: MAX_CANONICAL_DEPTH,
        }
    } else {
        CanonicalError::Parse { reason }
    }
}

/// Deserialization seed that rebuilds a [`Value`] while tracking nesting
/// depth and refusing duplicate object keys.
struct ValueSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor { depth: self.depth })
    }
}

struct ValueVisitor {
    depth: usize,
}

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        // Accepted here so the emitter can report FloatRejected with the
        // value in hand; parse_strict callers never sign floats.
        Ok(serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        if self.depth >= MAX_CANONICAL_DEPTH {
            return Err(de::Error::custom(DEPTH_MARKER));
        }
        let mut items = Vec::new();
        while let Some(item) = access.next_element_seed(ValueSeed {
            depth: self.depth + 1,
        })? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        if self.depth >= MAX_CANONICAL_DEPTH {
            return Err(de::Error::custom(DEPTH_MARKER));
        }
        let mut map = serde_json::Map::new();
        while let Some(key) = access.next_key::<String>()? {
            let value = access.next_value_seed(ValueSeed {
                depth: self.depth + 1,
            })?;
            if map.insert(key.clone(), value).is_some() {
                return Err(de::Error::custom(format!(
                    "{DUPLICATE_KEY_MARKER} \"{key}\""
                )));
            }
        }
        Ok(Value::Object(map))
    }
}
