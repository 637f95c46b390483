//! Canonical context encoder. Encodes a mapping of string keys to
//! (string | non-negative integer | bytes) values into a deterministic
//! byte sequence (spec §4.2). This is the AAD for every AES-GCM operation
//! and the message for every HMAC signature in the system — reordering or
//! re-typing a field changes the encoding and breaks every decrypt/verify
//! downstream, so this module has no room for "clever" shortcuts.

use std::collections::BTreeMap;

/// One field value in a binding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonValue {
    Str(String),
    /// Non-negative integer, rendered as a decimal string (spec §9 open
    /// question: decimal-string chosen over raw `u64` bytes so the format
    /// stays stable under a language-neutral re-implementation).
    UInt(u64),
    Bytes(Vec<u8>),
}

impl From<&str> for CanonValue {
    fn from(s: &str) -> Self {
        CanonValue::Str(s.to_string())
    }
}

impl From<String> for CanonValue {
    fn from(s: String) -> Self {
        CanonValue::Str(s)
    }
}

impl From<u64> for CanonValue {
    fn from(v: u64) -> Self {
        CanonValue::UInt(v)
    }
}

impl From<u32> for CanonValue {
    fn from(v: u32) -> Self {
        CanonValue::UInt(v as u64)
    }
}

impl CanonValue {
    fn as_bytes(&self) -> Vec<u8> {
        match self {
            CanonValue::Str(s) => s.as_bytes().to_vec(),
            CanonValue::UInt(v) => v.to_string().into_bytes(),
            CanonValue::Bytes(b) => b.clone(),
        }
    }
}

/// A binding context: an immutable sorted key/value map. `BTreeMap<String,
/// _>` already orders keys by `Ord for String`, which for valid UTF-8
/// agrees with sorting by UTF-8 byte representation.
pub type Context = BTreeMap<String, CanonValue>;

pub fn context<const N: usize>(pairs: [(&str, CanonValue); N]) -> Context {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Encode a context deterministically: `u64` key count (`2 * len`), then for
/// each key in sorted order `u64 len_k || key || u64 len_v || value`.
pub fn encode(ctx: &Context) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&((ctx.len() as u64) * 2).to_be_bytes());
    for (key, value) in ctx {
        let key_bytes = key.as_bytes();
        let value_bytes = value.as_bytes();
        out.extend_from_slice(&(key_bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.extend_from_slice(&(value_bytes.len() as u64).to_be_bytes());
        out.extend_from_slice(&value_bytes);
    }
    out
}

/// Extend a context with additional fields, returning a new context. Used
/// everywhere a caller-supplied context must be bound with extra fields
/// (e.g. `KeySequenceCipher` adding `key: seq`).
pub fn extend(base: &Context, extra: impl IntoIterator<Item = (String, CanonValue)>) -> Context {
    let mut out = base.clone();
    out.extend(extra);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_does_not_affect_encoding() {
        let a = context([("b", CanonValue::from("2")), ("a", CanonValue::from("1"))]);
        let b = context([("a", CanonValue::from("1")), ("b", CanonValue::from("2"))]);
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn differing_values_change_encoding() {
        let a = context([("file", CanonValue::from("shard-1"))]);
        let b = context([("file", CanonValue::from("shard-2"))]);
        assert_ne!(encode(&a), encode(&b));
    }

    #[test]
    fn integer_uses_decimal_string_not_raw_bytes() {
        let ctx = context([("key", CanonValue::from(7u32))]);
        let encoded = encode(&ctx);
        // Value bytes for the integer should be the ASCII digit '7', not
        // the 4-byte big-endian encoding of 7.
        assert!(encoded.ends_with(b"7"));
    }

    #[test]
    fn extend_adds_fields_without_mutating_base() {
        let base = context([("file", CanonValue::from("s1"))]);
        let extended = extend(&base, [("key".to_string(), CanonValue::from(3u32))]);
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_ne!(encode(&base), encode(&extended));
    }
}
