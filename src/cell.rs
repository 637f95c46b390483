//! `Cell` — an encrypted container binding a plaintext JSON value to an
//! immutable context (spec §4.3). The context becomes the cipher's AAD, so
//! any caller reconstructing a cell under a different context fails
//! decryption rather than silently reading stale/foreign data.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::canon::Context;
use crate::error::{CoreError, CoreResult};

/// Narrow capability interface a `Cell` encrypts/decrypts through. Both
/// `KeySequenceCipher` (shard item/index cells) and a raw single-key AEAD
/// cipher (key cells wrapped under a parent cipher) implement this.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, context: &Context, plaintext: &[u8]) -> CoreResult<Vec<u8>>;
    async fn decrypt(&self, context: &Context, ciphertext: &[u8]) -> CoreResult<Vec<u8>>;
}

/// How a cell's plaintext is framed as bytes before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// `serde_json` text.
    Json,
    /// Raw bytes, passed through unchanged (used for key cells).
    Raw,
}

fn encode_plaintext(codec: Codec, value: &Value) -> CoreResult<Vec<u8>> {
    match codec {
        Codec::Json => Ok(serde_json::to_vec(value)?),
        Codec::Raw => match value {
            Value::String(s) => base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                s,
            )
            .map_err(CoreError::from),
            _ => Err(CoreError::Corrupt("raw codec expects base64 string value".into())),
        },
    }
}

fn decode_plaintext(codec: Codec, bytes: Vec<u8>) -> CoreResult<Value> {
    match codec {
        Codec::Json => Ok(serde_json::from_slice(&bytes)?),
        Codec::Raw => Ok(Value::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            bytes,
        ))),
    }
}

struct CellState {
    /// Ciphertext as loaded from storage, or last produced by `serialize`.
    ciphertext: Option<Vec<u8>>,
    /// Decrypted plaintext, cached after first `get()`.
    plaintext: Option<Value>,
    modified: bool,
}

/// An encrypted wrapper around a plaintext JSON value.
///
/// The cache is behind its own `Mutex` rather than requiring `&mut self`, so
/// a caller holding only a shared (read) lock on the enclosing shard can
/// still call `get`/`serialize` — the lock is never held across the cipher's
/// `.await`, only around the short synchronous cache check/update either
/// side of it.
pub struct Cell {
    cipher: Arc<dyn Cipher>,
    codec: Codec,
    context: Context,
    state: Mutex<CellState>,
}

impl Cell {
    pub fn new(cipher: Arc<dyn Cipher>, codec: Codec, context: Context, data: Option<Vec<u8>>) -> Self {
        Self {
            cipher,
            codec,
            context,
            state: Mutex::new(CellState { ciphertext: data, plaintext: None, modified: false }),
        }
    }

    pub fn empty(cipher: Arc<dyn Cipher>, codec: Codec, context: Context) -> Self {
        Self::new(cipher, codec, context, None)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Decrypted value, cached after first decryption. `None` for an empty
    /// cell. Fails `Decrypt` on AAD/key mismatch or tampering.
    pub async fn get(&self) -> CoreResult<Option<Value>> {
        let ciphertext = {
            let state = self.state.lock().unwrap();
            match &state.plaintext {
                Some(value) => return Ok(Some(value.clone())),
                None => match &state.ciphertext {
                    Some(bytes) => bytes.clone(),
                    None => return Ok(None),
                },
            }
        };
        let plaintext_bytes = self.cipher.decrypt(&self.context, &ciphertext).await?;
        let value = decode_plaintext(self.codec, plaintext_bytes)?;
        self.state.lock().unwrap().plaintext = Some(value.clone());
        Ok(Some(value))
    }

    /// Store a new plaintext value; does not re-encrypt until `serialize`.
    pub fn set(&self, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.plaintext = Some(value);
        state.modified = true;
    }

    /// `set(f(get()))`.
    pub async fn update<F>(&self, f: F) -> CoreResult<()>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let current = self.get().await?;
        self.set(f(current));
        Ok(())
    }

    /// Re-encrypt with a fresh IV if modified since load; otherwise return
    /// the cached ciphertext unchanged, so serializing an untouched shard
    /// is byte-for-byte stable.
    pub async fn serialize(&self) -> CoreResult<Vec<u8>> {
        let plaintext = {
            let state = self.state.lock().unwrap();
            if !state.modified {
                return state
                    .ciphertext
                    .clone()
                    .ok_or_else(|| CoreError::Corrupt("cannot serialize an empty cell".into()));
            }
            state.plaintext.clone()
        };
        let value = plaintext.ok_or_else(|| CoreError::Corrupt("cannot serialize a null cell".into()))?;
        if value.is_null() {
            return Err(CoreError::Corrupt("cannot serialize a null cell".into()));
        }
        let plaintext_bytes = encode_plaintext(self.codec, &value)?;
        let ciphertext = self.cipher.encrypt(&self.context, &plaintext_bytes).await?;
        let mut state = self.state.lock().unwrap();
        state.ciphertext = Some(ciphertext.clone());
        state.modified = false;
        Ok(ciphertext)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.ciphertext.is_none() && state.plaintext.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{context, CanonValue};
    use std::sync::Mutex;

    /// A trivial fixed-key AEAD cipher for tests, grounded the same way as
    /// the key-cell "parent cipher" role in `KeySequenceCipher`.
    struct FixedCipher {
        key: [u8; 32],
        decrypt_calls: Mutex<u32>,
    }

    impl FixedCipher {
        fn new() -> Self {
            Self {
                key: *crate::crypto::aead::random_key(),
                decrypt_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Cipher for FixedCipher {
        async fn encrypt(&self, context: &Context, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
            crate::crypto::aead::seal(&self.key, plaintext, &crate::canon::encode(context))
        }
        async fn decrypt(&self, context: &Context, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
            *self.decrypt_calls.lock().unwrap() += 1;
            crate::crypto::aead::open(&self.key, ciphertext, &crate::canon::encode(context))
        }
    }

    fn ctx(file: &str) -> Context {
        context([("file", CanonValue::from(file))])
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher, Codec::Json, ctx("s1"));
        cell.set(serde_json::json!({"a": 1}));
        cell.serialize().await.unwrap();
        assert_eq!(cell.get().await.unwrap(), Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn empty_cell_returns_none() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher, Codec::Json, ctx("s1"));
        assert_eq!(cell.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn serialize_on_unmodified_cell_is_idempotent() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher, Codec::Json, ctx("s1"));
        cell.set(serde_json::json!("v"));
        let first = cell.serialize().await.unwrap();
        let second = cell.serialize().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn wrong_context_fails_decrypt() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher.clone(), Codec::Json, ctx("s1"));
        cell.set(serde_json::json!("v"));
        let bytes = cell.serialize().await.unwrap();

        let reloaded = Cell::new(cipher, Codec::Json, ctx("s2"), Some(bytes));
        let err = reloaded.get().await.unwrap_err();
        assert!(matches!(err, CoreError::Decrypt(_)));
    }

    #[tokio::test]
    async fn get_caches_plaintext_after_first_decrypt() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher.clone(), Codec::Json, ctx("s1"));
        cell.set(serde_json::json!("v"));
        let bytes = cell.serialize().await.unwrap();

        let reloaded = Cell::new(cipher.clone(), Codec::Json, ctx("s1"), Some(bytes));
        reloaded.get().await.unwrap();
        reloaded.get().await.unwrap();
        assert_eq!(*cipher.decrypt_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn serialize_empty_cell_fails_corrupt() {
        let cipher = Arc::new(FixedCipher::new());
        let cell = Cell::empty(cipher, Codec::Json, ctx("s1"));
        let err = cell.serialize().await.unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }
}
