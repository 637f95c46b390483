//! `KeySequenceCipher` — a per-shard key ring that rotates AES-256-GCM
//! keys at usage limits, with HMAC-authenticated serialization (spec
//! §4.4). Implements [`Cipher`] so a `Shard`'s index/item cells can use it
//! like any other cipher.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::canon::{self, CanonValue, Context};
use crate::cell::{Cell, Cipher, Codec};
use crate::codec::{self, Atom, Field};
use crate::config::CipherLimits;
use crate::counter::CounterBag;
use crate::crypto::{aead, mac};
use crate::error::{CoreError, CoreResult};

const ALGO_AES_256_GCM: &str = "aes-256-gcm";

fn msg_counter_id(seq: u32) -> String {
    format!("{seq}.msg")
}

fn blk_counter_id(seq: u32) -> String {
    format!("{seq}.blk")
}

struct KeyEntry {
    seq: u32,
    /// Encrypted under the parent cipher with context `{...shard_context,
    /// key: seq}`; plaintext is `{"algo": ..., "key": base64(raw key)}`.
    cell: Cell,
}

struct Inner {
    keys: Vec<KeyEntry>,
    counters: CounterBag,
}

/// Wire form of `KeySequenceCipher::serialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySeqState {
    pub keys: Vec<String>,
    pub state: String,
    pub mac: String,
}

pub struct KeySequenceCipher {
    parent: Arc<dyn Cipher>,
    shard_context: Context,
    auth_key: [u8; mac::KEY_LEN],
    limits: CipherLimits,
    inner: Mutex<Inner>,
}

fn key_cell_context(shard_context: &Context, seq: u32) -> Context {
    canon::extend(shard_context, [("key".to_string(), CanonValue::from(seq))])
}

impl KeyEntry {
    fn new(parent: Arc<dyn Cipher>, shard_context: &Context, seq: u32, raw_key: [u8; 32]) -> Self {
        let cell = Cell::empty(parent, Codec::Json, key_cell_context(shard_context, seq));
        cell.set(serde_json::json!({
            "algo": ALGO_AES_256_GCM,
            "key": B64.encode(raw_key),
        }));
        Self { seq, cell }
    }

    async fn raw_key(&mut self) -> CoreResult<[u8; 32]> {
        let value = self
            .cell
            .get()
            .await?
            .ok_or_else(|| CoreError::Corrupt("key cell is empty".into()))?;
        let algo = value
            .get("algo")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParseKey("key cell missing algo".into()))?;
        if algo != ALGO_AES_256_GCM {
            return Err(CoreError::ParseKey(format!("unsupported key algo {algo}")));
        }
        let key_b64 = value
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParseKey("key cell missing key".into()))?;
        let raw = B64
            .decode(key_b64)
            .map_err(|e| CoreError::ParseKey(format!("bad key base64: {e}")))?;
        raw.try_into()
            .map_err(|_| CoreError::ParseKey("key is not 32 bytes".into()))
    }
}

impl KeySequenceCipher {
    /// A fresh, empty key ring for a newly created shard.
    pub fn new(
        parent: Arc<dyn Cipher>,
        shard_context: Context,
        auth_key: [u8; mac::KEY_LEN],
        limits: CipherLimits,
    ) -> Self {
        Self {
            parent,
            shard_context,
            auth_key,
            limits,
            inner: Mutex::new(Inner {
                keys: Vec::new(),
                counters: CounterBag::new(),
            }),
        }
    }

    pub fn shard_context(&self) -> &Context {
        &self.shard_context
    }

    pub async fn counters_snapshot(&self) -> CounterBag {
        self.inner.lock().await.counters.clone()
    }

    pub async fn commit_counters(&self) {
        self.inner.lock().await.counters.commit();
    }

    pub async fn merge_counters(&self, other: &CounterBag) {
        self.inner.lock().await.counters.merge(other);
    }

    pub async fn key_count(&self) -> usize {
        self.inner.lock().await.keys.len()
    }

    fn mac_message(shard_context: &Context, keys_field: &[Field], state: &[u8]) -> Vec<u8> {
        let mut ctx = canon::extend(
            shard_context,
            [
                ("state".to_string(), CanonValue::Bytes(state.to_vec())),
            ],
        );
        // `keys` is encoded as the concatenation of big-endian seqs, bound
        // as a bytes field so its exact ordering participates in the MAC.
        let seqs: Vec<u8> = keys_field
            .iter()
            .filter_map(|f| f.as_u32().ok())
            .flat_map(|s| s.to_be_bytes())
            .collect();
        ctx.insert("keys".to_string(), CanonValue::Bytes(seqs));
        canon::encode(&ctx)
    }

    async fn serialize_locked(&self, inner: &mut Inner) -> CoreResult<KeySeqState> {
        let mut keys_b64 = Vec::with_capacity(inner.keys.len());
        let mut seq_fields = Vec::with_capacity(inner.keys.len());
        let mut counter_values: Vec<u64> = Vec::with_capacity(inner.keys.len() * 2);
        for entry in inner.keys.iter_mut() {
            let cell_bytes = entry.cell.serialize().await?;
            let framed = codec::dump(
                &[Atom::U32, Atom::Bytes],
                &[Field::U32(entry.seq), Field::Bytes(cell_bytes)],
            )?;
            keys_b64.push(B64.encode(framed));
            seq_fields.push(Field::U32(entry.seq));
            counter_values.push(inner.counters.get(&msg_counter_id(entry.seq)));
            counter_values.push(inner.counters.get(&blk_counter_id(entry.seq)));
        }
        let state_bytes = codec::dump_array(&counter_values);
        let message = Self::mac_message(&self.shard_context, &seq_fields, &state_bytes);
        let tag = mac::sign(&self.auth_key, &message);
        Ok(KeySeqState {
            keys: keys_b64,
            state: B64.encode(state_bytes),
            mac: B64.encode(tag),
        })
    }

    pub async fn serialize(&self) -> CoreResult<KeySeqState> {
        let mut inner = self.inner.lock().await;
        self.serialize_locked(&mut inner).await
    }

    /// Verify the MAC before trusting any field, then decode keys and
    /// counter state. Any altered seq, swapped key, or swapped counter
    /// fails `AuthFailed`.
    pub fn parse(
        state: &KeySeqState,
        parent: Arc<dyn Cipher>,
        shard_context: Context,
        auth_key: [u8; mac::KEY_LEN],
        limits: CipherLimits,
    ) -> CoreResult<Self> {
        let state_bytes = B64.decode(&state.state)?;
        let tag = B64.decode(&state.mac)?;

        let mut seqs = Vec::with_capacity(state.keys.len());
        let mut framed_cells = Vec::with_capacity(state.keys.len());
        for entry in &state.keys {
            let framed = B64.decode(entry)?;
            let fields = codec::load(&[Atom::U32, Atom::Bytes], &framed)?;
            let seq = fields[0].as_u32()?;
            let cell_bytes = fields[1].clone().into_bytes()?;
            seqs.push(seq);
            framed_cells.push((seq, cell_bytes));
        }
        let seq_fields: Vec<Field> = seqs.iter().map(|s| Field::U32(*s)).collect();
        let message = Self::mac_message(&shard_context, &seq_fields, &state_bytes);
        mac::verify(&auth_key, &message, &tag)?;

        let counter_values: Vec<u64> = codec::load_array(&state_bytes)?;
        if counter_values.len() != seqs.len() * 2 {
            return Err(CoreError::Corrupt("counter state length mismatch".into()));
        }

        let mut counters = CounterBag::new();
        let mut keys = Vec::with_capacity(seqs.len());
        for (i, (seq, cell_bytes)) in framed_cells.into_iter().enumerate() {
            let msg = counter_values[i * 2];
            let blk = counter_values[i * 2 + 1];
            counters.set_init(&msg_counter_id(seq), msg, msg);
            counters.set_init(&blk_counter_id(seq), blk, blk);
            let cell = Cell::new(
                parent.clone(),
                Codec::Json,
                key_cell_context(&shard_context, seq),
                Some(cell_bytes),
            );
            keys.push(KeyEntry { seq, cell });
        }

        Ok(Self {
            parent,
            shard_context,
            auth_key,
            limits,
            inner: Mutex::new(Inner { keys, counters }),
        })
    }

    /// Pick the key to encrypt `nbytes` of plaintext under, rolling to a
    /// fresh key if the current one is at or past either usage limit.
    async fn select_key_for_encrypt(&self, inner: &mut Inner, nbytes: usize) -> CoreResult<u32> {
        let needs_new = match inner.keys.last() {
            None => true,
            Some(last) => {
                let msg = inner.counters.get(&msg_counter_id(last.seq));
                let blk = inner.counters.get(&blk_counter_id(last.seq));
                msg + 1 > self.limits.max_messages
                    || blk + aead::block_count(nbytes) > self.limits.max_blocks
            }
        };
        if needs_new {
            let next_seq = inner.keys.last().map(|k| k.seq + 1).unwrap_or(1);
            let raw_key = *aead::random_key();
            inner.keys.push(KeyEntry::new(
                self.parent.clone(),
                &self.shard_context,
                next_seq,
                raw_key,
            ));
            Ok(next_seq)
        } else {
            Ok(inner.keys.last().unwrap().seq)
        }
    }

    fn entry_mut<'a>(inner: &'a mut Inner, seq: u32) -> CoreResult<&'a mut KeyEntry> {
        inner
            .keys
            .iter_mut()
            .find(|k| k.seq == seq)
            .ok_or(CoreError::MissingKey(seq))
    }
}

#[async_trait]
impl Cipher for KeySequenceCipher {
    async fn encrypt(&self, context: &Context, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let seq = self.select_key_for_encrypt(&mut inner, plaintext.len()).await?;
        inner.counters.increment(&msg_counter_id(seq), 1);
        inner
            .counters
            .increment(&blk_counter_id(seq), aead::block_count(plaintext.len()));

        let child_context = canon::extend(context, [("key".to_string(), CanonValue::from(seq))]);
        let raw_key = Self::entry_mut(&mut inner, seq)?.raw_key().await?;
        let ciphertext = aead::seal(&raw_key, plaintext, &canon::encode(&child_context))?;
        codec::dump(
            &[Atom::U32, Atom::Bytes],
            &[Field::U32(seq), Field::Bytes(ciphertext)],
        )
    }

    async fn decrypt(&self, context: &Context, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let fields = codec::load(&[Atom::U32, Atom::Bytes], ciphertext)?;
        let seq = fields[0].as_u32()?;
        let body = fields[1].clone().into_bytes()?;

        let mut inner = self.inner.lock().await;
        let child_context = canon::extend(context, [("key".to_string(), CanonValue::from(seq))]);
        let raw_key = Self::entry_mut(&mut inner, seq)?.raw_key().await?;
        aead::open(&raw_key, &body, &canon::encode(&child_context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::context;

    struct RawParent {
        key: [u8; 32],
    }

    #[async_trait]
    impl Cipher for RawParent {
        async fn encrypt(&self, context: &Context, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
            aead::seal(&self.key, plaintext, &canon::encode(context))
        }
        async fn decrypt(&self, context: &Context, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
            aead::open(&self.key, ciphertext, &canon::encode(context))
        }
    }

    fn parent() -> Arc<dyn Cipher> {
        Arc::new(RawParent { key: *aead::random_key() })
    }

    fn shard_ctx(id: &str) -> Context {
        context([("file", CanonValue::from(id))])
    }

    fn small_limits() -> CipherLimits {
        CipherLimits { max_messages: 10, max_blocks: u64::MAX }
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], CipherLimits::default());
        let ctx = context([("scope", CanonValue::from("items"))]);
        let ciphertext = keyseq.encrypt(&ctx, b"secret").await.unwrap();
        let plaintext = keyseq.decrypt(&ctx, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[tokio::test]
    async fn rollover_after_message_limit() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], small_limits());
        let ctx = context([("scope", CanonValue::from("items"))]);
        for _ in 0..15 {
            let ct = keyseq.encrypt(&ctx, b"msg").await.unwrap();
            let pt = keyseq.decrypt(&ctx, &ct).await.unwrap();
            assert_eq!(pt, b"msg");
        }
        assert_eq!(keyseq.key_count().await, 2);
    }

    #[tokio::test]
    async fn decrypt_unknown_seq_fails_missing_key() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], CipherLimits::default());
        let ctx = context([("scope", CanonValue::from("items"))]);
        let bogus = codec::dump(
            &[Atom::U32, Atom::Bytes],
            &[Field::U32(99), Field::Bytes(vec![0; 28])],
        )
        .unwrap();
        let err = keyseq.decrypt(&ctx, &bogus).await.unwrap_err();
        assert!(matches!(err, CoreError::MissingKey(99)));
    }

    #[tokio::test]
    async fn serialize_parse_round_trip() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], CipherLimits::default());
        let ctx = context([("scope", CanonValue::from("items"))]);
        let ciphertext = keyseq.encrypt(&ctx, b"secret").await.unwrap();

        let state = keyseq.serialize().await.unwrap();
        let parent_for_parse = keyseq.parent.clone();
        let reloaded = KeySequenceCipher::parse(
            &state,
            parent_for_parse,
            shard_ctx("s1"),
            [9u8; 64],
            CipherLimits::default(),
        )
        .unwrap();

        let plaintext = reloaded.decrypt(&ctx, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[tokio::test]
    async fn tampered_mac_fails_parse() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], CipherLimits::default());
        let ctx = context([("scope", CanonValue::from("items"))]);
        keyseq.encrypt(&ctx, b"secret").await.unwrap();
        let mut state = keyseq.serialize().await.unwrap();
        state.mac = B64.encode(b"not a real mac, just 32 junk bytes padded out!!!");

        let err = KeySequenceCipher::parse(
            &state,
            keyseq.parent.clone(),
            shard_ctx("s1"),
            [9u8; 64],
            CipherLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn swapped_counters_fail_parse() {
        let keyseq = KeySequenceCipher::new(parent(), shard_ctx("s1"), [9u8; 64], small_limits());
        let ctx = context([("scope", CanonValue::from("items"))]);
        for _ in 0..12 {
            keyseq.encrypt(&ctx, b"msg").await.unwrap();
        }
        let mut state = keyseq.serialize().await.unwrap();
        let mut bytes = B64.decode(&state.state).unwrap();
        bytes.swap(0, 8); // swap the two keys' msg counters
        state.state = B64.encode(bytes);

        let err = KeySequenceCipher::parse(
            &state,
            keyseq.parent.clone(),
            shard_ctx("s1"),
            [9u8; 64],
            small_limits(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AuthFailed(_)));
    }
}
