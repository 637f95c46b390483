//! `Shard` — an encrypted ordered map from path strings to `Cell`s, plus
//! its key-sequence cipher and a fair async read/write lock (spec §4.5).
//! Serialised as a line-oriented blob: header JSON, then the index cell,
//! then item cells in index order. Because the path is baked into every
//! item cell's AAD and the shard id into every context, reordering lines
//! or loading under the wrong id both fail loudly rather than silently
//! returning stale data.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use unicode_normalization::UnicodeNormalization;

use crate::canon::{context, CanonValue, Context};
use crate::cell::{Cell, Cipher, Codec};
use crate::config::CipherLimits;
use crate::counter::CounterBag;
use crate::crypto::mac;
use crate::error::{CoreError, CoreResult};
use crate::keyseq::KeySequenceCipher;

pub type ShardId = String;

const BLOB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ShardHeader {
    version: u32,
    tag: String,
    cipher: crate::keyseq::KeySeqState,
}

/// Normalizes a path to NFC so index ordering is stable across equivalent
/// Unicode representations (spec §3: "sorted by Unicode NFC path string").
pub fn normalize_path(path: &str) -> String {
    path.nfc().collect()
}

struct State {
    index: Cell,
    /// Decrypted, cached path list; kept in sync with `index`'s plaintext.
    paths: Vec<String>,
    items: Vec<Cell>,
}

pub struct Shard {
    id: ShardId,
    keyseq: Arc<KeySequenceCipher>,
    tag: [u8; 8],
    state: RwLock<State>,
}

fn index_context(shard_id: &str) -> Context {
    context([
        ("file", CanonValue::from(shard_id)),
        ("scope", CanonValue::from("index")),
    ])
}

fn item_context(shard_id: &str, path: &str) -> Context {
    context([
        ("file", CanonValue::from(shard_id)),
        ("scope", CanonValue::from("items")),
        ("path", CanonValue::from(path)),
    ])
}

impl Shard {
    /// A brand-new, empty shard.
    pub fn new(
        id: ShardId,
        parent: Arc<dyn Cipher>,
        auth_key: [u8; mac::KEY_LEN],
        limits: CipherLimits,
    ) -> Self {
        let shard_context = context([("file", CanonValue::from(id.as_str()))]);
        let keyseq = Arc::new(KeySequenceCipher::new(parent, shard_context, auth_key, limits));
        let mut tag = [0u8; 8];
        OsRng.fill_bytes(&mut tag);
        let index = Cell::empty(keyseq.clone(), Codec::Json, index_context(&id));
        index.set(serde_json::json!([]));
        Self {
            id,
            keyseq,
            tag,
            state: RwLock::new(State { index, paths: Vec::new(), items: Vec::new() }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keyseq(&self) -> &Arc<KeySequenceCipher> {
        &self.keyseq
    }

    pub async fn counters_snapshot(&self) -> CounterBag {
        self.keyseq.counters_snapshot().await
    }

    pub async fn commit_counters(&self) {
        self.keyseq.commit_counters().await
    }

    pub async fn merge_counters(&self, other: &CounterBag) {
        self.keyseq.merge_counters(other).await
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.paths.len()
    }

    fn find(paths: &[String], path: &str) -> Result<usize, usize> {
        paths.binary_search(&path.to_string())
    }

    pub async fn get(&self, path: &str) -> CoreResult<Option<Value>> {
        let path = normalize_path(path);
        let state = self.state.read().await;
        let Ok(pos) = Self::find(&state.paths, &path) else {
            return Ok(None);
        };
        state.items[pos].get().await
    }

    pub async fn list(&self, path: &str) -> CoreResult<Option<Vec<String>>> {
        let value = self.get(path).await?;
        match value {
            None => Ok(None),
            Some(Value::Array(items)) => Ok(Some(
                items
                    .into_iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect(),
            )),
            Some(_) => Err(CoreError::Corrupt(format!("{path} is not a directory listing"))),
        }
    }

    fn insert_at(state: &mut State, pos: usize, path: String, shard_id: &str, keyseq: Arc<KeySequenceCipher>) {
        let cell = Cell::empty(keyseq, Codec::Json, item_context(shard_id, &path));
        cell.set(Value::Null);
        state.paths.insert(pos, path);
        state.items.insert(pos, cell);
    }

    pub async fn put<F>(&self, path: &str, f: F) -> CoreResult<()>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let path = normalize_path(path);
        let mut state = self.state.write().await;
        match Self::find(&state.paths, &path) {
            Ok(pos) => {
                let current = state.items[pos].get().await?;
                state.items[pos].set(f(current));
            }
            Err(pos) => {
                Self::insert_at(&mut state, pos, path.clone(), &self.id, self.keyseq.clone());
                state.items[pos].set(f(None));
                Self::reindex(&mut state);
            }
        }
        Ok(())
    }

    pub async fn rm(&self, path: &str) -> CoreResult<()> {
        let path = normalize_path(path);
        let mut state = self.state.write().await;
        if let Ok(pos) = Self::find(&state.paths, &path) {
            state.paths.remove(pos);
            state.items.remove(pos);
            Self::reindex(&mut state);
        }
        Ok(())
    }

    pub async fn link(&self, path: &str, name: &str) -> CoreResult<()> {
        let path = path.to_string();
        let name = name.to_string();
        self.put(&path, move |current| {
            let mut names: Vec<String> = match current {
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect(),
                _ => Vec::new(),
            };
            if let Err(pos) = names.binary_search(&name) {
                names.insert(pos, name.clone());
            }
            Value::Array(names.into_iter().map(Value::String).collect())
        })
        .await
    }

    pub async fn unlink(&self, path: &str, name: &str) -> CoreResult<()> {
        let path = normalize_path(path);
        let mut state = self.state.write().await;
        let Ok(pos) = Self::find(&state.paths, &path) else {
            return Ok(());
        };
        let current = state.items[pos].get().await?;
        let mut names: Vec<String> = match current {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
            _ => Vec::new(),
        };
        if let Ok(idx) = names.binary_search(&name.to_string()) {
            names.remove(idx);
        }
        if names.is_empty() {
            state.paths.remove(pos);
            state.items.remove(pos);
            Self::reindex(&mut state);
        } else {
            state.items[pos].set(Value::Array(names.into_iter().map(Value::String).collect()));
        }
        Ok(())
    }

    /// Re-derive the index cell's plaintext from `paths` and mark it
    /// modified so `serialize` re-encrypts it.
    fn reindex(state: &mut State) {
        let value = Value::Array(state.paths.iter().cloned().map(Value::String).collect());
        state.index.set(value);
    }

    /// Serialise index then items in index order. Stable for unchanged
    /// state because `Cell::serialize` returns cached ciphertext for
    /// untouched cells.
    pub async fn serialize(&self) -> CoreResult<String> {
        let state = self.state.read().await;
        let index_bytes = state.index.serialize().await?;
        let mut item_lines = Vec::with_capacity(state.items.len());
        for cell in state.items.iter() {
            item_lines.push(B64.encode(cell.serialize().await?));
        }
        let header = ShardHeader {
            version: BLOB_VERSION,
            tag: B64.encode(self.tag),
            cipher: self.keyseq.serialize().await?,
        };
        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        out.push_str(&B64.encode(index_bytes));
        for line in item_lines {
            out.push('\n');
            out.push_str(&line);
        }
        Ok(out)
    }

    pub async fn parse(
        blob: &str,
        id: ShardId,
        parent: Arc<dyn Cipher>,
        auth_key: [u8; mac::KEY_LEN],
        limits: CipherLimits,
    ) -> CoreResult<Self> {
        let mut lines = blob.lines();
        let header_line = lines
            .next()
            .ok_or_else(|| CoreError::Corrupt("empty shard blob".into()))?;
        let header: ShardHeader = serde_json::from_str(header_line)?;
        if header.version != BLOB_VERSION {
            return Err(CoreError::Corrupt(format!("unsupported shard version {}", header.version)));
        }
        let tag_bytes = B64.decode(&header.tag)?;
        let tag: [u8; 8] = tag_bytes
            .try_into()
            .map_err(|_| CoreError::Corrupt("tag is not 8 bytes".into()))?;

        let shard_context = context([("file", CanonValue::from(id.as_str()))]);
        let keyseq = Arc::new(KeySequenceCipher::parse(
            &header.cipher,
            parent,
            shard_context,
            auth_key,
            limits,
        )?);

        let index_line = lines
            .next()
            .ok_or_else(|| CoreError::Corrupt("shard blob missing index line".into()))?;
        let index_bytes = B64.decode(index_line)?;
        let index = Cell::new(keyseq.clone(), Codec::Json, index_context(&id), Some(index_bytes));
        let paths: Vec<String> = match index.get().await?.unwrap_or(Value::Array(vec![])) {
            Value::Array(items) => items
                .into_iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
            _ => return Err(CoreError::Corrupt("index plaintext is not an array".into())),
        };

        let mut items = Vec::with_capacity(paths.len());
        for path in &paths {
            let line = lines
                .next()
                .ok_or_else(|| CoreError::Corrupt("shard blob missing item line".into()))?;
            let item_bytes = B64.decode(line)?;
            items.push(Cell::new(
                keyseq.clone(),
                Codec::Json,
                item_context(&id, path),
                Some(item_bytes),
            ));
        }
        if lines.next().is_some() {
            return Err(CoreError::Corrupt("shard blob has trailing lines".into()));
        }
        if paths.len() != items.len() {
            return Err(CoreError::Corrupt("index/items length mismatch".into()));
        }

        Ok(Self {
            id,
            keyseq,
            tag,
            state: RwLock::new(State { index, paths, items }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead;
    use async_trait::async_trait;

    struct RawParent {
        key: [u8; 32],
    }

    #[async_trait]
    impl Cipher for RawParent {
        async fn encrypt(&self, context: &Context, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
            aead::seal(&self.key, plaintext, &crate::canon::encode(context))
        }
        async fn decrypt(&self, context: &Context, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
            aead::open(&self.key, ciphertext, &crate::canon::encode(context))
        }
    }

    fn parent() -> Arc<dyn Cipher> {
        Arc::new(RawParent { key: *aead::random_key() })
    }

    fn new_shard(id: &str) -> Shard {
        Shard::new(id.to_string(), parent(), [3u8; 64], CipherLimits::default())
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let shard = new_shard("shard-x");
        shard.put("/a/b", |_| serde_json::json!({"v": 1})).await.unwrap();
        assert_eq!(shard.get("/a/b").await.unwrap(), Some(serde_json::json!({"v": 1})));
        assert_eq!(shard.size().await, 1);
    }

    #[tokio::test]
    async fn rm_removes_entry() {
        let shard = new_shard("shard-x");
        shard.put("/a", |_| serde_json::json!(1)).await.unwrap();
        shard.rm("/a").await.unwrap();
        assert_eq!(shard.get("/a").await.unwrap(), None);
        assert_eq!(shard.size().await, 0);
    }

    #[tokio::test]
    async fn link_and_unlink_maintain_sorted_listing() {
        let shard = new_shard("shard-x");
        shard.link("/dir", "b").await.unwrap();
        shard.link("/dir", "a").await.unwrap();
        shard.link("/dir", "c").await.unwrap();
        assert_eq!(
            shard.list("/dir").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        shard.unlink("/dir", "b").await.unwrap();
        assert_eq!(shard.list("/dir").await.unwrap(), Some(vec!["a".to_string(), "c".to_string()]));
        shard.unlink("/dir", "a").await.unwrap();
        shard.unlink("/dir", "c").await.unwrap();
        assert_eq!(shard.list("/dir").await.unwrap(), None);
    }

    #[tokio::test]
    async fn serialize_parse_round_trip_preserves_documents() {
        let p = parent();
        let shard = Shard::new("shard-x".to_string(), p.clone(), [3u8; 64], CipherLimits::default());
        shard.put("/a", |_| serde_json::json!("doc-a")).await.unwrap();
        shard.put("/b", |_| serde_json::json!("doc-b")).await.unwrap();
        let blob = shard.serialize().await.unwrap();

        let parsed = Shard::parse(&blob, "shard-x".to_string(), p, [3u8; 64], CipherLimits::default())
            .await
            .unwrap();
        assert_eq!(parsed.get("/a").await.unwrap(), Some(serde_json::json!("doc-a")));
        assert_eq!(parsed.get("/b").await.unwrap(), Some(serde_json::json!("doc-b")));
    }

    #[tokio::test]
    async fn reorder_attack_fails_decrypt() {
        let p = parent();
        let shard = Shard::new("shard-x".to_string(), p.clone(), [3u8; 64], CipherLimits::default());
        shard.put("/a", |_| serde_json::json!("doc-a")).await.unwrap();
        shard.put("/z", |_| serde_json::json!("doc-z")).await.unwrap();
        let blob = shard.serialize().await.unwrap();

        let mut lines: Vec<&str> = blob.lines().collect();
        lines.swap(2, 3);
        let tampered = lines.join("\n");

        let parsed = Shard::parse(&tampered, "shard-x".to_string(), p, [3u8; 64], CipherLimits::default())
            .await
            .unwrap();
        let err = parsed.get("/a").await.unwrap_err();
        assert!(matches!(err, CoreError::Decrypt(_)));
    }

    #[tokio::test]
    async fn wrong_shard_id_fails_auth() {
        let p = parent();
        let shard = Shard::new("shard-X".to_string(), p.clone(), [3u8; 64], CipherLimits::default());
        shard.put("/a", |_| serde_json::json!(1)).await.unwrap();
        let blob = shard.serialize().await.unwrap();

        let err = Shard::parse(&blob, "shard-Y".to_string(), p, [3u8; 64], CipherLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn serialize_is_stable_when_nothing_changed() {
        let shard = new_shard("shard-x");
        shard.put("/a", |_| serde_json::json!(1)).await.unwrap();
        let first = shard.serialize().await.unwrap();
        let second = shard.serialize().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn composed_and_decomposed_paths_normalize_to_the_same_entry() {
        let shard = new_shard("shard-x");
        // "\u{E9}" (LATIN SMALL LETTER E WITH ACUTE, precomposed) and
        // "e\u{301}" (e + COMBINING ACUTE ACCENT, decomposed) are the same
        // NFC string; a path written under one form must be readable under
        // the other rather than creating two index entries.
        let composed = "/caf\u{e9}";
        let decomposed = "/cafe\u{301}";
        assert_eq!(normalize_path(composed), normalize_path(decomposed));

        shard.put(composed, |_| serde_json::json!("menu")).await.unwrap();
        assert_eq!(shard.get(decomposed).await.unwrap(), Some(serde_json::json!("menu")));
        assert_eq!(shard.size().await, 1);
    }
}
