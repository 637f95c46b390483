//! `Cache` — the sole writer of shards (spec §4.7). Wraps a
//! [`StorageAdapter`] and, per shard id, coalesces concurrent loads behind
//! one in-flight slot the way `storage::document_cache::DocumentCache`
//! coalesces document reads behind a `tokio::sync::RwLock<HashMap<..>>`
//! — except here the map's values are themselves locked, since loading a
//! shard spans an `.await` and a second caller must wait for the first
//! rather than race it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::adapter::StorageAdapter;
use crate::cell::Cipher;
use crate::config::CipherLimits;
use crate::counter::CounterBag;
use crate::crypto::mac;
use crate::error::{CoreError, CoreResult};
use crate::shard::{Shard, ShardId};

struct Slot {
    /// `None` until first read/creation.
    loaded: Option<LoadedShard>,
    /// Counters retained across a `CONFLICT` eviction, merged into the
    /// shard the next time it's loaded (spec §4.7/§4.8).
    retained_counters: Option<CounterBag>,
}

struct LoadedShard {
    shard: Arc<Shard>,
    /// `None` means "known not to exist upstream yet" (CAS precondition
    /// for the next write is "must not exist").
    rev: Option<String>,
}

impl Slot {
    fn empty() -> Self {
        Self { loaded: None, retained_counters: None }
    }
}

/// The only writer of shards. Holds the key material every shard is
/// constructed with; shard-specific binding comes from the shard id baked
/// into each cell's context, not from anything stored here.
pub struct Cache {
    adapter: Arc<dyn StorageAdapter>,
    parent: Arc<dyn Cipher>,
    auth_key: [u8; mac::KEY_LEN],
    limits: CipherLimits,
    slots: Mutex<HashMap<ShardId, Arc<Mutex<Slot>>>>,
}

impl Cache {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        parent: Arc<dyn Cipher>,
        auth_key: [u8; mac::KEY_LEN],
        limits: CipherLimits,
    ) -> Self {
        Self {
            adapter,
            parent,
            auth_key,
            limits,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot_for(&self, id: &ShardId) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::empty())))
            .clone()
    }

    /// Return the cached shard, fetching (or creating, if the adapter has
    /// nothing stored under `id` yet) on first access. A shard evicted
    /// after a `CONFLICT` write is reloaded here and has its retained
    /// counters merged in.
    pub async fn read(&self, id: &ShardId) -> CoreResult<Arc<Shard>> {
        let slot = self.slot_for(id).await;
        let mut slot = slot.lock().await;
        if let Some(loaded) = &slot.loaded {
            return Ok(loaded.shard.clone());
        }

        let (shard, rev) = match self.adapter.read(id).await? {
            Some(blob) => {
                let shard = Shard::parse(&blob.value, id.clone(), self.parent.clone(), self.auth_key, self.limits)
                    .await?;
                (shard, Some(blob.rev))
            }
            None => {
                let shard = Shard::new(id.clone(), self.parent.clone(), self.auth_key, self.limits);
                (shard, None)
            }
        };

        if let Some(retained) = slot.retained_counters.take() {
            shard.merge_counters(&retained).await;
        }

        let shard = Arc::new(shard);
        slot.loaded = Some(LoadedShard { shard: shard.clone(), rev });
        Ok(shard)
    }

    /// Serialise the cached shard and write it with optimistic CAS. On
    /// success commits counters and advances the tracked rev. On
    /// `CONFLICT`, evicts the cached shard (retaining its counter bag for
    /// the next `read`) and re-raises; other errors leave the cache entry
    /// untouched.
    pub async fn write(&self, id: &ShardId) -> CoreResult<()> {
        let slot = self.slot_for(id).await;
        let mut slot = slot.lock().await;
        let loaded = slot
            .loaded
            .as_ref()
            .ok_or_else(|| CoreError::Corrupt(format!("shard {id} written before it was read")))?;
        let shard = loaded.shard.clone();
        let rev = loaded.rev.clone();

        let blob = shard.serialize().await?;
        match self.adapter.write(id, blob, rev).await {
            Ok(new_rev) => {
                shard.commit_counters().await;
                slot.loaded = Some(LoadedShard { shard, rev: Some(new_rev) });
                Ok(())
            }
            Err(CoreError::Conflict(shard_id)) => {
                let counters = shard.counters_snapshot().await;
                slot.retained_counters = Some(counters);
                slot.loaded = None;
                Err(CoreError::Conflict(shard_id))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::canon::Context;
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

    fn cache(adapter: Arc<MemoryAdapter>) -> Cache {
        Cache::new(
            adapter,
            Arc::new(RawParent { key: *aead::random_key() }),
            [9u8; mac::KEY_LEN],
            CipherLimits::default(),
        )
    }

    #[tokio::test]
    async fn read_creates_empty_shard_when_absent() {
        let cache = cache(Arc::new(MemoryAdapter::new()));
        let id = "s1".to_string();
        let shard = cache.read(&id).await.unwrap();
        assert_eq!(shard.size().await, 0);
    }

    #[tokio::test]
    async fn read_coalesces_subsequent_calls_to_same_cached_shard() {
        let cache = cache(Arc::new(MemoryAdapter::new()));
        let id = "s1".to_string();
        let first = cache.read(&id).await.unwrap();
        let second = cache.read(&id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn write_round_trips_through_adapter() {
        let cache = cache(Arc::new(MemoryAdapter::new()));
        let id = "s1".to_string();
        let shard = cache.read(&id).await.unwrap();
        shard.put("/a", |_| serde_json::json!("doc")).await.unwrap();
        cache.write(&id).await.unwrap();

        let reloaded = cache.read(&id).await.unwrap();
        assert_eq!(reloaded.get("/a").await.unwrap(), Some(serde_json::json!("doc")));
    }

    #[tokio::test]
    async fn write_before_read_fails_corrupt() {
        let cache = cache(Arc::new(MemoryAdapter::new()));
        let err = cache.write(&"never-read".to_string()).await.unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn conflict_evicts_shard_and_retains_counters_for_merge_on_reload() {
        let adapter = Arc::new(MemoryAdapter::new());
        let cache = cache(adapter.clone());
        let id = "s1".to_string();

        let shard = cache.read(&id).await.unwrap();
        shard.put("/a", |_| serde_json::json!("v1")).await.unwrap();
        cache.write(&id).await.unwrap();

        let shard = cache.read(&id).await.unwrap();
        shard.put("/a", |_| serde_json::json!("v2")).await.unwrap();
        // Simulate a racing writer advancing the stored rev underneath us.
        adapter.bump_rev_behind_the_scenes(&id).await;
        let err = cache.write(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let reloaded = cache.read(&id).await.unwrap();
        assert_eq!(reloaded.get("/a").await.unwrap(), Some(serde_json::json!("v1")));
    }
}
