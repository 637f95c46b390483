//! `StorageAdapter` — the pluggable byte-blob backend contract (spec §6).
//! Real backends (memory/file/remote) are explicitly out of scope for the
//! core per §1; the core only consumes this trait. `MemoryAdapter` ships
//! behind `test-util` purely so `Cache`/`Executor` have something to drive
//! in their own tests — the same role `storage::document_cache`'s
//! in-process map plays for the teacher's query layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::shard::ShardId;

/// A stored blob and the opaque revision it was stored under.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub value: String,
    pub rev: String,
}

/// Pluggable byte-blob backend behind the `Cache` (spec §6).
///
/// `write`'s `rev` is a CAS token: `None` means "must not currently exist";
/// `Some(r)` means "must currently equal `r`". Any mismatch fails
/// `CoreError::Conflict`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn read(&self, id: &ShardId) -> CoreResult<Option<StoredBlob>>;
    async fn write(&self, id: &ShardId, value: String, rev: Option<String>) -> CoreResult<String>;
}

/// In-memory `StorageAdapter` for tests and demos. Revisions are a
/// monotonic per-shard counter rendered as a decimal string — opaque to
/// callers, just like a real backend's content hash would be.
#[cfg(any(test, feature = "test-util"))]
pub struct MemoryAdapter {
    blobs: Mutex<HashMap<ShardId, (String, u64)>>,
    next_rev: AtomicU64,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            next_rev: AtomicU64::new(1),
        }
    }

    /// Force the next write to `id` to race against a stale `rev`,
    /// reproducing the CAS-mismatch path without a second real writer.
    pub async fn bump_rev_behind_the_scenes(&self, id: &ShardId) {
        let mut blobs = self.blobs.lock().await;
        if let Some((value, rev)) = blobs.get(id).cloned() {
            blobs.insert(id.clone(), (value, rev + 1));
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn read(&self, id: &ShardId) -> CoreResult<Option<StoredBlob>> {
        let blobs = self.blobs.lock().await;
        Ok(blobs.get(id).map(|(value, rev)| StoredBlob {
            value: value.clone(),
            rev: rev.to_string(),
        }))
    }

    async fn write(&self, id: &ShardId, value: String, rev: Option<String>) -> CoreResult<String> {
        let mut blobs = self.blobs.lock().await;
        let current = blobs.get(id).map(|(_, rev)| *rev);
        let expected = match &rev {
            None => None,
            Some(r) => Some(
                r.parse::<u64>()
                    .map_err(|_| CoreError::Corrupt(format!("malformed rev {r}")))?,
            ),
        };
        if current != expected {
            return Err(CoreError::Conflict(id.clone()));
        }
        let new_rev = self.next_rev.fetch_add(1, Ordering::SeqCst);
        blobs.insert(id.clone(), (value, new_rev));
        Ok(new_rev.to_string())
    }
}
