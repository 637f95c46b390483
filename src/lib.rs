//! Core of an encrypted, sharded, hierarchical document store: a
//! dependency-aware scheduler, a coherent-read/optimistic-CAS-write
//! executor and cache, and a per-shard cryptographic container built from
//! a context-bound AEAD cell and a rotating key-sequence cipher.
//!
//! Storage adapter bodies, password-based configuration bootstrapping,
//! path parsing, the high-level task API, and the sync primitives library
//! are external collaborators reached only through the trait contracts
//! this crate exposes ([`adapter::StorageAdapter`], [`cell::Cipher`]).

pub mod adapter;
pub mod cache;
pub mod canon;
pub mod cell;
pub mod codec;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod keyseq;
pub mod schedule;
pub mod shard;

pub use adapter::{StorageAdapter, StoredBlob};
#[cfg(any(test, feature = "test-util"))]
pub use adapter::MemoryAdapter;
pub use cache::Cache;
pub use cell::{Cell, Cipher, Codec};
pub use config::{CipherLimits, KdfConfig, ScheduleConfig};
pub use counter::{Counter, CounterBag};
pub use error::{CoreError, CoreResult};
pub use executor::{Executor, PendingOp};
pub use keyseq::KeySequenceCipher;
pub use schedule::{GroupHandle, OpId, Schedule};
pub use shard::{Shard, ShardId};
