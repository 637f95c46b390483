//! `Executor` — the single-threaded cooperative loop that drains the
//! `Schedule`, reads shards coherently through the `Cache`, applies each
//! group's operations, and writes back with optimistic CAS (spec §4.9).
//!
//! Submitted operations are plain boxed async closures over `Arc<Shard>`,
//! resolved through a `tokio::sync::oneshot` channel — the same
//! promise-pair shape `transaction/mod.rs` uses for its `Operation`
//! results, generalised to an externally awaited future per Design Note
//! "Deferred futures".

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{oneshot, Notify};

use crate::cache::Cache;
use crate::error::{CoreError, CoreResult};
use crate::schedule::{GroupHandle, OpId, Schedule};
use crate::shard::{Shard, ShardId};

type OpFuture<R> = Pin<Box<dyn Future<Output = CoreResult<R>> + Send>>;
type OpFn<R> = Box<dyn FnOnce(Arc<Shard>) -> OpFuture<R> + Send>;

struct SubmittedOp<R> {
    f: OpFn<R>,
    tx: oneshot::Sender<CoreResult<R>>,
}

/// Handle to a submitted operation's eventual outcome.
pub struct PendingOp<R> {
    pub id: OpId,
    pub result: oneshot::Receiver<CoreResult<R>>,
}

/// Drains a [`Schedule`] against a [`Cache`], applying each group's
/// operations and writing the shard back with CAS. `R` is the result type
/// every submitted operation produces.
pub struct Executor<R> {
    schedule: Arc<Schedule<SubmittedOp<R>>>,
    cache: Arc<Cache>,
    notify: Notify,
}

impl<R: Send + 'static> Executor<R> {
    pub fn new(schedule: Arc<Schedule<SubmittedOp<R>>>, cache: Arc<Cache>) -> Arc<Self> {
        Arc::new(Self { schedule, cache, notify: Notify::new() })
    }

    /// Register an operation on `shard` depending on `deps`. Returns its id
    /// and a future the caller awaits for the outcome.
    pub fn submit<F, Fut>(
        &self,
        shard: ShardId,
        deps: &[OpId],
        f: F,
    ) -> CoreResult<PendingOp<R>>
    where
        F: FnOnce(Arc<Shard>) -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<R>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let submitted = SubmittedOp { f: Box::new(move |shard| Box::pin(f(shard))), tx };
        let id = self.schedule.add(shard, deps, submitted)?;
        self.notify.notify_one();
        Ok(PendingOp { id, result: rx })
    }

    /// Drain every currently-available group, spawning a task per group,
    /// and keep doing so as completions/failures free up new groups, until
    /// the schedule is empty. Runs cooperatively: no OS-level parallelism
    /// is required, only a runtime that lets spawned tasks interleave at
    /// their `.await` points (spec §5).
    pub async fn run(self: &Arc<Self>) {
        loop {
            let mut spawned_any = false;
            while let Some(handle) = self.schedule.next_group() {
                // Mark STARTED here, synchronously, rather than inside the
                // spawned task: on a current-thread runtime a spawned task
                // cannot run until this loop itself yields, so if `started`
                // happened there instead, `next_group` would keep handing
                // back the same still-AVAILABLE group forever.
                if let Err(err) = handle.started() {
                    tracing::warn!(error = %err, "group handle stale at start, dropping");
                    continue;
                }
                spawned_any = true;
                let exec = self.clone();
                tokio::spawn(async move {
                    exec.request(handle).await;
                    exec.notify.notify_one();
                });
            }
            if self.schedule.is_empty() {
                return;
            }
            if !spawned_any {
                self.notify.notified().await;
            }
        }
    }

    /// One pass of spawning: take every currently-available group once and
    /// run it to completion inline, without waiting for further
    /// completions to unblock more. Useful in tests that want deterministic
    /// single-step control instead of `run`'s notify-driven loop.
    pub async fn drain_available(self: &Arc<Self>) {
        while let Some(handle) = self.schedule.next_group() {
            if let Err(err) = handle.started() {
                tracing::warn!(error = %err, "group handle stale at start, dropping");
                continue;
            }
            self.request(handle).await;
        }
    }

    /// Runs an already-STARTED group: coherent pre-read, sequential op
    /// application, CAS write-back, resolve/reject futures.
    async fn request(self: &Arc<Self>, handle: GroupHandle<SubmittedOp<R>>) {
        tracing::info!(group = %handle.id(), shard = %handle.shard(), "group started");

        // Read every shard the schedule currently mentions before touching
        // this group's own shard: this is what eliminates read/write races
        // between concurrently running groups on overlapping shard sets.
        let all_shards = self.schedule.shards();
        let reads = join_all(all_shards.iter().map(|id| self.cache.read(id))).await;
        for (id, result) in all_shards.iter().zip(reads) {
            if let Err(err) = result {
                tracing::warn!(shard = %id, error = %err, "coherent pre-read failed");
            }
        }

        let shard = match self.cache.read(handle.shard()).await {
            Ok(shard) => shard,
            Err(err) => {
                self.abort(&handle, Vec::new(), err).await;
                return;
            }
        };

        let mut results: Vec<(oneshot::Sender<CoreResult<R>>, R)> = Vec::with_capacity(handle.ops().len());
        for &op_id in handle.ops() {
            let Some(submitted) = self.schedule.take_value(op_id) else {
                let senders = results.into_iter().map(|(tx, _)| tx).collect();
                self.abort(&handle, senders, CoreError::Corrupt(format!("{op_id} missing from schedule"))).await;
                return;
            };
            match (submitted.f)(shard.clone()).await {
                Ok(value) => results.push((submitted.tx, value)),
                Err(err) => {
                    let _ = submitted.tx.send(Err(err.clone()));
                    let senders = results.into_iter().map(|(tx, _)| tx).collect();
                    self.abort(&handle, senders, err).await;
                    return;
                }
            }
        }

        match self.cache.write(handle.shard()).await {
            Ok(()) => {
                for (tx, value) in results {
                    let _ = tx.send(Ok(value));
                }
                if let Err(err) = handle.completed() {
                    tracing::warn!(group = %handle.id(), error = %err, "group completion failed");
                }
                tracing::info!(group = %handle.id(), "group completed");
            }
            Err(err) => {
                let senders: Vec<_> = results.into_iter().map(|(tx, _)| tx).collect();
                self.abort(&handle, senders, err).await;
            }
        }
    }

    /// Reject `senders` (already-applied ops in the failing group) and
    /// every op `handle.failed()` reports as cancelled, all with `err`.
    async fn abort(
        &self,
        handle: &GroupHandle<SubmittedOp<R>>,
        senders: Vec<oneshot::Sender<CoreResult<R>>>,
        err: CoreError,
    ) {
        tracing::warn!(group = %handle.id(), error = %err, "group aborted");
        for tx in senders {
            let _ = tx.send(Err(err.clone()));
        }
        match handle.failed() {
            Ok(cancelled) => {
                for submitted in cancelled {
                    let _ = submitted.tx.send(Err(err.clone()));
                }
            }
            Err(schedule_err) => {
                tracing::warn!(group = %handle.id(), error = %schedule_err, "group already gone");
            }
        }
    }
}
