//! `Schedule` — the dependency DAG over per-shard operation groups (spec
//! §4.6). This is the heart of the core: it decides which group a new
//! operation lands in, tracks cross-shard depth so the executor never
//! deadlocks, and rebuilds itself from surviving operations whenever a
//! group fails.
//!
//! Operations and groups are arena-indexed by monotonic integer ids
//! (`OpId`/`GroupId`) rather than owned in a pointer graph, per Design Note
//! 9 — a DAG of `Rc`/`RefCell` cycles is exactly the kind of thing this
//! avoids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ScheduleConfig;
use crate::error::{CoreError, CoreResult};
use crate::shard::ShardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Available,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Available,
    Started,
}

struct OpNode<V> {
    shard: ShardId,
    parents: Vec<OpId>,
    children: HashSet<OpId>,
    group: GroupId,
    value: Option<V>,
}

#[derive(Clone)]
struct GroupNode {
    shard: ShardId,
    /// Application order for the executor; also insertion order.
    ops: Vec<OpId>,
    parents: HashSet<GroupId>,
    ancestors: HashSet<GroupId>,
    descendants: HashSet<GroupId>,
    state: GroupState,
    depth: u32,
}

struct ShardSlot {
    groups: Vec<GroupId>,
    state: ShardState,
}

struct Inner<V> {
    ops: HashMap<OpId, OpNode<V>>,
    groups: HashMap<GroupId, GroupNode>,
    shards: HashMap<ShardId, ShardSlot>,
    /// Order shards were first touched in, used to give `next_group` a
    /// deterministic scan order.
    shard_order: Vec<ShardId>,
    next_op: u64,
    next_group: u64,
    config: ScheduleConfig,
}

/// Dependency DAG over per-shard operation groups.
pub struct Schedule<V> {
    inner: Mutex<Inner<V>>,
}

/// A handle to a group returned by [`Schedule::next_group`]. Holds the
/// shard and op list as of the moment it was handed out; `started`,
/// `completed` and `failed` re-check the live group by id so a handle
/// obtained before a rebalance that discarded its (unstarted) group fails
/// loudly instead of silently acting on stale state.
pub struct GroupHandle<V> {
    schedule: Arc<Schedule<V>>,
    id: GroupId,
    shard: ShardId,
    ops: Vec<OpId>,
}

impl<V> GroupHandle<V> {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// AVAILABLE → STARTED; marks the shard STARTED. Fails `Schedule` if
    /// the group no longer exists or isn't AVAILABLE (a stale handle from
    /// before a rebalance).
    pub fn started(&self) -> CoreResult<()> {
        let mut inner = self.schedule.inner.lock().unwrap();
        let shard = {
            let group = inner
                .groups
                .get_mut(&self.id)
                .ok_or_else(|| CoreError::Schedule(format!("{} no longer exists", self.id)))?;
            if group.state != GroupState::Available {
                return Err(CoreError::Schedule(format!("{} is not available", self.id)));
            }
            group.state = GroupState::Started;
            group.shard.clone()
        };
        inner.shards.get_mut(&shard).unwrap().state = ShardState::Started;
        tracing::debug!(group = %self.id, shard = %shard, "group started");
        Ok(())
    }

    /// STARTED → COMPLETED; removes the group and its ops, marks the shard
    /// AVAILABLE again.
    pub fn completed(&self) -> CoreResult<()> {
        let mut inner = self.schedule.inner.lock().unwrap();
        inner.complete_group(self.id)?;
        tracing::debug!(group = %self.id, "group completed");
        Ok(())
    }

    /// STARTED → FAILED; cancels this group's ops and every descendant of
    /// those ops, then rebalances. Returns the cancelled ops' user values.
    pub fn failed(&self) -> CoreResult<Vec<V>> {
        let mut inner = self.schedule.inner.lock().unwrap();
        let values = inner.fail_group(self.id)?;
        tracing::warn!(group = %self.id, cancelled = values.len(), "group failed");
        Ok(values)
    }
}

impl<V> Schedule<V> {
    pub fn new(config: ScheduleConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                ops: HashMap::new(),
                groups: HashMap::new(),
                shards: HashMap::new(),
                shard_order: Vec::new(),
                next_op: 1,
                next_group: 1,
                config,
            }),
        })
    }

    /// Register a new operation on `shard` depending on `parents`. Fails
    /// `Schedule` if any parent id is unknown.
    pub fn add(&self, shard: ShardId, parents: &[OpId], value: V) -> CoreResult<OpId> {
        let mut inner = self.inner.lock().unwrap();
        inner.add(shard, parents.to_vec(), value)
    }

    /// First AVAILABLE group on an AVAILABLE shard with no remaining
    /// group-ancestors, or `None` if nothing is ready.
    pub fn next_group(self: &Arc<Self>) -> Option<GroupHandle<V>> {
        let inner = self.inner.lock().unwrap();
        for shard_id in &inner.shard_order {
            let Some(slot) = inner.shards.get(shard_id) else {
                continue;
            };
            if slot.state != ShardState::Available {
                continue;
            }
            let Some(&gid) = slot.groups.first() else {
                continue;
            };
            let group = &inner.groups[&gid];
            if group.state == GroupState::Available && group.ancestors.is_empty() {
                return Some(GroupHandle {
                    schedule: self.clone(),
                    id: gid,
                    shard: group.shard.clone(),
                    ops: group.ops.clone(),
                });
            }
        }
        None
    }

    /// Cancel `op_id` and all of its descendants, then rebalance. Returns
    /// the cancelled ops' user values.
    pub fn op_failed(&self, op_id: OpId) -> CoreResult<Vec<V>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.ops.contains_key(&op_id) {
            return Err(CoreError::Schedule(format!("{op_id} is not scheduled")));
        }
        let values = inner.cancel_ops(vec![op_id]);
        inner.prune_empty_groups();
        inner.rebalance();
        Ok(values)
    }

    /// Every shard id currently mentioned by the schedule, in first-seen
    /// order. The executor reads all of these before applying a group, to
    /// eliminate read/write races between concurrent groups on overlapping
    /// shard sets.
    pub fn shards(&self) -> Vec<ShardId> {
        self.inner.lock().unwrap().shard_order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().ops.is_empty()
    }

    pub fn op_count(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    pub fn group_count(&self) -> usize {
        self.inner.lock().unwrap().groups.len()
    }

    /// Take and remove the user value stored for `op_id`, if it is still
    /// present (not yet cancelled). Used by the executor to hand an op's
    /// function to the caller exactly once.
    pub fn take_value(&self, op_id: OpId) -> Option<V> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .get_mut(&op_id)
            .and_then(|node| node.value.take())
    }
}

impl<V> Inner<V> {
    fn add(&mut self, shard: ShardId, parents: Vec<OpId>, value: V) -> CoreResult<OpId> {
        for p in &parents {
            if !self.ops.contains_key(p) {
                return Err(CoreError::Schedule(format!("unknown dependency {p}")));
            }
        }
        let op_id = OpId(self.next_op);
        self.next_op += 1;
        for p in &parents {
            self.ops.get_mut(p).unwrap().children.insert(op_id);
        }
        self.ops.insert(
            op_id,
            OpNode {
                shard: shard.clone(),
                parents: parents.clone(),
                children: HashSet::new(),
                group: GroupId(0),
                value: Some(value),
            },
        );
        self.place_op(op_id, &shard, &parents);
        Ok(op_id)
    }

    fn ensure_shard(&mut self, shard: &ShardId) {
        if !self.shards.contains_key(shard) {
            self.shards.insert(
                shard.clone(),
                ShardSlot {
                    groups: Vec::new(),
                    state: ShardState::Available,
                },
            );
            self.shard_order.push(shard.clone());
        }
    }

    /// Place an already-registered op into a group on `shard`, creating a
    /// new group if no existing one fits (spec §4.6 placement rule).
    fn place_op(&mut self, op_id: OpId, shard: &ShardId, parents: &[OpId]) {
        self.ensure_shard(shard);

        let dep_groups: HashSet<GroupId> = parents.iter().map(|p| self.ops[p].group).collect();
        let lower_bound = self.lower_bound(shard, &dep_groups);
        let desired_depth = self.desired_depth(shard, &dep_groups);
        let group_id = self
            .choose_candidate(shard, lower_bound, desired_depth)
            .unwrap_or_else(|| self.create_group(shard, lower_bound, desired_depth));

        self.groups.get_mut(&group_id).unwrap().ops.push(op_id);
        self.ops.get_mut(&op_id).unwrap().group = group_id;

        for dep_group in dep_groups {
            self.add_group_parent(group_id, dep_group);
        }
        self.recompute_depths(group_id);
    }

    /// Rightmost same-shard group that is either a direct dependency group
    /// (op may reuse it) or an ancestor of a dependency group (op must come
    /// strictly after it); `0` if no such group exists.
    fn lower_bound(&self, shard: &ShardId, dep_groups: &HashSet<GroupId>) -> usize {
        let slot = &self.shards[shard];
        for (idx, gid) in slot.groups.iter().enumerate().rev() {
            if dep_groups.contains(gid) {
                return idx;
            }
            if dep_groups
                .iter()
                .any(|d| self.groups[d].ancestors.contains(gid))
            {
                return idx + 1;
            }
        }
        0
    }

    /// Max over cross-shard dependency groups of (their depth + 1); `0` if
    /// every dependency is on the same shard (same-shard deps never raise
    /// depth).
    fn desired_depth(&self, shard: &ShardId, dep_groups: &HashSet<GroupId>) -> u32 {
        dep_groups
            .iter()
            .filter(|g| self.groups[g].shard != *shard)
            .map(|g| self.groups[g].depth + 1)
            .max()
            .unwrap_or(0)
    }

    /// Among AVAILABLE groups at index >= `lower_bound`, the one whose
    /// depth is closest to `desired`; `None` if no candidate exists or the
    /// closest one is well-separated from `desired` (by at least
    /// `depth_limit`), in which case a fresh group should be created
    /// instead.
    fn choose_candidate(
        &self,
        shard: &ShardId,
        lower_bound: usize,
        desired: u32,
    ) -> Option<GroupId> {
        let slot = &self.shards[shard];
        if lower_bound >= slot.groups.len() {
            return None;
        }
        let mut best: Option<(usize, u32)> = None;
        for idx in lower_bound..slot.groups.len() {
            let gid = slot.groups[idx];
            let group = &self.groups[&gid];
            if group.state != GroupState::Available {
                continue;
            }
            let dist = group.depth.abs_diff(desired);
            best = Some(match best {
                None => (idx, dist),
                Some((best_idx, best_dist)) => {
                    if dist < best_dist {
                        (idx, dist)
                    } else if dist == best_dist {
                        // Tie: prefer the earlier group, unless it already
                        // has dependants and the later candidate doesn't —
                        // landing in a leaf avoids rippling a depth change
                        // into groups that already depend on it.
                        let earlier = &self.groups[&slot.groups[best_idx]];
                        if !earlier.descendants.is_empty() && group.descendants.is_empty() {
                            (idx, dist)
                        } else {
                            (best_idx, best_dist)
                        }
                    } else {
                        (best_idx, best_dist)
                    }
                }
            });
        }
        let (idx, dist) = best?;
        if dist >= self.config.depth_limit {
            return None;
        }
        Some(slot.groups[idx])
    }

    fn create_group(&mut self, shard: &ShardId, insert_at: usize, depth: u32) -> GroupId {
        let gid = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            gid,
            GroupNode {
                shard: shard.clone(),
                ops: Vec::new(),
                parents: HashSet::new(),
                ancestors: HashSet::new(),
                descendants: HashSet::new(),
                state: GroupState::Available,
                depth,
            },
        );
        let slot = self.shards.get_mut(shard).unwrap();
        let at = insert_at.min(slot.groups.len());
        slot.groups.insert(at, gid);
        gid
    }

    /// Add a group-parent edge `d -> n` and update the transitive closure
    /// of both sides' ancestor/descendant sets.
    fn add_group_parent(&mut self, n: GroupId, d: GroupId) {
        if n == d {
            return;
        }
        if !self.groups.get_mut(&n).unwrap().parents.insert(d) {
            return;
        }
        let mut new_ancestors = self.groups[&d].ancestors.clone();
        new_ancestors.insert(d);

        let mut n_and_descendants: Vec<GroupId> = self.groups[&n].descendants.iter().copied().collect();
        n_and_descendants.push(n);
        for x in &n_and_descendants {
            self.groups
                .get_mut(x)
                .unwrap()
                .ancestors
                .extend(new_ancestors.iter().copied());
        }

        for y in &new_ancestors {
            self.groups
                .get_mut(y)
                .unwrap()
                .descendants
                .extend(n_and_descendants.iter().copied());
        }
    }

    /// Recompute `depth` for `start` and all of its descendants, in
    /// topological order. Ancestor-set size is a valid topological key: a
    /// parent's ancestor set is always a strict subset of its child's.
    fn recompute_depths(&mut self, start: GroupId) {
        let mut affected: Vec<GroupId> = self.groups[&start].descendants.iter().copied().collect();
        affected.push(start);
        affected.sort_by_key(|id| self.groups[id].ancestors.len());
        for id in affected {
            let shard = self.groups[&id].shard.clone();
            let max_cross = self.groups[&id]
                .parents
                .iter()
                .filter(|p| self.groups[p].shard != shard)
                .map(|p| self.groups[p].depth)
                .max();
            self.groups.get_mut(&id).unwrap().depth = max_cross.map(|d| d + 1).unwrap_or(0);
        }
    }

    /// BFS-cancel `roots` and every op reachable via `children`, removing
    /// each from `ops` and returning their user values. Does not touch
    /// group membership; callers prune empty groups afterwards.
    fn cancel_ops(&mut self, roots: Vec<OpId>) -> Vec<V> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<OpId> = roots.into_iter().collect();
        let mut ordered = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            ordered.push(id);
            if let Some(node) = self.ops.get(&id) {
                for child in &node.children {
                    queue.push_back(*child);
                }
            }
        }
        let mut values = Vec::with_capacity(ordered.len());
        for id in ordered {
            if let Some(mut node) = self.ops.remove(&id) {
                if let Some(v) = node.value.take() {
                    values.push(v);
                }
                for p in &node.parents {
                    if let Some(parent) = self.ops.get_mut(p) {
                        parent.children.remove(&id);
                    }
                }
            }
        }
        values
    }

    /// Drop any group whose op list has become empty (every op it held was
    /// cancelled), fixing up the owning shard slot's state.
    fn prune_empty_groups(&mut self) {
        let mut changed_shards = HashSet::new();
        let mut to_remove = Vec::new();
        for (gid, group) in self.groups.iter_mut() {
            group.ops.retain(|op| self.ops.contains_key(op));
            if group.ops.is_empty() {
                to_remove.push(*gid);
                changed_shards.insert(group.shard.clone());
            }
        }
        for gid in to_remove {
            self.detach_group(gid);
            self.groups.remove(&gid);
        }
        for shard in &changed_shards {
            if let Some(slot) = self.shards.get_mut(shard) {
                slot.groups.retain(|g| self.groups.contains_key(g));
            }
        }
        self.sync_shard_states();
    }

    /// Remove `gid` from every other group's parent/ancestor/descendant
    /// sets, so no group ever indexes a removed id.
    fn detach_group(&mut self, gid: GroupId) {
        for group in self.groups.values_mut() {
            group.parents.remove(&gid);
            group.ancestors.remove(&gid);
            group.descendants.remove(&gid);
        }
    }

    fn sync_shard_states(&mut self) {
        for slot in self.shards.values_mut() {
            slot.state = match slot.groups.first() {
                Some(gid) if self.groups[gid].state == GroupState::Started => ShardState::Started,
                _ => ShardState::Available,
            };
        }
    }

    fn complete_group(&mut self, gid: GroupId) -> CoreResult<()> {
        let group = self
            .groups
            .get(&gid)
            .ok_or_else(|| CoreError::Schedule(format!("{gid} no longer exists")))?;
        if group.state != GroupState::Started {
            return Err(CoreError::Schedule(format!("{gid} is not started")));
        }
        let shard = group.shard.clone();
        let ops = group.ops.clone();
        self.groups.remove(&gid);
        self.detach_group(gid);
        for op in ops {
            self.ops.remove(&op);
        }
        if let Some(slot) = self.shards.get_mut(&shard) {
            slot.groups.retain(|g| *g != gid);
        }
        self.sync_shard_states();
        Ok(())
    }

    fn fail_group(&mut self, gid: GroupId) -> CoreResult<Vec<V>> {
        let group = self
            .groups
            .get(&gid)
            .ok_or_else(|| CoreError::Schedule(format!("{gid} no longer exists")))?;
        if group.state != GroupState::Started {
            return Err(CoreError::Schedule(format!("{gid} is not started")));
        }
        let shard = group.shard.clone();
        let roots = group.ops.clone();
        self.groups.remove(&gid);
        self.detach_group(gid);
        if let Some(slot) = self.shards.get_mut(&shard) {
            slot.groups.retain(|g| *g != gid);
        }
        let values = self.cancel_ops(roots);
        self.sync_shard_states();
        self.rebalance();
        Ok(values)
    }

    /// Rebuild every non-STARTED group from scratch by replaying surviving
    /// ops (in ascending id order, which is already a valid topological
    /// order since a dependency's id is always smaller than its
    /// dependant's) through the normal placement algorithm. STARTED groups
    /// keep their id and ops untouched; their stale parent/ancestor/
    /// descendant bookkeeping is cleared and refilled as the replay
    /// re-creates edges pointing at them.
    fn rebalance(&mut self) {
        let mut preserved = HashMap::new();
        let mut preserved_ops = HashSet::new();
        for (gid, group) in self.groups.iter() {
            if group.state == GroupState::Started {
                preserved.insert(
                    *gid,
                    GroupNode {
                        shard: group.shard.clone(),
                        ops: group.ops.clone(),
                        parents: HashSet::new(),
                        ancestors: HashSet::new(),
                        descendants: HashSet::new(),
                        state: GroupState::Started,
                        depth: group.depth,
                    },
                );
                preserved_ops.extend(group.ops.iter().copied());
            }
        }

        let mut surviving: Vec<OpId> = self
            .ops
            .keys()
            .copied()
            .filter(|id| !preserved_ops.contains(id))
            .collect();
        surviving.sort();
        let replay: Vec<(OpId, ShardId, Vec<OpId>)> = surviving
            .into_iter()
            .map(|id| {
                let op = &self.ops[&id];
                (id, op.shard.clone(), op.parents.clone())
            })
            .collect();

        self.groups = preserved;
        self.shards.clear();
        for (gid, group) in self.groups.iter() {
            let slot = self.shards.entry(group.shard.clone()).or_insert_with(|| ShardSlot {
                groups: Vec::new(),
                state: ShardState::Started,
            });
            slot.groups.push(*gid);
        }
        self.shard_order.retain(|s| self.shards.contains_key(s));

        for (op_id, shard, parents) in replay {
            self.place_op(op_id, &shard, &parents);
        }
    }
}
