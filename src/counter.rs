//! Named monotonic `u64` counters (spec §3/§4.8). A shard's
//! `KeySequenceCipher` keeps one counter bag tracking `"<seq>.msg"` and
//! `"<seq>.blk"` usage per key; the `Cache` snapshots, commits and merges
//! these across reload/retry so that a CAS conflict never loses a local
//! increment.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub init: u64,
    pub value: u64,
}

impl Counter {
    fn commit(&mut self) {
        self.init = self.value;
    }

    fn merge(&mut self, other: &Counter) {
        if other.init == 0 {
            // Skip ids whose peer baseline is stale/unset, per spec §4.8.
            return;
        }
        self.value += other.value.saturating_sub(other.init);
    }
}

/// Bag of named counters. Keys are small strings like `"1.msg"`/`"1.blk"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterBag {
    counters: BTreeMap<String, Counter>,
}

impl CounterBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> u64 {
        self.counters.get(id).map(|c| c.value).unwrap_or(0)
    }

    pub fn increment(&mut self, id: &str, by: u64) {
        let counter = self.counters.entry(id.to_string()).or_default();
        counter.value += by;
    }

    pub fn set_init(&mut self, id: &str, init: u64, value: u64) {
        self.counters.insert(id.to_string(), Counter { init, value });
    }

    /// Snapshot current values as new `init` baselines. Called after a
    /// successful write commits the in-memory increments.
    pub fn commit(&mut self) {
        for counter in self.counters.values_mut() {
            counter.commit();
        }
    }

    /// For each id present in both bags, add `other`'s increment since its
    /// own last commit into ours. Ids absent locally, or with a stale
    /// (`init == 0`) peer baseline, are left untouched.
    pub fn merge(&mut self, other: &CounterBag) {
        for (id, ours) in self.counters.iter_mut() {
            if let Some(theirs) = other.counters.get(id) {
                ours.merge(theirs);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_resets_baseline() {
        let mut bag = CounterBag::new();
        bag.increment("1.msg", 5);
        bag.commit();
        assert_eq!(bag.counters.get("1.msg").unwrap().init, 5);
    }

    #[test]
    fn merge_adds_peer_increment_since_its_commit() {
        let mut local = CounterBag::new();
        local.set_init("1.msg", 5, 5);

        let mut peer = CounterBag::new();
        peer.set_init("1.msg", 5, 10); // peer advanced by 5 since its commit

        local.merge(&peer);
        assert_eq!(local.get("1.msg"), 10);
    }

    #[test]
    fn merge_ignores_ids_absent_locally() {
        let mut local = CounterBag::new();
        local.set_init("1.msg", 0, 0);

        let mut peer = CounterBag::new();
        peer.set_init("2.msg", 3, 7);

        local.merge(&peer);
        assert_eq!(local.get("2.msg"), 0);
    }

    #[test]
    fn merge_skips_stale_zero_init_peer() {
        let mut local = CounterBag::new();
        local.set_init("1.msg", 5, 5);

        let mut peer = CounterBag::new();
        peer.set_init("1.msg", 0, 100);

        local.merge(&peer);
        assert_eq!(local.get("1.msg"), 5);
    }

    #[test]
    fn merge_is_commutative_over_disjoint_ids() {
        let mut a = CounterBag::new();
        a.set_init("1.msg", 1, 1);
        a.set_init("2.msg", 1, 1);

        let mut peer1 = CounterBag::new();
        peer1.set_init("1.msg", 1, 4);
        let mut peer2 = CounterBag::new();
        peer2.set_init("2.msg", 1, 9);

        let mut order1 = a.clone();
        order1.merge(&peer1);
        order1.merge(&peer2);

        let mut order2 = a.clone();
        order2.merge(&peer2);
        order2.merge(&peer1);

        assert_eq!(order1, order2);
    }
}
