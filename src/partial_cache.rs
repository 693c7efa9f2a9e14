//! `PartialCache`: in-memory per-round aggregation buffer with a
//! per-signer quota (spec.md §4.2).
//!
//! Owned exclusively by the [`crate::aggregator::Aggregator`] loop — no
//! lock is shared with any other task, per spec.md §9's single-writer
//! redesign flag, so this type is plain `&mut self`, not
//! `Arc<Mutex<..>>`, the way `node/db/src/memory.rs`'s store wraps its
//! map only where genuinely shared across tasks.

use std::collections::VecDeque;

use ahash::AHashMap;

use crate::wire::PartialBeacon;

/// Identifies one round-cache: a round paired with the previous
/// signature the partials were computed over (spec.md §3 `RoundCache`).
/// Two nodes can legitimately disagree on `previous_sig` for the same
/// round during a network split; spec.md §9 leaves rejecting one as an
/// open policy question, so both are kept as independent caches here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoundCacheId {
    pub round: u64,
    pub previous_sig: Vec<u8>,
}

/// The partials collected so far for one `RoundCacheId`.
#[derive(Default)]
pub struct RoundCache {
    by_signer: AHashMap<u32, PartialBeacon>,
    done: bool,
}

impl RoundCache {
    /// Inserts `partial`, returning `true` only if this signer had not
    /// already contributed to this round-cache (spec.md §4.2
    /// `round_cache.append`).
    fn append(&mut self, partial: PartialBeacon) -> bool {
        if self.by_signer.contains_key(&partial.signer_index) {
            return false;
        }
        self.by_signer.insert(partial.signer_index, partial);
        true
    }

    pub fn len(&self) -> usize {
        self.by_signer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_signer.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn partials(&self) -> Vec<PartialBeacon> {
        self.by_signer.values().cloned().collect()
    }
}

/// Default per-signer live-entry quota (spec.md §9 open question: "any
/// implementation may choose a value ≥ T but must document it" — chosen
/// here as a small constant independent of T since T varies per group and
/// this cache is shared across every live round-cache of any round).
pub const DEFAULT_MAX_PARTIALS_PER_NODE: usize = 5;

/// Holds every live [`RoundCache`] plus, per signer, the ordered list of
/// round-caches they have contributed to, to enforce the quota.
pub struct PartialCache {
    max_partials_per_node: usize,
    caches: AHashMap<RoundCacheId, RoundCache>,
    /// Per-signer FIFO of the round-caches they have live entries in,
    /// oldest first, for quota eviction (spec.md §4.2).
    per_signer: AHashMap<u32, VecDeque<RoundCacheId>>,
}

impl PartialCache {
    pub fn new(max_partials_per_node: usize) -> Self {
        Self {
            max_partials_per_node,
            caches: AHashMap::new(),
            per_signer: AHashMap::new(),
        }
    }

    /// Appends `partial` to its round-cache, evicting the signer's oldest
    /// entry first if they are already at quota (spec.md §4.2). Returns
    /// the id the partial landed under and whether it was newly
    /// inserted — the caller (`Aggregator`) uses the id to check whether
    /// the round-cache just crossed threshold.
    pub fn append(&mut self, partial: PartialBeacon) -> (RoundCacheId, bool) {
        let id = RoundCacheId {
            round: partial.round,
            previous_sig: partial.previous_sig.clone(),
        };
        let signer = partial.signer_index;

        let queue = self.per_signer.entry(signer).or_default();
        if !queue.contains(&id) && queue.len() >= self.max_partials_per_node {
            if let Some(evicted_id) = queue.pop_front() {
                self.evict_signer_from(&evicted_id, signer);
            }
        }

        let cache = self.caches.entry(id.clone()).or_default();
        let inserted = cache.append(partial);
        if inserted {
            let queue = self.per_signer.entry(signer).or_default();
            if !queue.contains(&id) {
                queue.push_back(id.clone());
            }
        }
        if cache.is_empty() {
            self.caches.remove(&id);
        }
        (id, inserted)
    }

    pub fn get(&self, id: &RoundCacheId) -> Option<&RoundCache> {
        self.caches.get(id)
    }

    pub fn get_mut(&mut self, id: &RoundCacheId) -> Option<&mut RoundCache> {
        self.caches.get_mut(id)
    }

    /// Deletes every round-cache whose round is `<= r` and cleans the
    /// per-signer index (spec.md §4.2 `flush_rounds`).
    pub fn flush_rounds(&mut self, r: u64) {
        let stale: Vec<RoundCacheId> = self
            .caches
            .keys()
            .filter(|id| id.round <= r)
            .cloned()
            .collect();
        for id in stale {
            self.caches.remove(&id);
            for queue in self.per_signer.values_mut() {
                queue.retain(|q| q != &id);
            }
        }
        self.per_signer.retain(|_, q| !q.is_empty());
    }

    /// Removes a single round-cache immediately (spec.md §4.6: evicted
    /// "when a later beacon is stored").
    pub fn evict(&mut self, id: &RoundCacheId) {
        self.caches.remove(id);
        for queue in self.per_signer.values_mut() {
            queue.retain(|q| q != id);
        }
        self.per_signer.retain(|_, q| !q.is_empty());
    }

    /// Count of distinct round-caches `signer` currently has a live entry
    /// in, for testing the quota bound directly.
    pub fn live_entries_for(&self, signer: u32) -> usize {
        self.per_signer.get(&signer).map_or(0, VecDeque::len)
    }

    fn evict_signer_from(&mut self, id: &RoundCacheId, signer: u32) {
        let mut drop_cache = false;
        if let Some(cache) = self.caches.get_mut(id) {
            cache.by_signer.remove(&signer);
            drop_cache = cache.is_empty();
        }
        if drop_cache {
            self.caches.remove(id);
        }
    }
}
