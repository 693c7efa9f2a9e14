//! In-memory `ChainStore`, for tests and single-process simulation.
//!
//! Grounded in `node/db/src/memory.rs`'s `Arc<RwLock<HashMap<..>>>`
//! wrapper, generalized from an opaque blockstore to an ordered,
//! round-keyed log (a `BTreeMap` so `last`/`cursor` are O(1)/O(log n)
//! without a secondary index).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::wire::Beacon;

use super::{CallbackRegistry, ChainStore, Cursor, Error, PutOutcome};

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<u64, Beacon>>>,
    callbacks: Arc<CallbackRegistry>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            callbacks: Arc::new(CallbackRegistry::new()),
        }
    }

    /// Writes the round-0 genesis beacon if the store is empty, per
    /// spec.md §4.1 "A genesis beacon ... is written at first startup."
    pub fn ensure_genesis(&self, seed: Vec<u8>) -> Result<(), Error> {
        let mut map = self.inner.write();
        if map.is_empty() {
            map.insert(0, Beacon::genesis(seed));
        }
        Ok(())
    }
}

impl ChainStore for MemoryStore {
    fn put(&self, beacon: Beacon) -> Result<PutOutcome, Error> {
        let mut map = self.inner.write();
        if let Some(existing) = map.get(&beacon.round) {
            return if *existing == beacon {
                Ok(PutOutcome::AlreadyStored)
            } else {
                Err(Error::Conflict {
                    round: beacon.round,
                })
            };
        }
        let expected_next = map.keys().next_back().map(|r| r + 1).unwrap_or(0);
        if beacon.round != expected_next {
            return Err(Error::InvalidRound {
                round: beacon.round,
            });
        }
        map.insert(beacon.round, beacon.clone());
        drop(map);
        self.callbacks.dispatch(&beacon);
        Ok(PutOutcome::Appended)
    }

    fn last(&self) -> Result<Beacon, Error> {
        self.inner
            .read()
            .values()
            .next_back()
            .cloned()
            .ok_or(Error::NoneStored)
    }

    fn get(&self, round: u64) -> Result<Beacon, Error> {
        self.inner
            .read()
            .get(&round)
            .cloned()
            .ok_or(Error::NotFound(round))
    }

    fn cursor(&self, round: u64) -> Box<dyn Cursor> {
        let snapshot: Vec<Beacon> = self
            .inner
            .read()
            .range(round..)
            .map(|(_, b)| b.clone())
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn len(&self) -> Result<u64, Error> {
        Ok(self.inner.read().len() as u64)
    }

    fn del(&self, round: u64) -> Result<(), Error> {
        self.inner.write().remove(&round);
        Ok(())
    }

    fn insecure_put(&self, beacon: Beacon) -> Result<(), Error> {
        self.inner.write().insert(beacon.round, beacon);
        Ok(())
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(round: u64, prev: &[u8], sig: &[u8]) -> Beacon {
        Beacon {
            round,
            previous_sig: prev.to_vec(),
            signature: sig.to_vec(),
        }
    }

    #[test]
    fn genesis_then_sequential_append_succeeds() {
        let store = MemoryStore::new();
        store.ensure_genesis(vec![9; 8]).unwrap();
        assert_eq!(store.last().unwrap().round, 0);

        let b1 = beacon(1, &[9; 8], b"sig1");
        assert_eq!(store.put(b1.clone()).unwrap(), PutOutcome::Appended);
        assert_eq!(store.last().unwrap(), b1);
    }

    #[test]
    fn duplicate_identical_put_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_genesis(vec![]).unwrap();
        let b1 = beacon(1, &[], b"sig1");
        store.put(b1.clone()).unwrap();
        assert_eq!(store.put(b1).unwrap(), PutOutcome::AlreadyStored);
    }

    #[test]
    fn duplicate_put_with_different_bytes_is_rejected() {
        let store = MemoryStore::new();
        store.ensure_genesis(vec![]).unwrap();
        let b1 = beacon(1, &[], b"sig1");
        store.put(b1).unwrap();
        let conflicting = beacon(1, &[], b"sig-different");
        assert!(matches!(
            store.put(conflicting),
            Err(Error::Conflict { round: 1 })
        ));
    }

    #[test]
    fn skipping_a_round_is_rejected() {
        let store = MemoryStore::new();
        store.ensure_genesis(vec![]).unwrap();
        let b2 = beacon(2, &[], b"sig2");
        assert!(matches!(
            store.put(b2),
            Err(Error::InvalidRound { round: 2 })
        ));
    }

    #[test]
    fn cursor_is_ascending_and_restartable() {
        let store = MemoryStore::new();
        store.ensure_genesis(vec![]).unwrap();
        for r in 1..=5 {
            store.put(beacon(r, &[], &[r as u8])).unwrap();
        }
        let rounds: Vec<u64> = store.cursor(2).map(|b| b.round).collect();
        assert_eq!(rounds, vec![2, 3, 4, 5]);
        // restartable: a fresh cursor from the same point yields the same sequence
        let rounds_again: Vec<u64> = store.cursor(2).map(|b| b.round).collect();
        assert_eq!(rounds, rounds_again);
    }

    #[test]
    fn get_missing_round_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.get(3), Err(Error::NotFound(3))));
    }
}
