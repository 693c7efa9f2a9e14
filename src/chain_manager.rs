//! `ChainManager`: the single writer of [`crate::store::ChainStore`],
//! deciding appendability and orchestrating sync (spec.md §4.6).
//!
//! Exclusive-writer discipline follows spec.md §9's redesign flag
//! directly: this is the only task that ever calls `ChainStore::put`.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::crypto::CryptoVault;
use crate::store::{ChainStore, PutOutcome};
use crate::wire::Beacon;

/// Appendability verdict for a candidate beacon relative to the chain's
/// current tip (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Appendable,
    Past,
    Future { gap_from: u64, gap_to: u64 },
}

/// Classifies `candidate` against `last` per spec.md §4.6's three states.
pub fn classify(candidate: &Beacon, last: &Beacon, chained: bool) -> Verdict {
    if candidate.round <= last.round {
        return Verdict::Past;
    }
    if candidate.round == last.round + 1 && (!chained || candidate.previous_sig == last.signature)
    {
        return Verdict::Appendable;
    }
    Verdict::Future {
        gap_from: last.round + 1,
        gap_to: candidate.round,
    }
}

/// Requests emitted toward the `SyncManager` when a gap is observed
/// (spec.md §4.6 "FUTURE -> request a sync from peers").
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest {
    pub from_round: u64,
    pub up_to_round: u64,
}

pub struct ChainManager<S: ChainStore> {
    store: Arc<S>,
    vault: CryptoVault,
    sync_in_flight: bool,
}

impl<S: ChainStore> ChainManager<S> {
    pub fn new(store: Arc<S>, vault: CryptoVault) -> Self {
        Self {
            store,
            vault,
            sync_in_flight: false,
        }
    }

    fn chained(&self) -> bool {
        self.vault.scheme().requires_previous()
    }

    /// Applies a candidate beacon produced locally by the `Aggregator`
    /// (already verified against the group commit). Returns the stored
    /// beacon on success so the caller can notify the aggregator/ticker,
    /// and a `SyncRequest` if a gap was observed.
    pub fn apply(&mut self, candidate: Beacon) -> (Option<Beacon>, Option<SyncRequest>) {
        self.apply_inner(candidate, false)
    }

    /// Applies a beacon that arrived as unverified peer gossip (spec.md
    /// §4.6 "fast follow"): verified under the group commit *before* the
    /// appendability check, dropped silently if invalid.
    pub fn apply_gossip(&mut self, candidate: Beacon) -> (Option<Beacon>, Option<SyncRequest>) {
        let digest = self
            .vault
            .digest_beacon(candidate.round, &candidate.previous_sig);
        if self
            .vault
            .verify_recovered(&digest, &candidate.signature)
            .is_err()
        {
            warn!(round = candidate.round, "dropped invalid gossip beacon");
            return (None, None);
        }
        self.apply_inner(candidate, true)
    }

    fn apply_inner(
        &mut self,
        candidate: Beacon,
        from_gossip: bool,
    ) -> (Option<Beacon>, Option<SyncRequest>) {
        let last = match self.store.last() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "chain manager could not read chain tip");
                return (None, None);
            }
        };

        match classify(&candidate, &last, self.chained()) {
            Verdict::Appendable => match self.store.put(candidate.clone()) {
                Ok(PutOutcome::Appended) => {
                    info!(round = candidate.round, gossip = from_gossip, "appended beacon");
                    (Some(candidate), None)
                }
                Ok(PutOutcome::AlreadyStored) => (None, None),
                Err(e) => {
                    warn!(round = candidate.round, error = %e, "append failed");
                    (None, None)
                }
            },
            Verdict::Past => (None, None),
            Verdict::Future { gap_from, gap_to } => {
                if self.sync_in_flight {
                    info!(
                        gap_from,
                        gap_to, "future beacon observed, sync already in flight"
                    );
                    (None, None)
                } else {
                    self.sync_in_flight = true;
                    (
                        None,
                        Some(SyncRequest {
                            from_round: gap_from,
                            up_to_round: gap_to,
                        }),
                    )
                }
            }
        }
    }

    /// Called by the `SyncManager` once an attempt (successful or not)
    /// completes, clearing the de-duplication gate (spec.md §4.6 "only
    /// one sync is in flight at a time").
    pub fn sync_completed(&mut self) {
        self.sync_in_flight = false;
    }

    pub fn sync_in_flight(&self) -> bool {
        self.sync_in_flight
    }

    /// Drives the manager as a long-lived task over bounded channels:
    /// reconstructed beacons from the `Aggregator`, gossiped beacons from
    /// peers, and sync-completion signals. Successfully appended beacons
    /// are announced on `stored_tx` (consumed by the `Aggregator` to
    /// flush caches) and `notify_tx` (consumed by the daemon to
    /// distinguish catchup from live beacons, spec.md §4.6).
    pub async fn run(
        mut self,
        mut reconstructed_rx: mpsc::Receiver<Beacon>,
        mut gossip_rx: mpsc::Receiver<Beacon>,
        mut sync_done_rx: mpsc::Receiver<()>,
        stored_tx: mpsc::Sender<u64>,
        notify_tx: mpsc::Sender<Beacon>,
        sync_request_tx: mpsc::Sender<SyncRequest>,
        mut stopping: watch::Receiver<bool>,
    ) {
        loop {
            let (stored, sync_req) = tokio::select! {
                biased;
                _ = stopping.changed() => {
                    if *stopping.borrow() {
                        return;
                    }
                    continue;
                }
                Some(()) = sync_done_rx.recv() => {
                    self.sync_completed();
                    continue;
                }
                Some(beacon) = reconstructed_rx.recv() => self.apply(beacon),
                Some(beacon) = gossip_rx.recv() => self.apply_gossip(beacon),
                else => return,
            };

            if let Some(beacon) = stored {
                let _ = stored_tx.try_send(beacon.round);
                let _ = notify_tx.try_send(beacon);
            }
            if let Some(req) = sync_req {
                let _ = sync_request_tx.try_send(req);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupInfo, NodeInfo, Scheme, Share};
    use crate::store::memory::MemoryStore;
    use blstrs::Scalar;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn toy_vault(scheme: Scheme) -> CryptoVault {
        let group = GroupInfo {
            threshold: 2,
            nodes: vec![NodeInfo {
                index: 1,
                address: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
            }],
            period: Duration::from_secs(2),
            genesis_time: 0,
            genesis_seed: vec![0u8; 8],
            scheme,
            group_public_poly: vec![vec![0u8; 48]],
        };
        CryptoVault::new(Share::new(1, Scalar::ZERO), group)
    }

    fn beacon(round: u64, prev: &[u8], sig: &[u8]) -> Beacon {
        Beacon {
            round,
            previous_sig: prev.to_vec(),
            signature: sig.to_vec(),
        }
    }

    #[test]
    fn appendable_beacon_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_genesis(vec![9; 8]).unwrap();
        let mut manager = ChainManager::new(store.clone(), toy_vault(Scheme::Unchained));

        let (stored, sync) = manager.apply(beacon(1, &[], b"sig1"));
        assert!(stored.is_some());
        assert!(sync.is_none());
        assert_eq!(store.last().unwrap().round, 1);
    }

    #[test]
    fn past_beacon_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_genesis(vec![]).unwrap();
        store.put(beacon(1, &[], b"sig1")).unwrap();
        let mut manager = ChainManager::new(store.clone(), toy_vault(Scheme::Unchained));

        let (stored, sync) = manager.apply(beacon(1, &[], b"sig1"));
        assert!(stored.is_none());
        assert!(sync.is_none());
    }

    #[test]
    fn future_beacon_requests_a_bounded_sync_once() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_genesis(vec![]).unwrap();
        let mut manager = ChainManager::new(store, toy_vault(Scheme::Unchained));

        let (_, sync) = manager.apply(beacon(5, &[], b"sig5"));
        let req = sync.expect("gap must trigger a sync request");
        assert_eq!(req.from_round, 1);
        assert_eq!(req.up_to_round, 5);
        assert!(manager.sync_in_flight());

        // A second future beacon while sync is in flight is just logged.
        let (_, sync2) = manager.apply(beacon(6, &[], b"sig6"));
        assert!(sync2.is_none());

        manager.sync_completed();
        assert!(!manager.sync_in_flight());
    }

    #[test]
    fn chained_scheme_requires_matching_previous_signature() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_genesis(vec![]).unwrap();
        store.put(beacon(1, &[], b"sig1")).unwrap();
        let mut manager = ChainManager::new(store, toy_vault(Scheme::Chained));

        // Round 2 claiming the wrong previous signature is neither
        // appendable nor a clean gap - it is treated as Future and a sync
        // is requested rather than silently corrupting the chain.
        let (stored, sync) = manager.apply(beacon(2, b"wrong-prev", b"sig2"));
        assert!(stored.is_none());
        assert!(sync.is_some());
    }
}
