//! `SyncManager`: pull-based catchup from peers (spec.md §4.7).
//!
//! `PeerClient` is the narrow trait this module needs from the transport
//! (out of scope per spec.md §1, modeled the way `peer_manager.rs`'s
//! `PeerManager` treats peers as an opaque, shufflable collection rather
//! than owning the network layer itself).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::crypto::CryptoVault;
use crate::store::{ChainStore, Error as StoreError, PutOutcome};
use crate::ticker::Clock;
use crate::wire::{Beacon, BeaconPacket, SyncRequest as WireSyncRequest};

#[derive(Debug, Error)]
pub enum Error {
    #[error("sync failed against all peers")]
    FailedAll,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One frame of a peer's sync stream, already off the wire.
pub type Frame = BeaconPacket;

/// The transport-facing surface `SyncManager` needs per peer (spec.md
/// §4.7 "open a streaming sync request ... the peer responds with an
/// ordered stream of beacons").
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn sync_chain(
        &self,
        peer: SocketAddr,
        request: WireSyncRequest,
    ) -> Result<Vec<Frame>, String>;

    async fn latest_round(&self, peer: SocketAddr) -> Result<u64, String>;
}

/// How far the network may be ahead of us before a best-head probe
/// schedules a sync (spec.md §4.7 "ahead by more than a small delta").
pub const BEST_HEAD_DELTA: u64 = 1;

/// Factor applied to the group period to decide the liveness-check
/// timeout (spec.md §4.7 "no new beacon ... in factor*P seconds").
pub const LIVENESS_FACTOR: u32 = 4;

pub struct SyncManager<S: ChainStore, P: PeerClient> {
    store: std::sync::Arc<S>,
    vault: CryptoVault,
    peers: Vec<SocketAddr>,
    client: P,
}

impl<S: ChainStore, P: PeerClient> SyncManager<S, P> {
    pub fn new(store: std::sync::Arc<S>, vault: CryptoVault, peers: Vec<SocketAddr>, client: P) -> Self {
        Self {
            store,
            vault,
            peers,
            client,
        }
    }

    fn chained(&self) -> bool {
        self.vault.scheme().requires_previous()
    }

    /// Runs one sync attempt toward `up_to`, trying each peer in a random
    /// shuffle (excluding none — the caller never includes self in
    /// `peers`) until one yields progress or all are exhausted. Retries
    /// once on `FailedAll` (spec.md §4.7).
    pub async fn sync(&self, up_to: u64) -> Result<(), Error> {
        match self.try_all_peers(up_to).await {
            Ok(()) => Ok(()),
            Err(Error::FailedAll) => {
                warn!("sync failed against all peers, retrying once");
                self.try_all_peers(up_to).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_all_peers(&self, up_to: u64) -> Result<(), Error> {
        let mut shuffled = self.peers.clone();
        shuffled.shuffle(&mut rand::thread_rng());

        for peer in shuffled {
            let from_round = match self.store.last() {
                Ok(b) => b.round + 1,
                Err(_) => 0,
            };
            if from_round > up_to {
                return Ok(());
            }
            let request = WireSyncRequest {
                from_round,
                metadata: Default::default(),
            };
            match self.client.sync_chain(peer, request).await {
                Ok(frames) => {
                    if self.consume_frames(peer, frames, up_to).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "peer sync request failed, trying next peer");
                }
            }
        }
        Err(Error::FailedAll)
    }

    /// Applies frames from one peer's stream, verifying each in order.
    /// Returns `true` once `up_to` has been reached locally.
    async fn consume_frames(&self, peer: SocketAddr, frames: Vec<Frame>, up_to: u64) -> bool {
        let mut prior_signature: Option<Vec<u8>> = None;
        for frame in frames {
            let beacon: Beacon = frame.clone().into();

            let digest = self
                .vault
                .digest_beacon(beacon.round, &beacon.previous_sig);
            if self
                .vault
                .verify_recovered(&digest, &beacon.signature)
                .is_err()
            {
                warn!(%peer, round = beacon.round, "invalid frame, abandoning this peer");
                return false;
            }

            if self.chained() {
                let expected_prev = match &prior_signature {
                    Some(prev) => prev.clone(),
                    None => match self.store.last() {
                        Ok(last) => last.signature,
                        Err(_) => Vec::new(),
                    },
                };
                if beacon.previous_sig != expected_prev {
                    warn!(%peer, round = beacon.round, "chain linkage mismatch, abandoning this peer");
                    return false;
                }
            }

            match self.store.put(beacon.clone()) {
                Ok(PutOutcome::Appended) | Ok(PutOutcome::AlreadyStored) => {}
                Err(e) => {
                    warn!(%peer, round = beacon.round, error = %e, "failed to store synced beacon");
                    return false;
                }
            }
            prior_signature = Some(beacon.signature);

            if beacon.round >= up_to {
                info!(%peer, round = beacon.round, "sync target reached");
                return true;
            }
        }
        false
    }

    /// ReSync(from, up_to): operator-driven repair of a known-bad range.
    /// Bypasses the append-linkage check via `insecure_put`; fires no
    /// callbacks (spec.md §4.7).
    pub async fn resync(&self, from: u64, up_to: u64, validated: Vec<Beacon>) -> Result<(), Error> {
        for beacon in validated
            .into_iter()
            .filter(|b| b.round >= from && b.round <= up_to)
        {
            let digest = self
                .vault
                .digest_beacon(beacon.round, &beacon.previous_sig);
            self.vault
                .verify_recovered(&digest, &beacon.signature)
                .map_err(|_| Error::FailedAll)?;
            self.store.insecure_put(beacon)?;
        }
        Ok(())
    }

    /// Queries every peer's latest round and returns `Some(target)` if the
    /// network is ahead of our local tip by more than [`BEST_HEAD_DELTA`]
    /// (spec.md §4.7 "best-head probe").
    pub async fn best_head_probe(&self) -> Option<u64> {
        let local = self.store.last().ok()?.round;
        let mut best = local;
        for &peer in &self.peers {
            if let Ok(round) = self.client.latest_round(peer).await {
                best = best.max(round);
            }
        }
        if best > local + BEST_HEAD_DELTA {
            Some(best)
        } else {
            None
        }
    }

    /// The liveness-check timeout: if nothing has been stored within this
    /// window, any in-flight sync should be canceled and restarted
    /// (spec.md §4.7).
    pub fn liveness_timeout(period: Duration) -> Duration {
        period * LIVENESS_FACTOR
    }

    /// Background liveness check and best-head probe (spec.md §4.7): on
    /// every period boundary, checks whether the local tip has advanced
    /// since the last check and restarts a sync if it has stalled past
    /// [`Self::liveness_timeout`], then probes peers for their latest
    /// round and schedules a sync if the network is ahead by more than
    /// [`BEST_HEAD_DELTA`]. Runs as a single task, so at most one sync
    /// triggered by this loop is ever in flight at a time.
    pub async fn run<C: Clock>(
        self: Arc<Self>,
        clock: Arc<C>,
        period: Duration,
        mut stopping: watch::Receiver<bool>,
    ) {
        let mut last_seen_round = self.store.last().map(|b| b.round).unwrap_or(0);
        let mut last_progress_at = clock.now();
        let timeout = Self::liveness_timeout(period);

        loop {
            tokio::select! {
                biased;
                _ = stopping.changed() => {
                    if *stopping.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(period) => {
                    let current_round = self.store.last().map(|b| b.round).unwrap_or(0);
                    if current_round > last_seen_round {
                        last_seen_round = current_round;
                        last_progress_at = clock.now();
                    } else if clock.now().saturating_sub(last_progress_at) >= timeout.as_secs() {
                        warn!(
                            current_round,
                            "no new beacon within liveness window, restarting sync"
                        );
                        if self.sync(current_round + 1).await.is_ok() {
                            last_seen_round = self.store.last().map(|b| b.round).unwrap_or(0);
                        }
                        last_progress_at = clock.now();
                    }

                    if let Some(target) = self.best_head_probe().await {
                        info!(target, "best-head probe found network ahead, syncing");
                        if self.sync(target).await.is_ok() {
                            last_seen_round = self.store.last().map(|b| b.round).unwrap_or(0);
                            last_progress_at = clock.now();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupInfo, NodeInfo, Scheme, Share};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use blstrs::Scalar;
    use std::sync::Arc;

    struct StubClient {
        frames: Vec<Frame>,
    }

    #[async_trait]
    impl PeerClient for StubClient {
        async fn sync_chain(
            &self,
            _peer: SocketAddr,
            _request: WireSyncRequest,
        ) -> Result<Vec<Frame>, String> {
            Ok(self.frames.clone())
        }

        async fn latest_round(&self, _peer: SocketAddr) -> Result<u64, String> {
            Ok(self.frames.last().map(|f| f.round).unwrap_or(0))
        }
    }

    fn toy_vault() -> CryptoVault {
        let group = GroupInfo {
            threshold: 1,
            nodes: vec![NodeInfo {
                index: 1,
                address: "127.0.0.1:9000".parse().unwrap(),
            }],
            period: Duration::from_secs(2),
            genesis_time: 0,
            genesis_seed: vec![],
            scheme: Scheme::Unchained,
            group_public_poly: vec![vec![0u8; 48]],
        };
        CryptoVault::new(Share::new(1, Scalar::ZERO), group)
    }

    #[test]
    fn liveness_timeout_scales_with_period() {
        let timeout = SyncManager::<MemoryStore, StubClient>::liveness_timeout(Duration::from_secs(2));
        assert_eq!(timeout, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn sync_with_no_peers_fails_all() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_genesis(vec![]).unwrap();
        let manager = SyncManager::new(store, toy_vault(), vec![], StubClient { frames: vec![] });
        assert!(matches!(manager.sync(3).await, Err(Error::FailedAll)));
    }
}
