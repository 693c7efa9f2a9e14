//! `Aggregator`: collects verified partials per round-cache and
//! reconstructs the full beacon once threshold is met (spec.md §4.5).
//!
//! Single task, single owner of [`PartialCache`] — the redesign flag in
//! spec.md §9 calls for this lock to belong to exactly one task rather
//! than being shared behind `Arc<Mutex<_>>`, the pattern
//! `blockchain/chain_sync/src/chain_muxer.rs`'s state machine follows for
//! its own owned queues.

use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::crypto::CryptoVault;
use crate::partial_cache::{PartialCache, RoundCacheId, DEFAULT_MAX_PARTIALS_PER_NODE};
use crate::wire::{Beacon, PartialBeacon};

/// How far ahead of the last stored round an inbound partial may still be
/// buffered (spec.md §4.5, "typically 3").
pub const STORE_LOOKAHEAD: u64 = 3;

/// An inbound partial, tagged with the peer it arrived from for logging
/// (spec.md §4.5 inputs).
#[derive(Debug)]
pub struct InboundPartial {
    pub from: SocketAddr,
    pub partial: PartialBeacon,
}

pub struct Aggregator {
    vault: CryptoVault,
    cache: PartialCache,
    last_stored_round: u64,
    store_lookahead: u64,
}

impl Aggregator {
    pub fn new(vault: CryptoVault) -> Self {
        Self::with_quota(vault, DEFAULT_MAX_PARTIALS_PER_NODE, STORE_LOOKAHEAD)
    }

    pub fn with_quota(vault: CryptoVault, max_partials_per_node: usize, store_lookahead: u64) -> Self {
        Self {
            vault,
            cache: PartialCache::new(max_partials_per_node),
            last_stored_round: 0,
            store_lookahead,
        }
    }

    /// Handles one inbound partial, returning a freshly reconstructed and
    /// verified [`Beacon`] when this partial was the one that crossed
    /// threshold (spec.md §4.5). Invalid partials are dropped and logged,
    /// never propagated as an error — only the caller-facing
    /// `ProcessPartialBeacon` handler surfaces a typed rejection.
    pub fn handle_partial(&mut self, inbound: InboundPartial) -> Option<Beacon> {
        let partial = inbound.partial;

        if partial.round <= self.last_stored_round
            || partial.round > self.last_stored_round + 1 + self.store_lookahead
        {
            warn!(
                round = partial.round,
                last_stored = self.last_stored_round,
                from = %inbound.from,
                "partial outside store-lookahead window, dropped"
            );
            return None;
        }

        let digest = self
            .vault
            .digest_beacon(partial.round, &partial.previous_sig);
        if let Err(e) = self.vault.verify_partial(&digest, &partial) {
            warn!(
                round = partial.round,
                signer = partial.signer_index,
                from = %inbound.from,
                error = %e,
                "partial failed verification, dropped"
            );
            return None;
        }

        let (id, inserted) = self.cache.append(partial);
        if !inserted {
            return None;
        }
        self.try_recover(&id)
    }

    fn try_recover(&mut self, id: &RoundCacheId) -> Option<Beacon> {
        let threshold = self.vault.threshold();
        let round_cache = self.cache.get_mut(id)?;
        if round_cache.is_done() || round_cache.len() < threshold {
            return None;
        }

        let partials = round_cache.partials();
        let digest = self.vault.digest_beacon(id.round, &id.previous_sig);
        let signature = match self.vault.recover(&partials) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(round = id.round, error = %e, "recovery failed, round left open");
                return None;
            }
        };
        if let Err(e) = self.vault.verify_recovered(&digest, &signature) {
            // Threshold met but verification failed: spec.md §4.5 says the
            // `done` flag stays unset so a later, distinct set of T
            // partials can still be tried.
            warn!(round = id.round, error = %e, "recovered signature failed verification");
            return None;
        }

        if let Some(round_cache) = self.cache.get_mut(id) {
            round_cache.mark_done();
        }
        info!(round = id.round, "round reconstructed");
        Some(Beacon {
            round: id.round,
            previous_sig: id.previous_sig.clone(),
            signature,
        })
    }

    /// Notifies the aggregator that `round` was stored, flushing every
    /// round-cache at or below it and advancing the lookahead window
    /// (spec.md §4.5 input (b), §4.2 `flush_rounds`).
    pub fn notify_stored(&mut self, round: u64) {
        self.last_stored_round = self.last_stored_round.max(round);
        self.cache.flush_rounds(round);
    }

    /// Drops every round-cache at or below `round` without touching
    /// `last_stored_round` or the lookahead window (spec.md §4.8: the
    /// ticker flushes the prior round's cache on every tick whether or
    /// not that round was ever stored — distinct from [`Self::notify_stored`],
    /// which only fires on an actual append and also advances the
    /// lookahead boundary).
    pub fn flush_through(&mut self, round: u64) {
        self.cache.flush_rounds(round);
    }

    pub fn cache(&self) -> &PartialCache {
        &self.cache
    }

    /// Drives the aggregator as a long-lived task: consumes inbound
    /// partials and stored-beacon notifications from bounded channels,
    /// emitting reconstructed beacons to `beacon_tx` (spec.md §4.5
    /// concurrency: "partial intake and beacon-stored notifications
    /// arrive on bounded channels").
    pub async fn run(
        mut self,
        mut partial_rx: mpsc::Receiver<InboundPartial>,
        mut stored_rx: mpsc::Receiver<u64>,
        mut flush_rx: mpsc::Receiver<u64>,
        beacon_tx: mpsc::Sender<Beacon>,
        mut stopping: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = stopping.changed() => {
                    if *stopping.borrow() {
                        return;
                    }
                }
                Some(round) = stored_rx.recv() => {
                    self.notify_stored(round);
                }
                Some(round) = flush_rx.recv() => {
                    self.flush_through(round);
                }
                Some(inbound) = partial_rx.recv() => {
                    if let Some(beacon) = self.handle_partial(inbound) {
                        if beacon_tx.send(beacon).await.is_err() {
                            return;
                        }
                    }
                }
                else => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupInfo, NodeInfo, Scheme, Share};
    use blstrs::Scalar;
    use ff::Field;
    use rand::rngs::OsRng;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn toy_group(n: u32, t: usize) -> (GroupInfo, Vec<Share>) {
        let coeffs: Vec<Scalar> = (0..t).map(|_| Scalar::random(&mut OsRng)).collect();
        let eval = |x: u64| -> Scalar {
            let x = Scalar::from(x);
            let mut acc = Scalar::ZERO;
            let mut xp = Scalar::ONE;
            for c in &coeffs {
                acc += *c * xp;
                xp *= x;
            }
            acc
        };
        let shares: Vec<Share> = (1..=n).map(|i| Share::new(i, eval(u64::from(i)))).collect();
        let mut group_public_poly = vec![bls_signatures::PrivateKey::from_bytes(
            &coeffs[0].to_bytes_be(),
        )
        .unwrap()
        .public_key()
        .as_bytes()];
        group_public_poly.extend((1..=n).map(|i| {
            bls_signatures::PrivateKey::from_bytes(&eval(u64::from(i)).to_bytes_be())
                .unwrap()
                .public_key()
                .as_bytes()
        }));
        let nodes: Vec<NodeInfo> = (1..=n)
            .map(|i| NodeInfo { index: i, address: addr() })
            .collect();
        let group = GroupInfo {
            threshold: t,
            nodes,
            period: Duration::from_secs(2),
            genesis_time: 0,
            genesis_seed: vec![0u8; 32],
            scheme: Scheme::Unchained,
            group_public_poly,
        };
        (group, shares)
    }

    #[test]
    fn threshold_partials_reconstruct_a_verified_beacon() {
        let (group, shares) = toy_group(3, 2);
        let vaults: Vec<CryptoVault> = shares
            .into_iter()
            .map(|s| CryptoVault::new(s, group.clone()))
            .collect();

        // The aggregator's own share never signs here; only recovery and
        // verification run against the group's public material.
        let mut aggregator = Aggregator::new(vaults[0].clone());

        let mut last = None;
        for vault in vaults.iter().take(2) {
            let partial = vault.sign(1, b"");
            last = aggregator.handle_partial(InboundPartial {
                from: addr(),
                partial,
            });
        }
        let beacon = last.expect("threshold reached on second partial");
        assert_eq!(beacon.round, 1);
    }

    #[test]
    fn duplicate_partial_does_not_double_count() {
        let (group, shares) = toy_group(3, 2);
        let vault = CryptoVault::new(shares[0].clone(), group.clone());
        let mut aggregator = Aggregator::new(vault.clone());
        let partial = vault.sign(1, b"");
        assert!(aggregator
            .handle_partial(InboundPartial { from: addr(), partial: partial.clone() })
            .is_none());
        assert!(aggregator
            .handle_partial(InboundPartial { from: addr(), partial })
            .is_none());
    }

    #[test]
    fn partial_far_beyond_lookahead_is_dropped() {
        let (group, shares) = toy_group(3, 2);
        let vault = CryptoVault::new(shares[0].clone(), group.clone());
        let mut aggregator = Aggregator::new(vault.clone());
        aggregator.notify_stored(0);
        let partial = vault.sign(0 + 1 + STORE_LOOKAHEAD + 1, b"");
        assert!(aggregator
            .handle_partial(InboundPartial { from: addr(), partial })
            .is_none());
    }
}
