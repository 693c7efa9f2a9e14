//! `Handler`: the core round-driving state machine and the entry point
//! for inbound requests (spec.md §4.8).
//!
//! Wires together [`crate::ticker::Ticker`], [`crate::aggregator::Aggregator`],
//! [`crate::chain_manager::ChainManager`], and
//! [`crate::sync_manager::SyncManager`] the way `blockchain/chain_sync/src/chain_muxer.rs`'s
//! `ChainSyncer` wires together its own bootstrap/follow stages — each
//! stage here is message-passing rather than a manual `Future::poll`
//! state machine, per spec.md §9.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aggregator::{Aggregator, InboundPartial, STORE_LOOKAHEAD};
use crate::chain_manager::{ChainManager, SyncRequest as ManagerSyncRequest};
use crate::config::Config;
use crate::crypto::CryptoVault;
use crate::error::BeaconError;
use crate::group::NodeInfo;
use crate::partial_cache::DEFAULT_MAX_PARTIALS_PER_NODE;
use crate::store::callbacks::Delivery;
use crate::store::{ChainStore, CallbackId};
use crate::sync_manager::{PeerClient, SyncManager};
use crate::ticker::{current_round, Clock, RoundInfo, Ticker};
use crate::transport::PartialClient;
use crate::wire::{Beacon, BeaconPacket, PartialBeacon, PartialBeaconRequest, PartialBeaconResponse, RequestMetadata};

/// Channel depth for the internal partial-intake and beacon-notification
/// pipes `Handler::run` wires between its owned `Aggregator` and
/// `ChainManager` (spec.md §5: bounded channels for back-pressured paths).
const INTERNAL_CHANNEL_DEPTH: usize = 128;

/// How much slack either side of the wall-clock round a request is still
/// accepted with (spec.md §4.8 "a configurable slack").
pub const DEFAULT_ROUND_SLACK: u64 = 1;

/// Cap on frames streamed by `SyncChain` in one response (spec.md §4.8,
/// "one week at 30s").
pub const MAX_SYNC_LENGTH: u64 = 20160;

struct RunningRound {
    round: u64,
    previous_sig: Vec<u8>,
}

pub struct Handler<S, C, P, Pc>
where
    S: ChainStore,
    C: Clock,
    P: PeerClient,
    Pc: PartialClient,
{
    vault: CryptoVault,
    store: Arc<S>,
    clock: Arc<C>,
    genesis_time: u64,
    period: Duration,
    round_slack: u64,
    /// Cap on frames streamed by `SyncChain` in one response (spec.md §6
    /// `max_sync_length`; defaults to [`MAX_SYNC_LENGTH`] unless built via
    /// [`Self::from_config`]).
    max_sync_length: u64,
    peers: Vec<NodeInfo>,
    partial_client: Arc<Pc>,
    sync_manager: Arc<SyncManager<S, P>>,
    /// This node's own partial for each round it has signed, so repeated
    /// `ProcessPartialBeacon` requests for the same round are answered
    /// byte-identically (spec.md §4.8 "a single node answers at most one
    /// distinct partial per round").
    own_partials: Mutex<HashMap<u64, PartialBeacon>>,
    current: Mutex<RunningRound>,
    stopping: watch::Sender<bool>,
    /// Owned per spec.md §3 ("Handler owns ... Aggregator, ChainManager
    /// ..."). Each is a single-task state machine that consumes itself in
    /// `run()`, so they are parked here as `Some` until `run()` takes them
    /// out to spawn — `Handler::run` must only be called once per node,
    /// matching the teacher's `ChainSyncer::start` contract.
    aggregator: Mutex<Option<Aggregator>>,
    chain_manager: Mutex<Option<ChainManager<S>>>,
    gossip_tx: mpsc::Sender<Beacon>,
    gossip_rx: Mutex<Option<mpsc::Receiver<Beacon>>>,
    /// Feeds both this node's own signed partials and verified partials
    /// from `ProcessPartialBeacon` callers into the owned `Aggregator`
    /// (spec.md §2 data flow, §4.8).
    partial_tx: mpsc::Sender<InboundPartial>,
    partial_rx: Mutex<Option<mpsc::Receiver<InboundPartial>>>,
}

impl<S, C, P, Pc> Handler<S, C, P, Pc>
where
    S: ChainStore + 'static,
    C: Clock,
    P: PeerClient,
    Pc: PartialClient + 'static,
{
    pub fn new(
        vault: CryptoVault,
        store: Arc<S>,
        clock: Arc<C>,
        genesis_time: u64,
        period: Duration,
        peers: Vec<NodeInfo>,
        partial_client: Arc<Pc>,
        sync_manager: Arc<SyncManager<S, P>>,
    ) -> Self {
        Self::with_policy(
            vault,
            store,
            clock,
            genesis_time,
            period,
            peers,
            partial_client,
            sync_manager,
            DEFAULT_MAX_PARTIALS_PER_NODE,
            STORE_LOOKAHEAD,
            MAX_SYNC_LENGTH,
        )
    }

    /// Builds a `Handler` from a [`Config`] (spec.md §6), wiring its three
    /// policy fields — `max_partials_per_node`, `store_lookahead`,
    /// `max_sync_length` — into the owned `Aggregator` and `sync_chain`'s
    /// batch cap, rather than leaving them as deserialized-but-unused
    /// fields (spec.md §9 open question, resolved in DESIGN.md).
    pub fn from_config(
        config: &Config,
        store: Arc<S>,
        clock: Arc<C>,
        partial_client: Arc<Pc>,
        sync_manager: Arc<SyncManager<S, P>>,
    ) -> Result<Self, BeaconError> {
        let share = config
            .share
            .to_share()
            .ok_or_else(|| BeaconError::from("share secret is not a valid scalar"))?;
        let vault = CryptoVault::new(share, config.group.clone());
        Ok(Self::with_policy(
            vault,
            store,
            clock,
            config.genesis_time(),
            config.period(),
            config.group.nodes.clone(),
            partial_client,
            sync_manager,
            config.max_partials_per_node,
            config.store_lookahead,
            config.max_sync_length,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn with_policy(
        vault: CryptoVault,
        store: Arc<S>,
        clock: Arc<C>,
        genesis_time: u64,
        period: Duration,
        peers: Vec<NodeInfo>,
        partial_client: Arc<Pc>,
        sync_manager: Arc<SyncManager<S, P>>,
        max_partials_per_node: usize,
        store_lookahead: u64,
        max_sync_length: u64,
    ) -> Self {
        let (stopping, _) = watch::channel(false);
        let aggregator = Aggregator::with_quota(vault.clone(), max_partials_per_node, store_lookahead);
        let chain_manager = ChainManager::new(store.clone(), vault.clone());
        let (gossip_tx, gossip_rx) = mpsc::channel(INTERNAL_CHANNEL_DEPTH);
        let (partial_tx, partial_rx) = mpsc::channel(INTERNAL_CHANNEL_DEPTH);
        Self {
            vault,
            store,
            clock,
            genesis_time,
            period,
            round_slack: DEFAULT_ROUND_SLACK,
            max_sync_length,
            peers,
            partial_client,
            sync_manager,
            own_partials: Mutex::new(HashMap::new()),
            current: Mutex::new(RunningRound {
                round: 0,
                previous_sig: Vec::new(),
            }),
            stopping,
            aggregator: Mutex::new(Some(aggregator)),
            chain_manager: Mutex::new(Some(chain_manager)),
            gossip_tx,
            gossip_rx: Mutex::new(Some(gossip_rx)),
            partial_tx,
            partial_rx: Mutex::new(Some(partial_rx)),
        }
    }

    /// The sender side of the gossip inlet `ChainManager::apply_gossip`
    /// reads from (spec.md §4.6 "fast follow"): the transport (out of
    /// scope per spec.md §1) clones this to feed in unverified peer
    /// beacons as they arrive.
    pub fn gossip_sender(&self) -> mpsc::Sender<Beacon> {
        self.gossip_tx.clone()
    }

    fn wall_clock_round(&self) -> u64 {
        current_round(self.clock.now(), self.genesis_time, self.period)
    }

    /// Start(): called when current time <= genesis_time; sleeps until
    /// genesis and begins at round 1 (spec.md §4.8).
    pub async fn start(&self) {
        let now = self.clock.now();
        if now < self.genesis_time {
            tokio::time::sleep(Duration::from_secs(self.genesis_time - now)).await;
        }
        let mut current = self.current.lock();
        current.round = 1;
        current.previous_sig = self.store.last().map(|b| b.signature).unwrap_or_default();
    }

    /// Catchup(): invoked when the network is already running. Runs
    /// `SyncManager` until the local tip is just before the next
    /// wall-clock round, then hands off to the normal run loop (spec.md
    /// §4.8).
    pub async fn catchup(&self) {
        loop {
            let last_round = self.store.last().map(|b| b.round).unwrap_or(0);
            let wall = self.wall_clock_round();
            if last_round + 1 >= wall {
                break;
            }
            if self.sync_manager.sync(wall.saturating_sub(1)).await.is_err() {
                warn!("catchup sync attempt failed against all peers");
                break;
            }
        }
        let mut current = self.current.lock();
        current.round = self.wall_clock_round();
        current.previous_sig = self.store.last().map(|b| b.signature).unwrap_or_default();
    }

    /// runRound(r, prev_round, prev_sig) (spec.md §4.8): signs this
    /// node's own partial, fans `PartialBeaconRequest` out to every peer —
    /// embedding that same partial so the peer can verify and absorb it
    /// too — with a per-call timeout of one period, and feeds verified
    /// responses into the owned `Aggregator` via `self.partial_tx`.
    pub async fn run_round(&self, round: u64, previous_sig: Vec<u8>) {
        let own = self.sign_own_partial(round, &previous_sig);
        let _ = self
            .partial_tx
            .send(InboundPartial {
                from: self_address(&self.peers, self.vault.index()),
                partial: own.clone(),
            })
            .await;

        let request = PartialBeaconRequest {
            round,
            previous_signature: previous_sig.clone(),
            signer_index: own.signer_index,
            partial_signature: own.partial_sig,
            metadata: RequestMetadata::default(),
        };

        let mut handles = Vec::new();
        for peer in self.peers.iter().filter(|n| n.index != self.vault.index()) {
            let client = self.partial_client.clone();
            let addr = peer.address;
            let req = request.clone();
            let period = self.period;
            handles.push(tokio::spawn(async move {
                match timeout(period, client.request_partial(addr, req)).await {
                    Ok(Ok(response)) => Some((addr, response)),
                    Ok(Err(e)) => {
                        warn!(%addr, error = %e, "peer partial request failed");
                        None
                    }
                    Err(_) => {
                        warn!(%addr, "peer partial request timed out");
                        None
                    }
                }
            }));
        }

        for handle in handles {
            if let Ok(Some((addr, response))) = handle.await {
                let partial = PartialBeacon {
                    round,
                    previous_sig: previous_sig.clone(),
                    signer_index: self
                        .peers
                        .iter()
                        .find(|n| n.address == addr)
                        .map(|n| n.index)
                        .unwrap_or(u32::MAX),
                    partial_sig: response.partial_signature,
                };
                let _ = self
                    .partial_tx
                    .send(InboundPartial { from: addr, partial })
                    .await;
            }
        }
    }

    fn sign_own_partial(&self, round: u64, previous_sig: &[u8]) -> PartialBeacon {
        let mut cache = self.own_partials.lock();
        cache
            .entry(round)
            .or_insert_with(|| self.vault.sign(round, previous_sig))
            .clone()
    }

    /// ProcessPartialBeacon(req) (spec.md §4.8): verifies the caller's
    /// embedded partial and, if valid, forwards it to the owned
    /// `Aggregator` (spec.md §2 data flow: Handler -> Aggregator) before
    /// answering with this node's own partial for the round.
    pub fn process_partial_beacon(
        &self,
        req: &PartialBeaconRequest,
        from: SocketAddr,
    ) -> Result<PartialBeaconResponse, BeaconError> {
        let wall = self.wall_clock_round();
        if req.round + self.round_slack < wall || req.round > wall + self.round_slack {
            return Err(BeaconError::InvalidRound {
                requested: req.round,
                current: wall,
            });
        }

        let expected_prev = self.expected_previous_signature(req.round)?;
        if self.vault.scheme().requires_previous() && req.previous_signature != expected_prev {
            return Err(BeaconError::InvalidChain { round: req.round });
        }

        let digest = self.vault.digest_beacon(req.round, &req.previous_signature);
        let caller_partial = PartialBeacon {
            round: req.round,
            previous_sig: req.previous_signature.clone(),
            signer_index: req.signer_index,
            partial_sig: req.partial_signature.clone(),
        };
        self.vault
            .verify_partial(&digest, &caller_partial)
            .map_err(|e| BeaconError::InvalidPartial {
                index: req.signer_index,
                reason: e.to_string(),
            })?;
        let _ = self.partial_tx.try_send(InboundPartial {
            from,
            partial: caller_partial,
        });

        let response_partial = self.sign_own_partial(req.round, &req.previous_signature);
        Ok(PartialBeaconResponse {
            partial_signature: response_partial.partial_sig,
        })
    }

    fn expected_previous_signature(&self, round: u64) -> Result<Vec<u8>, BeaconError> {
        if round == 1 {
            return Ok(self.vault.group().genesis_seed.clone());
        }
        let last = self
            .store
            .last()
            .map_err(|_| BeaconError::NoBeaconStored(round - 1))?;
        if last.round != round - 1 {
            return Err(BeaconError::InvalidChain { round });
        }
        Ok(last.signature)
    }

    /// SyncChain(req) (spec.md §4.8): returns the bounded initial batch
    /// from the store cursor. Live continuation after the batch is
    /// registered as a callback under `requester`, replacing any previous
    /// registration for the same address (spec.md §4.1, §4.8).
    pub fn sync_chain(
        &self,
        req: &crate::wire::SyncRequest,
        requester: SocketAddr,
    ) -> (Vec<BeaconPacket>, mpsc::Receiver<BeaconPacket>) {
        let batch: Vec<BeaconPacket> = self
            .store
            .cursor(req.from_round)
            .take(self.max_sync_length as usize)
            .map(|b| (&b).into())
            .collect();

        let (tx, rx) = mpsc::channel(64);
        let callback_id: CallbackId = requester.to_string();
        self.store.callbacks().register(
            callback_id,
            Arc::new(move |delivery: Delivery| {
                if delivery.closed {
                    return;
                }
                let packet: BeaconPacket = (&delivery.beacon).into();
                let _ = tx.try_send(packet);
            }),
        );

        (batch, rx)
    }

    /// Stop(): stops the ticker, cancels the run loop, idempotent
    /// (spec.md §4.8).
    pub fn stop(&self) {
        let _ = self.stopping.send(true);
    }

    /// StopAt(t): sleeps until `at` (unix seconds) then stops.
    pub async fn stop_at(&self, at: u64) {
        let now = self.clock.now();
        if at > now {
            tokio::time::sleep(Duration::from_secs(at - now)).await;
        }
        self.stop();
    }

    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    /// The long-lived run loop: spawns this node's owned `Ticker`,
    /// `Aggregator`, and `ChainManager` as their own tasks (spec.md §3
    /// ownership, §9 "single-writer tasks ... with message passing"),
    /// wires them together with bounded channels, and reacts to ticks and
    /// to the owned `ChainManager` completing the expected round (spec.md
    /// §4.8). Beacons the `ChainManager` appends — whether reconstructed
    /// locally or caught up via sync/gossip — are forwarded to
    /// `notify_tx` so an external listener can distinguish catchup from
    /// live beacons (spec.md §4.6). Must only be called once per node.
    pub async fn run(self: Arc<Self>, ticker: Ticker<C>, notify_tx: mpsc::Sender<Beacon>)
    where
        P: 'static,
    {
        let aggregator = self
            .aggregator
            .lock()
            .take()
            .expect("Handler::run called more than once");
        let chain_manager = self
            .chain_manager
            .lock()
            .take()
            .expect("Handler::run called more than once");
        let gossip_rx = self
            .gossip_rx
            .lock()
            .take()
            .expect("Handler::run called more than once");
        let partial_rx = self
            .partial_rx
            .lock()
            .take()
            .expect("Handler::run called more than once");

        let (stored_tx, stored_rx) = mpsc::channel::<u64>(INTERNAL_CHANNEL_DEPTH);
        let (flush_tx, flush_rx) = mpsc::channel::<u64>(INTERNAL_CHANNEL_DEPTH);
        let (beacon_tx, reconstructed_rx) = mpsc::channel::<Beacon>(INTERNAL_CHANNEL_DEPTH);
        let (sync_done_tx, sync_done_rx) = mpsc::channel::<()>(8);
        let (sync_request_tx, sync_request_rx) = mpsc::channel::<ManagerSyncRequest>(8);
        let (completed_tx, mut completed_rx) = mpsc::channel::<u64>(INTERNAL_CHANNEL_DEPTH);

        let mut ticks = ticker.subscribe();
        tokio::spawn(ticker.run(self.stopping()));
        let mut stopping = self.stopping();
        tokio::spawn(
            self.sync_manager
                .clone()
                .run(self.clock.clone(), self.period, self.stopping()),
        );
        tokio::spawn(aggregator.run(partial_rx, stored_rx, flush_rx, beacon_tx, self.stopping()));

        // `ChainManager::run`'s own `notify_tx` only knows about external
        // listeners (spec.md §4.6); this node's own round-advance (the
        // `completed_rx` branch below) also needs every appended beacon,
        // so the two are teed off one internal channel here rather than
        // giving `ChainManager` two near-identical parameters.
        let (tee_tx, mut tee_rx) = mpsc::channel::<Beacon>(INTERNAL_CHANNEL_DEPTH);
        tokio::spawn(async move {
            while let Some(beacon) = tee_rx.recv().await {
                let _ = completed_tx.send(beacon.round).await;
                let _ = notify_tx.send(beacon).await;
            }
        });

        tokio::spawn(chain_manager.run(
            reconstructed_rx,
            gossip_rx,
            sync_done_rx,
            stored_tx,
            tee_tx,
            sync_request_tx,
            self.stopping(),
        ));
        tokio::spawn(drive_sync_requests(
            self.sync_manager.clone(),
            sync_request_rx,
            sync_done_tx,
        ));

        // `start()`/`catchup()` already set `current` to the round this
        // node should be running (spec.md §4.8 "Start() ... begins running
        // round r=1"); the `Ticker` only fires on *future* boundaries, so
        // that first round's own `runRound` is kicked off here rather than
        // waiting for a tick that will never name it.
        {
            let (round, prev_sig) = {
                let current = self.current.lock();
                (current.round, current.previous_sig.clone())
            };
            if round > 0 {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_round(round, prev_sig).await;
                });
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = stopping.changed() => {
                    if *stopping.borrow() {
                        info!("handler run loop stopping");
                        return;
                    }
                }
                Ok(()) = ticks.changed() => {
                    let RoundInfo { round, .. } = *ticks.borrow_and_update();
                    let prev_sig = self.current.lock().previous_sig.clone();
                    {
                        let mut current = self.current.lock();
                        current.round = round;
                    }
                    // Flush the prior round's PartialCache on every tick
                    // (spec.md §4.8), independent of whether that round
                    // ever reached threshold — `ChainManager`'s `stored_tx`
                    // only fires on an actual append, which would
                    // otherwise leave a never-completed round's cache
                    // entries around forever.
                    let _ = flush_tx.try_send(round.saturating_sub(1));
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.run_round(round, prev_sig).await;
                    });
                }
                Some(completed_round) = completed_rx.recv() => {
                    let mut current = self.current.lock();
                    if completed_round == current.round {
                        if let Ok(beacon) = self.store.get(completed_round) {
                            current.previous_sig = beacon.signature;
                        }
                    }
                }
                else => return,
            }
        }
    }
}

fn self_address(peers: &[NodeInfo], own_index: u32) -> SocketAddr {
    peers
        .iter()
        .find(|n| n.index == own_index)
        .map(|n| n.address)
        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap())
}

/// Bridges `ChainManager`'s sync-request channel to `SyncManager::sync`
/// (spec.md §4.6 emits the request, §4.7 executes it). `Handler::run`
/// spawns this itself; exported separately so a caller driving these
/// components by hand (as the integration tests do) can wire the same
/// bridge without going through the full node loop.
pub async fn drive_sync_requests<S: ChainStore + 'static, P: PeerClient>(
    sync_manager: Arc<SyncManager<S, P>>,
    mut requests: mpsc::Receiver<ManagerSyncRequest>,
    completed: mpsc::Sender<()>,
) {
    while let Some(req) = requests.recv().await {
        let _ = sync_manager.sync(req.up_to_round).await;
        let _ = completed.send(()).await;
    }
}
