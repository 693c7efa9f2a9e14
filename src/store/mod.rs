//! `ChainStore`: durable append-only beacon log keyed by round (spec.md §4.1).
//!
//! Two implementations share the trait: [`memory::MemoryStore`] for tests
//! and single-process simulation (grounded in `node/db/src/memory.rs`'s
//! `Arc<RwLock<HashMap<..>>>` pattern) and [`parity_store::ParityStore`] for
//! a real embedded persistent bucket (grounded in `node/db/src/parity_db.rs`'s
//! `Arc<parity_db::Db>` wrapper around a single named column).

pub mod callbacks;
pub mod memory;
pub mod parity_store;

use thiserror::Error;

use crate::wire::Beacon;

pub use callbacks::{CallbackId, CallbackRegistry};

/// The name of the persisted key-value bucket (spec.md §6).
pub const BUCKET: &str = "beacons";

#[derive(Debug, Error)]
pub enum Error {
    #[error("round {round} already stored with different bytes")]
    Conflict { round: u64 },
    #[error("round {round} is not appendable to the current chain")]
    InvalidRound { round: u64 },
    #[error("no beacon stored for round {0}")]
    NotFound(u64),
    #[error("store is empty")]
    NoneStored,
    #[error(transparent)]
    Backend(#[from] parity_db::Error),
    #[error("{0}")]
    Other(String),
}

/// Result of a `put`: either success, or the benign idempotent-duplicate
/// race spec.md §4.1/§7 calls out as a non-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Appended,
    AlreadyStored,
}

/// big-endian u64 round, the persisted key format (spec.md §6).
pub fn round_key(round: u64) -> [u8; 8] {
    round.to_be_bytes()
}

pub fn key_to_round(key: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// A lazy, restartable, finite ascending iterator over stored beacons
/// starting at a given round (spec.md §4.1 `cursor`).
pub trait Cursor: Iterator<Item = Beacon> + Send {}
impl<T: Iterator<Item = Beacon> + Send> Cursor for T {}

/// Append-only, single-writer persistent beacon log.
///
/// Implementors must uphold the invariants in spec.md §4.1: `put` only
/// succeeds if `round == last.round + 1` (and, in chained mode, linkage
/// holds); duplicate `put` of identical bytes is idempotent; duplicate
/// `put` of different bytes is a hard error; `del` exists only for the
/// resync repair path.
pub trait ChainStore: Send + Sync {
    /// Appends `beacon` if it is the immediate successor of `last()`.
    /// Chain-linkage (`previous_sig == last.signature`) is checked by the
    /// caller ([`crate::chain_manager::ChainManager`]) before calling this —
    /// the store itself only enforces strict round monotonicity and
    /// byte-identical idempotence, matching spec.md §4.1's separation
    /// between "appendable" (ChainManager's call) and "append" (the store's).
    fn put(&self, beacon: Beacon) -> Result<PutOutcome, Error>;

    fn last(&self) -> Result<Beacon, Error>;

    fn get(&self, round: u64) -> Result<Beacon, Error>;

    fn cursor(&self, round: u64) -> Box<dyn Cursor>;

    fn len(&self) -> Result<u64, Error>;

    fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Used only by the resync repair path (spec.md §4.1); not part of
    /// normal flow.
    fn del(&self, round: u64) -> Result<(), Error>;

    /// Inserts a beacon directly, bypassing the append-linkage check, for
    /// operator-driven resync repair (spec.md §4.7 `ReSync`). Does not fire
    /// callbacks.
    fn insecure_put(&self, beacon: Beacon) -> Result<(), Error>;

    fn callbacks(&self) -> &CallbackRegistry;
}
