//! Error taxonomy for the beacon engine (spec.md §7).
//!
//! Each subsystem owns a narrow `Error` enum; `BeaconError` unifies them for
//! callers that cross module boundaries (the handler, mainly), the way
//! `chain_sync::Error` wraps `db::Error`/`chain::Error` in the teacher crate.

use thiserror::Error;

use crate::crypto;
use crate::store;
use crate::sync_manager;

/// Top-level error returned from the handler's public API.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error(transparent)]
    Store(#[from] store::Error),

    #[error(transparent)]
    Crypto(#[from] crypto::Error),

    #[error(transparent)]
    Sync(#[from] sync_manager::Error),

    /// Round is not within the allowed window of the current wall-clock round.
    #[error("round {requested} out of window around current round {current}")]
    InvalidRound { requested: u64, current: u64 },

    /// Embedded signer index unknown, or the partial failed verification.
    #[error("invalid partial from signer {index}: {reason}")]
    InvalidPartial { index: u32, reason: String },

    /// `put` failed the chain-linkage check.
    #[error("invalid chain linkage at round {round}")]
    InvalidChain { round: u64 },

    /// Read against an empty or unknown round.
    #[error("no beacon stored for round {0}")]
    NoBeaconStored(u64),

    /// Recovery attempted below threshold; not an error to the caller, just
    /// a skipped round.
    #[error("insufficient partials for round {round}: have {have}, need {need}")]
    InsufficientPartials { round: u64, have: usize, need: usize },

    /// Threshold was met but the reconstructed signature failed verification.
    #[error("recovered signature for round {0} failed verification")]
    RecoveryInvalid(u64),

    /// No peer yielded progress during a sync attempt.
    #[error("sync failed against all peers")]
    SyncFailedAll,

    /// Operation attempted after `Stop()`.
    #[error("store is closed")]
    StoreClosed,

    #[error("{0}")]
    Other(String),
}

impl From<&str> for BeaconError {
    fn from(e: &str) -> Self {
        BeaconError::Other(e.to_owned())
    }
}

impl From<String> for BeaconError {
    fn from(e: String) -> Self {
        BeaconError::Other(e)
    }
}
