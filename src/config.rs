//! `Config`: the engine's externally-supplied inputs (spec.md §6).
//!
//! CLI surface, environment variables, flag parsing, and config-file
//! loading are out of scope (spec.md §1, §6) — this struct is just the
//! plain `serde`-deserializable shape a daemon wires up from whatever
//! format it chooses, the way `node/db/src/parity_db.rs`'s
//! `ParityDbConfig` is a bare struct with no opinion on where its values
//! came from.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::STORE_LOOKAHEAD;
use crate::group::{GroupInfo, Scheme, Share};
use crate::partial_cache::DEFAULT_MAX_PARTIALS_PER_NODE;

/// This node's key pair: identity (network/libp2p-style address binding)
/// and the signing share used by the `CryptoVault` (spec.md §6
/// `private`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateIdentity {
    pub address: SocketAddr,
    #[serde(with = "hex::serde")]
    pub signing_key_seed: Vec<u8>,
}

/// spec.md §6 `share`: this node's threshold share and index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareConfig {
    pub index: u32,
    #[serde(with = "hex::serde")]
    pub secret_be: Vec<u8>,
}

impl ShareConfig {
    pub fn to_share(&self) -> Option<Share> {
        let arr: [u8; 32] = self.secret_be.clone().try_into().ok()?;
        let scalar = blstrs::Scalar::from_bytes_be(&arr);
        if scalar.is_some().into() {
            Some(Share::new(self.index, scalar.unwrap()))
        } else {
            None
        }
    }
}

/// spec.md §6: the recognized top-level options the core engine consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub private: PrivateIdentity,
    pub share: ShareConfig,
    pub group: GroupInfo,
    pub scheme: Scheme,
    /// Directory for the persistent `ParityStore` bucket (spec.md §6
    /// mentions the KV store only as an external, typed interface; this
    /// is the one path the core still needs to open it).
    pub store_path: std::path::PathBuf,
    #[serde(default = "default_max_partials_per_node")]
    pub max_partials_per_node: usize,
    #[serde(default = "default_store_lookahead")]
    pub store_lookahead: u64,
    #[serde(default = "default_max_sync_length")]
    pub max_sync_length: u64,
}

fn default_max_partials_per_node() -> usize {
    DEFAULT_MAX_PARTIALS_PER_NODE
}

fn default_store_lookahead() -> u64 {
    STORE_LOOKAHEAD
}

fn default_max_sync_length() -> u64 {
    crate::handler::MAX_SYNC_LENGTH
}

impl Config {
    pub fn period(&self) -> Duration {
        self.group.period
    }

    pub fn genesis_time(&self) -> u64 {
        self.group.genesis_time
    }
}
