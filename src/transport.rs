//! Transport interfaces only (spec.md §1: "the transport that carries
//! requests between nodes" is explicitly out of scope). These traits are
//! the seam the [`crate::handler::Handler`] and
//! [`crate::sync_manager::SyncManager`] are written against; a concrete
//! wire implementation lives outside this crate.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::wire::{PartialBeaconRequest, PartialBeaconResponse};

/// Outbound partial-request fan-out, implemented by the daemon's network
/// layer (grounded in the shape of `blockchain/chain_sync/src/peer_manager.rs`'s
/// peer-facing calls, generalized from tipsets to partial requests).
#[async_trait]
pub trait PartialClient: Send + Sync {
    async fn request_partial(
        &self,
        peer: SocketAddr,
        request: PartialBeaconRequest,
    ) -> Result<PartialBeaconResponse, String>;
}

pub use crate::sync_manager::PeerClient;
