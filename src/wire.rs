//! On-chain and wire types (spec.md §3, §6).
//!
//! Field names are normative per spec.md §6. `round` is serialized
//! big-endian as an 8-byte key wherever it is used as a persistent-store
//! key (`store::round_key`); the in-memory/wire representation here is a
//! plain `u64` and lets `serde` pick the wire encoding (left to the
//! transport, which is out of scope, per spec.md §1).

use serde::{Deserialize, Serialize};

/// The on-chain record (spec.md §3). Never mutated once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub round: u64,
    /// Empty for round 0, the genesis seed for round 1, the signature of
    /// round `r-1` in chained mode otherwise; always empty in unchained
    /// mode.
    pub previous_sig: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Beacon {
    pub fn genesis(seed: Vec<u8>) -> Self {
        Beacon {
            round: 0,
            previous_sig: Vec::new(),
            signature: seed,
        }
    }
}

/// Wire-only partial signature (spec.md §3). Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBeacon {
    pub round: u64,
    pub previous_sig: Vec<u8>,
    pub signer_index: u32,
    pub partial_sig: Vec<u8>,
}

/// Metadata carried on every request, used for tracing/dedup by the
/// transport (spec.md §6 `metadata.beacon_id`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub beacon_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBeaconRequest {
    pub round: u64,
    pub previous_signature: Vec<u8>,
    /// The caller's own signer index, so the callee can verify and
    /// forward `partial_signature` as a full `PartialBeacon` (spec.md
    /// §4.8 "verifies the caller's embedded partial").
    pub signer_index: u32,
    pub partial_signature: Vec<u8>,
    pub metadata: RequestMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialBeaconResponse {
    pub partial_signature: Vec<u8>,
}

/// Sync-stream frame (spec.md §6 `BeaconPacket`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconPacket {
    pub round: u64,
    pub previous_signature: Vec<u8>,
    pub signature: Vec<u8>,
    pub metadata: RequestMetadata,
}

impl From<&Beacon> for BeaconPacket {
    fn from(b: &Beacon) -> Self {
        BeaconPacket {
            round: b.round,
            previous_signature: b.previous_sig.clone(),
            signature: b.signature.clone(),
            metadata: RequestMetadata::default(),
        }
    }
}

impl From<BeaconPacket> for Beacon {
    fn from(p: BeaconPacket) -> Self {
        Beacon {
            round: p.round,
            previous_sig: p.previous_signature,
            signature: p.signature,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_round: u64,
    pub metadata: RequestMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_packet_round_trips_through_beacon() {
        let b = Beacon {
            round: 7,
            previous_sig: vec![1, 2, 3],
            signature: vec![4, 5, 6],
        };
        let packet: BeaconPacket = (&b).into();
        let back: Beacon = packet.into();
        assert_eq!(b, back);
    }

    #[test]
    fn sync_request_carries_from_round_and_metadata() {
        let req = SyncRequest {
            from_round: 42,
            metadata: RequestMetadata {
                beacon_id: "default".into(),
            },
        };
        assert_eq!(req.from_round, 42);
        assert_eq!(req.metadata.beacon_id, "default");
    }
}
