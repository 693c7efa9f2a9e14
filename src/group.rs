//! The cryptographic and membership context for one beacon epoch
//! (spec.md §3, `GroupInfo` / `Share`).
//!
//! `GroupInfo` is produced externally by a DKG (out of scope here, per
//! spec.md §1) and is immutable for the life of the epoch; this module only
//! models its shape and the small amount of arithmetic (minimum threshold,
//! digest scheme selection) that depends purely on its fields.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One node's public identity within the group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Signer index used to tag partial signatures (spec.md §3, `RoundCache`).
    pub index: u32,
    pub address: SocketAddr,
}

/// Digest/linkage variant (spec.md §9 "Scheme polymorphism").
///
/// Modeled as a variant with one small method set rather than spreading
/// `if scheme == ...` conditionals through the round loop, per the
/// REDESIGN FLAG in spec.md §9.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    /// digest = H(previous_sig || round_be), chain is tamper-evident.
    Chained,
    /// digest = H(round_be), beacons independently verifiable but unlinked.
    Unchained,
    /// digest = H(round_be), signed in G1 instead of G2 (spec.md §4.4): the
    /// partial and recovered signatures are 48-byte compressed points
    /// rather than 96-byte ones, at the cost of public keys moving to G2.
    /// Unlinked like `Unchained` — only the curve partials/signatures live
    /// in differs.
    ShortSig,
}

impl Scheme {
    /// Whether `previous_sig` is a meaningful input to the round's digest.
    pub fn requires_previous(self) -> bool {
        matches!(self, Scheme::Chained)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::Chained => "chained",
            Scheme::Unchained => "unchained",
            Scheme::ShortSig => "short-sig",
        };
        write!(f, "{s}")
    }
}

/// The immutable cryptographic/membership context for one epoch
/// (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupInfo {
    /// T, the number of partials required to reconstruct a signature.
    pub threshold: usize,
    /// All N nodes in the group, including self.
    pub nodes: Vec<NodeInfo>,
    #[serde(with = "duration_secs")]
    pub period: Duration,
    /// Unix seconds at which round 1 begins.
    pub genesis_time: u64,
    /// Stored verbatim as the round-0 beacon's signature.
    #[serde(with = "hex::serde")]
    pub genesis_seed: Vec<u8>,
    pub scheme: Scheme,
    /// Degree T-1 public commitment polynomial, used to verify an
    /// individual signer's partial: one compressed G1 point per coefficient
    /// for `Chained`/`Unchained`, or one compressed G2 point per
    /// coefficient for `ShortSig` (the scheme's signatures live in G1, so
    /// its public keys live in G2 instead).
    #[serde(with = "hex_vec")]
    pub group_public_poly: Vec<Vec<u8>>,
}

impl GroupInfo {
    /// N, the group size.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// The degree-0 coefficient of the commitment polynomial: the group
    /// public key, used to verify a fully reconstructed signature.
    pub fn group_public_commit(&self) -> &[u8] {
        self.group_public_poly
            .first()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn node(&self, index: u32) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.index == index)
    }

    /// Lowest threshold a well-formed group of this size may declare: a
    /// strict majority, matching the DKG's own minimum (spec.md leaves the
    /// exact DKG policy external; this is just a sanity floor at load time).
    pub fn minimum_threshold(n: usize) -> usize {
        (n / 2) + 1
    }
}

/// This node's private share: its polynomial evaluation and index
/// (spec.md §3, `Share`). Never logged — no `Debug`/`Display` on the secret
/// field.
#[derive(Clone)]
pub struct Share {
    pub index: u32,
    secret: blstrs::Scalar,
}

impl Share {
    pub fn new(index: u32, secret: blstrs::Scalar) -> Self {
        Self { index, secret }
    }

    pub(crate) fn secret(&self) -> &blstrs::Scalar {
        &self.secret
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = v.iter().map(hex::encode).collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_threshold_matches_strict_majority() {
        assert_eq!(GroupInfo::minimum_threshold(3), 2);
        assert_eq!(GroupInfo::minimum_threshold(4), 3);
        assert_eq!(GroupInfo::minimum_threshold(7), 4);
    }

    #[test]
    fn scheme_requires_previous_only_when_chained() {
        assert!(Scheme::Chained.requires_previous());
        assert!(!Scheme::Unchained.requires_previous());
        assert!(!Scheme::ShortSig.requires_previous());
    }
}
