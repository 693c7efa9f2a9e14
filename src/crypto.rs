//! `CryptoVault`: threshold BLS signing, verification, and reconstruction
//! (spec.md §4.4).
//!
//! Follows the split the teacher crate uses for drand verification in
//! `blockchain/beacon/src/drand.rs`: `sha2` to build the digest, a
//! `bls_signatures` round-trip for the pairing check. `bls_signatures` is
//! also the one to hash the digest onto the curve, for both the per-share
//! signing (`PrivateKey::sign`) and the pairing check
//! (`verify_messages`) — a hand-rolled `hash_to_curve` call here would
//! use a different domain-separation tag than the one `verify_messages`
//! hashes with internally, and the two would never agree. The part
//! `drand.rs` never needed — actually reconstructing a signature from T
//! partials — is done with `blstrs` scalar/point arithmetic directly on
//! the already-hashed points, since `bls_signatures` only exposes plain
//! aggregation (sum of all shares), not the Lagrange-weighted combination
//! a threshold scheme requires.
//!
//! `Chained`/`Unchained` use the minimal-pubkey-size convention
//! `bls_signatures` implements: public keys are G1 (48 bytes), signatures
//! and partials are G2 (96 bytes). `ShortSig` (spec.md §4.4, "a shorter
//! curve output") flips that: partials and the recovered signature are
//! 48-byte G1 points, public keys move to G2. `bls_signatures` only
//! verifies the first convention, so the G1 path hashes onto the curve
//! and checks the pairing equation directly via `blstrs`/`pairing`, the
//! same `G1_DOMAIN`-tagged hash real drand's short-signature scheme uses.

use bls_signatures::{PrivateKey, Serialize as BlsSerialize};
use blstrs::{Bls12, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use byteorder::{BigEndian, WriteBytesExt};
use ff::Field;
use group::{Curve, Group as _};
use pairing::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::group::{GroupInfo, Scheme, Share};
use crate::wire::PartialBeacon;

/// Domain-separation tag for hashing a round digest onto G1 in the
/// `ShortSig` scheme (the minimal-signature-size BLS convention's
/// standard hash-to-curve suite).
const SHORT_SIG_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed point or scalar: {0}")]
    Malformed(String),
    #[error("signer index {0} not present in group")]
    UnknownSigner(u32),
    #[error("partial signature failed verification")]
    InvalidPartial,
    #[error("reconstructed signature failed verification")]
    InvalidRecovered,
    #[error("insufficient partials: have {have}, need {need}")]
    Insufficient { have: usize, need: usize },
}

/// Wraps the group's cryptographic material and this node's share.
#[derive(Clone)]
pub struct CryptoVault {
    share: Share,
    group: GroupInfo,
}

impl CryptoVault {
    pub fn new(share: Share, group: GroupInfo) -> Self {
        Self { share, group }
    }

    pub fn index(&self) -> u32 {
        self.share.index
    }

    pub fn scheme(&self) -> Scheme {
        self.group.scheme
    }

    /// T, the number of partials required to reconstruct a signature.
    pub fn threshold(&self) -> usize {
        self.group.threshold
    }

    pub fn group(&self) -> &GroupInfo {
        &self.group
    }

    /// digest_beacon(round, previous_sig) — the message each partial signs
    /// (spec.md §4.4). Scheme-dependent per spec.md §9's "one method set per
    /// variant" design.
    pub fn digest_beacon(&self, round: u64, previous_sig: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(previous_sig.len() + 8);
        if self.group.scheme.requires_previous() {
            msg.extend_from_slice(previous_sig);
        }
        msg.write_u64::<BigEndian>(round)
            .expect("writing to a Vec never fails");
        Sha256::digest(&msg).to_vec()
    }

    /// sign(msg) using this node's share, returning partial bytes with an
    /// embedded signer index. `Chained`/`Unchained` delegate the
    /// hash-to-curve step to `bls_signatures::PrivateKey::sign` so the
    /// digest is hashed with the exact group and DST `verify_messages`
    /// expects on the other end; `ShortSig` hashes onto G1 itself and signs
    /// by scalar multiplication, since `bls_signatures` has no G1-signature
    /// path to delegate to.
    pub fn sign(&self, round: u64, previous_sig: &[u8]) -> PartialBeacon {
        let digest = self.digest_beacon(round, previous_sig);
        let partial_sig = match self.group.scheme {
            Scheme::ShortSig => {
                let point = hash_to_g1(&digest);
                (point * *self.share.secret())
                    .to_affine()
                    .to_compressed()
                    .to_vec()
            }
            Scheme::Chained | Scheme::Unchained => {
                let sk = PrivateKey::from_bytes(&self.share.secret().to_bytes_be())
                    .expect("a valid Scalar is always a valid BLS private key");
                sk.sign(&digest).as_bytes()
            }
        };
        PartialBeacon {
            round,
            previous_sig: previous_sig.to_vec(),
            signer_index: self.share.index,
            partial_sig,
        }
    }

    pub fn index_of(&self, partial: &PartialBeacon) -> u32 {
        partial.signer_index
    }

    /// verify_partial(group_pub_poly, msg, partial).
    ///
    /// `group_public_poly` is addressed by signer index directly (index 0
    /// is the degree-0 group commit, index `i` is signer `i`'s own
    /// commitment) rather than by the signer's position in `nodes`, since
    /// the two only coincide when node indices happen to be a dense
    /// `1..=n` run in list order.
    pub fn verify_partial(&self, digest: &[u8], partial: &PartialBeacon) -> Result<(), Error> {
        self.group
            .node(partial.signer_index)
            .ok_or(Error::UnknownSigner(partial.signer_index))?;
        let coeff = self
            .group
            .group_public_poly
            .get(partial.signer_index as usize)
            .ok_or(Error::UnknownSigner(partial.signer_index))?;
        match self.group.scheme {
            Scheme::ShortSig => {
                let pubkey = decode_g2(coeff)?;
                let sig = decode_g1(&partial.partial_sig)?;
                let point = hash_to_g1(digest);
                if pairing_eq(sig.to_affine(), g2_generator(), point.to_affine(), pubkey.to_affine())
                {
                    Ok(())
                } else {
                    Err(Error::InvalidPartial)
                }
            }
            Scheme::Chained | Scheme::Unchained => {
                let pubkey = bls_signatures::PublicKey::from_bytes(coeff)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                let sig = bls_signatures::Signature::from_bytes(&partial.partial_sig)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                if bls_signatures::verify_messages(&sig, &[digest], &[pubkey]) {
                    Ok(())
                } else {
                    Err(Error::InvalidPartial)
                }
            }
        }
    }

    /// recover(group_pub_poly, msg, partials, T, N) — Lagrange-interpolate
    /// the T partial signatures into the group signature at the origin.
    pub fn recover(&self, partials: &[PartialBeacon]) -> Result<Vec<u8>, Error> {
        let threshold = self.group.threshold;
        if partials.len() < threshold {
            return Err(Error::Insufficient {
                have: partials.len(),
                need: threshold,
            });
        }
        let used = &partials[..threshold];
        let indices: Vec<Scalar> = used
            .iter()
            .map(|p| Scalar::from(u64::from(p.signer_index)))
            .collect();

        match self.group.scheme {
            Scheme::ShortSig => {
                let mut acc = G1Projective::identity();
                for (i, partial) in used.iter().enumerate() {
                    let point = decode_g1(&partial.partial_sig)?;
                    let coeff = lagrange_coefficient(&indices, i);
                    acc += point * coeff;
                }
                Ok(acc.to_affine().to_compressed().to_vec())
            }
            Scheme::Chained | Scheme::Unchained => {
                let mut acc = G2Projective::identity();
                for (i, partial) in used.iter().enumerate() {
                    let point = decode_g2(&partial.partial_sig)?;
                    let coeff = lagrange_coefficient(&indices, i);
                    acc += point * coeff;
                }
                Ok(acc.to_affine().to_compressed().to_vec())
            }
        }
    }

    /// verify_recovered(group_pub_commit, msg, sig).
    pub fn verify_recovered(&self, digest: &[u8], signature: &[u8]) -> Result<(), Error> {
        match self.group.scheme {
            Scheme::ShortSig => {
                let pubkey = decode_g2(self.group.group_public_commit())?;
                let sig = decode_g1(signature)?;
                let point = hash_to_g1(digest);
                if pairing_eq(sig.to_affine(), g2_generator(), point.to_affine(), pubkey.to_affine())
                {
                    Ok(())
                } else {
                    Err(Error::InvalidRecovered)
                }
            }
            Scheme::Chained | Scheme::Unchained => {
                let pubkey = bls_signatures::PublicKey::from_bytes(self.group.group_public_commit())
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                let sig = bls_signatures::Signature::from_bytes(signature)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                if bls_signatures::verify_messages(&sig, &[digest], &[pubkey]) {
                    Ok(())
                } else {
                    Err(Error::InvalidRecovered)
                }
            }
        }
    }

    /// randomness_from(sig) — the hash of the signature, published externally.
    pub fn randomness_from(signature: &[u8]) -> Vec<u8> {
        Sha256::digest(signature).to_vec()
    }
}

fn decode_g2(bytes: &[u8]) -> Result<G2Projective, Error> {
    let arr: [u8; 96] = bytes
        .try_into()
        .map_err(|_| Error::Malformed("expected 96-byte compressed G2 point".into()))?;
    let affine = G2Affine::from_compressed(&arr);
    if affine.is_some().into() {
        Ok(G2Projective::from(affine.unwrap()))
    } else {
        Err(Error::Malformed("invalid compressed G2 point".into()))
    }
}

fn decode_g1(bytes: &[u8]) -> Result<G1Projective, Error> {
    let arr: [u8; 48] = bytes
        .try_into()
        .map_err(|_| Error::Malformed("expected 48-byte compressed G1 point".into()))?;
    let affine = G1Affine::from_compressed(&arr);
    if affine.is_some().into() {
        Ok(G1Projective::from(affine.unwrap()))
    } else {
        Err(Error::Malformed("invalid compressed G1 point".into()))
    }
}

/// Hashes a round digest onto G1 under the `ShortSig` scheme's domain tag
/// (spec.md §4.4).
fn hash_to_g1(digest: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(digest, SHORT_SIG_DST, &[])
}

fn g2_generator() -> G2Affine {
    G2Projective::generator().to_affine()
}

/// Checks `e(g1_a, g2_a) == e(g1_b, g2_b)`, the pairing equation
/// `ShortSig` verification reduces to: `e(sig, g2) == e(H(m), pubkey)`.
fn pairing_eq(g1_a: G1Affine, g2_a: G2Affine, g1_b: G1Affine, g2_b: G2Affine) -> bool {
    Bls12::pairing(g1_a, g2_a) == Bls12::pairing(g1_b, g2_b)
}

/// Lagrange coefficient for interpolating at x=0 given signer indices used
/// as the evaluation points, for the `i`-th entry in `indices`.
fn lagrange_coefficient(indices: &[Scalar], i: usize) -> Scalar {
    let xi = indices[i];
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for (j, &xj) in indices.iter().enumerate() {
        if j == i {
            continue;
        }
        num *= xj;
        den *= xj - xi;
    }
    num * den.invert().expect("signer indices must be distinct")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::NodeInfo;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    /// Builds a toy (n, t) group by sampling a random degree t-1 polynomial
    /// and evaluating it at 1..=n, the same way a DKG's dealer would.
    fn toy_group(n: u32, t: usize, scheme: Scheme) -> (GroupInfo, Vec<Share>) {
        use rand::rngs::OsRng;

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

        // Public commitment: one point per coefficient, in G1 (expressed as
        // bls_signatures public keys) for Chained/Unchained, or in G2
        // (g2^coeff via blstrs directly) for ShortSig.
        let commit_point = |s: Scalar| -> Vec<u8> {
            match scheme {
                Scheme::ShortSig => (G2Projective::generator() * s).to_affine().to_compressed().to_vec(),
                Scheme::Chained | Scheme::Unchained => bls_signatures::PrivateKey::from_bytes(&s.to_bytes_be())
                    .unwrap()
                    .public_key()
                    .as_bytes(),
            }
        };
        // index 0 is reserved for the degree-0 commit (the group key).
        let mut group_public_poly_with_commit = vec![commit_point(coeffs[0])];
        group_public_poly_with_commit.extend((1..=n).map(|i| commit_point(eval(u64::from(i)))));

        let nodes: Vec<NodeInfo> = (1..=n)
            .map(|i| NodeInfo {
                index: i,
                address: addr(5000 + i as u16),
            })
            .collect();

        let group = GroupInfo {
            threshold: t,
            nodes,
            period: Duration::from_secs(3),
            genesis_time: 0,
            genesis_seed: vec![0u8; 32],
            scheme,
            group_public_poly: group_public_poly_with_commit,
        };
        (group, shares)
    }

    #[test]
    fn digest_includes_previous_sig_only_when_chained() {
        let (group, shares) = toy_group(3, 2, Scheme::Chained);
        let vault = CryptoVault::new(shares[0].clone(), group.clone());
        let with_prev = vault.digest_beacon(5, b"prev");
        let without_prev = vault.digest_beacon(5, b"");
        assert_ne!(with_prev, without_prev);

        let (group_u, shares_u) = toy_group(3, 2, Scheme::Unchained);
        let vault_u = CryptoVault::new(shares_u[0].clone(), group_u);
        let a = vault_u.digest_beacon(5, b"prev-a");
        let b = vault_u.digest_beacon(5, b"prev-b");
        assert_eq!(a, b, "unchained digest must ignore previous_sig");
    }

    #[test]
    fn short_sig_partials_and_recovered_signature_are_forty_eight_bytes() {
        let (group, shares) = toy_group(3, 2, Scheme::ShortSig);
        let vaults: Vec<CryptoVault> = shares
            .into_iter()
            .map(|s| CryptoVault::new(s, group.clone()))
            .collect();

        let digest = vaults[0].digest_beacon(7, b"");
        let partials: Vec<PartialBeacon> = vaults.iter().take(2).map(|v| v.sign(7, b"")).collect();
        for (v, partial) in vaults.iter().zip(partials.iter()) {
            assert_eq!(partial.partial_sig.len(), 48);
            v.verify_partial(&digest, partial)
                .expect("a ShortSig partial must verify against its own signer's G2 commitment");
        }

        let recovered = vaults[0].recover(&partials).expect("threshold met");
        assert_eq!(recovered.len(), 48);
        vaults[0]
            .verify_recovered(&digest, &recovered)
            .expect("recovered ShortSig signature must verify against the group commit");
    }

    #[test]
    fn short_sig_scheme_is_not_byte_compatible_with_unchained() {
        // Same scalars, same round/digest, but ShortSig signs in G1 while
        // Unchained signs in G2 (spec.md §4.4) — the two must never
        // collide on wire size or content.
        let (group_s, shares_s) = toy_group(3, 2, Scheme::ShortSig);
        let (group_u, shares_u) = toy_group(3, 2, Scheme::Unchained);
        let vault_s = CryptoVault::new(shares_s[0].clone(), group_s);
        let vault_u = CryptoVault::new(shares_u[0].clone(), group_u);
        let short = vault_s.sign(1, b"");
        let unchained = vault_u.sign(1, b"");
        assert_ne!(short.partial_sig.len(), unchained.partial_sig.len());
    }
}
