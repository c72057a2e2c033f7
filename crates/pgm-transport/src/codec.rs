//! # FEC Codec
//!
//! Reed-Solomon `RS(n,k)` parity over a transmission group of `k` equal-
//! length shards, producing `h` repair shards (`n = k + h`). The donor
//! declares `reed-solomon-simd` in its `Cargo.toml` but its own codec
//! never calls it — `emit_repair`/`try_recover` there are a hand-rolled
//! XOR code that only survives a single loss. This module is the actual
//! consumer of that dependency: real Galois-field RS arithmetic,
//! recovering any `h` losses out of `n`, matching PGM's `OPT_PARITY_PRM`
//! semantics (one group, `k` originals, `h` repair indices
//! `k..k+h`) instead of the donor's generation/symbol-index bookkeeping.

use std::collections::BTreeMap;

use crate::error::PgmError;

/// Builds the `h` repair shards for one transmission group. All `k`
/// inputs must already be the same length — callers zero-pad via
/// [`crate::txw::TransmitWindow::zero_pad`] first.
pub struct RsEncoder {
    k: usize,
    h: usize,
}

impl RsEncoder {
    pub fn new(k: usize, h: usize) -> Self {
        RsEncoder { k, h }
    }

    /// `shards.len()` must equal `k`; every shard the same length.
    pub fn encode(&self, shards: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PgmError> {
        if shards.len() != self.k {
            return Err(PgmError::InvalidArgument(format!(
                "expected {} shards, got {}",
                self.k,
                shards.len()
            )));
        }
        reed_solomon_simd::encode(self.k, self.h, shards)
            .map_err(|e| PgmError::InvalidArgument(e.to_string()))
    }
}

/// Recovers missing originals of one transmission group given whatever
/// subset of the `k` originals and `h` repair shards actually arrived.
pub struct RsDecoder {
    k: usize,
    h: usize,
}

impl RsDecoder {
    pub fn new(k: usize, h: usize) -> Self {
        RsDecoder { k, h }
    }

    /// `originals`/`recovery` carry `(index, shard)` pairs for whatever
    /// arrived; `index` is the position within the group (`0..k` for
    /// originals, `0..h` for repair shards). Returns the recovered
    /// originals keyed by their group index. Errs if too few shards
    /// arrived to reconstruct the group.
    pub fn decode(
        &self,
        originals: &[(usize, Vec<u8>)],
        recovery: &[(usize, Vec<u8>)],
    ) -> Result<BTreeMap<usize, Vec<u8>>, PgmError> {
        if originals.len() + recovery.len() < self.k {
            return Err(PgmError::InvalidArgument(
                "not enough shards to reconstruct transmission group".into(),
            ));
        }
        let original_iter = originals.iter().map(|(i, d)| (*i, d.clone()));
        let recovery_iter = recovery.iter().map(|(i, d)| (*i, d.clone()));
        reed_solomon_simd::decode(self.k, self.h, original_iter, recovery_iter)
            .map_err(|e| PgmError::InvalidArgument(e.to_string()))
    }
}
