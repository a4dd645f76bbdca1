//! Proof-of-work gating around the daemon's RandomX verification RPC: the
//! trust-score-driven decision of *when* to ask the daemon to recompute a
//! share's hash, plus the small blob/nonce manipulations every submit needs.
//!
//! The crate never computes RandomX itself (§1 Non-goals) — `calc_pow` is a
//! daemon RPC call made by the caller; this module only decides whether to
//! make it and patches the bytes the daemon/hash function needs.

use rand::Rng;

use crate::core::params::{RANDOM_FULL_VERIFY_PROBABILITY, TRUST_SCORE_FRAUD_PENALTY};

/// Nonce bytes sit at offset 39..43 of both the hashing blob and the full
/// block blob.
pub const NONCE_OFFSET: usize = 39;
pub const NONCE_LEN: usize = 4;

/// Reserved NiceHash partition byte, offset 42 of the hashing blob (the
/// fourth nonce byte).
pub const NICEHASH_BYTE_OFFSET: usize = 42;

/// A per-connection trust score gating probabilistic full verification.
/// Starts at 0, +1 per accepted share, reset to -100 on detected fraud.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustScore(pub i32);

impl TrustScore {
    pub fn record_valid_share(&mut self) {
        self.0 += 1;
    }

    pub fn record_fraud(&mut self) {
        self.0 = TRUST_SCORE_FRAUD_PENALTY;
    }
}

/// Overwrites the 4 nonce bytes (offset 39..43) of `blob` in place with the
/// submitted nonce. No-ops if the blob is too short to hold them.
pub fn patch_nonce(blob: &mut [u8], nonce: &[u8; NONCE_LEN]) {
    if blob.len() >= NONCE_OFFSET + NONCE_LEN {
        blob[NONCE_OFFSET..NONCE_OFFSET + NONCE_LEN].copy_from_slice(nonce);
    }
}

/// Reads the NiceHash partition byte embedded in a P2Pool-supplied hashing
/// blob (byte 42), if the blob is long enough to carry one.
pub fn read_embedded_nicehash_byte(blob: &[u8]) -> Option<u8> {
    blob.get(NICEHASH_BYTE_OFFSET).copied()
}

/// Decides whether a share that already met its job difficulty should also
/// be sent to the daemon's `calc_pow` for full verification (§4.4).
///
/// Full verification is mandatory when the share appears to solve a network
/// block or the connection's trust score is below the configured threshold;
/// otherwise it happens with fixed probability 0.5 as a spot-check.
pub fn requires_full_verification(
    share_diff: u64,
    network_difficulty: u64,
    trust_score: TrustScore,
    trust_score_threshold: i32,
) -> bool {
    if share_diff >= network_difficulty {
        return true;
    }
    if trust_score.0 < trust_score_threshold {
        return true;
    }
    rand::thread_rng().gen_range(0.0f32..1.0f32) < RANDOM_FULL_VERIFY_PROBABILITY
}

/// Clamps a client-supplied starting difficulty (`login+N`) into
/// `[min_diff, network_difficulty/2]`.
pub fn clamp_initial_difficulty(requested: u64, min_diff: u64, network_difficulty: u64) -> u64 {
    let hi = (network_difficulty / 2).max(min_diff);
    requested.clamp(min_diff, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_nonce_overwrites_correct_offset() {
        let mut blob = vec![0u8; 76];
        patch_nonce(&mut blob, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&blob[39..43], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn patch_nonce_too_short_is_noop() {
        let mut blob = vec![0u8; 10];
        patch_nonce(&mut blob, &[1, 2, 3, 4]);
        assert_eq!(blob, vec![0u8; 10]);
    }

    #[test]
    fn full_verify_mandatory_on_block_solve() {
        let score = TrustScore(1000);
        assert!(requires_full_verification(1_000_000, 1_000_000, score, -10));
    }

    #[test]
    fn full_verify_mandatory_below_trust_threshold() {
        let score = TrustScore(-5);
        assert!(requires_full_verification(10, 1_000_000, score, 0));
    }

    #[test]
    fn initial_difficulty_clamped() {
        assert_eq!(clamp_initial_difficulty(50, 1000, 1_000_000), 1000);
        assert_eq!(clamp_initial_difficulty(10_000_000, 1000, 1_000_000), 500_000);
    }
}
