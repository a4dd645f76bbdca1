//! Pool-wide constants.
//!
//! These are not consensus constants of the underlying chain (the daemon
//! owns those) — they govern the pool's own accounting and protocol
//! behavior: PPLNS window bounds, vardiff smoothing, withdrawal batching,
//! and stats retention.

/// Frame codec AEAD overhead per sealed record (24-byte nonce + 16-byte tag).
pub const SEAL_OVERHEAD: usize = 40;

/// PPLNS window floor/ceiling, in seconds.
pub const PPLNS_WINDOW_MAX: u64 = 2 * 24 * 3600;
pub const PPLNS_WINDOW_DEFAULT: u64 = PPLNS_WINDOW_MAX;

/// Returns the PPLNS window in seconds given the pool's view of net/pool
/// hashrate and the daemon's block time.
///
/// `window = 2 * (net_hashrate / pool_hashrate) * block_time`, clamped to
/// `[2 * block_time, 2 days]`; undefined (zero) pool hashrate yields the
/// 2-day default.
pub fn pplns_window_seconds(net_hashrate: f64, pool_hashrate: f64, block_time_s: u64) -> u64 {
    if pool_hashrate == 0.0 || net_hashrate == 0.0 {
        return PPLNS_WINDOW_DEFAULT;
    }
    let mut interval = (net_hashrate / pool_hashrate) * block_time_s as f64;
    interval *= 2.0;

    if interval > PPLNS_WINDOW_MAX as f64 {
        return PPLNS_WINDOW_MAX;
    }
    let floor = (block_time_s * 2) as f64;
    if interval < floor {
        return block_time_s * 2;
    }
    interval as u64
}

/// Vardiff delta-t clamp bounds, expressed as milliseconds-per-second-of-
/// target multipliers (`target_s * 250` .. `target_s * 4000`).
pub const VARDIFF_DELTA_T_MIN_MULT: u64 = 250;
pub const VARDIFF_DELTA_T_MAX_MULT: u64 = 4000;

/// EMA smoothing applied to each vardiff proposal: `(d' + 6*prev) / 7`.
pub fn smooth_vardiff(proposed: f64, previous: f64) -> f64 {
    (proposed + 6.0 * previous) / 7.0
}

/// Computes the proposed next difficulty for a single accepted share.
///
/// `delta_t_ms` is the time since the connection's previous share, already
/// clamped to `[target_s*250, target_s*4000]` by the caller.
pub fn vardiff_proposal(job_diff: u64, delta_t_ms: u64, target_s: u64) -> f64 {
    let est_hr = job_diff as f64 / delta_t_ms as f64;
    est_hr * 1000.0 * target_s as f64
}

/// Clamps `delta_t_ms` into the vardiff sampling window for the given
/// target share time.
pub fn clamp_delta_t(delta_t_ms: u64, target_s: u64) -> u64 {
    let lo = target_s * VARDIFF_DELTA_T_MIN_MULT;
    let hi = target_s * VARDIFF_DELTA_T_MAX_MULT;
    delta_t_ms.clamp(lo, hi)
}

/// Trust score penalty applied when a share fails full PoW verification.
pub const TRUST_SCORE_FRAUD_PENALTY: i32 = -100;

/// Probability (0.0-1.0) that an accepted share still triggers full PoW
/// verification even when not otherwise required.
pub const RANDOM_FULL_VERIFY_PROBABILITY: f32 = 0.5;

/// Extra probability, applied only to non-TLS connections, that an accepted
/// share is diverted to the fee address regardless of the configured fee.
pub const NON_TLS_FEE_SURCHARGE_PROBABILITY: f32 = 0.001;

/// NiceHash nonce partition byte bounds: 0 is the "unallocated" sentinel,
/// 1..=255 are valid partitions.
pub const NICEHASH_PARTITION_MAX: u8 = 255;

/// Withdrawal batching limits.
pub const MIN_WITHDRAW_DESTINATIONS: usize = 1;
pub const MAX_WITHDRAW_DESTINATIONS: usize = 8;

/// Incoming-transfer lookback buffer, in blocks, applied when scanning the
/// wallet for new transfers each updater tick.
pub const PENDING_SCAN_LOOKBACK_BLOCKS: u64 = 720;

/// Stats aggregator tick interval and retention.
pub const STATS_TICK_MINUTES: u64 = 15;
pub const STATS_CHART_SAMPLES: usize = (60 * 24) / STATS_TICK_MINUTES as usize; // 96
pub const STATS_SHARE_WINDOW_SECS: u64 = 15 * 60;
pub const STATS_KNOWN_ADDRESS_TTL_SECS: u64 = 24 * 3600;
pub const RECENT_WITHDRAWALS_CAP: usize = 40;
pub const BLOCKS_FOUND_CAP: usize = 40;

/// Hashrate window lengths used by the on-demand hashrate readouts.
pub const HASHRATE_WINDOW_5M_SECS: u64 = 5 * 60;
pub const HASHRATE_WINDOW_15M_SECS: u64 = 15 * 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pplns_window_default_when_unknown() {
        assert_eq!(pplns_window_seconds(0.0, 0.0, 90), PPLNS_WINDOW_DEFAULT);
    }

    #[test]
    fn pplns_window_floor() {
        // Tiny ratio -> floor of 2*block_time.
        assert_eq!(pplns_window_seconds(1.0, 1_000_000.0, 90), 180);
    }

    #[test]
    fn pplns_window_ceiling() {
        assert_eq!(pplns_window_seconds(1_000_000.0, 1.0, 90), PPLNS_WINDOW_MAX);
    }

    #[test]
    fn vardiff_converges_at_target_rate() {
        let target_s = 10u64;
        let job_diff = 1_000u64;
        let mut next_diff = job_diff as f64;
        for _ in 0..200 {
            let delta_t_ms = clamp_delta_t(target_s * 1000, target_s);
            let proposed = vardiff_proposal(job_diff, delta_t_ms, target_s);
            next_diff = smooth_vardiff(proposed, next_diff);
        }
        assert!((next_diff - job_diff as f64).abs() < 1.0);
    }

    #[test]
    fn clamp_delta_t_bounds() {
        assert_eq!(clamp_delta_t(0, 10), 2500);
        assert_eq!(clamp_delta_t(1_000_000, 10), 40_000);
    }
}
