//! Stats aggregator (C9): rolling hashrate windows, known-address chart
//! series, snapshot persistence to `stats.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::params::{
    HASHRATE_WINDOW_15M_SECS, HASHRATE_WINDOW_5M_SECS, STATS_CHART_SAMPLES, STATS_KNOWN_ADDRESS_TTL_SECS,
    STATS_SHARE_WINDOW_SECS,
};
use crate::database::Store;
use crate::error::PoolError;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashrateSample {
    pub time: u64,
    pub hashrate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecentWithdrawal {
    pub tx_hash: String,
    pub destinations: Vec<(String, u64)>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockFoundRecord {
    pub height: u64,
    pub hash: String,
    pub reward: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Statistics {
    pub last_update: u64,
    pub pool_hashrate: f64,
    pub pool_hashrate_chart: Vec<HashrateSample>,
    pub hashrate_charts: HashMap<String, Vec<HashrateSample>>,
    pub last_block: Option<BlockFoundRecord>,
    pub blocks_found: Vec<BlockFoundRecord>,
    pub num_found: u64,
    pub net_hashrate: f64,
    pub known_addresses: HashMap<String, u64>,
    pub recent_withdrawals: Vec<RecentWithdrawal>,
    pub workers: u64,
    pub workers_chart: Vec<HashrateSample>,
    pub addresses_chart: Vec<HashrateSample>,
    pub height: u64,
    pub pplns_window_s: u64,
}

/// Drops two elements at a time off the back when over the 40 cap — an
/// intentional-looking off-by-one carried verbatim from the original
/// (§9 Open Questions: preserved, not "fixed").
fn trim_ring<T>(v: &mut Vec<T>, cap: usize) {
    while v.len() > cap {
        v.remove(v.len() - 1);
        if v.len() > cap {
            v.remove(v.len() - 1);
        }
    }
}

impl Statistics {
    pub fn record_block_found(&mut self, rec: BlockFoundRecord) {
        self.last_block = Some(rec.clone());
        self.num_found += 1;
        self.blocks_found.insert(0, rec);
        trim_ring(&mut self.blocks_found, crate::core::params::BLOCKS_FOUND_CAP);
    }

    pub fn record_withdrawal(&mut self, w: RecentWithdrawal) {
        self.recent_withdrawals.insert(0, w);
        trim_ring(&mut self.recent_withdrawals, crate::core::params::RECENT_WITHDRAWALS_CAP);
    }

    fn push_sample(series: &mut Vec<HashrateSample>, time: u64, hashrate: f64) {
        series.push(HashrateSample { time, hashrate });
        while series.len() > STATS_CHART_SAMPLES {
            series.remove(0);
        }
    }

    /// Performs one 15-minute tick: updates per-address and pool-wide
    /// hashrate series from the rolling share ledger, drops addresses
    /// whose samples are all zero, and persists to `stats.json`.
    pub fn tick(
        &mut self,
        store: &Store,
        pool_hashrate: f64,
        worker_count: u64,
        net_hashrate: f64,
        height: u64,
        pplns_window_s: u64,
    ) {
        let now = now_unix();
        self.last_update = now;
        self.workers = worker_count;
        self.pool_hashrate = pool_hashrate;
        self.net_hashrate = net_hashrate;
        self.height = height;
        self.pplns_window_s = pplns_window_s;

        let per_address = sum_diff_per_address(store, STATS_SHARE_WINDOW_SECS);

        for (addr, _) in per_address.iter() {
            self.known_addresses.insert(addr.clone(), now);
        }
        self.known_addresses.retain(|_, last_seen| now.saturating_sub(*last_seen) < STATS_KNOWN_ADDRESS_TTL_SECS);

        for addr in self.known_addresses.keys().cloned().collect::<Vec<_>>() {
            let hr = hashrate_from_diff(*per_address.get(&addr).unwrap_or(&0), HASHRATE_WINDOW_15M_SECS);
            let series = self.hashrate_charts.entry(addr).or_default();
            Self::push_sample(series, now, hr);
        }

        self.hashrate_charts.retain(|_, series| series.iter().any(|s| s.hashrate > 0.0));

        Self::push_sample(&mut self.pool_hashrate_chart, now, pool_hashrate);
        Self::push_sample(&mut self.workers_chart, now, worker_count as f64);
        Self::push_sample(&mut self.addresses_chart, now, self.known_addresses.len() as f64);
    }

    pub fn hashrate_5m(&self, store: &Store, addr: &str) -> f64 {
        window_hashrate(store, addr, HASHRATE_WINDOW_5M_SECS)
    }

    pub fn hashrate_15m(&self, store: &Store, addr: &str) -> f64 {
        window_hashrate(store, addr, HASHRATE_WINDOW_15M_SECS)
    }

    /// Aggregate pool hashrate across every known wallet over the 15-minute
    /// window, used to feed `tick`'s `pool_hashrate` parameter.
    pub fn pool_hashrate_now(store: &Store) -> f64 {
        let total: u64 = sum_diff_per_address(store, HASHRATE_WINDOW_15M_SECS).values().sum();
        hashrate_from_diff(total, HASHRATE_WINDOW_15M_SECS)
    }
}

fn sum_diff_per_address(store: &Store, window_s: u64) -> HashMap<String, u64> {
    let now = now_unix();
    let mut out: HashMap<String, u64> = HashMap::new();
    for (_, share) in store.iter_shares() {
        let Ok(share) = share else { continue };
        if share.time + window_s < now {
            continue;
        }
        *out.entry(share.wallet).or_insert(0) += share.diff;
    }
    out
}

fn window_hashrate(store: &Store, addr: &str, window_s: u64) -> f64 {
    let now = now_unix();
    let mut total: u64 = 0;
    for (_, share) in store.iter_shares() {
        let Ok(share) = share else { continue };
        if share.wallet == addr && share.time + window_s >= now {
            total += share.diff;
        }
    }
    hashrate_from_diff(total, window_s)
}

fn hashrate_from_diff(total_diff: u64, window_s: u64) -> f64 {
    if window_s == 0 {
        0.0
    } else {
        total_diff as f64 / window_s as f64
    }
}

/// In-memory handle that owns the `Statistics` singleton and persists it to
/// `stats.json` on every tick.
pub struct StatsHandle {
    path: PathBuf,
    pub inner: RwLock<Statistics>,
}

impl StatsHandle {
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join("stats.json");
        let inner = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        StatsHandle { path, inner: RwLock::new(inner) }
    }

    pub async fn persist(&self) -> Result<(), PoolError> {
        let snapshot = self.inner.read().await;
        let json = serde_json::to_string_pretty(&*snapshot)
            .map_err(|e| PoolError::Protocol(format!("stats serialize: {}", e)))?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// The tick loop polls every 100ms but only does work once 15 minutes have
/// elapsed since `last_update`; if the gap exceeds 10x the interval (e.g.
/// the process was suspended), `last_update` is fast-forwarded rather than
/// replaying missed ticks.
pub fn should_tick(last_update: u64, now: u64, tick_interval_s: u64) -> (bool, Option<u64>) {
    let elapsed = now.saturating_sub(last_update);
    if elapsed >= tick_interval_s * 10 {
        return (true, Some(now.saturating_sub(tick_interval_s)));
    }
    (elapsed >= tick_interval_s, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_ring_drops_two_at_a_time() {
        let mut v: Vec<u32> = (0..45).collect();
        trim_ring(&mut v, 40);
        assert_eq!(v.len(), 39);
    }

    #[test]
    fn should_tick_fast_forwards_after_long_gap() {
        let (tick, fast_forward) = should_tick(0, 100_000 * 900, 900);
        assert!(tick);
        assert!(fast_forward.is_some());
    }

    #[test]
    fn should_tick_false_before_interval() {
        let (tick, fast_forward) = should_tick(1000, 1100, 900);
        assert!(!tick);
        assert!(fast_forward.is_none());
    }
}
