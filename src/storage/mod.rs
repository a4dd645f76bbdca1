//! Share ledger and PPLNS engine (C7) — the business logic layered on top
//! of the raw schema/store in [`crate::database`].
//!
//! Three operations, each meant to run inside its own store write
//! transaction at the call site: recording a share batch, computing and
//! queuing pending balances from new wallet transfers, and confirming the
//! head of the pending-tx queue once it matures.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::params::{self, PENDING_SCAN_LOOKBACK_BLOCKS};
use crate::database::{AddrInfo, Share, Store, UnconfirmedTx};
use crate::error::PoolError;
use crate::rpc::{DaemonClient, WalletClient};

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Persists one aggregated `ShareBatch` as a single Share record. Addresses
/// that fail validation are rewritten to `fee_address` by the caller before
/// this is invoked (§4.7 "On ShareBatch").
pub fn record_share_batch(store: &Store, wallet: &str, diff: u64) -> Result<u64, PoolError> {
    let share = Share { wallet: wallet.to_string(), diff, time: now_unix() };
    store.append_share(&share)
}

/// Sums total and per-address hashes (diff) over shares still inside the
/// PPLNS window, and separately collects the ids of any share visited that
/// has fallen outside it (or failed to decode) so the caller can purge them
/// as part of its own write transaction (§7.v). This function itself only
/// reads — the purge is the caller's concern.
pub struct CreditBasis {
    pub total_hashes: u64,
    pub per_address: HashMap<String, u64>,
    pub stale_ids: Vec<u64>,
}

pub fn compute_credit_basis(store: &Store, pplns_window_s: u64) -> Result<CreditBasis, PoolError> {
    let now = now_unix();
    let mut total_hashes: u64 = 0;
    let mut per_address: HashMap<String, u64> = HashMap::new();
    let mut stale_ids = Vec::new();

    for (id, share) in store.iter_shares() {
        let share = match share {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("corrupt share record {} will be purged: {}", id, e);
                stale_ids.push(id);
                continue;
            }
        };
        if share.time + pplns_window_s < now {
            stale_ids.push(id);
            continue;
        }
        total_hashes += share.diff;
        *per_address.entry(share.wallet).or_insert(0) += share.diff;
    }

    Ok(CreditBasis { total_hashes, per_address, stale_ids })
}

/// One-time startup pass purging corrupt or PPLNS-stale share records in a
/// single write transaction, grounded on the original `DatabaseCleanup()`
/// (§4.7).
pub fn database_cleanup(store: &Store, pplns_window_s: u64) -> Result<(u64, u64), PoolError> {
    let now = now_unix();
    let mut stale_ids = Vec::new();
    let mut kept = 0u64;
    for (id, share) in store.iter_shares() {
        match share {
            Ok(s) if s.time + pplns_window_s >= now => kept += 1,
            Ok(_) => stale_ids.push(id),
            Err(_) => stale_ids.push(id),
        }
    }
    let removed = stale_ids.len() as u64;
    store.purge_shares(&stale_ids)?;
    tracing::info!("database cleanup: removed {} kept {}", removed, kept);
    Ok((removed, kept))
}

/// Queries the wallet for incoming transfers and, for each one newer than
/// `pending.last_height`, computes a PPLNS credit schedule and appends an
/// `UnconfirmedTx` to the pending queue (§4.7 "Pending-balance computation").
///
/// `height` is the master's current daemon height. `pending.last_height`
/// always advances to the highest transfer height seen that exceeds the
/// prior value, or to `height` if no transfer exceeded it — it never
/// regresses, and always reaches at least `height` by the time this
/// returns, even when there are no new transfers to process.
pub async fn process_pending_balances(
    store: &Store,
    wallet: &WalletClient,
    fee_address: &str,
    fee_percent: f64,
    min_confs: u64,
    pplns_window_s: u64,
    height: u64,
) -> Result<u64, PoolError> {
    let pending = store.get_pending()?;
    let scan_from = pending.last_height.saturating_sub(PENDING_SCAN_LOOKBACK_BLOCKS);

    let transfers_result = wallet.get_transfers(scan_from).await?;
    let mut transfers = transfers_result.r#in;
    transfers.sort_by_key(|t| t.height);
    let transfers: Vec<_> = transfers.into_iter().filter(|t| t.height > pending.last_height).collect();

    let mut highest_seen = pending.last_height;
    let mut processed = 0u64;
    let mut credits: HashMap<String, u64> = HashMap::new();
    let mut new_unconfirmed: Vec<UnconfirmedTx> = Vec::new();
    let mut stale_ids: Vec<u64> = Vec::new();

    if !transfers.is_empty() {
        let basis = compute_credit_basis(store, pplns_window_s)?;
        stale_ids = basis.stale_ids;

        for transfer in &transfers {
            let gross = transfer.amount;
            let net = (gross as f64 * (100.0 - fee_percent) / 100.0) as u64;

            let tx_bals = if basis.total_hashes == 0 {
                tracing::warn!(
                    "pending balance scan: no shares in PPLNS window, crediting {} to fee address",
                    gross
                );
                HashMap::from([(fee_address.to_string(), gross)])
            } else {
                let mut tx_bals: HashMap<String, u64> = HashMap::new();
                let mut distributed: u64 = 0;
                for (addr, hashes) in &basis.per_address {
                    let credit = (*hashes as u128 * net as u128 / basis.total_hashes as u128) as u64;
                    if credit > 0 {
                        tx_bals.insert(addr.clone(), credit);
                        distributed += credit;
                    }
                }
                let residue = gross.saturating_sub(distributed);
                *tx_bals.entry(fee_address.to_string()).or_insert(0) += residue;
                tx_bals
            };

            for (addr, amount) in &tx_bals {
                *credits.entry(addr.clone()).or_insert(0) += amount;
            }
            new_unconfirmed.push(build_unconfirmed(transfer.height, min_confs, &transfer.txid, tx_bals)?);

            highest_seen = highest_seen.max(transfer.height);
            processed += 1;
        }
    }

    let new_last_height = highest_seen.max(height);
    store.apply_pending_update(&stale_ids, &credits, &new_unconfirmed, new_last_height)?;
    Ok(processed)
}

fn build_unconfirmed(
    transfer_height: u64,
    min_confs: u64,
    txid_hex: &str,
    bals: HashMap<String, u64>,
) -> Result<UnconfirmedTx, PoolError> {
    let mut txn_hash = [0u8; 32];
    let decoded = hex::decode(txid_hex).map_err(|e| PoolError::Protocol(format!("bad txid hex: {}", e)))?;
    if decoded.len() != 32 {
        return Err(PoolError::Protocol("txid must be 32 bytes".into()));
    }
    txn_hash.copy_from_slice(&decoded);
    Ok(UnconfirmedTx { unlock_height: transfer_height + min_confs + 1, txn_hash, bals })
}

/// Advances the pending-tx queue: if the head has matured (`unlock_height <
/// height`), verifies it against the daemon and either credits balances or
/// discards it as orphaned (§4.7 "Confirmation step"). The daemon RPC call
/// runs before the store write — sled transactions are synchronous and
/// can't await a network round-trip inside their closure — but the
/// resulting credit (or discard) is applied as a single atomic write.
pub async fn confirm_head(store: &Store, daemon: &DaemonClient, height: u64) -> Result<bool, PoolError> {
    let pending = store.get_pending()?;
    let Some(head) = pending.unconfirmed_txs.first().cloned() else {
        return Ok(false);
    };
    if head.unlock_height >= height {
        return Ok(false);
    }

    let hash_hex = hex::encode(head.txn_hash);
    let result = daemon.get_transactions(&[hash_hex.clone()]).await?;
    let confirmed = result
        .txs
        .iter()
        .find(|tx| tx.tx_hash == hash_hex)
        .map(|tx| !tx.in_pool && tx.block_height > 0)
        .unwrap_or(false);

    if confirmed {
        store.apply_confirmation(&head.bals)?;
    } else {
        tracing::warn!("pending tx {} orphaned, discarding credit schedule", hash_hex);
        store.discard_pending_head()?;
    }

    Ok(true)
}

/// PPLNS window in seconds for the configured net/pool hashrate, delegating
/// the formula to [`params::pplns_window_seconds`].
pub fn pplns_window(net_hashrate: f64, pool_hashrate: f64, block_time_s: u64) -> u64 {
    params::pplns_window_seconds(net_hashrate, pool_hashrate, block_time_s)
}

#[derive(Debug, Clone, Default)]
pub struct AddressBalances {
    pub balance: u64,
    pub balance_pending: u64,
    pub paid: u64,
}

pub fn address_balances(store: &Store, addr: &str) -> Result<AddressBalances, PoolError> {
    let info = store.get_addr_info(addr)?.unwrap_or_default();
    Ok(AddressBalances { balance: info.balance, balance_pending: info.balance_pending, paid: info.paid })
}

impl From<AddrInfo> for AddressBalances {
    fn from(info: AddrInfo) -> Self {
        AddressBalances { balance: info.balance, balance_pending: info.balance_pending, paid: info.paid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("eqf-ledger-test-{}-{}", std::process::id(), rand_suffix()));
        Store::open(&dir).unwrap()
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }

    #[test]
    fn credit_basis_sums_within_window_and_flags_stale() {
        let store = temp_store();
        let now = now_unix();
        store.append_share(&Share { wallet: "a".into(), diff: 100, time: now }).unwrap();
        store.append_share(&Share { wallet: "b".into(), diff: 300, time: now }).unwrap();
        let stale_id = store.append_share(&Share { wallet: "a".into(), diff: 999, time: now - 100_000 }).unwrap();

        let basis = compute_credit_basis(&store, 3600).unwrap();
        assert_eq!(basis.total_hashes, 400);
        assert_eq!(basis.per_address["a"], 100);
        assert_eq!(basis.per_address["b"], 300);
        assert_eq!(basis.stale_ids, vec![stale_id]);

        // A bare read doesn't purge anything — the caller commits the purge.
        let remaining: Vec<_> = store.iter_shares().collect();
        assert_eq!(remaining.len(), 3);

        store.purge_shares(&basis.stale_ids).unwrap();
        let remaining: Vec<_> = store.iter_shares().collect();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn database_cleanup_removes_stale() {
        let store = temp_store();
        let now = now_unix();
        store.append_share(&Share { wallet: "a".into(), diff: 1, time: now }).unwrap();
        store.append_share(&Share { wallet: "b".into(), diff: 1, time: now - 100_000 }).unwrap();
        let (removed, kept) = database_cleanup(&store, 3600).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kept, 1);
    }
}
