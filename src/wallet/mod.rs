//! Payout engine (C8): threshold scan, batched wallet transfer, fee
//! accounting, relay.
//!
//! Runs on the `withdrawal_interval_minutes` timer. The balance-zeroing scan
//! and the post-transfer fee credit are each committed as their own store
//! write transaction (§4.8 "Concurrency"); the wallet RPCs between them
//! can't participate in a sled transaction, so they're necessarily separate
//! steps.

use crate::core::params::{MAX_WITHDRAW_DESTINATIONS, MIN_WITHDRAW_DESTINATIONS};
use crate::database::Store;
use crate::error::PoolError;
use crate::rpc::WalletClient;

#[derive(Debug, Clone)]
pub struct Destination {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub tx_hash: String,
    pub destinations: Vec<Destination>,
    pub timestamp: u64,
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Scans all `AddressInfo` entries for `balance > min_withdrawal`, builds
/// up to `MAX_WITHDRAW_DESTINATIONS` payout destinations, and zeroes each
/// scanned address's balance while crediting `paid`. The tree-wide scan is
/// a plain read (sled transactions can't iterate a whole tree), but every
/// zeroed balance is committed in a single write transaction, so a crash
/// mid-scan can never leave one address zeroed without the rest (§4.8
/// step 1).
pub fn scan_withdraw_destinations(
    store: &Store,
    min_withdrawal: u64,
    withdrawal_fee: u64,
) -> Result<(Vec<Destination>, u64), PoolError> {
    let mut destinations = Vec::new();
    let mut fee_revenue: u64 = 0;
    let mut zeroed: Vec<(String, crate::database::AddrInfo)> = Vec::new();

    for entry in store.address_info.iter() {
        if destinations.len() >= MAX_WITHDRAW_DESTINATIONS {
            break;
        }
        let (key, value) = entry?;
        let addr = match std::str::from_utf8(&key) {
            Ok(a) => a.to_string(),
            Err(_) => continue,
        };
        let mut info = match crate::database::AddrInfo::deserialize(&value) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("skipping unreadable AddressInfo for {}: {}", addr, e);
                continue;
            }
        };
        if info.balance <= min_withdrawal {
            continue;
        }

        let payout = info.balance.saturating_sub(withdrawal_fee);
        fee_revenue += withdrawal_fee;
        let prior_balance = info.balance;
        info.balance = 0;
        info.paid += prior_balance;

        destinations.push(Destination { address: addr.clone(), amount: payout });
        zeroed.push((addr, info));
    }

    store.apply_withdrawal_scan(&zeroed)?;

    Ok((destinations, fee_revenue))
}

/// Runs one full payout cycle: scan, transfer, account for the wallet fee,
/// relay. Returns `None` when there were too few destinations to bother
/// (§4.8 step 2).
pub async fn run_payout_cycle(
    store: &Store,
    wallet: &WalletClient,
    fee_address: &str,
    min_withdrawal: u64,
    withdrawal_fee: u64,
) -> Result<Option<Withdrawal>, PoolError> {
    let (destinations, mut fee_revenue) = scan_withdraw_destinations(store, min_withdrawal, withdrawal_fee)?;

    if destinations.len() < MIN_WITHDRAW_DESTINATIONS {
        return Ok(None);
    }

    let dest_pairs: Vec<(String, u64)> =
        destinations.iter().map(|d| (d.address.clone(), d.amount)).collect();
    let result = wallet.transfer(&dest_pairs).await?;

    fee_revenue = fee_revenue.saturating_sub(result.fee);
    store.credit_address_balance(fee_address, fee_revenue)?;

    if let Err(e) = wallet.relay_tx(&result.tx_metadata).await {
        tracing::error!("relay_tx failed for {}: {} (balances already committed)", result.tx_hash, e);
    }

    Ok(Some(Withdrawal { tx_hash: result.tx_hash, destinations, timestamp: now_unix() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AddrInfo;

    fn temp_store() -> Store {
        use std::time::{SystemTime, UNIX_EPOCH};
        let suffix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("eqf-payout-test-{}-{}", std::process::id(), suffix));
        Store::open(&dir).unwrap()
    }

    #[test]
    fn threshold_scan_picks_only_addresses_above_min() {
        let store = temp_store();
        store.put_addr_info("high", &AddrInfo { balance: 1_000_000_000_000, balance_pending: 0, paid: 0 }).unwrap();
        store.put_addr_info("low", &AddrInfo { balance: 500_000_000_000, balance_pending: 0, paid: 0 }).unwrap();

        let (destinations, fee_revenue) = scan_withdraw_destinations(&store, 800_000_000_000, 10_000_000_000).unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].address, "high");
        assert_eq!(destinations[0].amount, 990_000_000_000);
        assert_eq!(fee_revenue, 10_000_000_000);

        // "high" was zeroed and credited to `paid`; "low" untouched.
        let high = store.get_addr_info("high").unwrap().unwrap();
        assert_eq!(high.balance, 0);
        assert_eq!(high.paid, 1_000_000_000_000);
        let low = store.get_addr_info("low").unwrap().unwrap();
        assert_eq!(low.balance, 500_000_000_000);
    }

    #[test]
    fn caps_at_max_destinations() {
        let store = temp_store();
        for i in 0..20 {
            store
                .put_addr_info(&format!("addr{}", i), &AddrInfo { balance: 1_000_000_000_000, balance_pending: 0, paid: 0 })
                .unwrap();
        }
        let (destinations, _) = scan_withdraw_destinations(&store, 1, 0).unwrap();
        assert_eq!(destinations.len(), MAX_WITHDRAW_DESTINATIONS);
    }
}
