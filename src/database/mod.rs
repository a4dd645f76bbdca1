//! Persisted record types (C3 data model) and the sled-backed transactional
//! store with the three namespaces from the original bucket layout:
//! `a` (AddressInfo), `s` (Share), `p` (PendingBals).

use std::collections::HashMap;
use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;

use crate::error::PoolError;
use crate::serializer::{Decoder, Encoder, VERSION};

pub const NS_ADDRESS_INFO: &str = "a";
pub const NS_SHARES: &str = "s";
pub const NS_PENDING: &str = "p";
const PENDING_KEY: &[u8] = b"pending";

#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub wallet: String,
    pub diff: u64,
    pub time: u64,
}

impl Share {
    pub fn serialize(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(VERSION);
        e.put_string(&self.wallet);
        e.put_u64(self.diff);
        e.put_u64(self.time);
        e.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PoolError> {
        let mut d = Decoder::new(data);
        d.read_u8();
        let wallet = d.read_string();
        let diff = d.read_u64();
        let time = d.read_u64();
        d.finish()?;
        Ok(Share { wallet, diff, time })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnconfirmedTx {
    pub unlock_height: u64,
    pub txn_hash: [u8; 32],
    pub bals: HashMap<String, u64>,
}

impl UnconfirmedTx {
    pub fn serialize(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(VERSION);
        e.put_uvarint(self.unlock_height);
        e.put_fixed_bytes(&self.txn_hash, 32);
        e.put_uvarint(self.bals.len() as u64);
        for (addr, amt) in &self.bals {
            e.put_string(addr);
            e.put_uvarint(*amt);
        }
        e.into_bytes()
    }

    /// Deserializes one record from the front of `data`, returning the
    /// record and the unconsumed remainder. Records are packed back to
    /// back inside `PendingBals`, so each one reports how much it consumed.
    fn deserialize_from(data: &[u8]) -> Result<(Self, &[u8]), PoolError> {
        let mut d = Decoder::new(data);
        d.read_u8();
        let unlock_height = d.read_uvarint();
        let txn_hash_vec = d.read_fixed_bytes(32);
        let bals_len = d.read_uvarint() as usize;
        let mut bals = HashMap::with_capacity(bals_len);
        for _ in 0..bals_len {
            let addr = d.read_string();
            let amt = d.read_uvarint();
            bals.insert(addr, amt);
        }
        let rest = d.remainder();
        d.finish()?;
        let mut txn_hash = [0u8; 32];
        txn_hash.copy_from_slice(&txn_hash_vec);
        Ok((UnconfirmedTx { unlock_height, txn_hash, bals }, rest))
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.serialize());
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBals {
    pub last_height: u64,
    pub unconfirmed_txs: Vec<UnconfirmedTx>,
}

impl PendingBals {
    pub fn serialize(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(VERSION);
        e.put_uvarint(self.last_height);
        e.put_uvarint(self.unconfirmed_txs.len() as u64);
        let mut out = e.into_bytes();
        for tx in &self.unconfirmed_txs {
            tx.serialize_into(&mut out);
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PoolError> {
        let mut d = Decoder::new(data);
        d.read_u8();
        let last_height = d.read_uvarint();
        let num_unconf = d.read_uvarint() as usize;
        let mut remainder = d.remainder();
        d.finish()?;

        let mut unconfirmed_txs = Vec::with_capacity(num_unconf);
        for _ in 0..num_unconf {
            let (tx, rest) = UnconfirmedTx::deserialize_from(remainder)?;
            unconfirmed_txs.push(tx);
            remainder = rest;
        }

        Ok(PendingBals { last_height, unconfirmed_txs })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrInfo {
    pub balance: u64,
    pub balance_pending: u64,
    pub paid: u64,
}

impl AddrInfo {
    pub fn serialize(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u8(VERSION);
        e.put_uvarint(self.balance);
        e.put_uvarint(self.balance_pending);
        e.put_uvarint(self.paid);
        e.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PoolError> {
        let mut d = Decoder::new(data);
        d.read_u8();
        let balance = d.read_uvarint();
        let balance_pending = d.read_uvarint();
        let paid = d.read_uvarint();
        d.finish()?;
        Ok(AddrInfo { balance, balance_pending, paid })
    }
}

/// Transactional key-value store over sled, one `Tree` per namespace.
pub struct Store {
    pub address_info: sled::Tree,
    pub shares: sled::Tree,
    pub pending: sled::Tree,
    db: sled::Db,
}

/// Unwraps a sled transaction outcome into the crate's own error type.
/// `Abort` carries whatever `PoolError` the closure raised; `Storage`
/// is a sled-internal conflict/IO failure on the transaction machinery
/// itself.
fn tx_err(e: TransactionError<PoolError>) -> PoolError {
    match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => PoolError::from(err),
    }
}

fn tt_get_addr_info(tt: &TransactionalTree, addr: &str) -> Result<AddrInfo, ConflictableTransactionError<PoolError>> {
    match tt.get(addr.as_bytes())? {
        Some(ivec) => AddrInfo::deserialize(&ivec).map_err(ConflictableTransactionError::Abort),
        None => Ok(AddrInfo::default()),
    }
}

fn tt_get_pending(tt: &TransactionalTree) -> Result<PendingBals, ConflictableTransactionError<PoolError>> {
    match tt.get(PENDING_KEY)? {
        Some(ivec) => PendingBals::deserialize(&ivec).map_err(ConflictableTransactionError::Abort),
        None => Ok(PendingBals::default()),
    }
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PoolError> {
        let db = sled::open(path)?;
        let address_info = db.open_tree(NS_ADDRESS_INFO)?;
        let shares = db.open_tree(NS_SHARES)?;
        let pending = db.open_tree(NS_PENDING)?;
        Ok(Store { address_info, shares, pending, db })
    }

    pub fn flush(&self) -> Result<(), PoolError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_addr_info(&self, addr: &str) -> Result<Option<AddrInfo>, PoolError> {
        match self.address_info.get(addr.as_bytes())? {
            Some(ivec) => Ok(Some(AddrInfo::deserialize(&ivec)?)),
            None => Ok(None),
        }
    }

    pub fn put_addr_info(&self, addr: &str, info: &AddrInfo) -> Result<(), PoolError> {
        self.address_info.insert(addr.as_bytes(), info.serialize())?;
        Ok(())
    }

    /// Appends a share keyed by the tree's auto-incrementing sequence,
    /// mirroring bolt's `NextSequence()`. The id is reserved outside the
    /// transaction (sequence generation is not itself a record mutation);
    /// the record write is the atomic step.
    pub fn append_share(&self, share: &Share) -> Result<u64, PoolError> {
        let id = self.shares.generate_id()?;
        let bytes = share.serialize();
        self.shares
            .transaction(move |tt| {
                tt.insert(id.to_be_bytes().as_slice(), bytes.clone())?;
                Ok(())
            })
            .map_err(tx_err)?;
        Ok(id)
    }

    pub fn iter_shares(&self) -> impl Iterator<Item = (u64, Result<Share, PoolError>)> {
        self.shares.iter().filter_map(|entry| {
            let (k, v) = entry.ok()?;
            let id = u64::from_be_bytes(k.as_ref().try_into().ok()?);
            Some((id, Share::deserialize(&v)))
        })
    }

    /// Removes a batch of share ids in one write transaction.
    pub fn purge_shares(&self, ids: &[u64]) -> Result<(), PoolError> {
        let ids = ids.to_vec();
        self.shares
            .transaction(move |tt| {
                for id in &ids {
                    tt.remove(id.to_be_bytes().as_slice())?;
                }
                Ok(())
            })
            .map_err(tx_err)
    }

    pub fn get_pending(&self) -> Result<PendingBals, PoolError> {
        match self.pending.get(PENDING_KEY)? {
            Some(ivec) => PendingBals::deserialize(&ivec),
            None => Ok(PendingBals::default()),
        }
    }

    pub fn put_pending(&self, pending: &PendingBals) -> Result<(), PoolError> {
        self.pending.insert(PENDING_KEY, pending.serialize())?;
        Ok(())
    }

    /// Atomically applies one pending-balance update tick: purges the given
    /// stale share ids, folds `credits` into each address's
    /// `balance_pending`, appends `new_unconfirmed` to the pending queue,
    /// and advances `last_height` — all three trees in one transaction, so
    /// a crash mid-tick can never leave a partially-credited ledger (§4.7
    /// Concurrency).
    pub fn apply_pending_update(
        &self,
        stale_share_ids: &[u64],
        credits: &HashMap<String, u64>,
        new_unconfirmed: &[UnconfirmedTx],
        new_last_height: u64,
    ) -> Result<(), PoolError> {
        let stale_share_ids = stale_share_ids.to_vec();
        let credits = credits.clone();
        let new_unconfirmed = new_unconfirmed.to_vec();

        (&self.address_info, &self.shares, &self.pending)
            .transaction(move |(addr_tt, shares_tt, pending_tt)| {
                for id in &stale_share_ids {
                    shares_tt.remove(id.to_be_bytes().as_slice())?;
                }
                for (addr, amount) in &credits {
                    let mut info = tt_get_addr_info(addr_tt, addr)?;
                    info.balance_pending += amount;
                    addr_tt.insert(addr.as_bytes(), info.serialize())?;
                }
                let mut pb = tt_get_pending(pending_tt)?;
                for tx in &new_unconfirmed {
                    pb.unconfirmed_txs.push(tx.clone());
                }
                pb.unconfirmed_txs.sort_by_key(|tx| tx.unlock_height);
                pb.last_height = new_last_height;
                pending_tt.insert(PENDING_KEY, pb.serialize())?;
                Ok(())
            })
            .map_err(tx_err)
    }

    /// Atomically credits each address in `credits` (confirmed balance up,
    /// pending balance down) and pops the matured head of the pending-tx
    /// queue (§4.7 "Confirmation step").
    pub fn apply_confirmation(&self, credits: &HashMap<String, u64>) -> Result<(), PoolError> {
        let credits = credits.clone();
        (&self.address_info, &self.pending)
            .transaction(move |(addr_tt, pending_tt)| {
                for (addr, amount) in &credits {
                    let mut info = tt_get_addr_info(addr_tt, addr)?;
                    info.balance += amount;
                    info.balance_pending = info.balance_pending.saturating_sub(*amount);
                    addr_tt.insert(addr.as_bytes(), info.serialize())?;
                }
                let mut pb = tt_get_pending(pending_tt)?;
                if !pb.unconfirmed_txs.is_empty() {
                    pb.unconfirmed_txs.remove(0);
                }
                pending_tt.insert(PENDING_KEY, pb.serialize())?;
                Ok(())
            })
            .map_err(tx_err)
    }

    /// Discards the pending-tx queue head without crediting any balance
    /// (the transfer turned out to be orphaned).
    pub fn discard_pending_head(&self) -> Result<(), PoolError> {
        self.pending
            .transaction(|tt| {
                let mut pb = tt_get_pending(tt)?;
                if !pb.unconfirmed_txs.is_empty() {
                    pb.unconfirmed_txs.remove(0);
                }
                tt.insert(PENDING_KEY, pb.serialize())?;
                Ok(())
            })
            .map_err(tx_err)
    }

    /// Atomically zeroes the payout-selected addresses' balances, crediting
    /// each prior balance to `paid` (§4.8 step 1).
    pub fn apply_withdrawal_scan(&self, zeroed: &[(String, AddrInfo)]) -> Result<(), PoolError> {
        let zeroed = zeroed.to_vec();
        self.address_info
            .transaction(move |tt| {
                for (addr, info) in &zeroed {
                    tt.insert(addr.as_bytes(), info.serialize())?;
                }
                Ok(())
            })
            .map_err(tx_err)
    }

    /// Atomically credits `amount` onto `addr`'s confirmed balance.
    pub fn credit_address_balance(&self, addr: &str, amount: u64) -> Result<(), PoolError> {
        let addr = addr.to_string();
        self.address_info
            .transaction(move |tt| {
                let mut info = tt_get_addr_info(tt, &addr)?;
                info.balance += amount;
                tt.insert(addr.as_bytes(), info.serialize())?;
                Ok(())
            })
            .map_err(tx_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_roundtrip() {
        let s = Share { wallet: "abc".into(), diff: 123456, time: 999 };
        assert_eq!(Share::deserialize(&s.serialize()).unwrap(), s);
    }

    #[test]
    fn addr_info_roundtrip() {
        let a = AddrInfo { balance: 1, balance_pending: 2, paid: 3 };
        assert_eq!(AddrInfo::deserialize(&a.serialize()).unwrap(), a);
    }

    #[test]
    fn pending_bals_roundtrip_with_multiple_unconfirmed_txs() {
        let mut bals1 = HashMap::new();
        bals1.insert("addr1".to_string(), 100u64);
        let mut bals2 = HashMap::new();
        bals2.insert("addr2".to_string(), 200u64);
        bals2.insert("addr3".to_string(), 300u64);

        let pb = PendingBals {
            last_height: 42,
            unconfirmed_txs: vec![
                UnconfirmedTx { unlock_height: 10, txn_hash: [1u8; 32], bals: bals1 },
                UnconfirmedTx { unlock_height: 20, txn_hash: [2u8; 32], bals: bals2 },
            ],
        };
        let decoded = PendingBals::deserialize(&pb.serialize()).unwrap();
        assert_eq!(decoded, pb);
    }

    #[test]
    fn store_share_sequence_and_addr_info() {
        let dir = std::env::temp_dir().join(format!("eqf-pool-test-{}", std::process::id()));
        let store = Store::open(&dir).unwrap();
        let id1 = store.append_share(&Share { wallet: "w1".into(), diff: 1, time: 1 }).unwrap();
        let id2 = store.append_share(&Share { wallet: "w2".into(), diff: 2, time: 2 }).unwrap();
        assert!(id2 > id1);

        store.put_addr_info("w1", &AddrInfo { balance: 5, balance_pending: 0, paid: 0 }).unwrap();
        assert_eq!(store.get_addr_info("w1").unwrap().unwrap().balance, 5);
        assert!(store.get_addr_info("unknown").unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
