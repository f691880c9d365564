//! Pending-transaction pool: admits, dedupes and surfaces unmined
//! transactions for the miner loop (`minerloop`) to drain and for the chain
//! manager (`chainmgr`) to remove from once mined.
//!
//! `from -> [hash]` is a secondary index only (insertion order, not
//! nonce-sorted); `pending()` itself is an unordered snapshot per spec.md
//! §4.5.

use std::collections::HashMap;

use parking_lot::RwLock;
use primitives::types::Transaction;
use primitives::{Address, Hash};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction {0:?} is already in the pool")]
    DuplicateTransaction(Hash),
    #[error("transaction rejected by policy: {0}")]
    Rejected(#[from] validator::ValidationError),
}

#[derive(Default)]
struct Inner {
    by_hash: HashMap<Hash, Transaction>,
    by_from: HashMap<Address, Vec<Hash>>,
}

/// Thread-safe pending-transaction pool. One lock guards both indices so
/// they never observe each other mid-mutation; reads (`get`/`pending`/
/// `size`) take only a shared lock.
#[derive(Default)]
pub struct Pool {
    inner: RwLock<Inner>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool::default()
    }

    /// Admits `tx`: rejects a duplicate hash, then runs it through
    /// [`validator::validate_transaction`] (signature recovery included)
    /// before it ever enters either index.
    pub fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        {
            let inner = self.inner.read();
            if inner.by_hash.contains_key(&tx.hash) {
                return Err(PoolError::DuplicateTransaction(tx.hash));
            }
        }
        validator::validate_transaction(&tx)?;

        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&tx.hash) {
            return Err(PoolError::DuplicateTransaction(tx.hash));
        }
        inner.by_from.entry(tx.from).or_default().push(tx.hash);
        inner.by_hash.insert(tx.hash, tx);
        Ok(())
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// An unordered snapshot of every pending transaction.
    pub fn pending(&self) -> Vec<Transaction> {
        self.inner.read().by_hash.values().cloned().collect()
    }

    /// Removes `hash` from both indices. No-op if absent (e.g. the chain
    /// manager removing a transaction that was never resubmitted locally).
    pub fn remove(&self, hash: &Hash) {
        let mut inner = self.inner.write();
        if let Some(tx) = inner.by_hash.remove(hash) {
            if let Some(hashes) = inner.by_from.get_mut(&tx.from) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    inner.by_from.remove(&tx.from);
                }
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// Transactions previously submitted by `from`, in admission order.
    pub fn by_sender(&self, from: &Address) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .by_from
            .get(from)
            .into_iter()
            .flatten()
            .filter_map(|h| inner.by_hash.get(h).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives::crypto::{self, sign};
    use primitives::U256;

    fn signed_tx(secret: &[u8; 32], nonce: u64) -> Transaction {
        let from = crypto::address_from_secret(secret).unwrap();
        let to = Some(Address::from_low_u64_be(9));
        let value = U256::from(1u64);
        let data = Vec::new();
        let preimage =
            Transaction::signing_preimage(nonce, to, value, 21_000, U256::from(1000u64), &data);
        let hash = primitives::sha256(&preimage);
        let (v, r, s) = sign(secret, &hash).unwrap();
        Transaction {
            nonce,
            gas_price: U256::from(1000u64),
            gas_limit: 21_000,
            to,
            value,
            data,
            v,
            r,
            s,
            hash,
            from,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let pool = Pool::new();
        let tx = signed_tx(&[1u8; 32], 0);
        pool.add(tx.clone()).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.get(&tx.hash), Some(tx));
    }

    #[test]
    fn duplicate_hash_is_rejected() {
        let pool = Pool::new();
        let tx = signed_tx(&[1u8; 32], 0);
        pool.add(tx.clone()).unwrap();
        let err = pool.add(tx.clone()).unwrap_err();
        assert_eq!(err, PoolError::DuplicateTransaction(tx.hash));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let pool = Pool::new();
        let mut tx = signed_tx(&[1u8; 32], 0);
        tx.from = Address::from_low_u64_be(0xdead);
        assert!(pool.add(tx).is_err());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn remove_clears_both_indices() {
        let pool = Pool::new();
        let tx = signed_tx(&[1u8; 32], 0);
        pool.add(tx.clone()).unwrap();
        pool.remove(&tx.hash);
        assert_eq!(pool.size(), 0);
        assert!(pool.by_sender(&tx.from).is_empty());
    }

    #[test]
    fn by_sender_returns_insertion_order() {
        let pool = Pool::new();
        let tx0 = signed_tx(&[2u8; 32], 0);
        let tx1 = signed_tx(&[2u8; 32], 1);
        pool.add(tx0.clone()).unwrap();
        pool.add(tx1.clone()).unwrap();
        assert_eq!(pool.by_sender(&tx0.from), vec![tx0, tx1]);
    }
}
