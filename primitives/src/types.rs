//! Shared domain types: accounts, transactions, blocks, receipts and logs.
//!
//! These are used by every subsystem above the state engine (`vm`,
//! `chainmgr`, `txpool`, `validator`, `netp2p`) and live here, alongside the
//! hash/address primitives, rather than duplicated per crate — mirroring
//! how the teacher keeps its own shared block/transaction/receipt shapes in
//! a single `ethcore-types` crate underneath everything else.

use rlp::{Rlp, RlpStream};
use serde::{Deserialize, Serialize};

use crate::encoding::{
    push_address_or_zero, push_bytes, push_hash, push_i64, push_u256_fixed, push_u256_variable,
    push_u64,
};
use crate::{keccak256, sha256, Address, Hash, U256};

/// On-chain account record. Empty (all four fields zero/empty) accounts are
/// indistinguishable from absent ones in the state trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: Hash,
    pub storage_root: Hash,
}

impl Account {
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && self.code_hash.is_zero()
            && self.storage_root.is_zero()
    }

    pub fn has_code(&self) -> bool {
        !self.code_hash.is_zero()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        stream.begin_list(4);
        stream.append(&self.nonce);
        let mut balance_bytes = [0u8; 32];
        self.balance.to_big_endian(&mut balance_bytes);
        stream.append(&balance_bytes.as_slice());
        stream.append(&self.code_hash.as_bytes().as_slice());
        stream.append(&self.storage_root.as_bytes().as_slice());
        stream.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Option<Account> {
        let rlp = Rlp::new(bytes);
        let nonce: u64 = rlp.val_at(0).ok()?;
        let balance_bytes: Vec<u8> = rlp.val_at(1).ok()?;
        let code_hash_bytes: Vec<u8> = rlp.val_at(2).ok()?;
        let storage_root_bytes: Vec<u8> = rlp.val_at(3).ok()?;
        Some(Account {
            nonce,
            balance: U256::from_big_endian(&balance_bytes),
            code_hash: Hash::from_slice(&code_hash_bytes),
            storage_root: Hash::from_slice(&storage_root_bytes),
        })
    }
}

/// A single signed transaction. `from` is always derived from signature
/// recovery and must never be trusted verbatim off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub v: u8,
    pub r: U256,
    pub s: U256,
    pub hash: Hash,
    pub from: Address,
}

impl Transaction {
    /// The canonical preimage bytes hashed to produce `Transaction::hash`:
    /// `nonce || to || value || gas_limit || gas_price || data`, with `to`
    /// encoded as 20 zero bytes when absent.
    pub fn signing_preimage(
        nonce: u64,
        to: Option<Address>,
        value: U256,
        gas_limit: u64,
        gas_price: U256,
        data: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u64(&mut buf, nonce);
        push_address_or_zero(&mut buf, to);
        push_u256_fixed(&mut buf, value);
        push_u64(&mut buf, gas_limit);
        push_u256_fixed(&mut buf, gas_price);
        push_bytes(&mut buf, data);
        buf
    }

    pub fn compute_hash(&self) -> Hash {
        sha256(&Self::signing_preimage(
            self.nonce,
            self.to,
            self.value,
            self.gas_limit,
            self.gas_price,
            &self.data,
        ))
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// `21000 + 68 * len(data)`, the minimum gas a transaction must supply.
    pub fn intrinsic_gas(&self) -> u64 {
        intrinsic_gas(&self.data)
    }
}

pub fn intrinsic_gas(data: &[u8]) -> u64 {
    21_000 + 68 * data.len() as u64
}

/// Deterministic (simplified, non-RLP) contract-creation address:
/// `last20(Keccak256(creator || big-endian nonce bytes))`. The spec
/// deliberately deviates from strict Ethereum RLP encoding here for
/// determinism; see the design notes.
pub fn derive_contract_address(creator: Address, nonce: u64) -> Address {
    let mut buf = Vec::with_capacity(20 + 8);
    buf.extend_from_slice(creator.as_bytes());
    push_u64(&mut buf, nonce);
    let digest = keccak256(&buf);
    Address::from_slice(&digest.as_bytes()[12..])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: Hash,
    pub tx_index: u64,
    pub block_hash: Hash,
    pub index: u64,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub tx_index: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub status: u8,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub parent_hash: Hash,
    pub timestamp: i64,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub logs_bloom: Vec<u8>,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub difficulty: U256,
    pub nonce: u64,
    pub hash: Hash,
}

impl BlockHeader {
    /// The canonical preimage bytes hashed to produce `BlockHeader::hash`,
    /// per spec.md §6: fixed big-endian fields in this exact order, with
    /// `difficulty` encoded at its minimal (variable) width. `logs_bloom`
    /// is intentionally excluded from the preimage.
    pub fn signing_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u64(&mut buf, self.number);
        push_hash(&mut buf, &self.parent_hash);
        push_i64(&mut buf, self.timestamp);
        push_hash(&mut buf, &self.state_root);
        push_hash(&mut buf, &self.tx_root);
        push_hash(&mut buf, &self.receipt_root);
        push_u64(&mut buf, self.gas_limit);
        push_u64(&mut buf, self.gas_used);
        push_u256_variable(&mut buf, self.difficulty);
        push_u64(&mut buf, self.nonce);
        buf
    }

    pub fn compute_hash(&self) -> Hash {
        sha256(&self.signing_preimage())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
}

/// A simple deterministic root over an ordered list of canonical item
/// bytes: `SHA256(len(n) || item_0 || len(item_0) || item_1 || ...)`. The
/// spec leaves the exact `tx_root`/`receipt_root` construction unspecified
/// (unlike the state/storage roots, which are MPT roots by definition);
/// this is documented as a design decision rather than an MPT, since
/// neither root is ever looked up by key, only compared for equality.
pub fn list_root(items: &[Vec<u8>]) -> Hash {
    let mut buf = Vec::new();
    push_u64(&mut buf, items.len() as u64);
    for item in items {
        push_bytes(&mut buf, item);
    }
    sha256(&buf)
}

pub fn transactions_root(transactions: &[Transaction]) -> Hash {
    list_root(
        &transactions
            .iter()
            .map(|tx| tx.hash.as_bytes().to_vec())
            .collect::<Vec<_>>(),
    )
}

pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    list_root(
        &receipts
            .iter()
            .map(|r| {
                let mut buf = Vec::new();
                push_hash(&mut buf, &r.tx_hash);
                push_u64(&mut buf, r.gas_used);
                buf.push(r.status);
                buf
            })
            .collect::<Vec<_>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_roundtrips_through_rlp() {
        let account = Account {
            nonce: 7,
            balance: U256::from(12345u64),
            code_hash: Hash::from_slice(&[1u8; 32]),
            storage_root: Hash::from_slice(&[2u8; 32]),
        };
        let decoded = Account::decode(&account.encode()).unwrap();
        assert_eq!(account, decoded);
    }

    #[test]
    fn empty_account_has_zero_fields() {
        assert!(Account::default().is_empty());
    }

    #[test]
    fn intrinsic_gas_matches_formula() {
        assert_eq!(intrinsic_gas(&[]), 21_000);
        assert_eq!(intrinsic_gas(&[0u8; 10]), 21_000 + 680);
    }

    #[test]
    fn contract_address_is_deterministic_per_nonce() {
        let creator = Address::from_low_u64_be(1);
        let a = derive_contract_address(creator, 0);
        let b = derive_contract_address(creator, 1);
        assert_ne!(a, b);
        assert_eq!(a, derive_contract_address(creator, 0));
    }

    #[test]
    fn header_hash_changes_when_nonce_flips() {
        let mut header = BlockHeader {
            number: 1,
            parent_hash: Hash::ZERO,
            timestamp: 0,
            state_root: Hash::ZERO,
            tx_root: Hash::ZERO,
            receipt_root: Hash::ZERO,
            logs_bloom: Vec::new(),
            gas_limit: 8_000_000,
            gas_used: 0,
            difficulty: U256::from(1000u64),
            nonce: 42,
            hash: Hash::ZERO,
        };
        let h1 = header.compute_hash();
        header.nonce = 43;
        let h2 = header.compute_hash();
        assert_ne!(h1, h2);
    }
}
