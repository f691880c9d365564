//! Pure, stateless policy checks applied to transactions and blocks before
//! they are admitted to the mempool (`txpool`) or imported (`chainmgr`).
//!
//! Nothing in this crate touches state, the KV store, or the network; every
//! function is a pure predicate over its argument, which is what makes it
//! independently unit-testable and safe to call from both the mempool's
//! synchronous admission path and the chain manager's import pipeline.

use ethereum_types::U256;
use primitives::crypto::{self, CryptoError};
use primitives::types::{Block, Transaction};
use primitives::Address;
use thiserror::Error;

/// Minimum `gas_price` a transaction must offer, per spec.md §4.10.
pub const MIN_GAS_PRICE: u64 = 1000;
/// Maximum `gas_limit` a transaction or block header may declare.
pub const MAX_GAS_LIMIT: u64 = 10_000_000;
/// Maximum serialized transaction size: 128 KiB.
pub const MAX_TX_SIZE_BYTES: usize = 128 * 1024;
/// Maximum serialized block size: 1 MiB.
pub const MAX_BLOCK_SIZE_BYTES: usize = 1024 * 1024;
/// A block's timestamp may not be more than this many seconds ahead of the
/// validator's wall clock.
pub const MAX_FUTURE_DRIFT_SECS: i64 = 900;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("gas_price {0} is below the floor of {MIN_GAS_PRICE}")]
    GasPriceTooLow(U256),
    #[error("gas_limit {0} is zero or exceeds the maximum of {MAX_GAS_LIMIT}")]
    InvalidGasLimit(u64),
    #[error("sender address is the zero address")]
    ZeroFromAddress,
    #[error("signature failed to recover to the declared sender")]
    InvalidSignature,
    #[error("transaction serialized size {got} exceeds the maximum of {max}")]
    TransactionTooLarge { got: usize, max: usize },
    #[error("block gas_limit {0} exceeds the maximum of {MAX_GAS_LIMIT}")]
    BlockGasLimitTooHigh(u64),
    #[error("block gas_used {gas_used} exceeds its gas_limit {gas_limit}")]
    GasUsedExceedsLimit { gas_used: u64, gas_limit: u64 },
    #[error("block timestamp {timestamp} is more than {MAX_FUTURE_DRIFT_SECS}s ahead of now ({now})")]
    TimestampTooFarInFuture { timestamp: i64, now: i64 },
    #[error("block serialized size {got} exceeds the maximum of {max}")]
    BlockTooLarge { got: usize, max: usize },
    #[error("transaction {index} in block failed validation: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
    #[error("a reward transaction (from the zero address) may only appear at index 0")]
    UnexpectedRewardTransaction { index: usize },
}

/// The miner loop's synthetic per-block subsidy (spec.md §4.7) is tagged by
/// `from == zero address`: it has no real signer to recover, so it is
/// recognized structurally instead and exempted from the ordinary
/// transaction policy (which it could never pass: `gas_price: 0` is below
/// the floor, and there is no key to produce a real signature for).
pub fn is_reward_transaction(tx: &Transaction) -> bool {
    tx.from.is_zero()
}

fn recover_signer(tx: &Transaction) -> Result<Address, CryptoError> {
    crypto::recover(&tx.hash, tx.v, tx.r, tx.s)
}

/// Checks spec.md §4.10's per-transaction policy. Does not recompute or
/// trust `tx.hash`/`tx.from` — only exercises them against the signature.
pub fn validate_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.gas_price < U256::from(MIN_GAS_PRICE) {
        return Err(ValidationError::GasPriceTooLow(tx.gas_price));
    }
    if tx.gas_limit == 0 || tx.gas_limit > MAX_GAS_LIMIT {
        return Err(ValidationError::InvalidGasLimit(tx.gas_limit));
    }
    // `tx.value` is a `U256`: negative values are not representable, so the
    // spec's "value >= 0" check is a structural guarantee, not a runtime one.
    if tx.from.is_zero() {
        return Err(ValidationError::ZeroFromAddress);
    }
    // `tx.to` is `Option<Address>`; when present it is, by construction of
    // the `Address` (`H160`) type, exactly 20 bytes. Nothing further to check.
    match recover_signer(tx) {
        Ok(recovered) if recovered == tx.from => {}
        _ => return Err(ValidationError::InvalidSignature),
    }
    let size = serde_json::to_vec(tx).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_TX_SIZE_BYTES {
        return Err(ValidationError::TransactionTooLarge {
            got: size,
            max: MAX_TX_SIZE_BYTES,
        });
    }
    Ok(())
}

/// Minimal shape check for the one reward transaction a block may carry at
/// index 0: no signature to verify, but its numeric shape is still fixed.
fn validate_reward_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.gas_limit == 0 || tx.gas_limit > MAX_GAS_LIMIT {
        return Err(ValidationError::InvalidGasLimit(tx.gas_limit));
    }
    Ok(())
}

/// Checks spec.md §4.10's per-block policy, including that every contained
/// transaction independently passes [`validate_transaction`], except a
/// reward transaction at index 0 (see [`is_reward_transaction`]), which gets
/// the lighter [`validate_reward_transaction`] shape check instead.
pub fn validate_block(block: &Block, now: i64) -> Result<(), ValidationError> {
    let header = &block.header;
    if header.gas_limit > MAX_GAS_LIMIT {
        return Err(ValidationError::BlockGasLimitTooHigh(header.gas_limit));
    }
    if header.gas_used > header.gas_limit {
        return Err(ValidationError::GasUsedExceedsLimit {
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
        });
    }
    if header.timestamp > now + MAX_FUTURE_DRIFT_SECS {
        return Err(ValidationError::TimestampTooFarInFuture {
            timestamp: header.timestamp,
            now,
        });
    }
    let size = serde_json::to_vec(block).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_BLOCK_SIZE_BYTES {
        return Err(ValidationError::BlockTooLarge {
            got: size,
            max: MAX_BLOCK_SIZE_BYTES,
        });
    }
    for (index, tx) in block.transactions.iter().enumerate() {
        if is_reward_transaction(tx) {
            if index != 0 {
                return Err(ValidationError::UnexpectedRewardTransaction { index });
            }
            validate_reward_transaction(tx).map_err(|source| ValidationError::InvalidTransaction {
                index,
                source: Box::new(source),
            })?;
            continue;
        }
        validate_transaction(tx).map_err(|source| ValidationError::InvalidTransaction {
            index,
            source: Box::new(source),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives::types::BlockHeader;
    use primitives::{crypto::sign, Hash};

    fn signed_tx(secret: &[u8; 32], nonce: u64, gas_price: U256, gas_limit: u64) -> Transaction {
        let from = crypto::address_from_secret(secret).unwrap();
        let to = Some(Address::from_low_u64_be(9));
        let value = U256::from(1u64);
        let data = Vec::new();
        let preimage = Transaction::signing_preimage(nonce, to, value, gas_limit, gas_price, &data);
        let hash = primitives::sha256(&preimage);
        let (v, r, s) = sign(secret, &hash).unwrap();
        Transaction {
            nonce,
            gas_price,
            gas_limit,
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

    fn secret(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn well_formed_signed_tx_passes() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 21_000);
        assert!(validate_transaction(&tx).is_ok());
    }

    #[test]
    fn gas_price_below_floor_is_rejected() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE - 1), 21_000);
        assert_eq!(
            validate_transaction(&tx),
            Err(ValidationError::GasPriceTooLow(U256::from(MIN_GAS_PRICE - 1)))
        );
    }

    #[test]
    fn zero_gas_limit_is_rejected() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 0);
        assert_eq!(validate_transaction(&tx), Err(ValidationError::InvalidGasLimit(0)));
    }

    #[test]
    fn oversized_gas_limit_is_rejected() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), MAX_GAS_LIMIT + 1);
        assert_eq!(
            validate_transaction(&tx),
            Err(ValidationError::InvalidGasLimit(MAX_GAS_LIMIT + 1))
        );
    }

    #[test]
    fn tampered_from_address_fails_signature_check() {
        let mut tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 21_000);
        tx.from = Address::from_low_u64_be(0xdead);
        assert_eq!(validate_transaction(&tx), Err(ValidationError::InvalidSignature));
    }

    #[test]
    fn zero_from_address_is_rejected_before_signature_check() {
        let mut tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 21_000);
        tx.from = Address::zero();
        assert_eq!(validate_transaction(&tx), Err(ValidationError::ZeroFromAddress));
    }

    fn header(gas_limit: u64, gas_used: u64, timestamp: i64) -> BlockHeader {
        BlockHeader {
            number: 1,
            parent_hash: Hash::ZERO,
            timestamp,
            state_root: Hash::ZERO,
            tx_root: Hash::ZERO,
            receipt_root: Hash::ZERO,
            logs_bloom: Vec::new(),
            gas_limit,
            gas_used,
            difficulty: U256::from(1000u64),
            nonce: 0,
            hash: Hash::ZERO,
        }
    }

    #[test]
    fn block_with_gas_used_over_limit_is_rejected() {
        let block = Block {
            header: header(21_000, 21_001, 0),
            transactions: Vec::new(),
            receipts: Vec::new(),
        };
        assert_eq!(
            validate_block(&block, 0),
            Err(ValidationError::GasUsedExceedsLimit {
                gas_used: 21_001,
                gas_limit: 21_000
            })
        );
    }

    #[test]
    fn block_timestamp_too_far_in_future_is_rejected() {
        let block = Block {
            header: header(21_000, 0, 1_000_000),
            transactions: Vec::new(),
            receipts: Vec::new(),
        };
        assert_eq!(
            validate_block(&block, 0),
            Err(ValidationError::TimestampTooFarInFuture {
                timestamp: 1_000_000,
                now: 0
            })
        );
    }

    fn reward_tx(to: Address) -> Transaction {
        Transaction {
            nonce: 0,
            gas_price: U256::zero(),
            gas_limit: 21_000,
            to: Some(to),
            value: U256::from(2_000_000_000_000_000_000u128),
            data: Vec::new(),
            v: 0,
            r: U256::zero(),
            s: U256::zero(),
            hash: Hash::ZERO,
            from: Address::zero(),
        }
    }

    #[test]
    fn reward_transaction_at_index_zero_is_accepted_without_a_signature() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 21_000);
        let block = Block {
            header: header(42_000, 42_000, 0),
            transactions: vec![reward_tx(Address::from_low_u64_be(0xAA)), tx],
            receipts: Vec::new(),
        };
        assert!(validate_block(&block, 0).is_ok());
    }

    #[test]
    fn reward_transaction_outside_index_zero_is_rejected() {
        let tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE), 21_000);
        let block = Block {
            header: header(42_000, 42_000, 0),
            transactions: vec![tx, reward_tx(Address::from_low_u64_be(0xAA))],
            receipts: Vec::new(),
        };
        assert_eq!(
            validate_block(&block, 0),
            Err(ValidationError::UnexpectedRewardTransaction { index: 1 })
        );
    }

    #[test]
    fn block_containing_an_invalid_tx_is_rejected() {
        let bad_tx = signed_tx(&secret(1), 0, U256::from(MIN_GAS_PRICE - 1), 21_000);
        let block = Block {
            header: header(8_000_000, 0, 0),
            transactions: vec![bad_tx],
            receipts: Vec::new(),
        };
        assert!(matches!(
            validate_block(&block, 0),
            Err(ValidationError::InvalidTransaction { index: 0, .. })
        ));
    }
}
