//! Chain manager: genesis construction, the block-import pipeline, receipt
//! production and persistence.
//!
//! Holds the head pointer and two in-memory indices (`hash -> Block`,
//! `number -> Block`) behind a single reader/writer lock, per spec.md §5's
//! lock-ordering discipline (peer-table -> chain -> mempool); `add_block`
//! takes that lock exclusively for the entire import (validate, execute,
//! commit, index update) so readers never observe a half-imported block.
//! The KV-backed block store underneath is append-only, keyed
//! `block_<decimal-number>`.

use std::collections::HashMap;
use std::sync::Arc;

use kvstore::KvStore;
use parking_lot::RwLock;
use primitives::types::{
    intrinsic_gas, receipts_root, transactions_root, Block, BlockHeader, Receipt, Transaction,
};
use primitives::{Address, Hash, U256};
use state::State;
use thiserror::Error;

const BLOCK_KEY_PREFIX: &str = "block_";

fn block_key(number: u64) -> Vec<u8> {
    format!("{BLOCK_KEY_PREFIX}{number}").into_bytes()
}

fn encode_block(block: &Block) -> Vec<u8> {
    serde_json::to_vec(block).expect("Block always serializes")
}

fn decode_block(bytes: &[u8]) -> Option<Block> {
    serde_json::from_slice(bytes).ok()
}

/// Parameters for deterministic genesis construction, per spec.md §4.6 /
/// S1. Two nodes given the same `GenesisConfig` must produce bit-identical
/// genesis blocks.
#[derive(Debug, Clone)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub gas_limit: u64,
    pub timestamp: i64,
    pub allocations: Vec<(Address, U256)>,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block number {got} does not follow head number {expected}")]
    NumberMismatch { expected: u64, got: u64 },
    #[error("block parent_hash does not match the current head's hash")]
    ParentHashMismatch,
    #[error("block validation failed: {0}")]
    Validation(#[from] validator::ValidationError),
    #[error("proof-of-work validation failed: {0}")]
    Consensus(#[from] consensus::ConsensusError),
    #[error("transaction execution failed: {0}")]
    Vm(#[from] vm::VmError),
    #[error("state error: {0}")]
    State(#[from] state::StateError),
    #[error("key-value store error: {0}")]
    Kv(#[from] kvstore::KvError),
    #[error("cumulative gas used {cumulative} exceeds the block's gas_limit {limit}")]
    GasLimitExceeded { cumulative: u64, limit: u64 },
    #[error("declared gas_used {declared} does not match the {computed} gas actually used")]
    GasUsedMismatch { declared: u64, computed: u64 },
    #[error("declared state_root does not match the root recomputed from re-execution")]
    StateRootMismatch,
    #[error("persisted block {0} has corrupt bytes in the key-value store")]
    CorruptBlock(u64),
}

struct Indices {
    head: Block,
    by_hash: HashMap<Hash, Block>,
    by_number: HashMap<u64, Block>,
}

/// A node's local view of the accepted chain. Cheap to clone (an `Arc`
/// handle) so it can be shared between the P2P peer tasks, the miner loop,
/// and a hypothetical RPC layer.
pub struct Chain {
    kv: Arc<dyn KvStore>,
    chain_id: u64,
    inner: RwLock<Indices>,
}

impl Chain {
    /// Opens the chain backed by `kv`. If `block_0` is already present the
    /// head (and every intervening block) is restored from the store; the
    /// given `genesis` is used only to label the chain ID, since the actual
    /// genesis contents already on disk are authoritative. Otherwise a
    /// fresh genesis is constructed deterministically from `genesis` and
    /// persisted once.
    pub fn open(kv: Arc<dyn KvStore>, genesis: &GenesisConfig) -> Result<Chain, ChainError> {
        match kv.get(&block_key(0))? {
            Some(bytes) => Self::restore(kv, genesis.chain_id, &bytes),
            None => Self::init_genesis(kv, genesis),
        }
    }

    fn restore(kv: Arc<dyn KvStore>, chain_id: u64, genesis_bytes: &[u8]) -> Result<Chain, ChainError> {
        let genesis_block = decode_block(genesis_bytes).ok_or(ChainError::CorruptBlock(0))?;
        let mut by_hash = HashMap::new();
        let mut by_number = HashMap::new();
        by_hash.insert(genesis_block.header.hash, genesis_block.clone());
        by_number.insert(0, genesis_block.clone());
        let mut head = genesis_block;

        let mut number = 1u64;
        while let Some(bytes) = kv.get(&block_key(number))? {
            let block = decode_block(&bytes).ok_or(ChainError::CorruptBlock(number))?;
            by_hash.insert(block.header.hash, block.clone());
            by_number.insert(number, block.clone());
            head = block;
            number += 1;
        }

        log::info!(target: "chainmgr", "restored chain at head #{}", head.header.number);
        Ok(Chain {
            kv,
            chain_id,
            inner: RwLock::new(Indices { head, by_hash, by_number }),
        })
    }

    fn init_genesis(kv: Arc<dyn KvStore>, genesis: &GenesisConfig) -> Result<Chain, ChainError> {
        let mut state = State::new(Hash::ZERO, kv.clone());
        for (address, balance) in &genesis.allocations {
            state.set_balance(address, *balance)?;
        }
        let state_root = state.commit()?;

        let mut header = BlockHeader {
            number: 0,
            parent_hash: Hash::ZERO,
            timestamp: genesis.timestamp,
            state_root,
            tx_root: transactions_root(&[]),
            receipt_root: receipts_root(&[]),
            logs_bloom: Vec::new(),
            gas_limit: genesis.gas_limit,
            gas_used: 0,
            difficulty: U256::from(consensus::MIN_DIFFICULTY),
            nonce: 0,
            hash: Hash::ZERO,
        };
        header.hash = header.compute_hash();

        let block = Block {
            header: header.clone(),
            transactions: Vec::new(),
            receipts: Vec::new(),
        };
        kv.put(&block_key(0), &encode_block(&block))?;
        log::info!(target: "chainmgr", "initialized genesis {:?}", header.hash);

        let mut by_hash = HashMap::new();
        let mut by_number = HashMap::new();
        by_hash.insert(header.hash, block.clone());
        by_number.insert(0, block.clone());
        Ok(Chain {
            kv,
            chain_id: genesis.chain_id,
            inner: RwLock::new(Indices { head: block, by_hash, by_number }),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn head(&self) -> Block {
        self.inner.read().head.clone()
    }

    pub fn head_header(&self) -> BlockHeader {
        self.inner.read().head.header.clone()
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<Block> {
        self.inner.read().by_number.get(&number).cloned()
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// The underlying KV handle. The miner loop uses it to instantiate its
    /// own speculative `State` working copy when assembling a candidate
    /// block, the same way `add_block` instantiates one to re-execute it.
    pub fn kv_handle(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    /// Validates, executes and persists `block`, advancing the head.
    /// Per spec.md §4.6: any failure aborts the import with no change to
    /// the head, indices, or canonical state root. Held under the chain's
    /// exclusive lock for its entire duration.
    pub fn add_block(&self, block: Block, now: i64) -> Result<(), ChainError> {
        let mut inner = self.inner.write();

        validator::validate_block(&block, now)?;

        let expected_number = inner.head.header.number + 1;
        if block.header.number != expected_number {
            return Err(ChainError::NumberMismatch {
                expected: expected_number,
                got: block.header.number,
            });
        }
        if block.header.parent_hash != inner.head.header.hash {
            return Err(ChainError::ParentHashMismatch);
        }

        consensus::validate(&block.header)?;

        let mut state = State::new(inner.head.header.state_root, self.kv.clone());
        let mut receipts: Vec<Receipt> = Vec::with_capacity(block.transactions.len());
        let mut cumulative_gas: u64 = 0;

        for (index, tx) in block.transactions.iter().enumerate() {
            let result = vm::execute_transaction(&mut state, tx)?;
            cumulative_gas += result.gas_used;
            if cumulative_gas > block.header.gas_limit {
                return Err(ChainError::GasLimitExceeded {
                    cumulative: cumulative_gas,
                    limit: block.header.gas_limit,
                });
            }

            let logs = result
                .logs
                .into_iter()
                .enumerate()
                .map(|(log_index, mut log)| {
                    log.block_number = block.header.number;
                    log.tx_hash = tx.hash;
                    log.tx_index = index as u64;
                    log.block_hash = block.header.hash;
                    log.index = log_index as u64;
                    log
                })
                .collect();

            receipts.push(Receipt {
                tx_hash: tx.hash,
                tx_index: index as u64,
                block_hash: block.header.hash,
                block_number: block.header.number,
                from: tx.from,
                to: tx.to,
                contract_address: result.contract_address,
                gas_used: result.gas_used,
                cumulative_gas_used: cumulative_gas,
                status: result.status,
                logs,
            });
        }

        // The source's `ValidateBlock` summed `tx.gas_limit` against
        // `header.gas_used`, which diverges for any non-trivial execution.
        // Per spec.md §9's correction, `gas_used` is authoritative and is
        // checked against the sum of *actual* `receipt.gas_used`.
        if cumulative_gas != block.header.gas_used {
            return Err(ChainError::GasUsedMismatch {
                declared: block.header.gas_used,
                computed: cumulative_gas,
            });
        }

        let computed_state_root = state.commit()?;
        if computed_state_root != block.header.state_root {
            return Err(ChainError::StateRootMismatch);
        }

        let mut final_block = block;
        final_block.receipts = receipts;

        self.kv
            .put(&block_key(final_block.header.number), &encode_block(&final_block))?;

        inner.by_hash.insert(final_block.header.hash, final_block.clone());
        inner.by_number.insert(final_block.header.number, final_block.clone());
        let number = final_block.header.number;
        let hash = final_block.header.hash;
        inner.head = final_block;
        log::info!(target: "chainmgr", "imported block #{number} {hash:?}");
        Ok(())
    }

    fn read_only_state(&self) -> State {
        let inner = self.inner.read();
        State::new(inner.head.header.state_root, self.kv.clone())
    }

    pub fn get_balance(&self, address: &Address) -> Result<U256, ChainError> {
        Ok(self.read_only_state().get_balance(address)?)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.read_only_state().get_nonce(address)?)
    }

    pub fn get_code(&self, address: &Address) -> Result<Vec<u8>, ChainError> {
        Ok(self.read_only_state().get_code(address)?)
    }

    pub fn get_storage_at(&self, address: &Address, key: &Hash) -> Result<Hash, ChainError> {
        Ok(self.read_only_state().get_storage(address, key)?)
    }
}

/// `21000 + 68 * len(tx.data)`, per spec.md §4.6.
pub fn estimate_gas(tx: &Transaction) -> u64 {
    intrinsic_gas(&tx.data)
}
