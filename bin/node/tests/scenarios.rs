//! End-to-end scenarios S1-S6 from spec.md §8, exercised against the real
//! crates this binary wires together rather than against the process
//! itself.

use std::sync::Arc;
use std::time::Duration;

use chainmgr::{Chain, ChainError, GenesisConfig};
use kvstore::MemoryKv;
use minerloop::{reward_transaction, BLOCK_REWARD};
use netp2p::{NetworkId, Server};
use primitives::crypto::{self, sign};
use primitives::types::Transaction;
use primitives::{Address, Hash, U256};
use tokio_util::sync::CancellationToken;
use txpool::Pool;

fn genesis_with_allocation(address: Address, balance: U256) -> GenesisConfig {
    GenesisConfig {
        chain_id: 1337,
        gas_limit: 8_000_000,
        timestamp: 0,
        allocations: vec![(address, balance)],
    }
}

fn wallet_address() -> Address {
    crypto::address_from_secret(&[7u8; 32]).unwrap()
}

fn signed_transfer(secret: &[u8; 32], nonce: u64, to: Address, value: U256, gas_price: U256) -> Transaction {
    let from = crypto::address_from_secret(secret).unwrap();
    let data = Vec::new();
    let preimage =
        Transaction::signing_preimage(nonce, Some(to), value, 21_000, gas_price, &data);
    let hash = primitives::sha256(&preimage);
    let (v, r, s) = sign(secret, &hash).unwrap();
    Transaction {
        nonce,
        gas_price,
        gas_limit: 21_000,
        to: Some(to),
        value,
        data,
        v,
        r,
        s,
        hash,
        from,
    }
}

fn mine_one_block(chain: &Chain, pool: &Pool, miner: Address) -> primitives::types::Block {
    for _ in 0..64 {
        if let Some(block) = minerloop_test_support::assemble(chain, pool, miner) {
            return block;
        }
    }
    panic!("mining at minimum difficulty did not complete in 64 attempts");
}

/// `minerloop::assemble_and_mine` is private; scenario tests reproduce its
/// observable behavior via the public crate surface (`Miner::mine_one` is
/// also private) by directly driving the same assembly the miner loop does,
/// through a one-off synchronous task.
mod minerloop_test_support {
    use super::*;
    use primitives::types::{receipts_root, transactions_root, BlockHeader, Receipt};
    use state::State;

    pub fn assemble(chain: &Chain, pool: &Pool, miner_address: Address) -> Option<primitives::types::Block> {
        let head = chain.head_header();
        let mut pending = pool.pending();
        pending.sort_by_key(|tx| tx.nonce);

        let mut transactions = Vec::with_capacity(pending.len() + 1);
        transactions.push(reward_transaction(miner_address));
        transactions.extend(pending);

        let mut state = State::new(head.state_root, chain.kv_handle());
        let mut included = Vec::new();
        let mut receipts: Vec<Receipt> = Vec::new();
        let mut cumulative_gas = 0u64;

        for tx in transactions {
            let snapshot = state.snapshot();
            match vm::execute_transaction(&mut state, &tx) {
                Ok(result) => {
                    if cumulative_gas + result.gas_used > head.gas_limit {
                        state.revert(snapshot);
                        break;
                    }
                    cumulative_gas += result.gas_used;
                    receipts.push(Receipt {
                        tx_hash: tx.hash,
                        tx_index: included.len() as u64,
                        block_hash: Hash::ZERO,
                        block_number: head.number + 1,
                        from: tx.from,
                        to: tx.to,
                        contract_address: result.contract_address,
                        gas_used: result.gas_used,
                        cumulative_gas_used: cumulative_gas,
                        status: result.status,
                        logs: Vec::new(),
                    });
                    included.push(tx);
                }
                Err(_) => {
                    state.revert(snapshot);
                }
            }
        }

        let state_root = state.commit().unwrap();
        let now = chrono::Utc::now().timestamp();
        let mut header = BlockHeader {
            number: head.number + 1,
            parent_hash: head.hash,
            timestamp: now,
            state_root,
            tx_root: transactions_root(&included),
            receipt_root: receipts_root(&receipts),
            logs_bloom: Vec::new(),
            gas_limit: head.gas_limit,
            gas_used: cumulative_gas,
            difficulty: consensus::retarget(head.number + 1, &head, now),
            nonce: 0,
            hash: Hash::ZERO,
        };

        match consensus::mine(&mut header) {
            Ok(()) => Some(primitives::types::Block {
                header,
                transactions: included,
                receipts: Vec::new(),
            }),
            Err(_) => None,
        }
    }
}

#[test]
fn s1_genesis_determinism() {
    let address = Address::from_low_u64_be(0x742d35cc);
    let balance = U256::from(1_000_000_000_000_000_000u128);

    let chain_a = Chain::open(Arc::new(MemoryKv::new()), &genesis_with_allocation(address, balance)).unwrap();
    let chain_b = Chain::open(Arc::new(MemoryKv::new()), &genesis_with_allocation(address, balance)).unwrap();

    assert_eq!(chain_a.head_header().hash, chain_b.head_header().hash);
    assert_eq!(chain_a.head_header().state_root, chain_b.head_header().state_root);
    assert_eq!(chain_a.get_balance(&address).unwrap(), balance);
}

#[test]
fn s2_transaction_admission() {
    let secret = [7u8; 32];
    let wallet = wallet_address();
    let genesis = genesis_with_allocation(wallet, U256::from(1_000_000_000_000_000_000u128));
    let _chain = Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap();
    let pool = Pool::new();

    let tx = signed_transfer(
        &secret,
        0,
        Address::from_low_u64_be(1),
        U256::from(100_000_000_000_000_000u128),
        U256::from(20_000_000_000u64),
    );

    pool.add(tx.clone()).unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.get(&tx.hash), Some(tx.clone()));

    let err = pool.add(tx.clone()).unwrap_err();
    assert_eq!(err, txpool::PoolError::DuplicateTransaction(tx.hash));
}

#[test]
fn s3_mine_and_apply() {
    let secret = [7u8; 32];
    let wallet = wallet_address();
    let recipient = Address::from_low_u64_be(1);
    let miner_address = Address::from_low_u64_be(0xAAAA);
    let gas_price = U256::from(20_000_000_000u64);
    let value = U256::from(100_000_000_000_000_000u128);

    let genesis = genesis_with_allocation(wallet, U256::from(1_000_000_000_000_000_000u128));
    let chain = Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap();
    let pool = Pool::new();

    let tx = signed_transfer(&secret, 0, recipient, value, gas_price);
    pool.add(tx.clone()).unwrap();

    let block = mine_one_block(&chain, &pool, miner_address);
    assert_eq!(block.transactions.len(), 2);
    assert!(validator::is_reward_transaction(&block.transactions[0]));
    assert_eq!(block.transactions[1].hash, tx.hash);

    chain.add_block(block, chrono::Utc::now().timestamp() + 10).unwrap();
    pool.remove(&tx.hash);

    assert_eq!(chain.head_header().number, 1);
    assert_eq!(chain.get_balance(&recipient).unwrap(), value);

    // A plain transfer's gas_used equals its intrinsic gas (21_000, no call
    // data), so the fee collected from the sender is gas_price * 21_000.
    let expected_wallet_balance =
        U256::from(1_000_000_000_000_000_000u128) - value - gas_price * U256::from(21_000u64);
    assert_eq!(chain.get_balance(&wallet).unwrap(), expected_wallet_balance);
    assert_eq!(chain.get_balance(&miner_address).unwrap(), U256::from(BLOCK_REWARD));
    assert_eq!(pool.size(), 0);
}

#[test]
fn s4_pow_tamper_detection() {
    let miner_address = Address::from_low_u64_be(0xAAAA);
    let genesis = GenesisConfig {
        chain_id: 1337,
        gas_limit: 8_000_000,
        timestamp: 0,
        allocations: Vec::new(),
    };
    let chain = Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap();
    let pool = Pool::new();

    let mut block = mine_one_block(&chain, &pool, miner_address);
    // Flip the nonce until the header actually fails the PoW check (a
    // single flip passes by chance roughly 1 in `MIN_DIFFICULTY`, so search
    // rather than assume the first flip is invalid).
    let original_nonce = block.header.nonce;
    let mut offset = 1u64;
    loop {
        block.header.nonce = original_nonce ^ offset;
        block.header.hash = block.header.compute_hash();
        if consensus::validate(&block.header).is_err() {
            break;
        }
        offset += 1;
    }

    let head_before = chain.head_header();
    let err = chain.add_block(block, chrono::Utc::now().timestamp() + 10).unwrap_err();
    assert!(matches!(err, ChainError::Consensus(_)));
    assert_eq!(chain.head_header().hash, head_before.hash);
}

#[tokio::test]
async fn s5_sync_catch_up() {
    let genesis = GenesisConfig {
        chain_id: 1337,
        gas_limit: 8_000_000,
        timestamp: 0,
        allocations: Vec::new(),
    };
    let miner_address = Address::from_low_u64_be(0xAAAA);

    let chain_a = Arc::new(Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap());
    let pool_a = Arc::new(Pool::new());
    for _ in 0..5 {
        let block = mine_one_block(&chain_a, &pool_a, miner_address);
        chain_a.add_block(block, chrono::Utc::now().timestamp() + 10).unwrap();
    }
    assert_eq!(chain_a.head_header().number, 5);

    let genesis_hash = chain_a.get_block_by_number(0).unwrap().header.hash;
    let network = NetworkId {
        chain_id: 1337,
        genesis_hash,
    };

    let cancel = CancellationToken::new();
    let server_a = Server::new(chain_a.clone(), pool_a.clone(), network, 50, cancel.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    {
        let server_a = server_a.clone();
        tokio::spawn(async move {
            let _ = server_a.serve_listener(listener).await;
        });
    }

    let chain_b = Arc::new(Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap());
    let pool_b = Arc::new(Pool::new());
    let server_b = Server::new(chain_b.clone(), pool_b.clone(), network, 50, cancel.clone());
    server_b.clone().connect_to(&local_addr.to_string()).await;

    // Give both sides time to handshake, sync-request and import.
    for _ in 0..50 {
        if chain_b.head_header().number == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(chain_b.head_header().hash, chain_a.head_header().hash);
}

#[tokio::test]
async fn s6_chain_id_mismatch() {
    let genesis = GenesisConfig {
        chain_id: 1337,
        gas_limit: 8_000_000,
        timestamp: 0,
        allocations: Vec::new(),
    };
    let other_genesis = GenesisConfig {
        chain_id: 9999,
        gas_limit: 8_000_000,
        timestamp: 0,
        allocations: Vec::new(),
    };

    let chain_a = Arc::new(Chain::open(Arc::new(MemoryKv::new()), &genesis).unwrap());
    let chain_b = Arc::new(Chain::open(Arc::new(MemoryKv::new()), &other_genesis).unwrap());

    let cancel = CancellationToken::new();
    let server_a = Server::new(
        chain_a.clone(),
        Arc::new(Pool::new()),
        NetworkId { chain_id: 1337, genesis_hash: chain_a.head_header().hash },
        50,
        cancel.clone(),
    );
    let server_b = Server::new(
        chain_b.clone(),
        Arc::new(Pool::new()),
        NetworkId { chain_id: 9999, genesis_hash: chain_b.head_header().hash },
        50,
        cancel.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    {
        let server_a = server_a.clone();
        tokio::spawn(async move {
            let _ = server_a.serve_listener(listener).await;
        });
    }

    server_b.clone().connect_to(&local_addr.to_string()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server_a.handshaked_peer_count(), 0);
    assert_eq!(server_b.handshaked_peer_count(), 0);
}
