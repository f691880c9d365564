//! Proof-of-work consensus: target/difficulty math, mining and validation.

use std::time::{Duration, Instant};

use ethereum_types::U512;
use primitives::{types::BlockHeader, U256};
use rand::RngCore;
use thiserror::Error;

/// Wall-clock budget for one mining attempt before the miner loop discards
/// the candidate and restarts with fresh transactions.
pub const MINING_TIMEOUT: Duration = Duration::from_secs(300);
/// How often (in nonce attempts) the mining loop checks the deadline —
/// checking every attempt would dominate the loop with syscalls.
pub const DEADLINE_CHECK_INTERVAL: u64 = 100_000;

pub const MIN_DIFFICULTY: u64 = 1000;
const TARGET_BLOCK_TIME_SECS: i64 = 15;
const RETARGET_WINDOW_BLOCKS: i64 = 10;
const RETARGET_GRACE_PERIOD_BLOCKS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("mining exceeded its wall-clock budget")]
    MiningTimeout,
    #[error("header hash does not satisfy the proof-of-work target")]
    InvalidProofOfWork,
}

fn max_difficulty() -> U256 {
    U256::from(1u8) << 240
}

/// `target = 2^256 / difficulty`, computed in 512-bit arithmetic since
/// `2^256` itself overflows `U256`.
pub fn target_for_difficulty(difficulty: U256) -> U256 {
    if difficulty.is_zero() {
        return U256::MAX;
    }
    let numerator = U512::from(1u8) << 256;
    let quotient = numerator / U512::from(difficulty);
    let mut bytes = [0u8; 64];
    quotient.to_big_endian(&mut bytes);
    U256::from_big_endian(&bytes[32..])
}

fn hash_as_u256(header: &BlockHeader) -> (primitives::Hash, U256) {
    let hash = header.compute_hash();
    (hash, U256::from_big_endian(hash.as_bytes()))
}

/// Recomputes the header hash from scratch (rejecting any tampering with
/// the stored `hash` field) and checks it against the PoW target.
pub fn validate(header: &BlockHeader) -> Result<(), ConsensusError> {
    let (recomputed, hash_value) = hash_as_u256(header);
    if recomputed != header.hash {
        return Err(ConsensusError::InvalidProofOfWork);
    }
    let target = target_for_difficulty(header.difficulty);
    if hash_value > target {
        return Err(ConsensusError::InvalidProofOfWork);
    }
    Ok(())
}

/// Mines `header` in place: seeds a random starting nonce, increments by
/// one per attempt, and stops as soon as the header hash satisfies its
/// difficulty's target or [`MINING_TIMEOUT`] elapses.
pub fn mine(header: &mut BlockHeader) -> Result<(), ConsensusError> {
    let deadline = Instant::now() + MINING_TIMEOUT;
    let target = target_for_difficulty(header.difficulty);

    let mut nonce = rand::thread_rng().next_u64();
    let mut attempts: u64 = 0;
    loop {
        header.nonce = nonce;
        let (hash, hash_value) = hash_as_u256(header);
        if hash_value <= target {
            header.hash = hash;
            return Ok(());
        }
        nonce = nonce.wrapping_add(1);
        attempts += 1;
        if attempts % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
            return Err(ConsensusError::MiningTimeout);
        }
    }
}

/// Difficulty for a block at `new_number` following `parent`, timestamped
/// at `new_timestamp`.
///
/// For `new_number < 10` this is the fixed [`MIN_DIFFICULTY`] floor.
/// Otherwise the retarget compares only the single parent-to-new timestamp
/// interval against `expected = 15s * 10 = 150s` — the spec's "10-block
/// window" description and this single-interval comparison disagree; that
/// mismatch is preserved verbatim from the source rather than silently
/// corrected (see DESIGN.md).
pub fn retarget(new_number: u64, parent: &BlockHeader, new_timestamp: i64) -> U256 {
    if new_number < RETARGET_GRACE_PERIOD_BLOCKS {
        return U256::from(MIN_DIFFICULTY);
    }
    let expected = TARGET_BLOCK_TIME_SECS * RETARGET_WINDOW_BLOCKS;
    let actual = new_timestamp - parent.timestamp;
    let difficulty = parent.difficulty;

    let adjusted = if actual < expected / 2 {
        difficulty + difficulty / 4
    } else if actual > expected * 2 {
        difficulty.saturating_sub(difficulty / 4)
    } else {
        difficulty
    };

    clamp_difficulty(adjusted)
}

fn clamp_difficulty(difficulty: U256) -> U256 {
    let min = U256::from(MIN_DIFFICULTY);
    let max = max_difficulty();
    difficulty.clamp(min, max)
}
