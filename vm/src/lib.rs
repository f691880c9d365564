//! Transaction execution against a state working copy.
//!
//! Pre-flight checks are fail-fast and make no state change on the failure
//! path; past that point the transaction always consumes gas and the
//! sender's nonce always advances, win or lose — only value transfers,
//! code installation and storage writes are rolled back on revert.

pub mod interpreter;
pub mod opcode;

use primitives::types::{derive_contract_address, Transaction};
use primitives::{Address, U256};
use state::{State, StateError};
use thiserror::Error;

/// `GasCreate` charged on top of intrinsic gas for contract-creation
/// transactions, per spec.md §4.3.
pub const GAS_CREATE: u64 = 32_000;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("sender balance insufficient for value + gas_price * gas_limit")]
    InsufficientBalance,
    #[error("transaction nonce {got} does not match account nonce {expected}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("gas_limit below intrinsic gas requirement")]
    GasLimitTooLow,
    #[error("reward transaction has no recipient")]
    RewardMissingRecipient,
    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Result of executing one transaction: status 1 success / 0 failure, the
/// total gas spent (intrinsic + any call execution, even on failure), any
/// value returned by a call, the address created by a creation tx, and the
/// logs emitted (empty on failure, since the call's effects are reverted).
pub struct ExecutionResult {
    pub status: u8,
    pub gas_used: u64,
    pub return_data: Vec<u8>,
    pub contract_address: Option<Address>,
    pub logs: Vec<primitives::types::Log>,
}

/// Executes `tx` against `state`. Pre-checks 1-3 of spec.md §4.3 are
/// evaluated first and return `Err` without touching state at all; past
/// that point the transaction is "included" (nonce always advances) and
/// failures are reported as `status: 0` in the `Ok` result rather than an
/// `Err`, since a block importing such a transaction is still valid.
pub fn execute_transaction(
    state: &mut State,
    tx: &Transaction,
) -> Result<ExecutionResult, VmError> {
    // The miner loop prepends one synthetic block-reward transaction per
    // block (spec.md §4.7), `from` the zero address, crediting the miner
    // with a fixed subsidy. It has no real signer, no balance to debit, and
    // its fixed `nonce: 0` does not track any account's sender nonce, so it
    // bypasses the ordinary pre-checks and fee accounting entirely: a plain
    // credit of `value` to `to`, costing its declared `gas_limit` in the
    // block's gas accounting but paying no fee (`gas_price: 0`).
    if tx.from.is_zero() {
        return execute_reward(state, tx);
    }

    let sender_balance = state.get_balance(&tx.from)?;
    let upfront_cost = tx.value + tx.gas_price * U256::from(tx.gas_limit);
    if sender_balance < upfront_cost {
        return Err(VmError::InsufficientBalance);
    }

    let sender_nonce = state.get_nonce(&tx.from)?;
    if tx.nonce != sender_nonce {
        return Err(VmError::NonceMismatch {
            expected: sender_nonce,
            got: tx.nonce,
        });
    }

    let intrinsic = tx.intrinsic_gas();
    if tx.gas_limit < intrinsic {
        return Err(VmError::GasLimitTooLow);
    }

    // The transaction is now committed to being included: the sender's
    // nonce advances regardless of whether the call below reverts.
    state.increment_nonce(&tx.from)?;

    let call_snapshot = state.snapshot();
    let mut gas_used = intrinsic;
    let mut contract_address = None;
    let mut return_data = Vec::new();

    // Failures here (collision, out-of-gas, an explicit REVERT) are
    // ordinary outcomes: the transaction is still valid and included, just
    // with `status: 0` and its call effects rolled back. Only a genuine
    // state/trie I/O failure (`ExecFailure::State`) aborts the whole import.
    let outcome: Result<(), ExecFailure> = (|| {
        if tx.is_contract_creation() {
            let addr = derive_contract_address(tx.from, tx.nonce);
            if !state.get_account(&addr)?.is_empty() {
                return Err(ExecFailure::Collision);
            }
            contract_address = Some(addr);
            gas_used += GAS_CREATE;
            if gas_used > tx.gas_limit {
                return Err(ExecFailure::OutOfGas);
            }
            state.sub_balance(&tx.from, tx.value)?;
            state.add_balance(&addr, tx.value)?;
            state.set_code(&addr, tx.data.clone())?;
        } else {
            let to = tx.to.expect("to is Some for non-creation transactions");
            state.sub_balance(&tx.from, tx.value)?;
            state.add_balance(&to, tx.value)?;
            let code = state.get_code(&to)?;
            if !code.is_empty() && !tx.data.is_empty() {
                let remaining = tx.gas_limit.saturating_sub(gas_used);
                let result = interpreter::run(state, &to, &code, remaining)?;
                gas_used += result.gas_used;
                return_data = result.return_data;
                if !result.success {
                    return Err(ExecFailure::Reverted);
                }
            }
        }
        Ok(())
    })();

    let (status, logs) = match outcome {
        Ok(()) => (1u8, state.take_logs()),
        Err(ExecFailure::State(e)) => return Err(VmError::State(e)),
        Err(_) => {
            state.revert(call_snapshot);
            (0u8, Vec::new())
        }
    };

    // The fee is charged outside the call snapshot, so it survives a revert:
    // a failed call still consumes the gas it spent, win or lose.
    let fee = tx.gas_price * U256::from(gas_used);
    state.sub_balance(&tx.from, fee)?;

    Ok(ExecutionResult {
        status,
        gas_used,
        return_data,
        contract_address,
        logs,
    })
}

fn execute_reward(state: &mut State, tx: &Transaction) -> Result<ExecutionResult, VmError> {
    let to = tx.to.ok_or(VmError::RewardMissingRecipient)?;
    state.add_balance(&to, tx.value)?;
    Ok(ExecutionResult {
        status: 1,
        gas_used: tx.gas_limit,
        return_data: Vec::new(),
        contract_address: None,
        logs: state.take_logs(),
    })
}

/// Internal, non-fatal outcomes of the creation/call step above. Never
/// exposed to callers: they become `status: 0` in [`ExecutionResult`],
/// except [`ExecFailure::State`] which signals a genuine state/trie
/// failure and aborts the transaction (and its importing block) entirely.
enum ExecFailure {
    Collision,
    OutOfGas,
    Reverted,
    State(StateError),
}

impl From<StateError> for ExecFailure {
    fn from(e: StateError) -> Self {
        ExecFailure::State(e)
    }
}
