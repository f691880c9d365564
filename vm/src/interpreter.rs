//! The embedded stack machine. Executes a callee's stored bytecode against
//! its own storage (through the shared state handle); `STORE`/`LOAD`
//! opcodes are the only state-touching instructions, so a failed call's
//! effects can always be undone by reverting to a snapshot taken before
//! entry.

use primitives::{Address, Hash, U256};
use state::{State, StateError};

use crate::opcode::{self, GAS_COMPUTATION, GAS_STORAGE, MAX_STACK_DEPTH};

type Word = [u8; 32];

/// Outcome of running the stack machine to completion, out-of-gas, a
/// revert instruction, or falling off the end of the code.
pub struct Outcome {
    pub success: bool,
    pub gas_used: u64,
    pub return_data: Vec<u8>,
}

fn failed(gas_used: u64) -> Outcome {
    Outcome {
        success: false,
        gas_used,
        return_data: Vec::new(),
    }
}

fn word_to_u256(word: &Word) -> U256 {
    U256::from_big_endian(word)
}

fn u256_to_word(value: U256) -> Word {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Runs `code` as `callee`'s program against `state`, never spending more
/// than `gas_budget`. Unknown opcodes, stack underflow/overflow, division
/// by zero, and running out of gas all surface as `success: false` rather
/// than a hard error; only a genuine state/trie I/O failure is propagated
/// as `Err`.
pub fn run(
    state: &mut State,
    callee: &Address,
    code: &[u8],
    gas_budget: u64,
) -> Result<Outcome, StateError> {
    let mut stack: Vec<Word> = Vec::new();
    let mut gas_used: u64 = 0;
    let mut pc = 0usize;

    loop {
        if pc >= code.len() {
            return Ok(Outcome {
                success: true,
                gas_used,
                return_data: Vec::new(),
            });
        }
        if gas_used + GAS_COMPUTATION > gas_budget {
            return Ok(failed(gas_used));
        }
        let op = code[pc];
        pc += 1;
        gas_used += GAS_COMPUTATION;

        match op {
            opcode::NOP => {}
            opcode::PUSH => {
                if pc + 32 > code.len() || stack.len() >= MAX_STACK_DEPTH {
                    return Ok(failed(gas_used));
                }
                let mut word = [0u8; 32];
                word.copy_from_slice(&code[pc..pc + 32]);
                pc += 32;
                stack.push(word);
            }
            opcode::POP => {
                if stack.pop().is_none() {
                    return Ok(failed(gas_used));
                }
            }
            opcode::ADD | opcode::SUB | opcode::MUL | opcode::DIV | opcode::MOD => {
                let (b, a) = match (stack.pop(), stack.pop()) {
                    (Some(b), Some(a)) => (b, a),
                    _ => return Ok(failed(gas_used)),
                };
                let (a, b) = (word_to_u256(&a), word_to_u256(&b));
                let result = match op {
                    opcode::ADD => a.overflowing_add(b).0,
                    opcode::SUB => a.overflowing_sub(b).0,
                    opcode::MUL => a.overflowing_mul(b).0,
                    opcode::DIV => {
                        if b.is_zero() {
                            return Ok(failed(gas_used));
                        }
                        a / b
                    }
                    opcode::MOD => {
                        if b.is_zero() {
                            return Ok(failed(gas_used));
                        }
                        a % b
                    }
                    _ => unreachable!(),
                };
                stack.push(u256_to_word(result));
            }
            opcode::STORE => {
                if gas_used + GAS_STORAGE > gas_budget {
                    return Ok(failed(gas_used));
                }
                let (key, value) = match (stack.pop(), stack.pop()) {
                    (Some(k), Some(v)) => (k, v),
                    _ => return Ok(failed(gas_used)),
                };
                gas_used += GAS_STORAGE;
                state.set_storage(callee, &Hash::from_slice(&key), Hash::from_slice(&value))?;
            }
            opcode::LOAD => {
                let key = match stack.pop() {
                    Some(k) => k,
                    None => return Ok(failed(gas_used)),
                };
                let value = state.get_storage(callee, &Hash::from_slice(&key))?;
                if stack.len() >= MAX_STACK_DEPTH {
                    return Ok(failed(gas_used));
                }
                stack.push(*value.as_bytes());
            }
            opcode::RETURN => {
                let top = match stack.pop() {
                    Some(t) => t,
                    None => return Ok(failed(gas_used)),
                };
                return Ok(Outcome {
                    success: true,
                    gas_used,
                    return_data: top.to_vec(),
                });
            }
            opcode::REVERT => return Ok(failed(gas_used)),
            _ => return Ok(failed(gas_used)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKv;
    use std::sync::Arc;

    fn fresh_state() -> State {
        State::new(Hash::ZERO, Arc::new(MemoryKv::new()))
    }

    fn push(word_value: u64) -> Vec<u8> {
        let mut bytes = vec![opcode::PUSH];
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&word_value.to_be_bytes());
        bytes.extend_from_slice(&word);
        bytes
    }

    #[test]
    fn add_then_return() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let mut code = push(2);
        code.extend(push(3));
        code.push(opcode::ADD);
        code.push(opcode::RETURN);

        let outcome = run(&mut state, &callee, &code, 1_000_000).unwrap();
        assert!(outcome.success);
        assert_eq!(U256::from_big_endian(&outcome.return_data), U256::from(5u64));
    }

    #[test]
    fn divide_by_zero_reverts() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let mut code = push(1);
        code.extend(push(0));
        code.push(opcode::DIV);

        let outcome = run(&mut state, &callee, &code, 1_000_000).unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn store_then_load_round_trips() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let mut code = push(42); // value
        code.extend(push(7)); // key
        code.push(opcode::STORE);
        code.extend(push(7)); // key
        code.push(opcode::LOAD);
        code.push(opcode::RETURN);

        let outcome = run(&mut state, &callee, &code, 1_000_000).unwrap();
        assert!(outcome.success);
        assert_eq!(U256::from_big_endian(&outcome.return_data), U256::from(42u64));
    }

    #[test]
    fn store_reverted_by_caller_does_not_persist() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let snapshot = state.snapshot();
        let mut code = push(42);
        code.extend(push(7));
        code.push(opcode::STORE);
        run(&mut state, &callee, &code, 1_000_000).unwrap();
        state.revert(snapshot);
        let value = state
            .get_storage(&callee, &Hash::from_slice(&{
                let mut k = [0u8; 32];
                k[31] = 7;
                k
            }))
            .unwrap();
        assert_eq!(value, Hash::ZERO);
    }

    #[test]
    fn unknown_opcode_reverts_but_charges_gas_so_far() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let code = vec![opcode::NOP, 0xffu8];
        let outcome = run(&mut state, &callee, &code, 1_000_000).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.gas_used, GAS_COMPUTATION * 2);
    }

    #[test]
    fn out_of_gas_stops_execution() {
        let mut state = fresh_state();
        let callee = Address::from_low_u64_be(1);
        let code = vec![opcode::NOP, opcode::NOP, opcode::NOP];
        let outcome = run(&mut state, &callee, &code, GAS_COMPUTATION).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.gas_used, GAS_COMPUTATION);
    }
}
