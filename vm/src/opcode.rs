//! The embedded stack machine's minimal opcode set. Each instruction is a
//! single tag byte; `Push` is followed by its 32-byte literal operand
//! inline in the code stream.

pub const NOP: u8 = 0x00;
pub const PUSH: u8 = 0x01;
pub const POP: u8 = 0x02;
pub const ADD: u8 = 0x03;
pub const SUB: u8 = 0x04;
pub const MUL: u8 = 0x05;
pub const DIV: u8 = 0x06;
pub const MOD: u8 = 0x07;
pub const STORE: u8 = 0x08;
pub const LOAD: u8 = 0x09;
pub const RETURN: u8 = 0x0a;
pub const REVERT: u8 = 0x0b;

/// Per-instruction-step gas, charged for every opcode including `Push`'s
/// operand bytes (the operand itself isn't separately metered).
pub const GAS_COMPUTATION: u64 = 3;
/// Additional gas charged on top of [`GAS_COMPUTATION`] for `Store`.
pub const GAS_STORAGE: u64 = 20_000;
pub const MAX_STACK_DEPTH: usize = 1024;
