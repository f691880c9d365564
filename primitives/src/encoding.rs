//! Fixed-width big-endian encoders for canonical hash preimages.
//!
//! Both the transaction-hash and block-header-hash invariants are defined
//! byte-for-byte in the specification; this module is the single place
//! that produces those bytes so the chain manager and VM cannot drift.

use ethereum_types::U256;

use crate::{Address, Hash};

/// Appends a `u64` as 8 big-endian bytes.
pub fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends an `i64` as 8 big-endian bytes.
pub fn push_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a 32-byte hash verbatim.
pub fn push_hash(buf: &mut Vec<u8>, value: &Hash) {
    buf.extend_from_slice(&value.0);
}

/// Appends a `U256` as its minimal big-endian byte representation, per the
/// "difficulty(variable)" field of the block-header preimage.
pub fn push_u256_variable(buf: &mut Vec<u8>, value: U256) {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(32);
    buf.extend_from_slice(&bytes[first_nonzero..]);
}

/// Appends a `U256` as a fixed 32-byte big-endian representation.
pub fn push_u256_fixed(buf: &mut Vec<u8>, value: U256) {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    buf.extend_from_slice(&bytes);
}

/// Appends an address, or 20 zero bytes when absent.
pub fn push_address_or_zero(buf: &mut Vec<u8>, value: Option<Address>) {
    match value {
        Some(addr) => buf.extend_from_slice(addr.as_bytes()),
        None => buf.extend_from_slice(&[0u8; 20]),
    }
}

/// Appends a length-prefixed byte blob (used for transaction `data`).
pub fn push_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    push_u64(buf, value.len() as u64);
    buf.extend_from_slice(value);
}
