//! ECDSA sign / verify / recover over secp256k1.
//!
//! The source this node's behavior is specified from used a placeholder
//! that could not actually recover a public key from a signature; this is
//! a real implementation, as the specification requires.

use ethereum_types::U256;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, Secp256k1, SecretKey,
};
use thiserror::Error;

use crate::{public_to_address, Address, Hash};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u64),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature did not recover to a valid public key")]
    RecoveryFailed,
    #[error("invalid secret key")]
    InvalidSecretKey,
}

fn u256_to_32_bytes(value: U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    buf
}

/// Recovers the signer's address from a message hash and an (v, r, s)
/// signature. `v` is the standard 0/1 recovery id (callers normalize
/// chain-id-encoded `v` values before calling this).
pub fn recover(hash: &Hash, v: u8, r: U256, s: U256) -> Result<Address, CryptoError> {
    let recovery_id =
        RecoveryId::from_i32(v as i32).map_err(|_| CryptoError::InvalidRecoveryId(v as u64))?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&u256_to_32_bytes(r));
    sig_bytes[32..].copy_from_slice(&u256_to_32_bytes(s));

    let signature = RecoverableSignature::from_compact(&sig_bytes, recovery_id)
        .map_err(|_| CryptoError::MalformedSignature)?;
    let message = Message::from_digest(hash.0);

    let secp = Secp256k1::verification_only();
    let public_key = secp
        .recover_ecdsa(&message, &signature)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    Ok(public_to_address(&public_key.serialize_uncompressed()[1..]))
}

/// Signs a message hash with a secret key, returning `(v, r, s)`.
///
/// Used only by test helpers / the wallet collaborator's contract; core
/// consensus code never signs, only recovers.
pub fn sign(secret_key_bytes: &[u8; 32], hash: &Hash) -> Result<(u8, U256, U256), CryptoError> {
    let secp = Secp256k1::signing_only();
    let secret_key =
        SecretKey::from_slice(secret_key_bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
    let message = Message::from_digest(hash.0);
    let (recovery_id, sig_bytes) = secp
        .sign_ecdsa_recoverable(&message, &secret_key)
        .serialize_compact();

    let r = U256::from_big_endian(&sig_bytes[..32]);
    let s = U256::from_big_endian(&sig_bytes[32..]);
    Ok((recovery_id.to_i32() as u8, r, s))
}

/// Derives the address that would sign with the given secret key, without
/// producing a signature. Used by test helpers to build wallets.
pub fn address_from_secret(secret_key_bytes: &[u8; 32]) -> Result<Address, CryptoError> {
    let secp = Secp256k1::signing_only();
    let secret_key =
        SecretKey::from_slice(secret_key_bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);
    Ok(public_to_address(&public_key.serialize_uncompressed()[1..]))
}
