//! Shared hash, address, big-integer and signature primitives.
//!
//! `Hash` is a generic 32-byte container; which digest fills it (SHA-256 or
//! Keccak-256) is a property of the call site, matching the data model in
//! the system specification: block/transaction hashes are SHA-256 over a
//! canonical encoding, while address derivation, code hashes and MPT node
//! keys use Keccak-256.

pub mod crypto;
pub mod encoding;
pub mod types;

use std::fmt;

pub use ethereum_types::{H160 as Address, U256};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A 32-byte opaque identifier. Serializes as a `0x`-prefixed hex string on
/// the wire (P2P JSON frames), matching spec.md §6's genesis-hash encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let trimmed = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(trimmed).map_err(D::Error::custom)?;
        if bytes.len() != 32 {
            return Err(D::Error::custom("hash must be 32 bytes"));
        }
        Ok(Hash::from_slice(&bytes))
    }
}

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_slice(bytes: &[u8]) -> Hash {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        Hash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// SHA-256 over arbitrary bytes, used for block/transaction canonical hashes.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Keccak-256, used for address derivation, contract code hashes and MPT node keys.
pub fn keccak256(data: &[u8]) -> Hash {
    Hash(keccak_hash::keccak(data).0)
}

/// Derives an address as the last 20 bytes of Keccak-256 over the
/// uncompressed public-key coordinates (64 bytes, no `0x04` prefix).
pub fn public_to_address(public_key_coords: &[u8]) -> Address {
    let digest = keccak256(public_key_coords);
    Address::from_slice(&digest.0[12..])
}
