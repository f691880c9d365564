//! A minimal key-value persistence abstraction.
//!
//! This is the one collaborator spec.md explicitly keeps out of scope
//! ("abstracted as a byte-level store with get/put/delete/iterate-prefix/
//! batch-write/snapshot"); this crate supplies the trait contract plus two
//! real, small implementations (`MemoryKv` for tests, `SledKv` for
//! persistence under `<data_dir>/chaindata/`) so the rest of the workspace
//! is runnable end to end.

mod memory;
mod sled_store;

pub use memory::MemoryKv;
pub use sled_store::SledKv;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered collection of writes applied atomically by `batch_write`.
#[derive(Debug, Clone, Default)]
pub struct Batch(pub Vec<BatchOp>);

impl Batch {
    pub fn new() -> Self {
        Batch(Vec::new())
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.0.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.0.push(BatchOp::Delete(key.into()));
    }
}

/// Byte-level persistence contract used by every subsystem that needs
/// durable storage (MPT nodes, contract code, block bytes).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;
    /// Returns all `(key, value)` pairs whose key starts with `prefix`.
    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;
    fn batch_write(&self, batch: Batch) -> Result<(), KvError>;
    /// A point-in-time, independently readable copy of the store.
    fn snapshot(&self) -> Arc<dyn KvStore>;
}
