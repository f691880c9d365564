use std::{path::Path, sync::Arc};

use crate::{Batch, BatchOp, KvError, KvStore, MemoryKv};

/// A persistent key-value store backed by `sled`, rooted at `<data_dir>/chaindata`.
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = sled::open(path).map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(SledKv { db })
    }
}

impl KvStore for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| KvError::Backend(e.to_string()))?
            .map(|ivec| ivec.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.db
            .insert(key, value)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.db
            .remove(key)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| KvError::Backend(e.to_string()))
            })
            .collect()
    }

    fn batch_write(&self, batch: Batch) -> Result<(), KvError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.0 {
            match op {
                BatchOp::Put(k, v) => sled_batch.insert(k, v),
                BatchOp::Delete(k) => sled_batch.remove(k),
            }
        }
        self.db
            .apply_batch(sled_batch)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn KvStore> {
        // sled has no cheap MVCC snapshot exposed through its public API;
        // the contract only requires an independently readable point-in-time
        // copy, so materialize one into memory.
        let copy = MemoryKv::new();
        for entry in self.db.iter().flatten() {
            let (k, v) = entry;
            let _ = copy.put(&k, &v);
        }
        Arc::new(copy)
    }
}
