use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::{Batch, BatchOp, KvError, KvStore};

/// An in-memory key-value store, used in tests and as a `--dev` backend.
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            data: RwLock::new(BTreeMap::new()),
        }
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch_write(&self, batch: Batch) -> Result<(), KvError> {
        let mut data = self.data.write();
        for op in batch.0 {
            match op {
                BatchOp::Put(k, v) => {
                    data.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn KvStore> {
        Arc::new(MemoryKv {
            data: RwLock::new(self.data.read().clone()),
        })
    }
}
