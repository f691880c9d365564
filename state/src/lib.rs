//! Single-writer working copy over an authenticated trie at some parent
//! state root: accounts, code, per-account storage, logs, and LIFO
//! snapshot/revert.

mod journal;

pub use journal::JournalEntry;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use kvstore::{Batch, KvStore};
use primitives::{keccak256, types::Account, types::Log, Address, Hash, U256};
use thiserror::Error;
use trie::Trie;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("trie error: {0}")]
    Trie(#[from] trie::TrieError),
    #[error("key-value store error: {0}")]
    Kv(#[from] kvstore::KvError),
    #[error("insufficient balance for account {0:?}")]
    InsufficientBalance(Address),
}

const CODE_KEY_PREFIX: &str = "code_";

fn code_key(hash: &Hash) -> Vec<u8> {
    let mut key = CODE_KEY_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(hex::encode(hash.as_bytes()).as_bytes());
    key
}

#[derive(Default)]
struct AccountEntry {
    account: Account,
    /// Pending code blob, set by `set_code`, persisted on commit.
    code: Option<Vec<u8>>,
    /// Storage cells written this session; empty means "no dirty cells",
    /// which is the signal `commit` uses to leave `storage_root` alone
    /// entirely rather than recomputing (and possibly zeroing) it.
    dirty_storage: HashMap<Hash, Hash>,
    storage_trie: Option<Trie>,
}

/// A working copy of world state rooted at some parent state root. Not
/// shared across threads: the chain manager instantiates a fresh one per
/// `add_block` from the parent's `state_root`.
pub struct State {
    trie: Trie,
    kv: Arc<dyn KvStore>,
    accounts: HashMap<Address, AccountEntry>,
    dirty: HashSet<Address>,
    logs: Vec<Log>,
    journal: Vec<JournalEntry>,
}

impl State {
    pub fn new(root: Hash, kv: Arc<dyn KvStore>) -> State {
        State {
            trie: Trie::open(root, kv.clone()),
            kv,
            accounts: HashMap::new(),
            dirty: HashSet::new(),
            logs: Vec::new(),
            journal: Vec::new(),
        }
    }

    fn ensure_loaded(&mut self, address: &Address) -> Result<(), StateError> {
        if self.accounts.contains_key(address) {
            return Ok(());
        }
        let account = match self.trie.get(address.as_bytes())? {
            Some(bytes) => Account::decode(&bytes).unwrap_or_default(),
            None => Account::default(),
        };
        self.accounts.insert(
            *address,
            AccountEntry {
                account,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn account_of(&mut self, address: &Address) -> Result<Account, StateError> {
        self.ensure_loaded(address)?;
        Ok(self.accounts[address].account)
    }

    fn mutate_account(
        &mut self,
        address: &Address,
        f: impl FnOnce(&mut Account),
    ) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let entry = self.accounts.get_mut(address).unwrap();
        let previous = entry.account;
        f(&mut entry.account);
        self.journal.push(JournalEntry::Account {
            address: *address,
            previous,
        });
        self.dirty.insert(*address);
        Ok(())
    }

    /// The full account record (nonce/balance/code_hash/storage_root),
    /// used by callers that need to test emptiness (e.g. the VM's
    /// contract-address collision check) without four separate lookups.
    pub fn get_account(&mut self, address: &Address) -> Result<Account, StateError> {
        self.account_of(address)
    }

    pub fn get_balance(&mut self, address: &Address) -> Result<U256, StateError> {
        Ok(self.account_of(address)?.balance)
    }

    pub fn set_balance(&mut self, address: &Address, balance: U256) -> Result<(), StateError> {
        self.mutate_account(address, |a| a.balance = balance)
    }

    pub fn add_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let current = self.get_balance(address)?;
        self.set_balance(address, current + amount)
    }

    pub fn sub_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let current = self.get_balance(address)?;
        if current < amount {
            return Err(StateError::InsufficientBalance(*address));
        }
        self.set_balance(address, current - amount)
    }

    pub fn get_nonce(&mut self, address: &Address) -> Result<u64, StateError> {
        Ok(self.account_of(address)?.nonce)
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<(), StateError> {
        self.mutate_account(address, |a| a.nonce = nonce)
    }

    pub fn increment_nonce(&mut self, address: &Address) -> Result<(), StateError> {
        let current = self.get_nonce(address)?;
        self.set_nonce(address, current + 1)
    }

    pub fn get_code(&mut self, address: &Address) -> Result<Vec<u8>, StateError> {
        self.ensure_loaded(address)?;
        let entry = &self.accounts[address];
        if let Some(code) = &entry.code {
            return Ok(code.clone());
        }
        if entry.account.code_hash.is_zero() {
            return Ok(Vec::new());
        }
        Ok(self
            .kv
            .get(&code_key(&entry.account.code_hash))?
            .unwrap_or_default())
    }

    pub fn set_code(&mut self, address: &Address, code: Vec<u8>) -> Result<(), StateError> {
        let hash = keccak256(&code);
        self.ensure_loaded(address)?;
        let entry = self.accounts.get_mut(address).unwrap();
        let previous_account = entry.account;
        let previous_code = entry.code.clone();
        entry.account.code_hash = hash;
        entry.code = Some(code);
        self.journal.push(JournalEntry::Account {
            address: *address,
            previous: previous_account,
        });
        self.journal.push(JournalEntry::Code {
            address: *address,
            previous: previous_code,
        });
        self.dirty.insert(*address);
        Ok(())
    }

    pub fn get_storage(&mut self, address: &Address, key: &Hash) -> Result<Hash, StateError> {
        self.ensure_loaded(address)?;
        let kv = self.kv.clone();
        let entry = self.accounts.get_mut(address).unwrap();
        if let Some(v) = entry.dirty_storage.get(key) {
            return Ok(*v);
        }
        let storage_root = entry.account.storage_root;
        if storage_root.is_zero() {
            return Ok(Hash::ZERO);
        }
        if entry.storage_trie.is_none() {
            entry.storage_trie = Some(Trie::open(storage_root, kv));
        }
        let value = entry.storage_trie.as_ref().unwrap().get(key.as_bytes())?;
        Ok(value.map(|b| Hash::from_slice(&b)).unwrap_or(Hash::ZERO))
    }

    pub fn set_storage(
        &mut self,
        address: &Address,
        key: &Hash,
        value: Hash,
    ) -> Result<(), StateError> {
        // Ensures the account (and any existing storage trie handle) is
        // loaded before we touch the dirty set.
        let _ = self.get_storage(address, key)?;
        let entry = self.accounts.get_mut(address).unwrap();
        let previous = entry.dirty_storage.get(key).copied();
        self.journal.push(JournalEntry::Storage {
            address: *address,
            key: *key,
            previous,
        });
        entry.dirty_storage.insert(*key, value);
        self.dirty.insert(*address);
        Ok(())
    }

    pub fn add_log(&mut self, log: Log) {
        self.logs.push(log);
        self.journal.push(JournalEntry::Log);
    }

    /// Drains and returns all logs added so far (e.g. by the chain manager
    /// after a single transaction's execution, so the next transaction's
    /// logs don't bleed into this one's receipt).
    pub fn take_logs(&mut self) -> Vec<Log> {
        std::mem::take(&mut self.logs)
    }

    /// Returns a journal-length marker identifying this point in time.
    pub fn snapshot(&mut self) -> usize {
        self.journal.len()
    }

    /// Undoes every mutation recorded since `id` was returned by
    /// `snapshot`, in reverse order. No-op if nothing changed since.
    pub fn revert(&mut self, id: usize) {
        while self.journal.len() > id {
            match self.journal.pop().unwrap() {
                JournalEntry::Account { address, previous } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.account = previous;
                    }
                }
                JournalEntry::Storage {
                    address,
                    key,
                    previous,
                } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        match previous {
                            Some(v) => {
                                entry.dirty_storage.insert(key, v);
                            }
                            None => {
                                entry.dirty_storage.remove(&key);
                            }
                        }
                    }
                }
                JournalEntry::Code { address, previous } => {
                    if let Some(entry) = self.accounts.get_mut(&address) {
                        entry.code = previous;
                    }
                }
                JournalEntry::Log => {
                    self.logs.pop();
                }
            }
        }
    }

    /// For every dirty account: recomputes its storage sub-trie root from
    /// its dirty cells (skipped entirely when there are none, so existing
    /// persisted storage is never mistaken for "empty" and zeroed out),
    /// persists any pending code blob, serializes the account record into
    /// the state trie, then commits the trie itself. Clears all dirty
    /// state and the snapshot journal; snapshots never survive a commit.
    pub fn commit(&mut self) -> Result<Hash, StateError> {
        let mut code_batch = Batch::new();
        let dirty_addresses: Vec<Address> = self.dirty.drain().collect();
        for address in dirty_addresses {
            let entry = self.accounts.get_mut(&address).unwrap();

            if !entry.dirty_storage.is_empty() {
                let mut storage_trie = entry
                    .storage_trie
                    .take()
                    .unwrap_or_else(|| Trie::open(entry.account.storage_root, self.kv.clone()));
                for (key, value) in entry.dirty_storage.drain() {
                    if value.is_zero() {
                        storage_trie.delete(key.as_bytes())?;
                    } else {
                        storage_trie.update(key.as_bytes(), value.as_bytes().to_vec())?;
                    }
                }
                entry.account.storage_root = storage_trie.commit()?;
                entry.storage_trie = Some(storage_trie);
            }

            if let Some(code) = entry.code.take() {
                code_batch.put(code_key(&entry.account.code_hash), code);
            }

            self.trie
                .update(address.as_bytes(), entry.account.encode())?;
        }
        if !code_batch.0.is_empty() {
            self.kv.batch_write(code_batch)?;
        }
        self.logs.clear();
        self.journal.clear();
        self.trie.commit().map_err(StateError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKv;

    fn fresh() -> State {
        State::new(Hash::ZERO, Arc::new(MemoryKv::new()))
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn balance_roundtrips_and_commits() {
        let mut state = fresh();
        let a = addr(1);
        state.set_balance(&a, U256::from(100u64)).unwrap();
        assert_eq!(state.get_balance(&a).unwrap(), U256::from(100u64));
        let root = state.commit().unwrap();
        assert_ne!(root, Hash::ZERO);
    }

    #[test]
    fn sub_balance_rejects_overdraft() {
        let mut state = fresh();
        let a = addr(1);
        state.set_balance(&a, U256::from(10u64)).unwrap();
        let err = state.sub_balance(&a, U256::from(11u64)).unwrap_err();
        assert!(matches!(err, StateError::InsufficientBalance(_)));
        assert_eq!(state.get_balance(&a).unwrap(), U256::from(10u64));
    }

    #[test]
    fn snapshot_revert_restores_prior_state_bit_for_bit() {
        let mut state = fresh();
        let a = addr(1);
        state.set_balance(&a, U256::from(100u64)).unwrap();
        state.set_nonce(&a, 3).unwrap();
        let key = Hash::from_slice(&[1u8; 32]);
        state.set_storage(&a, &key, Hash::from_slice(&[2u8; 32])).unwrap();

        let snap = state.snapshot();
        state.set_balance(&a, U256::from(999u64)).unwrap();
        state.set_nonce(&a, 99).unwrap();
        state
            .set_storage(&a, &key, Hash::from_slice(&[9u8; 32]))
            .unwrap();
        state.add_log(Log {
            address: a,
            topics: vec![],
            data: vec![],
            block_number: 0,
            tx_hash: Hash::ZERO,
            tx_index: 0,
            block_hash: Hash::ZERO,
            index: 0,
            removed: false,
        });

        state.revert(snap);
        assert_eq!(state.get_balance(&a).unwrap(), U256::from(100u64));
        assert_eq!(state.get_nonce(&a).unwrap(), 3);
        assert_eq!(
            state.get_storage(&a, &key).unwrap(),
            Hash::from_slice(&[2u8; 32])
        );
        assert!(state.take_logs().is_empty());
    }

    #[test]
    fn storage_root_survives_commit_then_empty_dirty_set() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let a = addr(1);
        let key = Hash::from_slice(&[5u8; 32]);

        let mut state = State::new(Hash::ZERO, kv.clone());
        state
            .set_storage(&a, &key, Hash::from_slice(&[7u8; 32]))
            .unwrap();
        let root1 = state.commit().unwrap();

        // Reopen at the committed root and touch an unrelated account;
        // the untouched account's storage must still be readable.
        let mut state2 = State::new(root1, kv);
        state2.set_nonce(&addr(2), 1).unwrap();
        let _root2 = state2.commit().unwrap();
        assert_eq!(
            state2.get_storage(&a, &key).unwrap(),
            Hash::from_slice(&[7u8; 32])
        );
    }

    #[test]
    fn code_roundtrips_through_commit_and_reopen() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let a = addr(1);
        let mut state = State::new(Hash::ZERO, kv.clone());
        state.set_code(&a, b"hello code".to_vec()).unwrap();
        let root = state.commit().unwrap();

        let mut reopened = State::new(root, kv);
        assert_eq!(reopened.get_code(&a).unwrap(), b"hello code".to_vec());
    }

    #[test]
    fn after_commit_no_snapshots_remain() {
        let mut state = fresh();
        state.snapshot();
        state.commit().unwrap();
        assert_eq!(state.snapshot(), 0);
    }
}
