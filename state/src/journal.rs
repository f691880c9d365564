//! Reverse-delta journal backing `State::snapshot`/`State::revert`.
//!
//! Rather than cloning the whole working set per snapshot (the source's
//! approach), every mutating operation pushes one entry recording the
//! field's previous value. A snapshot id is simply the journal length at
//! the time it was taken; reverting replays entries newer than that id in
//! reverse, giving O(delta) revert instead of O(state).

use primitives::{types::Account, Address, Hash};

#[derive(Debug, Clone)]
pub enum JournalEntry {
    /// An account record (nonce/balance/code_hash/storage_root) changed;
    /// `previous` is the full record before the write.
    Account { address: Address, previous: Account },
    /// One dirty storage cell changed. `previous` is `None` when the cell
    /// was not yet in the dirty set (so revert removes it, falling back to
    /// the committed trie value); `Some` restores the prior dirty value.
    Storage {
        address: Address,
        key: Hash,
        previous: Option<Hash>,
    },
    /// An account's pending code blob changed.
    Code {
        address: Address,
        previous: Option<Vec<u8>>,
    },
    /// One log was appended; revert pops it.
    Log,
}
