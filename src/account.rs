use std::collections::HashMap;

use alloy_consensus::{constants::KECCAK_EMPTY, EMPTY_ROOT_HASH};
use alloy_primitives::{Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// The account state stored in the state trie.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AccountState {
    pub nonce: U256,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            nonce: U256::ZERO,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        }
    }
}

/// How a cached account relates to its trie leaf.
///
/// `ContractConception` is a dirty variant marking accounts created by
/// contract deployment in this session; `Killed` entries are removed from
/// the trie on the next commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unchanged,
    Dirty,
    ContractConception,
    Killed,
}

/// In-memory representation of a single account.
///
/// Carries the basic state alongside the storage overlay and the lazily
/// loaded bytecode. The overlay is authoritative: a cached slot shadows the
/// storage trie, and a value of zero means deleted.
#[derive(Debug, Clone)]
pub struct Account {
    nonce: U256,
    balance: U256,
    // Root of the storage trie on disk when this entry was loaded.
    storage_root: B256,
    storage_overlay: HashMap<U256, U256>,
    code_hash: B256,
    code: Option<Bytes>,
    fresh_code: bool,
    lifecycle: Lifecycle,
}

impl Account {
    /// An account decoded from its trie leaf; cached, not yet mutated.
    pub fn from_leaf(leaf: AccountState) -> Self {
        Self {
            nonce: leaf.nonce,
            balance: leaf.balance,
            storage_root: leaf.storage_root,
            storage_overlay: HashMap::new(),
            code_hash: leaf.code_hash,
            code: None,
            fresh_code: false,
            lifecycle: Lifecycle::Unchanged,
        }
    }

    /// A plain account created by this session (balance transfer, nonce
    /// bump, explicit creation).
    pub fn new_basic(nonce: U256, balance: U256) -> Self {
        Self {
            nonce,
            balance,
            storage_root: EMPTY_ROOT_HASH,
            storage_overlay: HashMap::new(),
            code_hash: KECCAK_EMPTY,
            code: None,
            fresh_code: false,
            lifecycle: Lifecycle::Dirty,
        }
    }

    /// A contract account being created; replaces whatever storage the
    /// address had before.
    pub fn new_contract(nonce: U256, balance: U256) -> Self {
        Self {
            lifecycle: Lifecycle::ContractConception,
            ..Self::new_basic(nonce, balance)
        }
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn balance(&self) -> U256 {
        self.balance
    }

    pub fn storage_root(&self) -> B256 {
        self.storage_root
    }

    pub fn code_hash(&self) -> B256 {
        self.code_hash
    }

    pub fn code(&self) -> Option<&Bytes> {
        self.code.as_ref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn storage_overlay(&self) -> &HashMap<U256, U256> {
        &self.storage_overlay
    }

    pub fn is_dirty(&self) -> bool {
        self.lifecycle != Lifecycle::Unchanged
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle != Lifecycle::Killed
    }

    /// Nonce, balance and code all at their defaults.
    pub fn is_empty(&self) -> bool {
        self.nonce.is_zero() && self.balance.is_zero() && !self.code_bearing()
    }

    /// Whether the account has code, fresh or referenced by hash.
    pub fn code_bearing(&self) -> bool {
        self.fresh_code || self.code_hash != KECCAK_EMPTY
    }

    pub fn is_fresh_code(&self) -> bool {
        self.fresh_code
    }

    pub fn code_cached(&self) -> bool {
        self.code.is_some()
    }

    pub fn add_balance(&mut self, amount: U256) {
        self.balance += amount;
        self.touch();
    }

    /// Caller checks funds; the engine surfaces `NotEnoughCash` above this.
    pub fn sub_balance(&mut self, amount: U256) {
        debug_assert!(self.balance >= amount);
        self.balance -= amount;
        self.touch();
    }

    pub fn inc_nonce(&mut self) {
        self.nonce += U256::from(1);
        self.touch();
    }

    /// Marks the account for removal from the trie at the next commit.
    /// Mutations after this still land in the entry but never resurrect it.
    pub fn kill(&mut self) {
        self.lifecycle = Lifecycle::Killed;
        self.storage_overlay.clear();
        self.storage_root = EMPTY_ROOT_HASH;
        self.code_hash = KECCAK_EMPTY;
        self.code = None;
        self.fresh_code = false;
        self.nonce = U256::ZERO;
        self.balance = U256::ZERO;
    }

    /// Dirty storage write into the overlay; a zero value deletes the slot
    /// at commit.
    pub fn set_storage(&mut self, key: U256, value: U256) {
        self.storage_overlay.insert(key, value);
        self.touch();
    }

    /// Read-through population of the overlay; does not dirty the account.
    pub fn cache_storage(&mut self, key: U256, value: U256) {
        self.storage_overlay.insert(key, value);
    }

    pub fn cached_storage(&self, key: U256) -> Option<U256> {
        self.storage_overlay.get(&key).copied()
    }

    /// Records bytecode loaded from the store for this account's code hash.
    pub fn note_code(&mut self, code: Bytes) {
        self.code = Some(code);
        self.fresh_code = false;
    }

    /// New-contract path: the code is not yet hashed or persisted, so the
    /// recorded code hash is meaningless until commit resolves it.
    pub fn set_fresh_code(&mut self, code: Bytes) {
        self.code = Some(code);
        self.fresh_code = true;
        self.touch();
    }

    fn touch(&mut self) {
        if self.lifecycle == Lifecycle::Unchanged {
            self.lifecycle = Lifecycle::Dirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_account_starts_unchanged() {
        let account = Account::from_leaf(AccountState::default());
        assert!(!account.is_dirty());
        assert!(account.is_alive());
        assert!(account.is_empty());
    }

    #[test]
    fn balance_change_marks_dirty() {
        let mut account = Account::from_leaf(AccountState::default());
        account.add_balance(U256::from(5));
        assert!(account.is_dirty());
        assert_eq!(account.balance(), U256::from(5));
    }

    #[test]
    fn read_through_storage_does_not_dirty() {
        let mut account = Account::from_leaf(AccountState::default());
        account.cache_storage(U256::from(7), U256::from(42));
        assert!(!account.is_dirty());
        assert_eq!(account.cached_storage(U256::from(7)), Some(U256::from(42)));

        account.set_storage(U256::from(7), U256::from(43));
        assert!(account.is_dirty());
    }

    #[test]
    fn kill_zeroes_everything_and_stays_dead() {
        let mut account = Account::new_basic(U256::from(3), U256::from(100));
        account.set_storage(U256::from(1), U256::from(2));
        account.kill();
        assert!(!account.is_alive());
        assert!(account.is_dirty());
        assert!(account.balance().is_zero());
        assert!(account.storage_overlay().is_empty());

        account.add_balance(U256::from(1));
        assert!(!account.is_alive());
    }

    #[test]
    fn fresh_code_is_code_bearing_before_hashing() {
        let mut account = Account::new_contract(U256::from(1), U256::ZERO);
        assert!(!account.code_bearing());
        account.set_fresh_code(Bytes::from(vec![0x60, 0x00]));
        assert!(account.code_bearing());
        assert!(account.is_fresh_code());
        assert!(!account.is_empty());
    }

    #[test]
    fn note_code_clears_fresh_flag() {
        let mut account = Account::from_leaf(AccountState::default());
        account.note_code(Bytes::new());
        assert!(account.code_cached());
        assert!(!account.is_fresh_code());
        assert!(!account.is_dirty());
    }
}
