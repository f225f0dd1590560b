use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use alloy_consensus::{constants::KECCAK_EMPTY, EMPTY_ROOT_HASH};
use alloy_primitives::{hex, keccak256, Address, Bytes, B256, U256};
use alloy_rlp::Decodable;
use eth_trie::{EthTrie, Trie};
use parking_lot::{Mutex, MutexGuard};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, enabled, trace, warn, Level};

use crate::{
    account::{Account, AccountState},
    code_cache::CodeSizeCache,
    config::StateConfig,
    executive::{
        EnvInfo, Executive, ExecutionResult, OnOpFn, Permanence, SealEngine, Transaction,
        TransactionReceipt,
    },
    metrics::{start_timer_vec, stop_timer, COMMIT_PROCESSING_TIMES, EXECUTION_PROCESSING_TIMES},
    storage::{account_db::AccountDB, error::StateError, overlay_db::OverlayDB},
};

// Address preimages for the fat-db index live under this prefix, next to
// trie nodes and code blobs in the shared store.
const ADDRESS_PREIMAGE_PREFIX: &[u8] = b"addr:";

/// Whether a new `State` starts from a freshly initialised empty trie or a
/// pre-existing root the caller will install via [`State::set_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseState {
    Empty,
    PreExisting,
}

/// Commit-time handling of touched-but-empty accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitBehaviour {
    KeepEmptyAccounts,
    /// Dirty empty accounts are pruned from the trie; the hard-fork rule.
    RemoveEmptyAccounts,
}

struct CacheInner {
    accounts: HashMap<Address, Account>,
    // Addresses cached by reads but never mutated; the eviction candidate
    // pool. Best effort: entries may have turned dirty since insertion.
    unchanged: Vec<Address>,
    rng: StdRng,
}

/// The world-state engine.
///
/// Maps addresses to accounts over a Merkle-Patricia trie persisted through
/// an [`OverlayDB`]. Reads populate an in-memory cache lazily; mutations
/// dirty cache entries; [`commit`] flushes dirty entries into the trie and
/// updates the root. Dropping the cache (or executing with
/// [`Permanence::Reverted`]) abandons every mutation since the last commit.
///
/// Single-writer: readers take `&self` but still mutate the cache under its
/// lock, so concurrent use requires external exclusivity.
///
/// [`commit`]: State::commit
pub struct State {
    db: OverlayDB,
    trie: Arc<Mutex<EthTrie<OverlayDB>>>,
    cache: Mutex<CacheInner>,
    touched: Mutex<HashSet<Address>>,
    account_start_nonce: Option<U256>,
    code_sizes: CodeSizeCache,
    config: StateConfig,
}

impl State {
    pub fn new(account_start_nonce: U256, db: OverlayDB, base: BaseState) -> Self {
        Self::with_config(
            account_start_nonce,
            db,
            base,
            StateConfig::default(),
            CodeSizeCache::new(),
        )
    }

    pub fn with_config(
        account_start_nonce: U256,
        db: OverlayDB,
        base: BaseState,
        config: StateConfig,
        code_sizes: CodeSizeCache,
    ) -> Self {
        // A newly built trie is the initialised empty trie; a PreExisting
        // caller installs its root via set_root before first use.
        debug!(?base, "Creating state engine");
        let trie = EthTrie::new(Arc::new(db.clone()));
        Self {
            db,
            trie: Arc::new(Mutex::new(trie)),
            cache: Mutex::new(CacheInner {
                accounts: HashMap::new(),
                unchanged: Vec::new(),
                rng: Self::eviction_rng(&config),
            }),
            touched: Mutex::new(HashSet::new()),
            account_start_nonce: Some(account_start_nonce),
            code_sizes,
            config,
        }
    }

    /// Opens an existing state at `root` with the account start nonce
    /// unset; [`note_account_start_nonce`] records it once known.
    ///
    /// [`note_account_start_nonce`]: State::note_account_start_nonce
    pub fn from_existing(db: OverlayDB, root: B256) -> Result<Self, StateError> {
        let config = StateConfig::default();
        let trie = Self::open_trie(&db, root)?;
        Ok(Self {
            db,
            trie: Arc::new(Mutex::new(trie)),
            cache: Mutex::new(CacheInner {
                accounts: HashMap::new(),
                unchanged: Vec::new(),
                rng: Self::eviction_rng(&config),
            }),
            touched: Mutex::new(HashSet::new()),
            account_start_nonce: None,
            code_sizes: CodeSizeCache::new(),
            config,
        })
    }

    fn eviction_rng(config: &StateConfig) -> StdRng {
        match config.eviction_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn open_trie(db: &OverlayDB, root: B256) -> Result<EthTrie<OverlayDB>, StateError> {
        if root == EMPTY_ROOT_HASH {
            Ok(EthTrie::new(Arc::new(db.clone())))
        } else {
            Ok(EthTrie::from(Arc::new(db.clone()), root)?)
        }
    }

    /// An independent view of the same state: shared store and code-size
    /// cache, own trie handle at the current root, cache copied by value.
    pub fn snapshot(&self) -> Result<Self, StateError> {
        let root = self.trie.lock().root_hash()?;
        let inner = self.cache.lock();
        Ok(Self {
            db: self.db.clone(),
            trie: Arc::new(Mutex::new(Self::open_trie(&self.db, root)?)),
            cache: Mutex::new(CacheInner {
                accounts: inner.accounts.clone(),
                unchanged: inner.unchanged.clone(),
                rng: inner.rng.clone(),
            }),
            touched: Mutex::new(self.touched.lock().clone()),
            account_start_nonce: self.account_start_nonce,
            code_sizes: self.code_sizes.clone(),
            config: self.config.clone(),
        })
    }

    pub fn db(&self) -> &OverlayDB {
        &self.db
    }

    pub fn root_hash(&self) -> Result<B256, StateError> {
        Ok(self.trie.lock().root_hash()?)
    }

    /// Points the engine at another root, dropping the cache; stale entries
    /// would otherwise shadow the new root.
    pub fn set_root(&mut self, root: B256) -> Result<(), StateError> {
        {
            let mut inner = self.cache.lock();
            inner.accounts.clear();
            inner.unchanged.clear();
        }
        *self.trie.lock() = Self::open_trie(&self.db, root)?;
        Ok(())
    }

    pub fn require_account_start_nonce(&self) -> Result<U256, StateError> {
        self.account_start_nonce
            .ok_or(StateError::InvalidAccountStartNonce)
    }

    /// Records the chain's account start nonce on a state opened without
    /// one; a later disagreeing value is a consistency violation.
    pub fn note_account_start_nonce(&mut self, actual: U256) -> Result<(), StateError> {
        match self.account_start_nonce {
            None => {
                self.account_start_nonce = Some(actual);
                Ok(())
            }
            Some(recorded) if recorded == actual => Ok(()),
            Some(recorded) => Err(StateError::IncorrectAccountStartNonce { recorded, actual }),
        }
    }

    /// Addresses whose trie leaf has changed over this engine's lifetime.
    pub fn touched(&self) -> HashSet<Address> {
        self.touched.lock().clone()
    }

    fn cache(&self) -> MutexGuard<'_, CacheInner> {
        self.cache.lock()
    }

    /// The central read path: makes sure `address` is cached if it exists
    /// at all, loading the trie leaf (and, on request, the bytecode) on a
    /// miss.
    fn ensure_loaded(
        &self,
        inner: &mut CacheInner,
        address: Address,
        require_code: bool,
    ) -> Result<(), StateError> {
        if !inner.accounts.contains_key(&address) {
            let address_hash = keccak256(address);
            let Some(raw_leaf) = self.trie.lock().get(address_hash.as_slice())? else {
                return Ok(());
            };
            let leaf = AccountState::decode(&mut raw_leaf.as_slice())?;
            inner.accounts.insert(address, Account::from_leaf(leaf));
            inner.unchanged.push(address);
            self.clear_cache_if_too_large(inner);
        }

        let Some(account) = inner.accounts.get_mut(&address) else {
            return Ok(());
        };
        if require_code && !account.is_fresh_code() && !account.code_cached() {
            let code = if account.code_hash() == KECCAK_EMPTY {
                Bytes::new()
            } else {
                self.db
                    .get(account.code_hash().as_slice())?
                    .map(Bytes::from)
                    .unwrap_or_default()
            };
            self.code_sizes.store(account.code_hash(), code.len());
            account.note_code(code);
        }
        Ok(())
    }

    /// Evicts random unchanged entries while the candidate pool exceeds the
    /// soft limit. Dirty entries never leave the cache; the pool is best
    /// effort, not an index of eligibility.
    fn clear_cache_if_too_large(&self, inner: &mut CacheInner) {
        while inner.unchanged.len() > self.config.cache_soft_limit {
            let random_index = inner.rng.gen_range(0..inner.unchanged.len());
            let address = inner.unchanged.swap_remove(random_index);
            if let Some(account) = inner.accounts.get(&address) {
                if !account.is_dirty() {
                    inner.accounts.remove(&address);
                }
            }
        }
    }

    fn with_account<R>(
        &self,
        address: Address,
        require_code: bool,
        f: impl FnOnce(Option<&Account>) -> R,
    ) -> Result<R, StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, require_code)?;
        Ok(f(inner.accounts.get(&address)))
    }

    pub fn address_in_use(&self, address: Address) -> Result<bool, StateError> {
        self.with_account(address, false, |account| account.is_some())
    }

    pub fn account_nonempty_and_existing(&self, address: Address) -> Result<bool, StateError> {
        self.with_account(address, false, |account| {
            account.map(|a| !a.is_empty()).unwrap_or(false)
        })
    }

    pub fn address_has_code(&self, address: Address) -> Result<bool, StateError> {
        self.with_account(address, false, |account| {
            account.map(|a| a.code_bearing()).unwrap_or(false)
        })
    }

    pub fn balance(&self, address: Address) -> Result<U256, StateError> {
        self.with_account(address, false, |account| {
            account.map(|a| a.balance()).unwrap_or(U256::ZERO)
        })
    }

    pub fn nonce(&self, address: Address) -> Result<U256, StateError> {
        let nonce = self.with_account(address, false, |account| account.map(|a| a.nonce()))?;
        match nonce {
            Some(nonce) => Ok(nonce),
            None => self.require_account_start_nonce(),
        }
    }

    pub fn code(&self, address: Address) -> Result<Bytes, StateError> {
        if !self.address_has_code(address)? {
            return Ok(Bytes::new());
        }
        self.with_account(address, true, |account| {
            account
                .and_then(|a| a.code().cloned())
                .unwrap_or_default()
        })
    }

    pub fn code_hash(&self, address: Address) -> Result<B256, StateError> {
        self.with_account(address, false, |account| match account {
            Some(a) if a.is_fresh_code() => {
                keccak256(a.code().cloned().unwrap_or_default())
            }
            Some(a) => a.code_hash(),
            None => KECCAK_EMPTY,
        })
    }

    pub fn code_size(&self, address: Address) -> Result<usize, StateError> {
        let summary = self.with_account(address, false, |account| {
            account.map(|a| (a.is_fresh_code(), a.code_hash(), a.code().map(|c| c.len())))
        })?;
        match summary {
            None => Ok(0),
            Some((true, _, cached_len)) => Ok(cached_len.unwrap_or(0)),
            Some((false, code_hash, _)) => {
                if let Some(size) = self.code_sizes.get(code_hash) {
                    return Ok(size);
                }
                let size = self.code(address)?.len();
                self.code_sizes.store(code_hash, size);
                Ok(size)
            }
        }
    }

    /// Storage root straight from the trie leaf, bypassing the cache.
    pub fn storage_root(&self, address: Address) -> Result<B256, StateError> {
        let raw = self.trie.lock().get(keccak256(address).as_slice())?;
        match raw {
            Some(raw) => Ok(AccountState::decode(&mut raw.as_slice())?.storage_root),
            None => Ok(EMPTY_ROOT_HASH),
        }
    }

    /// Effective storage value: overlay if cached, else the storage trie at
    /// the account's base root, else zero. Trie reads populate the overlay
    /// as a read-through cache without dirtying the account.
    pub fn storage(&self, address: Address, key: U256) -> Result<U256, StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        let Some(account) = inner.accounts.get_mut(&address) else {
            return Ok(U256::ZERO);
        };
        if let Some(value) = account.cached_storage(key) {
            return Ok(value);
        }

        let value = if account.storage_root() == EMPTY_ROOT_HASH {
            U256::ZERO
        } else {
            let storage_trie = Self::storage_trie_at(
                &self.db,
                keccak256(address),
                account.storage_root(),
            )?;
            match storage_trie.get(keccak256(B256::from(key)).as_slice())? {
                Some(raw) => U256::decode(&mut raw.as_slice())?,
                None => U256::ZERO,
            }
        };
        account.cache_storage(key, value);
        Ok(value)
    }

    /// Materialises the whole storage of an account, dirty overlay entries
    /// layered over the trie contents. Keys are hashed slots, the only form
    /// the trie can enumerate; zero values are erased from the view.
    /// Introspection only.
    pub fn storage_map(&self, address: Address) -> Result<BTreeMap<B256, U256>, StateError> {
        let mut out = BTreeMap::new();
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        let Some(account) = inner.accounts.get(&address) else {
            return Ok(out);
        };

        if account.storage_root() != EMPTY_ROOT_HASH {
            let storage_trie = Self::storage_trie_at(
                &self.db,
                keccak256(address),
                account.storage_root(),
            )?;
            for slot in storage_trie.iter() {
                let (hashed_key, raw_value) = slot?;
                let value = U256::decode(&mut raw_value.as_slice())?;
                out.insert(B256::from_slice(&hashed_key), value);
            }
        }

        for (key, value) in account.storage_overlay() {
            let hashed_key = keccak256(B256::from(*key));
            if value.is_zero() {
                out.remove(&hashed_key);
            } else {
                out.insert(hashed_key, *value);
            }
        }
        Ok(out)
    }

    fn storage_trie_at(
        db: &OverlayDB,
        address_hash: B256,
        root: B256,
    ) -> Result<EthTrie<AccountDB>, StateError> {
        let account_db = Arc::new(AccountDB::new(address_hash, db.clone()));
        if root == EMPTY_ROOT_HASH {
            Ok(EthTrie::new(account_db))
        } else {
            Ok(EthTrie::from(account_db, root)?)
        }
    }

    pub fn add_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        match inner.accounts.get_mut(&address) {
            Some(account) => account.add_balance(amount),
            None => {
                let start_nonce = self.require_account_start_nonce()?;
                inner
                    .accounts
                    .insert(address, Account::new_basic(start_nonce, amount));
            }
        }
        Ok(())
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        match inner.accounts.get_mut(&address) {
            Some(account) if account.balance() >= amount => {
                account.sub_balance(amount);
                Ok(())
            }
            Some(account) => Err(StateError::NotEnoughCash {
                balance: account.balance(),
                required: amount,
            }),
            None => Err(StateError::NotEnoughCash {
                balance: U256::ZERO,
                required: amount,
            }),
        }
    }

    pub fn transfer_balance(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), StateError> {
        self.sub_balance(from, amount)?;
        self.add_balance(to, amount)
    }

    pub fn inc_nonce(&mut self, address: Address) -> Result<(), StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        match inner.accounts.get_mut(&address) {
            Some(account) => account.inc_nonce(),
            None => {
                // Possible with a gas price of zero: the nonce moves without
                // the balance ever having been touched.
                let start_nonce = self.require_account_start_nonce()?;
                inner.accounts.insert(
                    address,
                    Account::new_basic(start_nonce + U256::from(1), U256::ZERO),
                );
            }
        }
        Ok(())
    }

    pub fn ensure_account_exists(&mut self, address: Address) -> Result<(), StateError> {
        if !self.address_in_use(address)? {
            let start_nonce = self.require_account_start_nonce()?;
            self.cache()
                .accounts
                .insert(address, Account::new_basic(start_nonce, U256::ZERO));
        }
        Ok(())
    }

    /// Replaces whatever lives at `address` with a newly conceived
    /// contract, preserving any balance already there.
    pub fn create_contract(
        &mut self,
        address: Address,
        increment_nonce: bool,
    ) -> Result<(), StateError> {
        let start_nonce = self.require_account_start_nonce()?;
        let balance = self.balance(address)?;
        let nonce = if increment_nonce {
            start_nonce + U256::from(1)
        } else {
            start_nonce
        };
        self.cache()
            .accounts
            .insert(address, Account::new_contract(nonce, balance));
        Ok(())
    }

    /// Installs fresh bytecode on an account; hashed and persisted at
    /// commit.
    pub fn set_code(&mut self, address: Address, code: Bytes) -> Result<(), StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        match inner.accounts.get_mut(&address) {
            Some(account) => account.set_fresh_code(code),
            None => {
                let start_nonce = self.require_account_start_nonce()?;
                let mut account = Account::new_contract(start_nonce, U256::ZERO);
                account.set_fresh_code(code);
                inner.accounts.insert(address, account);
            }
        }
        Ok(())
    }

    pub fn set_storage(
        &mut self,
        address: Address,
        key: U256,
        value: U256,
    ) -> Result<(), StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        match inner.accounts.get_mut(&address) {
            Some(account) => account.set_storage(key, value),
            None => {
                let start_nonce = self.require_account_start_nonce()?;
                let mut account = Account::new_basic(start_nonce, U256::ZERO);
                account.set_storage(key, value);
                inner.accounts.insert(address, account);
            }
        }
        Ok(())
    }

    /// Marks the account for deletion at the next commit. Killing an
    /// address that is in neither cache nor trie is a no-op, not an error;
    /// the trie is authoritative and there is nothing to kill.
    pub fn kill(&mut self, address: Address) -> Result<(), StateError> {
        let mut inner = self.cache();
        self.ensure_loaded(&mut inner, address, false)?;
        if let Some(account) = inner.accounts.get_mut(&address) {
            account.kill();
        }
        Ok(())
    }

    fn remove_empty_accounts(&mut self) {
        for account in self.cache().accounts.values_mut() {
            if account.is_dirty() && account.is_empty() {
                account.kill();
            }
        }
    }

    /// Flushes every dirty cache entry into the trie and clears the cache.
    ///
    /// Killed accounts lose their leaf and their storage trie; dirty
    /// accounts get their storage overlay folded into their storage trie,
    /// fresh code hashed and persisted, and their leaf re-encoded. Returns
    /// the new root; the set of changed addresses accumulates in
    /// [`touched`](State::touched).
    pub fn commit(&mut self, behaviour: CommitBehaviour) -> Result<B256, StateError> {
        if behaviour == CommitBehaviour::RemoveEmptyAccounts {
            let timer = start_timer_vec(&COMMIT_PROCESSING_TIMES, &["remove_empty_accounts"]);
            self.remove_empty_accounts();
            stop_timer(timer);
        }

        let accounts: Vec<(Address, Account)> = {
            let mut inner = self.cache();
            inner.unchanged.clear();
            inner.accounts.drain().collect()
        };

        let timer = start_timer_vec(&COMMIT_PROCESSING_TIMES, &["flush_accounts"]);
        let mut changed: Vec<Address> = Vec::new();
        let root = {
            let mut trie = self.trie.lock();
            for (address, account) in accounts {
                if !account.is_dirty() {
                    continue;
                }
                let address_hash = keccak256(address);
                if !account.is_alive() {
                    Self::wipe_storage_trie(&self.db, &mut trie, address_hash)?;
                    trie.remove(address_hash.as_slice())?;
                } else {
                    let leaf = self.flush_account(address_hash, &account)?;
                    trie.insert(address_hash.as_slice(), &alloy_rlp::encode(leaf))?;
                    if self.config.fat_db {
                        self.db
                            .insert(&preimage_key(address_hash.as_slice()), address.to_vec());
                    }
                }
                changed.push(address);
            }
            trie.root_hash()?
        };
        stop_timer(timer);

        self.touched.lock().extend(changed);

        if self.config.paranoid_checks && !self.is_trie_good(true) {
            return Err(StateError::InvalidTrie);
        }
        Ok(root)
    }

    /// Folds one live account's overlay and code into the store and returns
    /// the leaf to insert.
    fn flush_account(
        &self,
        address_hash: B256,
        account: &Account,
    ) -> Result<AccountState, StateError> {
        let mut storage_root = account.storage_root();
        if !account.storage_overlay().is_empty() {
            let mut storage_trie = Self::storage_trie_at(&self.db, address_hash, storage_root)?;
            for (key, value) in account.storage_overlay() {
                let slot_hash = keccak256(B256::from(*key));
                if value.is_zero() {
                    storage_trie.remove(slot_hash.as_slice())?;
                } else {
                    storage_trie.insert(slot_hash.as_slice(), &alloy_rlp::encode(value))?;
                }
            }
            storage_root = storage_trie.root_hash()?;
        }

        let code_hash = if account.is_fresh_code() {
            let code = account.code().cloned().unwrap_or_default();
            let code_hash = keccak256(&code);
            if !code.is_empty() {
                self.db.insert(code_hash.as_slice(), code.to_vec());
            }
            code_hash
        } else {
            account.code_hash()
        };

        Ok(AccountState {
            nonce: account.nonce(),
            balance: account.balance(),
            storage_root,
            code_hash,
        })
    }

    fn wipe_storage_trie(
        db: &OverlayDB,
        trie: &mut EthTrie<OverlayDB>,
        address_hash: B256,
    ) -> Result<(), StateError> {
        let Some(raw_leaf) = trie.get(address_hash.as_slice())? else {
            return Ok(());
        };
        let leaf = AccountState::decode(&mut raw_leaf.as_slice())?;
        if leaf.storage_root != EMPTY_ROOT_HASH {
            let mut storage_trie = Self::storage_trie_at(db, address_hash, leaf.storage_root)?;
            storage_trie.clear_trie_from_db()?;
        }
        Ok(())
    }

    /// Runs a transaction through the external executive and either commits
    /// the cache or drops it, per `permanence`.
    ///
    /// VM faults surface inside the returned [`ExecutionResult`], never as
    /// `Err`; a faulted transaction still commits its fee and nonce
    /// effects. When no opcode observer is supplied and trace logging is
    /// enabled for the `vm` target, a logging observer is substituted.
    pub fn execute(
        &mut self,
        env: &EnvInfo,
        engine: &dyn SealEngine,
        tx: &Transaction,
        executive: &mut dyn Executive,
        permanence: Permanence,
        on_op: Option<&mut OnOpFn<'_>>,
    ) -> Result<(ExecutionResult, TransactionReceipt), StateError> {
        if self.config.paranoid_checks && !self.is_trie_good(true) {
            return Err(StateError::InvalidTrie);
        }

        let timer = start_timer_vec(&EXECUTION_PROCESSING_TIMES, &["initialize"]);
        executive.initialize(self, env, tx)?;
        stop_timer(timer);

        let mut default_tracer = |step: u64, opcode: u8, gas_left: U256| {
            trace!(target: "vm", step, opcode = opcode as u64, gas_left = %gas_left, "op");
        };
        let on_op = match on_op {
            Some(on_op) => Some(on_op),
            None if enabled!(target: "vm", Level::TRACE) => {
                Some(&mut default_tracer as &mut OnOpFn<'_>)
            }
            None => None,
        };

        let timer = start_timer_vec(&EXECUTION_PROCESSING_TIMES, &["vm"]);
        if !executive.execute(self)? {
            executive.go(self, on_op)?;
        }
        stop_timer(timer);

        let timer = start_timer_vec(&EXECUTION_PROCESSING_TIMES, &["finalize"]);
        let result = executive.finalize(self)?;
        stop_timer(timer);

        match permanence {
            Permanence::Reverted => {
                let mut inner = self.cache();
                inner.accounts.clear();
                inner.unchanged.clear();
            }
            Permanence::Committed => {
                let behaviour = if env.number >= engine.chain_params().eip158_fork_block {
                    CommitBehaviour::RemoveEmptyAccounts
                } else {
                    CommitBehaviour::KeepEmptyAccounts
                };
                let timer = start_timer_vec(&EXECUTION_PROCESSING_TIMES, &["commit"]);
                self.commit(behaviour)?;
                stop_timer(timer);
            }
        }

        let receipt = TransactionReceipt {
            state_root: self.root_hash()?,
            cumulative_gas_used: env.gas_used + result.gas_used,
            logs: executive.logs().to_vec(),
        };
        Ok((result, receipt))
    }

    /// Every address the trie knows, mapped to its balance, with live cache
    /// entries layered on top. Needs the fat-db address index.
    pub fn addresses(&self) -> Result<HashMap<Address, U256>, StateError> {
        if !self.config.fat_db {
            return Err(StateError::InterfaceNotSupported("addresses"));
        }
        let mut out = HashMap::new();
        {
            let trie = self.trie.lock();
            for item in trie.iter() {
                let (address_hash, raw_leaf) = item?;
                let leaf = AccountState::decode(&mut raw_leaf.as_slice())?;
                if let Some(address) = self.lookup_preimage(&address_hash)? {
                    out.insert(address, leaf.balance);
                }
            }
        }
        let inner = self.cache();
        for (address, account) in &inner.accounts {
            if account.is_alive() {
                out.insert(*address, account.balance());
            } else {
                out.remove(address);
            }
        }
        Ok(out)
    }

    fn lookup_preimage(&self, address_hash: &[u8]) -> Result<Option<Address>, StateError> {
        Ok(self
            .db
            .get(&preimage_key(address_hash))?
            .map(|raw| Address::from_slice(&raw)))
    }

    /// Walks every account leaf, fully iterates each storage trie and, when
    /// `check_code` is set, requires bytecode to be present for every
    /// non-empty code hash. Returns false on any detected corruption.
    pub fn is_trie_good(&self, check_code: bool) -> bool {
        match self.check_trie(check_code) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "state trie failed validation");
                false
            }
        }
    }

    fn check_trie(&self, check_code: bool) -> Result<(), StateError> {
        let trie = self.trie.lock();
        for item in trie.iter() {
            let (address_hash, raw_leaf) = item?;
            let leaf = AccountState::decode(&mut raw_leaf.as_slice())?;
            if leaf.storage_root != EMPTY_ROOT_HASH {
                let storage_trie = Self::storage_trie_at(
                    &self.db,
                    B256::from_slice(&address_hash),
                    leaf.storage_root,
                )?;
                for slot in storage_trie.iter() {
                    slot?;
                }
            }
            if check_code
                && leaf.code_hash != KECCAK_EMPTY
                && !self.db.contains(leaf.code_hash.as_slice())?
            {
                return Err(StateError::InvalidTrie);
            }
        }
        Ok(())
    }

    fn pretty_print(&self, out: &mut String) -> Result<(), StateError> {
        use std::fmt::Write as _;

        let root = self.trie.lock().root_hash()?;
        let _ = writeln!(out, "--- {root}");

        // Snapshot the cache first, then walk the trie; printing never holds
        // both locks.
        let cached: BTreeMap<Address, Account> = {
            let inner = self.cache();
            inner
                .accounts
                .iter()
                .map(|(address, account)| (*address, account.clone()))
                .collect()
        };

        let mut leaves: BTreeMap<Address, AccountState> = BTreeMap::new();
        {
            let trie = self.trie.lock();
            if self.config.fat_db {
                for item in trie.iter() {
                    let (address_hash, raw_leaf) = item?;
                    if let Some(address) = self.lookup_preimage(&address_hash)? {
                        leaves.insert(address, AccountState::decode(&mut raw_leaf.as_slice())?);
                    }
                }
            }
            for address in cached.keys() {
                if leaves.contains_key(address) {
                    continue;
                }
                if let Some(raw_leaf) = trie.get(keccak256(address).as_slice())? {
                    leaves.insert(*address, AccountState::decode(&mut raw_leaf.as_slice())?);
                }
            }
        }

        let mut addresses: Vec<Address> = leaves.keys().chain(cached.keys()).copied().collect();
        addresses.sort();
        addresses.dedup();

        for address in addresses {
            let account = cached.get(&address);
            let leaf = leaves.get(&address);

            if account.map(|a| !a.is_alive()).unwrap_or(false) {
                let _ = writeln!(out, "XXX  {address}");
                continue;
            }

            let mut lead = match (account, leaf) {
                (Some(a), Some(r)) if a.nonce() == r.nonce && a.balance() == r.balance => " .   ",
                (Some(_), Some(_)) => " *   ",
                (Some(_), None) => " +   ",
                (None, _) => "     ",
            };

            let nonce = account.map(|a| a.nonce()).or(leaf.map(|r| r.nonce)).unwrap_or_default();
            let balance = account
                .map(|a| a.balance())
                .or(leaf.map(|r| r.balance))
                .unwrap_or_default();

            let code_bearing = account.map(|a| a.code_bearing()).unwrap_or(false)
                || leaf.map(|r| r.code_hash != KECCAK_EMPTY).unwrap_or(false);

            let mut contout = String::new();
            if code_bearing {
                // Slot view keyed by hashed slot: trie contents first, then
                // the overlay layered on top.
                let mut mem: BTreeMap<B256, U256> = BTreeMap::new();
                let mut back: HashSet<B256> = HashSet::new();
                let mut delta: HashSet<B256> = HashSet::new();
                let mut read_cached: HashSet<B256> = HashSet::new();

                if let Some(leaf) = leaf {
                    if leaf.storage_root != EMPTY_ROOT_HASH {
                        let storage_trie = Self::storage_trie_at(
                            &self.db,
                            keccak256(address),
                            leaf.storage_root,
                        )?;
                        for slot in storage_trie.iter() {
                            let (hashed_key, raw_value) = slot?;
                            let hashed_key = B256::from_slice(&hashed_key);
                            mem.insert(hashed_key, U256::decode(&mut raw_value.as_slice())?);
                            back.insert(hashed_key);
                        }
                    }
                }
                if let Some(account) = account {
                    for (key, value) in account.storage_overlay() {
                        let hashed_key = keccak256(B256::from(*key));
                        let known = mem.get(&hashed_key).copied();
                        if (known.is_none() && !value.is_zero())
                            || (known.is_some() && known != Some(*value))
                        {
                            mem.insert(hashed_key, *value);
                            delta.insert(hashed_key);
                        } else if !value.is_zero() {
                            read_cached.insert(hashed_key);
                        }
                    }
                }
                if !delta.is_empty() {
                    lead = if lead == " .   " { "*.*  " } else { "***  " };
                }

                let _ = write!(contout, " @:");
                if !delta.is_empty() {
                    let _ = write!(contout, "???");
                } else if let Some(leaf) = leaf {
                    let _ = write!(contout, "{}", leaf.storage_root);
                } else {
                    let _ = write!(contout, "{EMPTY_ROOT_HASH}");
                }
                match account {
                    Some(a) if a.is_fresh_code() => {
                        let code = a.code().cloned().unwrap_or_default();
                        let _ = write!(contout, " ${}", hex::encode(&code));
                    }
                    Some(a) => {
                        let _ = write!(contout, " ${}", a.code_hash());
                    }
                    None => {
                        let code_hash = leaf.map(|r| r.code_hash).unwrap_or(KECCAK_EMPTY);
                        let _ = write!(contout, " ${code_hash}");
                    }
                }

                for (hashed_key, value) in &mem {
                    if value.is_zero() {
                        let _ = write!(contout, "\nXXX    {hashed_key}");
                    } else {
                        let tag = if delta.contains(hashed_key) {
                            if back.contains(hashed_key) {
                                " *     "
                            } else {
                                " +     "
                            }
                        } else if read_cached.contains(hashed_key) {
                            " .     "
                        } else {
                            "       "
                        };
                        let _ = write!(contout, "\n{tag}{hashed_key}: {value}");
                    }
                }
            } else {
                contout.push_str(" [SIMPLE]");
            }
            let _ = writeln!(out, "{lead}{address}: {nonce} #:{balance}{contout}");
        }
        Ok(())
    }
}

fn preimage_key(address_hash: &[u8]) -> Vec<u8> {
    [ADDRESS_PREIMAGE_PREFIX, address_hash].concat()
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.pretty_print(&mut out).map_err(|_| fmt::Error)?;
        f.write_str(&out)
    }
}
