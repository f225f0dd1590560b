//! Account-based world state over a Merkle-Patricia trie.
//!
//! [`State`] maps every address to its nonce, balance, code and per-account
//! storage, backed by a hashed-key trie persisted through a write-back
//! [`OverlayDB`] over RocksDB. Reads populate an in-memory account cache
//! lazily; mutations dirty cache entries; `commit` folds the dirty set into
//! the trie and produces the new root, while dropping the cache reverts
//! everything since the last commit. Transaction execution plugs in through
//! the [`Executive`] trait and either commits or reverts atomically.

pub mod account;
pub mod code_cache;
pub mod config;
pub mod executive;
pub mod metrics;
pub mod state;
pub mod storage;

pub use account::{Account, AccountState, Lifecycle};
pub use code_cache::CodeSizeCache;
pub use config::StateConfig;
pub use executive::{
    ChainParams, EnvInfo, Executive, ExecutionResult, LogEntry, OnOpFn, Permanence, SealEngine,
    Transaction, TransactionException, TransactionReceipt,
};
pub use state::{BaseState, CommitBehaviour, State};
pub use storage::{
    error::StateError,
    overlay_db::OverlayDB,
    utils::{open_db, WithExisting, DATABASE_VERSION},
};
