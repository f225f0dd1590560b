use alloy_primitives::U256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("trie error {0}")]
    Trie(#[from] eth_trie::TrieError),

    #[error("rlp error {0}")]
    Rlp(#[from] alloy_rlp::Error),

    #[error("rocksdb error {0}")]
    Database(#[from] rocksdb::Error),

    #[error("io error {0}")]
    Io(#[from] std::io::Error),

    #[error("not enough available space on disk")]
    NotEnoughAvailableSpace,

    #[error("state database already open: {0}")]
    DatabaseAlreadyOpen(String),

    #[error("account start nonce was read before it was set")]
    InvalidAccountStartNonce,

    #[error("account start nonce {actual} disagrees with the recorded {recorded}")]
    IncorrectAccountStartNonce { recorded: U256, actual: U256 },

    #[error("not enough cash: balance {balance} is below required {required}")]
    NotEnoughCash { balance: U256, required: U256 },

    #[error("state trie is corrupted")]
    InvalidTrie,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("interface not supported: {0}")]
    InterfaceNotSupported(&'static str),
}
