use alloy_consensus::EMPTY_ROOT_HASH;
use alloy_primitives::B256;
use eth_trie::DB;

use super::{error::StateError, overlay_db::OverlayDB};

static NULL_RLP_STATIC: [u8; 1] = [0x80; 1];

/// Per-account view over the overlay store, backing one storage trie.
///
/// Every key is prefixed with the 32-byte address hash so storage nodes of
/// different accounts never collide in the shared store.
#[derive(Debug, Clone)]
pub struct AccountDB {
    pub address_hash: B256,
    pub db: OverlayDB,
}

impl AccountDB {
    pub fn new(address_hash: B256, db: OverlayDB) -> Self {
        Self { address_hash, db }
    }

    fn get_db_key(&self, key: &[u8]) -> Vec<u8> {
        [self.address_hash.as_slice(), key].concat()
    }
}

impl DB for AccountDB {
    type Error = StateError;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        if B256::from_slice(key) == EMPTY_ROOT_HASH {
            return Ok(Some(NULL_RLP_STATIC.to_vec()));
        }
        self.db.get(&self.get_db_key(key))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        if B256::from_slice(key) == EMPTY_ROOT_HASH {
            return Ok(());
        }
        self.db.insert(&self.get_db_key(key), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StateError> {
        if B256::from_slice(key) == EMPTY_ROOT_HASH {
            return Ok(());
        }
        self.db.remove(&self.get_db_key(key));
        Ok(())
    }

    fn flush(&self) -> Result<(), StateError> {
        Ok(())
    }
}
