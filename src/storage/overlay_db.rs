use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use rocksdb::{IteratorMode, WriteBatch, DB as RocksDB};

use super::error::StateError;

/// Write-back overlay in front of the persistent store.
///
/// Puts and deletes are buffered in memory; reads consult the overlay first
/// and fall through to RocksDB. Nothing reaches disk until [`commit`] drains
/// the overlay into a single atomic write batch. Clones share the overlay,
/// so every trie handle opened over the same store sees the same buffered
/// writes.
///
/// [`commit`]: OverlayDB::commit
#[derive(Debug, Clone)]
pub struct OverlayDB {
    // A buffered delete is stored as `None` and reads as absent.
    overlay: Arc<RwLock<HashMap<Vec<u8>, Option<Vec<u8>>>>>,
    // If "light" is true, deletes are honored; otherwise they are dropped so
    // nodes referenced by historic roots stay readable.
    light: bool,
    db: Arc<RocksDB>,
}

impl OverlayDB {
    pub fn new(light: bool, db: Arc<RocksDB>) -> Self {
        Self {
            overlay: Arc::new(RwLock::new(HashMap::new())),
            light,
            db,
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(entry) = self.overlay.read().get(key) {
            return Ok(entry.clone());
        }
        Ok(self.db.get(key)?)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn insert(&self, key: &[u8], value: Vec<u8>) {
        self.overlay.write().insert(key.to_vec(), Some(value));
    }

    pub fn remove(&self, key: &[u8]) {
        if self.light {
            self.overlay.write().insert(key.to_vec(), None);
        }
    }

    /// Flushes every buffered write to RocksDB in one atomic batch and
    /// returns the number of entries flushed.
    pub fn commit(&self) -> Result<usize, StateError> {
        let mut overlay = self.overlay.write();
        let count = overlay.len();
        let mut batch = WriteBatch::default();
        for (key, value) in overlay.drain() {
            match value {
                Some(value) => batch.put(&key, &value),
                None => batch.delete(&key),
            }
        }
        self.db.write(batch)?;
        Ok(count)
    }

    /// Every key visible through this store, overlay and disk combined.
    /// Diagnostic use only; walks the whole database.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let overlay = self.overlay.read();
        let mut keys: Vec<Vec<u8>> = overlay
            .iter()
            .filter(|(_, value)| value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for (key, _) in self.db.iterator(IteratorMode::Start).flatten() {
            if !overlay.contains_key(key.as_ref()) {
                keys.push(key.to_vec());
            }
        }
        keys
    }

    pub fn pending_writes(&self) -> usize {
        self.overlay.read().len()
    }
}

impl eth_trie::DB for OverlayDB {
    type Error = StateError;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        OverlayDB::get(self, key)
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error> {
        OverlayDB::insert(self, key, value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Self::Error> {
        OverlayDB::remove(self, key);
        Ok(())
    }

    fn flush(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
