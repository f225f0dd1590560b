use std::{collections::HashMap, sync::Arc};

use alloy_primitives::B256;
use parking_lot::Mutex;

/// Entries beyond this are evicted; the cache is keyed by code hash so any
/// entry can go without ever serving a stale size.
const CODE_SIZE_CACHE_LIMIT: usize = 50_000;

/// Process-wide cache of code-hash to bytecode length, so learning a
/// contract's code size does not force reloading its bytecode.
///
/// Shared across every `State` in the process; clone the handle and hand it
/// to each engine. Tests inject their own instance to control its contents.
#[derive(Debug, Clone, Default)]
pub struct CodeSizeCache {
    sizes: Arc<Mutex<HashMap<B256, usize>>>,
}

impl CodeSizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, code_hash: B256) -> bool {
        self.sizes.lock().contains_key(&code_hash)
    }

    pub fn get(&self, code_hash: B256) -> Option<usize> {
        self.sizes.lock().get(&code_hash).copied()
    }

    pub fn store(&self, code_hash: B256, size: usize) {
        let mut sizes = self.sizes.lock();
        if sizes.len() >= CODE_SIZE_CACHE_LIMIT && !sizes.contains_key(&code_hash) {
            // Evict an arbitrary entry; which one does not matter.
            if let Some(victim) = sizes.keys().next().copied() {
                sizes.remove(&victim);
            }
        }
        sizes.insert(code_hash, size);
    }

    pub fn len(&self) -> usize {
        self.sizes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.lock().is_empty()
    }
}
