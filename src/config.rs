/// Runtime tunables for a `State` engine.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Maintain an address-preimage index at commit so `addresses()` and the
    /// pretty-printer can resolve hashed trie keys.
    pub fat_db: bool,
    /// Revalidate the trie around commits and execution. Expensive; meant
    /// for development runs.
    pub paranoid_checks: bool,
    /// Unchanged cache entries above this count become eviction candidates.
    pub cache_soft_limit: usize,
    /// Seed for the eviction RNG; fixed seeds make eviction reproducible in
    /// tests.
    pub eviction_seed: Option<u64>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            fat_db: false,
            paranoid_checks: false,
            cache_soft_limit: 1000,
            eviction_seed: None,
        }
    }
}
