//! Per-run lookup cache
//!
//! Memoizes expensive lookups (directory creation, remote id resolution)
//! for the duration of a run. Concurrent callers asking for the same key
//! share one computation; a failed computation is not cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Async get-or-compute map shared by workers
#[derive(Debug)]
pub struct LookupCache<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for LookupCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> LookupCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Cached value for `key`, if already computed
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Return the cached value or compute it with `init`
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(&key);
        let value = cell.get_or_try_init(init).await?.clone();
        Ok(value)
    }

    /// Number of computed entries
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    /// True when nothing has been computed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
