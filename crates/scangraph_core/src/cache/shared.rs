//! Process-wide snapshot cache.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generation observed before a database read; see
/// [`SharedCache::set_many_if_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken(u64);

/// Long-lived cache shared by all transactions.
///
/// Values are stored as `Arc<V>` and never mutated in place: a write replaces
/// the `Arc`, so snapshots already returned stay unchanged.
pub struct SharedCache<V> {
    entries: RwLock<HashMap<String, Arc<V>>>,
    generation: AtomicU64,
}

impl<V> Default for SharedCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<V> SharedCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `ids` into cached snapshots and de-duplicated misses.
    pub fn get_many<S: AsRef<str>>(&self, ids: &[S]) -> (HashMap<String, Arc<V>>, Vec<String>) {
        let entries = self.entries.read();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        let mut seen_missing = HashSet::new();
        for id in ids {
            let id = id.as_ref();
            match entries.get(id) {
                Some(value) => {
                    found.insert(id.to_string(), Arc::clone(value));
                }
                None => {
                    if seen_missing.insert(id) {
                        missing.push(id.to_string());
                    }
                }
            }
        }
        (found, missing)
    }

    pub fn set_many(&self, values: impl IntoIterator<Item = (String, V)>) {
        let mut entries = self.entries.write();
        for (id, value) in values {
            entries.insert(id, Arc::new(value));
        }
    }

    /// Takes a token before reading rows that will populate the cache.
    pub fn read_token(&self) -> ReadToken {
        ReadToken(self.generation.load(Ordering::SeqCst))
    }

    /// Populates the cache unless something was invalidated after `token`
    /// was taken. Returns whether the values were stored.
    ///
    /// Rows read before a concurrent write committed must not overwrite the
    /// invalidation that write performed.
    pub fn set_many_if_fresh(
        &self,
        token: ReadToken,
        values: impl IntoIterator<Item = (String, V)>,
    ) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::SeqCst) != token.0 {
            return false;
        }
        for (id, value) in values {
            entries.insert(id, Arc::new(value));
        }
        true
    }

    pub fn delete_many<S: AsRef<str>>(&self, ids: &[S]) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        for id in ids {
            entries.remove(id.as_ref());
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
