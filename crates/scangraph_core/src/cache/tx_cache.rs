//! Transaction-scoped row cache.

use std::collections::{HashMap, HashSet};

/// Map owned by one call path for the duration of one transaction.
///
/// Not shared between threads; dropped with the operation that created it,
/// so it needs no invalidation.
#[derive(Debug, Clone)]
pub struct TxCache<V> {
    entries: HashMap<String, V>,
}

impl<V> Default for TxCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> TxCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `ids` into cached values and de-duplicated misses.
    pub fn get_many<S: AsRef<str>>(&self, ids: &[S]) -> (HashMap<String, V>, Vec<String>) {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        let mut seen_missing = HashSet::new();
        for id in ids {
            let id = id.as_ref();
            match self.entries.get(id) {
                Some(value) => {
                    found.insert(id.to_string(), value.clone());
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

    pub fn set_many(&mut self, values: impl IntoIterator<Item = (String, V)>) {
        self.entries.extend(values);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TxCache;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn repeated_misses_are_reported_once() {
        let mut cache = TxCache::new();
        cache.set_many([("a".to_string(), 1)]);

        let (found, missing) = cache.get_many(&["a", "b", "b", "a"]);

        assert_eq!(found.get("a"), Some(&1));
        assert_eq!(missing, vec!["b".to_string()]);
    }

    proptest! {
        #[test]
        fn found_and_missing_partition_requested_ids(
            cached in proptest::collection::hash_set("[a-f]{1,2}", 0..12),
            requested in proptest::collection::vec("[a-f]{1,2}", 0..24),
        ) {
            let mut cache = TxCache::new();
            cache.set_many(cached.iter().map(|id| (id.clone(), id.len())));

            let (found, missing) = cache.get_many(&requested);

            let found_ids: HashSet<&str> = found.keys().map(String::as_str).collect();
            let missing_ids: HashSet<&str> = missing.iter().map(String::as_str).collect();
            let requested_ids: HashSet<&str> = requested.iter().map(String::as_str).collect();

            prop_assert!(found_ids.is_disjoint(&missing_ids));
            prop_assert_eq!(
                found_ids.union(&missing_ids).copied().collect::<HashSet<_>>(),
                requested_ids
            );
            prop_assert_eq!(missing.len(), missing_ids.len());
        }
    }
}
