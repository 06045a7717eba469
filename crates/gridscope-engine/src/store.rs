//! Capacity-limited key/value table backing the resident asset and edge sets.
//!
//! The store itself is policy-free: callers pass the active cap on every batch
//! because the asset cap moves with the zoom tier.

use std::collections::HashMap;
use std::hash::Hash;

/// Outcome of one batched insert. `accepted` lists newly inserted keys in the
/// order they were taken; refreshes of already-resident keys never consume
/// capacity and are counted separately.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertOutcome<K> {
    pub accepted: Vec<K>,
    pub refreshed: usize,
    pub rejected: usize,
}

impl<K> Default for InsertOutcome<K> {
    fn default() -> Self {
        Self {
            accepted: Vec::new(),
            refreshed: 0,
            rejected: 0,
        }
    }
}

impl<K> InsertOutcome<K> {
    pub fn inserted(&self) -> usize {
        self.accepted.len()
    }
}

/// Bounded id-keyed table. Never grows past the cap handed to
/// [`BoundedStore::insert_batch`], even transiently.
#[derive(Debug)]
pub struct BoundedStore<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> Default for BoundedStore<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> BoundedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Replace-in-place refresh. Bypasses the capacity check on purpose:
    /// refreshing a resident key must never be rejected. Returns whether the
    /// key was already present.
    pub fn upsert(&mut self, key: K, value: V) -> bool {
        self.entries.insert(key, value).is_some()
    }

    /// Inserts items in the order provided until the cap is reached; the
    /// remainder is dropped and reported. Items whose key is already resident
    /// refresh in place and do not count against the cap.
    pub fn insert_batch(&mut self, items: Vec<(K, V)>, cap: usize) -> InsertOutcome<K> {
        let before = self.entries.len();
        let mut outcome = InsertOutcome::default();
        for (key, value) in items {
            if self.entries.contains_key(&key) {
                self.entries.insert(key, value);
                outcome.refreshed += 1;
            } else if self.entries.len() < cap {
                self.entries.insert(key.clone(), value);
                outcome.accepted.push(key);
            } else {
                outcome.rejected += 1;
            }
        }
        debug_assert!(self.entries.len() <= before.max(cap));
        outcome
    }

    /// Removes and returns every entry satisfying the predicate. O(n) scan;
    /// runs off the hot path.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<V>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }
}

impl<K, V> BoundedStore<K, V>
where
    K: Eq + Hash + Clone + Ord,
{
    /// Shrinks the table down to `cap` by removing the entries with the
    /// lowest `order` value first (ties resolved by key, so eviction is
    /// deterministic). Returns the removed values.
    pub fn evict_oldest<F>(&mut self, cap: usize, order: F) -> Vec<V>
    where
        F: Fn(&V) -> u64,
    {
        if self.entries.len() <= cap {
            return Vec::new();
        }
        let mut ranked: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(k, v)| (order(v), k.clone()))
            .collect();
        ranked.sort_unstable_by(|a, b| a.cmp(b));
        let excess = self.entries.len() - cap;
        ranked
            .into_iter()
            .take(excess)
            .filter_map(|(_, k)| self.entries.remove(&k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(range: std::ops::Range<u32>) -> Vec<(String, u32)> {
        range.map(|i| (format!("id-{i}"), i)).collect()
    }

    #[test]
    fn never_exceeds_cap_mid_sequence() {
        let mut store = BoundedStore::new();
        let mut rejected = 0;
        for start in [0u32, 60, 120] {
            let outcome = store.insert_batch(batch(start..start + 60), 100);
            rejected += outcome.rejected;
            assert!(store.len() <= 100);
        }
        assert_eq!(store.len(), 100);
        assert_eq!(rejected, 80);
    }

    #[test]
    fn accepts_in_input_order() {
        let mut store = BoundedStore::new();
        let outcome = store.insert_batch(batch(0..10), 3);
        assert_eq!(
            outcome.accepted,
            vec!["id-0".to_string(), "id-1".into(), "id-2".into()]
        );
        assert_eq!(outcome.rejected, 7);
    }

    #[test]
    fn refresh_of_resident_key_never_rejected() {
        let mut store = BoundedStore::new();
        store.insert_batch(batch(0..3), 3);
        // Store is full; a batch of refreshes plus one new key.
        let outcome = store.insert_batch(
            vec![
                ("id-0".to_string(), 100),
                ("id-1".to_string(), 101),
                ("id-9".to_string(), 9),
            ],
            3,
        );
        assert_eq!(outcome.refreshed, 2);
        assert_eq!(outcome.inserted(), 0);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(store.get(&"id-0".to_string()), Some(&100));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn upsert_replaces_without_capacity_check() {
        let mut store = BoundedStore::new();
        store.insert_batch(batch(0..2), 2);
        assert!(store.upsert("id-1".to_string(), 41));
        assert!(!store.upsert("id-5".to_string(), 5));
        assert_eq!(store.get(&"id-1".to_string()), Some(&41));
    }

    #[test]
    fn remove_where_returns_removed_values() {
        let mut store = BoundedStore::new();
        store.insert_batch(batch(0..6), 10);
        let removed = store.remove_where(|_, v| *v % 2 == 0);
        assert_eq!(removed.len(), 3);
        assert_eq!(store.len(), 3);
        assert!(!store.contains(&"id-4".to_string()));
        assert!(store.contains(&"id-5".to_string()));
    }

    #[test]
    fn evict_oldest_is_deterministic_and_ordered() {
        let mut store = BoundedStore::new();
        store.insert_batch(batch(0..5), 10);
        let removed = store.evict_oldest(2, |v| u64::from(*v));
        assert_eq!(removed, vec![0, 1, 2]);
        assert_eq!(store.len(), 2);
        assert!(store.contains(&"id-3".to_string()));
        assert!(store.contains(&"id-4".to_string()));
        assert!(store.evict_oldest(2, |v| u64::from(*v)).is_empty());
    }
}
