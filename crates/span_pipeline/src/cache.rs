//! Bounded LRU cache.
//!
//! Entries live in a slab of nodes linked into a recency list (head is most
//! recently used, tail is least); a `HashMap` maps keys to slab slots. `get`
//! and `set` are O(1). Freed slots are reused so the slab never grows beyond
//! the capacity.
//!
//! [`BoundedCache`] itself is single-threaded. [`SharedCache`] wraps it in a
//! mutex for use from many call sites.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Fixed-capacity recency-ordered map.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    head: usize,
    tail: usize,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity(capacity));
        }
        Ok(Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the value for `key` and marks it most recently used.
    /// A miss has no side effects.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.promote(slot);
        Some(&self.nodes[slot].value)
    }

    /// Looks up `key` without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.nodes[slot].value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or overwrites `key` as most recently used. Returns the entry
    /// evicted to stay within capacity, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.nodes[slot].value = value;
            self.promote(slot);
            return None;
        }

        if self.nodes.len() < self.capacity {
            let slot = self.nodes.len();
            self.nodes.push(Node {
                key: key.clone(),
                value,
                prev: NIL,
                next: NIL,
            });
            self.index.insert(key, slot);
            self.push_front(slot);
            return None;
        }

        // Full: recycle the least recently used slot in place.
        let slot = self.tail;
        self.unlink(slot);
        let node = &mut self.nodes[slot];
        let old_key = std::mem::replace(&mut node.key, key.clone());
        let old_value = std::mem::replace(&mut node.value, value);
        self.index.remove(&old_key);
        self.index.insert(key, slot);
        self.push_front(slot);
        Some((old_key, old_value))
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.next;
            Some(&node.key)
        })
    }

    fn promote(&mut self, slot: usize) {
        if self.head != slot {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = &self.nodes[slot];
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        let node = &mut self.nodes[slot];
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[slot];
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head == NIL {
            self.tail = slot;
        } else {
            self.nodes[old_head].prev = slot;
        }
        self.head = slot;
    }
}

/// Thread-safe wrapper over [`BoundedCache`] returning cloned values.
#[derive(Debug)]
pub struct SharedCache<K, V> {
    inner: Mutex<BoundedCache<K, V>>,
}

impl<K, V> SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: Mutex::new(BoundedCache::new(capacity)?),
        })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) -> Option<(K, V)> {
        self.inner.lock().set(key, value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            BoundedCache::<String, String>::new(0).unwrap_err(),
            CacheError::InvalidCapacity(0)
        );
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = BoundedCache::new(2).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));

        let evicted = cache.set("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"c"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_promotes() {
        let mut cache = BoundedCache::new(2).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        cache.set("c", 3);
        assert_eq!(cache.peek(&"a"), Some(&10));
        assert!(!cache.contains(&"b"));
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec!["c", "a"]);
    }

    #[test]
    fn test_stored_empty_value_is_distinct_from_absent() {
        let mut cache = BoundedCache::new(1).unwrap();
        cache.set("stmt", String::new());
        assert_eq!(cache.get(&"stmt"), Some(&String::new()));
        assert_eq!(cache.get(&"other"), None);
    }

    #[test]
    fn test_miss_does_not_change_order() {
        let mut cache = BoundedCache::new(2).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get(&"zzz"), None);
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_capacity_one() {
        let mut cache = BoundedCache::new(1).unwrap();
        cache.set(1, "x");
        assert_eq!(cache.set(2, "y"), Some((1, "x")));
        assert_eq!(cache.get(&2), Some(&"y"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shared_cache_across_threads() {
        let cache = Arc::new(SharedCache::new(64).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.set(format!("{t}-{i}"), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
        assert_eq!(cache.capacity(), 64);
    }

    proptest! {
        #[test]
        fn prop_lru_law(capacity in 1usize..16, extra in 1usize..16) {
            let mut cache = BoundedCache::new(capacity).unwrap();
            let total = capacity + extra;
            for key in 0..total {
                cache.set(key, key * 10);
            }
            prop_assert_eq!(cache.len(), capacity);
            for key in 0..extra {
                prop_assert_eq!(cache.get(&key), None);
            }
            for key in extra..total {
                prop_assert_eq!(cache.get(&key), Some(&(key * 10)));
            }
        }

        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..8,
            ops in proptest::collection::vec((0u8..20, any::<bool>()), 0..200),
        ) {
            let mut cache = BoundedCache::new(capacity).unwrap();
            for (key, is_get) in ops {
                if is_get {
                    cache.get(&key);
                } else {
                    cache.set(key, u32::from(key));
                }
                prop_assert!(cache.len() <= capacity);
                prop_assert_eq!(cache.keys().count(), cache.len());
            }
        }
    }
}
