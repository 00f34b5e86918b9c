//! Bounded LRU cache
//!
//! Integer-keyed, every entry costs one unit. Used for the per-user cipher
//! and token-bucket caches. Not synchronized; the engine wraps each cache
//! in a mutex and holds it only across single operations.

/// Called with the evicted key and value whenever an entry leaves the
/// cache because of capacity pressure, removal or purge.
pub type EvictCallback<V> = Box<dyn FnMut(u32, &V) + Send>;

struct Entry<V> {
    value: V,
    /// recency stamp, larger = more recently used
    stamp: u64,
}

pub struct LruCache<V> {
    capacity: usize,
    clock: u64,
    items: std::collections::HashMap<u32, Entry<V>>,
    /// stamp -> key, ordered oldest first
    order: std::collections::BTreeMap<u64, u32>,
    on_evict: Option<EvictCallback<V>>,
}

impl<V> LruCache<V> {
    pub fn new(capacity: usize, on_evict: Option<EvictCallback<V>>) -> LruCache<V> {
        assert!(capacity > 0, "cache capacity must be positive");
        LruCache {
            capacity,
            clock: 0,
            items: std::collections::HashMap::new(),
            order: std::collections::BTreeMap::new(),
            on_evict,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert or replace. Returns true if the insert evicted another entry.
    pub fn add(&mut self, key: u32, value: V) -> bool {
        let stamp = self.tick();
        if let Some(entry) = self.items.get_mut(&key) {
            self.order.remove(&entry.stamp);
            entry.value = value;
            entry.stamp = stamp;
            self.order.insert(stamp, key);
            return false;
        }

        self.items.insert(key, Entry { value, stamp });
        self.order.insert(stamp, key);

        let mut evicted = false;
        while self.items.len() > self.capacity {
            self.remove_oldest();
            evicted = true;
        }
        evicted
    }

    /// Look up and touch recency
    pub fn get(&mut self, key: u32) -> Option<&V> {
        let stamp = self.tick();
        match self.items.get_mut(&key) {
            Some(entry) => {
                self.order.remove(&entry.stamp);
                entry.stamp = stamp;
                self.order.insert(stamp, key);
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Look up without touching recency
    pub fn peek(&self, key: u32) -> Option<&V> {
        self.items.get(&key).map(|e| &e.value)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.items.contains_key(&key)
    }

    /// Remove one entry, returning whether it existed
    pub fn remove(&mut self, key: u32) -> bool {
        match self.items.remove(&key) {
            Some(entry) => {
                self.order.remove(&entry.stamp);
                if let Some(ref mut cb) = self.on_evict {
                    cb(key, &entry.value);
                }
                true
            }
            None => false,
        }
    }

    /// Drop everything
    pub fn purge(&mut self) {
        let keys: Vec<u32> = self.items.keys().copied().collect();
        for key in keys {
            self.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn remove_oldest(&mut self) {
        if let Some((&stamp, &key)) = self.order.iter().next() {
            self.order.remove(&stamp);
            if let Some(entry) = self.items.remove(&key) {
                if let Some(ref mut cb) = self.on_evict {
                    cb(key, &entry.value);
                }
            }
        }
    }
}
