//! Bounded in-memory tier.
//!
//! Holds decoded entries up to a byte budget and evicts least-recently-used
//! entries when a new one does not fit. Recency is tracked with access ticks
//! in an ordered index, so eviction never scans the whole map.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::trace;

use crate::cache::entry::{next_access_tick, CacheEntry, ResourceKey};

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ResourceKey, Slot>,
    by_access: BTreeMap<u64, ResourceKey>,
    used: u64,
}

impl Inner {
    fn remove(&mut self, key: &ResourceKey) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.by_access.remove(&slot.tick);
        self.used = self.used.saturating_sub(slot.entry.data.len() as u64);
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.by_access.pop_first()?;
        let slot = self.entries.remove(&key)?;
        self.used = self.used.saturating_sub(slot.entry.data.len() as u64);
        Some(slot.entry)
    }
}

/// The memory tier. A capacity of zero disables it.
#[derive(Debug)]
pub struct MemoryTier {
    capacity: u64,
    inner: Mutex<Inner>,
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let slot = inner.entries.get_mut(key)?;

        inner.by_access.remove(&slot.tick);
        slot.tick = next_access_tick();
        inner.by_access.insert(slot.tick, key.clone());
        slot.entry.meta.touch();

        Some(slot.entry.clone())
    }

    /// Insert or replace an entry, evicting LRU entries until it fits.
    ///
    /// Entries larger than the whole tier are not admitted. Returns the number
    /// of entries evicted to make room.
    pub fn insert(&self, entry: CacheEntry) -> usize {
        let size = entry.data.len() as u64;
        let mut inner = self.inner.lock();
        inner.remove(entry.key());

        if size > self.capacity {
            return 0;
        }

        let mut evicted = 0;
        while inner.used + size > self.capacity {
            match inner.pop_lru() {
                Some(old) => {
                    trace!(key = %old.key(), size = old.data.len(), "Memory tier evicted entry");
                    evicted += 1;
                }
                None => break,
            }
        }

        let tick = next_access_tick();
        inner.by_access.insert(tick, entry.key().clone());
        inner.used += size;
        inner.entries.insert(entry.key().clone(), Slot { entry, tick });
        evicted
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_access.clear();
        inner.used = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::entry::{Codec, EntryMeta};

    fn entry(name: &str, size: usize) -> CacheEntry {
        let key = ResourceKey::parse(name).unwrap();
        CacheEntry {
            meta: EntryMeta::new(key, Codec::None, size as u64, size as u64, None),
            data: Bytes::from(vec![0u8; size]),
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::parse(name).unwrap()
    }

    #[test]
    fn test_lru_eviction_order() {
        let tier = MemoryTier::new(300);
        tier.insert(entry("a", 100));
        tier.insert(entry("b", 100));
        tier.insert(entry("c", 100));

        // Touch "a" so "b" becomes the oldest.
        assert!(tier.get(&key("a")).is_some());

        let evicted = tier.insert(entry("d", 100));
        assert_eq!(evicted, 1);
        assert!(tier.contains(&key("a")));
        assert!(!tier.contains(&key("b")));
        assert!(tier.contains(&key("c")));
        assert!(tier.contains(&key("d")));
        assert_eq!(tier.used_bytes(), 300);
    }

    #[test]
    fn test_replace_updates_accounting() {
        let tier = MemoryTier::new(1000);
        tier.insert(entry("a", 100));
        tier.insert(entry("a", 250));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.used_bytes(), 250);
    }

    #[test]
    fn test_oversized_entry_not_admitted() {
        let tier = MemoryTier::new(100);
        tier.insert(entry("small", 50));
        tier.insert(entry("huge", 101));
        assert!(!tier.contains(&key("huge")));
        assert!(tier.contains(&key("small")));
    }

    #[test]
    fn test_zero_capacity_disables_tier() {
        let tier = MemoryTier::new(0);
        tier.insert(entry("a", 1));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = MemoryTier::new(1000);
        tier.insert(entry("a", 10));
        tier.insert(entry("b", 10));
        assert!(tier.remove(&key("a")).is_some());
        assert!(tier.remove(&key("a")).is_none());
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.used_bytes(), 0);
    }
}
