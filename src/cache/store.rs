//! Two-tier entry store: bounded memory tier in front of a compressed disk tier.
//!
//! The store:
//! - Serves reads from memory, then disk, promoting disk hits into memory
//! - Compresses and persists writes atomically per key
//! - Keeps an index of disk entries ordered by last access for eviction
//! - Serializes all reads and writes of one key through a per-key lock

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::disk_io::{DiskIoEngine, DiskIoError};
use crate::cache::entry::{next_access_tick, CacheEntry, CachePolicy, Codec, EntryMeta, ResourceKey};
use crate::cache::locks::{KeyGuard, KeyLocks};
use crate::cache::memory::MemoryTier;
use crate::config::StoreConfig;
use crate::metrics::CacheMetrics;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Disk I/O failed: {0}")]
    Disk(#[from] DiskIoError),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: ResourceKey, reason: String },
}

/// Why an entry left the disk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Budget,
    Age,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Budget => "budget",
            EvictionReason::Age => "age",
        }
    }
}

/// Result of a non-blocking eviction attempt.
#[derive(Debug)]
pub enum EvictOutcome {
    /// Removed, freeing this many bytes of disk budget.
    Removed(u64),
    /// The key is being read or written.
    Busy,
    /// Already gone.
    Missing,
    Failed(StoreError),
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub disk_bytes: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_capacity: u64,
}

#[derive(Debug)]
struct IndexSlot {
    meta: EntryMeta,
    tick: u64,
}

/// Disk entries by key, plus the same keys ordered by access tick.
#[derive(Debug, Default)]
struct DiskIndex {
    entries: HashMap<ResourceKey, IndexSlot>,
    by_access: BTreeMap<u64, ResourceKey>,
    total_bytes: u64,
}

impl DiskIndex {
    fn insert(&mut self, meta: EntryMeta) {
        self.remove(&meta.key);
        let tick = next_access_tick();
        self.total_bytes += meta.compressed_size;
        self.by_access.insert(tick, meta.key.clone());
        self.entries.insert(meta.key.clone(), IndexSlot { meta, tick });
    }

    fn remove(&mut self, key: &ResourceKey) -> Option<EntryMeta> {
        let slot = self.entries.remove(key)?;
        self.by_access.remove(&slot.tick);
        self.total_bytes = self.total_bytes.saturating_sub(slot.meta.compressed_size);
        Some(slot.meta)
    }

    fn touch(&mut self, key: &ResourceKey) -> Option<EntryMeta> {
        let slot = self.entries.get_mut(key)?;
        self.by_access.remove(&slot.tick);
        slot.tick = next_access_tick();
        self.by_access.insert(slot.tick, key.clone());
        slot.meta.touch();
        Some(slot.meta.clone())
    }

    fn lru_snapshot(&self) -> Vec<EntryMeta> {
        self.by_access
            .values()
            .filter_map(|key| self.entries.get(key).map(|slot| slot.meta.clone()))
            .collect()
    }
}

/// The entry store.
pub struct Store {
    cache_dir: PathBuf,
    memory: MemoryTier,
    disk: DiskIoEngine,
    index: Mutex<DiskIndex>,
    locks: KeyLocks,
    compressor: Compressor,
    /// Default time-to-live in seconds; zero means entries never expire.
    default_ttl_secs: AtomicU64,
    metrics: Arc<CacheMetrics>,
}

impl Store {
    /// Open the store, rebuilding the disk index from entry headers.
    pub async fn open(
        config: &StoreConfig,
        default_ttl: Option<Duration>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self, StoreError> {
        let disk = DiskIoEngine::new(&config.cache_dir).await?;

        let mut scanned = disk.scan().await?;
        scanned.sort_by_key(|s| s.modified);

        let mut index = DiskIndex::default();
        for s in scanned {
            let mut meta = s.meta;
            let modified: DateTime<Utc> = s.modified.into();
            if modified > meta.last_accessed_at {
                meta.last_accessed_at = modified;
            }
            index.insert(meta);
        }

        info!(
            cache_dir = %config.cache_dir.display(),
            entries = index.entries.len(),
            disk_bytes = index.total_bytes,
            memory_capacity = config.memory_capacity_bytes,
            codec = %config.codec,
            "Store opened"
        );
        metrics.disk_bytes.set(index.total_bytes as i64);

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            memory: MemoryTier::new(config.memory_capacity_bytes),
            disk,
            index: Mutex::new(index),
            locks: KeyLocks::new(),
            compressor: Compressor::new(config.codec, config.compression_level),
            default_ttl_secs: AtomicU64::new(default_ttl.map_or(0, |d| d.as_secs())),
            metrics,
        })
    }

    /// Look up an entry: memory first, then disk.
    pub async fn get(&self, key: &ResourceKey) -> Result<Option<CacheEntry>, StoreError> {
        self.get_with(key, CachePolicy::DiskAndMemory).await
    }

    /// Look up an entry in the tiers `policy` names. A disk hit is promoted
    /// into memory only when the policy includes the memory tier.
    pub async fn get_with(
        &self,
        key: &ResourceKey,
        policy: CachePolicy,
    ) -> Result<Option<CacheEntry>, StoreError> {
        if policy == CachePolicy::None {
            self.metrics.misses.inc();
            return Ok(None);
        }

        let _guard = self.locks.lock(key).await;
        let now = Utc::now();

        if policy.uses_memory() {
            if let Some(entry) = self.memory.get(key) {
                if entry.meta.is_expired_at(now) {
                    return self.expire_locked(key).await;
                }
                let touched = self.index.lock().touch(key);
                let meta = match touched {
                    Some(meta) => {
                        self.touch_durable(key).await;
                        meta
                    }
                    None => entry.meta,
                };
                self.metrics.memory_hits.inc();
                return Ok(Some(CacheEntry { meta, data: entry.data }));
            }
        }

        if !policy.uses_disk() {
            self.metrics.misses.inc();
            return Ok(None);
        }

        let indexed = self.index.lock().entries.get(key).map(|s| s.meta.clone());
        let Some(indexed) = indexed else {
            self.metrics.misses.inc();
            return Ok(None);
        };
        if indexed.is_expired_at(now) {
            return self.expire_locked(key).await;
        }

        let stored = match self.disk.read_entry(key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(key = %key, "Indexed entry file vanished");
                self.forget(key);
                self.metrics.misses.inc();
                return Ok(None);
            }
            Err(DiskIoError::Corrupt { reason, .. }) => {
                return Err(self.discard_corrupt(key, reason).await);
            }
            Err(e) => return Err(e.into()),
        };

        let (meta, payload) = stored;
        let compressor = self.compressor.clone();
        let (codec, expected_len) = (meta.codec, meta.original_size);
        let decoded = tokio::task::spawn_blocking(move || {
            compressor.decompress(codec, &payload, expected_len)
        })
        .await
        .map_err(join_error)?;
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.discard_corrupt(key, e.to_string()).await),
        };

        let touched = self.index.lock().touch(key);
        let meta = touched.unwrap_or(meta);
        self.touch_durable(key).await;

        let entry = CacheEntry {
            meta,
            data: Bytes::from(decoded),
        };
        if policy.uses_memory() {
            self.memory.insert(entry.clone());
            debug!(key = %key, size = entry.len(), "Disk hit promoted to memory");
        }
        self.metrics.disk_hits.inc();

        Ok(Some(entry))
    }

    /// Compress and persist `data` under `key`, replacing any previous entry.
    ///
    /// `ttl = None` applies the store's default time-to-live. On failure
    /// neither tier changes.
    pub async fn put(
        &self,
        key: &ResourceKey,
        data: Bytes,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry, StoreError> {
        self.put_with(key, data, ttl, CachePolicy::DiskAndMemory).await
    }

    /// Store `data` in the tiers `policy` names.
    ///
    /// A previous entry in a tier the policy skips is dropped, so no tier
    /// serves stale bytes. `CachePolicy::None` keeps nothing and leaves
    /// existing entries alone.
    pub async fn put_with(
        &self,
        key: &ResourceKey,
        data: Bytes,
        ttl: Option<Duration>,
        policy: CachePolicy,
    ) -> Result<CacheEntry, StoreError> {
        let ttl = ttl.or_else(|| self.default_ttl());
        let size = data.len() as u64;
        if policy == CachePolicy::None {
            let meta = EntryMeta::new(key.clone(), Codec::None, size, size, ttl);
            return Ok(CacheEntry { meta, data });
        }

        let _guard = self.locks.lock(key).await;

        let meta = if policy.uses_disk() {
            let compressor = self.compressor.clone();
            let raw = data.clone();
            let (codec, payload) = tokio::task::spawn_blocking(move || compressor.compress(&raw))
                .await
                .map_err(join_error)??;

            let meta = EntryMeta::new(key.clone(), codec, size, payload.len() as u64, ttl);
            self.disk.write_entry(&meta, &payload).await?;

            let total = {
                let mut index = self.index.lock();
                index.insert(meta.clone());
                index.total_bytes
            };
            self.metrics.disk_bytes.set(total as i64);
            meta
        } else {
            self.disk.delete_entry(key).await?;
            self.forget(key);
            EntryMeta::new(key.clone(), Codec::None, size, size, ttl)
        };

        let entry = CacheEntry { meta, data };
        if policy.uses_memory() {
            self.memory.insert(entry.clone());
        } else {
            self.memory.remove(key);
        }

        debug!(
            key = %key,
            policy = %policy,
            original_size = entry.meta.original_size,
            compressed_size = entry.meta.compressed_size,
            codec = %entry.meta.codec,
            "Stored entry"
        );
        Ok(entry)
    }

    /// Remove an entry from both tiers. Missing keys are not an error.
    pub async fn remove(&self, key: &ResourceKey) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(key).await;
        self.remove_locked(key).await
    }

    /// Remove `key` unless it is in use. Never waits.
    pub async fn try_evict(&self, key: &ResourceKey, reason: EvictionReason) -> EvictOutcome {
        let Some(_guard) = self.locks.try_lock(key) else {
            return EvictOutcome::Busy;
        };
        let size = match self.index.lock().entries.get(key) {
            Some(slot) => slot.meta.compressed_size,
            None => return EvictOutcome::Missing,
        };

        match self.remove_locked(key).await {
            Ok(true) => {
                self.metrics.evictions.with_label_values(&[reason.as_str()]).inc();
                debug!(key = %key, size, reason = reason.as_str(), "Evicted entry");
                EvictOutcome::Removed(size)
            }
            Ok(false) => EvictOutcome::Missing,
            Err(e) => EvictOutcome::Failed(e),
        }
    }

    /// Hold the key lock. Sweeps skip the entry while the guard lives.
    pub async fn lease(&self, key: &ResourceKey) -> KeyGuard<'_> {
        self.locks.lock(key).await
    }

    /// Disk entries, least recently accessed first.
    pub fn snapshot(&self) -> Vec<EntryMeta> {
        self.index.lock().lru_snapshot()
    }

    /// Disk usage as accounted by the budget (sum of stored payload sizes).
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.lock().entries.contains_key(key)
    }

    /// Number of disk entries.
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry from the memory tier only.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Remove all entries and partial files.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for meta in self.snapshot() {
            self.remove(&meta.key).await?;
        }
        self.memory.clear();
        self.disk.clear().await?;
        info!(cache_dir = %self.cache_dir.display(), "Store cleared");
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let (entries, disk_bytes) = {
            let index = self.index.lock();
            (index.entries.len(), index.total_bytes)
        };
        StoreStats {
            entries,
            disk_bytes,
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.used_bytes(),
            memory_capacity: self.memory.capacity(),
        }
    }

    /// Change the default time-to-live applied by future writes.
    pub fn set_default_ttl(&self, ttl: Option<Duration>) {
        self.default_ttl_secs
            .store(ttl.map_or(0, |d| d.as_secs()), Ordering::Relaxed);
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        match self.default_ttl_secs.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Disk engine, shared with the transfer coordinator for partial files.
    pub fn disk(&self) -> &DiskIoEngine {
        &self.disk
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn remove_locked(&self, key: &ResourceKey) -> Result<bool, StoreError> {
        let in_memory = self.memory.remove(key).is_some();
        let on_disk = self.disk.delete_entry(key).await?;
        let indexed = self.forget(key);
        Ok(in_memory || on_disk || indexed)
    }

    fn forget(&self, key: &ResourceKey) -> bool {
        let (removed, total) = {
            let mut index = self.index.lock();
            (index.remove(key).is_some(), index.total_bytes)
        };
        self.metrics.disk_bytes.set(total as i64);
        removed
    }

    async fn expire_locked(&self, key: &ResourceKey) -> Result<Option<CacheEntry>, StoreError> {
        debug!(key = %key, "Entry expired on read");
        self.remove_locked(key).await?;
        self.metrics.evictions.with_label_values(&[EvictionReason::Expired.as_str()]).inc();
        self.metrics.misses.inc();
        Ok(None)
    }

    async fn discard_corrupt(&self, key: &ResourceKey, reason: String) -> StoreError {
        warn!(key = %key, reason = %reason, "Discarding corrupt entry");
        if let Err(e) = self.remove_locked(key).await {
            warn!(key = %key, error = %e, "Failed to remove corrupt entry");
        }
        StoreError::Corrupt {
            key: key.clone(),
            reason,
        }
    }

    async fn touch_durable(&self, key: &ResourceKey) {
        if let Err(e) = self.disk.touch_entry(key, SystemTime::now()).await {
            debug!(key = %key, error = %e, "Failed to record access time on disk");
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> DiskIoError {
    DiskIoError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path, codec: Codec) -> StoreConfig {
        StoreConfig {
            cache_dir: dir.to_path_buf(),
            memory_capacity_bytes: 1024 * 1024,
            codec,
            compression_level: 3,
            ..StoreConfig::default()
        }
    }

    async fn open(dir: &Path, codec: Codec) -> Store {
        let metrics = Arc::new(CacheMetrics::new().unwrap());
        Store::open(&config(dir, codec), None, metrics).await.unwrap()
    }

    fn key(s: &str) -> ResourceKey {
        ResourceKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Zstd).await;

        let data = Bytes::from(b"frame".repeat(1000));
        let written = store.put(&key("a"), data.clone(), None).await.unwrap();
        assert!(written.meta.compressed_size < written.meta.original_size);

        let entry = store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.data, data);
        assert_eq!(store.total_bytes(), written.meta.compressed_size);
    }

    #[tokio::test]
    async fn test_disk_hit_promotes_to_memory() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Gzip).await;

        let data = Bytes::from(vec![9u8; 2048]);
        store.put(&key("a"), data.clone(), None).await.unwrap();
        store.clear_memory();
        assert_eq!(store.stats().memory_entries, 0);

        let entry = store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.data, data);
        assert_eq!(store.stats().memory_entries, 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::None).await;
        assert!(!store.remove(&key("nothing")).await.unwrap());

        store.put(&key("a"), Bytes::from_static(b"x"), None).await.unwrap();
        assert!(store.remove(&key("a")).await.unwrap());
        assert!(store.get(&key("a")).await.unwrap().is_none());
        assert_eq!(store.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(tmp.path(), Codec::Zstd).await;
            store.put(&key("a"), Bytes::from(vec![1u8; 500]), None).await.unwrap();
            store.put(&key("b"), Bytes::from(vec![2u8; 700]), None).await.unwrap();
        }

        let store = open(tmp.path(), Codec::Zstd).await;
        assert_eq!(store.len(), 2);
        let b = store.get(&key("b")).await.unwrap().unwrap();
        assert_eq!(b.data, Bytes::from(vec![2u8; 700]));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_reported_and_removed() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Zstd).await;

        store.put(&key("a"), Bytes::from(vec![3u8; 4096]), None).await.unwrap();
        store.clear_memory();

        // Flip payload bytes but keep the length, so only decoding fails.
        let path = store.disk().entry_path(&key("a"));
        let mut raw = std::fs::read(&path).unwrap();
        let len = raw.len();
        for b in &mut raw[len - 8..] {
            *b ^= 0xff;
        }
        std::fs::write(&path, raw).unwrap();

        let err = store.get(&key("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!store.contains(&key("a")));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_absurd_original_size_is_corrupt_not_panic() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Gzip).await;

        store.put(&key("a"), Bytes::from(b"GIF89a".repeat(300)), None).await.unwrap();
        store.clear_memory();

        // Rewrite only the recorded size; the payload is still valid gzip.
        let path = store.disk().entry_path(&key("a"));
        let raw = std::fs::read(&path).unwrap();
        let (mut meta, offset) = crate::cache::disk_io::decode_header(&path, &raw).unwrap();
        assert_eq!(meta.codec, Codec::Gzip);
        meta.original_size = u64::MAX;
        let rewritten = crate::cache::disk_io::encode_entry(&meta, &raw[offset..]).unwrap();
        std::fs::write(&path, rewritten).unwrap();

        let err = store.get(&key("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!store.contains(&key("a")));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_memory_only_policy_skips_disk() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Zstd).await;

        store.put(&key("a"), Bytes::from(vec![1u8; 900]), None).await.unwrap();
        assert!(store.contains(&key("a")));

        // Replacing with a memory-only write drops the older disk copy.
        let data = Bytes::from(vec![2u8; 900]);
        let entry = store
            .put_with(&key("a"), data.clone(), None, CachePolicy::Memory)
            .await
            .unwrap();
        assert_eq!(entry.meta.compressed_size, 900);
        assert!(!store.contains(&key("a")));
        assert!(!store.disk().entry_path(&key("a")).exists());
        assert_eq!(store.total_bytes(), 0);

        let hit = store.get_with(&key("a"), CachePolicy::Memory).await.unwrap().unwrap();
        assert_eq!(hit.data, data);
        assert!(store.get_with(&key("a"), CachePolicy::Disk).await.unwrap().is_none());

        store.clear_memory();
        assert!(store.get(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_only_policy_skips_memory() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Zstd).await;

        let data = Bytes::from(b"chunk".repeat(200));
        store
            .put_with(&key("a"), data.clone(), None, CachePolicy::Disk)
            .await
            .unwrap();
        assert_eq!(store.stats().memory_entries, 0);
        assert!(store.contains(&key("a")));

        let hit = store.get_with(&key("a"), CachePolicy::Disk).await.unwrap().unwrap();
        assert_eq!(hit.data, data);
        // Not promoted.
        assert_eq!(store.stats().memory_entries, 0);
        assert!(store.get_with(&key("a"), CachePolicy::Memory).await.unwrap().is_none());

        store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(store.stats().memory_entries, 1);
    }

    #[tokio::test]
    async fn test_none_policy_keeps_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::Zstd).await;

        store.put(&key("a"), Bytes::from_static(b"old"), None).await.unwrap();
        let entry = store
            .put_with(&key("a"), Bytes::from_static(b"new"), None, CachePolicy::None)
            .await
            .unwrap();
        assert_eq!(entry.data, Bytes::from_static(b"new"));

        assert!(store.get_with(&key("a"), CachePolicy::None).await.unwrap().is_none());
        let kept = store.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(kept.data, Bytes::from_static(b"old"));

        store
            .put_with(&key("b"), Bytes::from_static(b"b"), None, CachePolicy::None)
            .await
            .unwrap();
        assert!(!store.contains(&key("b")));
        assert!(store.get(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_ttl_applies_to_writes() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::None).await;

        let forever = store.put(&key("a"), Bytes::from_static(b"a"), None).await.unwrap();
        assert!(forever.meta.expires_at.is_none());

        store.set_default_ttl(Some(Duration::from_secs(3600)));
        let bounded = store.put(&key("b"), Bytes::from_static(b"b"), None).await.unwrap();
        assert!(bounded.meta.expires_at.is_some());

        // Existing entries are untouched by the change.
        let a = store.get(&key("a")).await.unwrap().unwrap();
        assert!(a.meta.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_try_evict_skips_leased_entry() {
        let tmp = TempDir::new().unwrap();
        let store = open(tmp.path(), Codec::None).await;
        store.put(&key("a"), Bytes::from_static(b"aaaa"), None).await.unwrap();

        let lease = store.lease(&key("a")).await;
        assert!(matches!(
            store.try_evict(&key("a"), EvictionReason::Budget).await,
            EvictOutcome::Busy
        ));
        drop(lease);

        assert!(matches!(
            store.try_evict(&key("a"), EvictionReason::Budget).await,
            EvictOutcome::Removed(4)
        ));
        assert!(matches!(
            store.try_evict(&key("a"), EvictionReason::Budget).await,
            EvictOutcome::Missing
        ));
    }
}
