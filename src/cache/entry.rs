//! Cache entry types and resource keys.
//!
//! An entry holds one downloaded resource. It is the unit of storage and
//! eviction: written, promoted and removed as a whole.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest key accepted; keys are used verbatim as file names.
pub const MAX_KEY_LEN: usize = 200;

/// Identifies one logical resource in both tiers and in the in-flight registry.
///
/// Keys are restricted to `[A-Za-z0-9_-]` so they can name files directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Validate a raw key string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err("key is empty".to_string());
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(format!("key is {} chars, limit is {MAX_KEY_LEN}", raw.len()));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(format!("key contains {c:?}"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.0
    }
}

/// How an entry's payload is encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Stored as received.
    None,
    /// zstd frame.
    #[default]
    Zstd,
    /// gzip member.
    Gzip,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::None => write!(f, "none"),
            Codec::Zstd => write!(f, "zstd"),
            Codec::Gzip => write!(f, "gzip"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Codec::None),
            "zstd" => Ok(Codec::Zstd),
            "gzip" => Ok(Codec::Gzip),
            other => Err(format!("unknown codec {other:?}")),
        }
    }
}

/// Which tiers a read consults and a write fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Bypass the cache: reads miss, writes keep nothing.
    None,
    Memory,
    Disk,
    #[default]
    DiskAndMemory,
}

impl CachePolicy {
    pub fn uses_memory(self) -> bool {
        matches!(self, CachePolicy::Memory | CachePolicy::DiskAndMemory)
    }

    pub fn uses_disk(self) -> bool {
        matches!(self, CachePolicy::Disk | CachePolicy::DiskAndMemory)
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::None => write!(f, "none"),
            CachePolicy::Memory => write!(f, "memory"),
            CachePolicy::Disk => write!(f, "disk"),
            CachePolicy::DiskAndMemory => write!(f, "disk_and_memory"),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(CachePolicy::None),
            "memory" => Ok(CachePolicy::Memory),
            "disk" => Ok(CachePolicy::Disk),
            "disk_and_memory" | "all" => Ok(CachePolicy::DiskAndMemory),
            other => Err(format!("unknown cache policy {other:?}")),
        }
    }
}

/// Entry metadata. Persisted as the header of the entry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: ResourceKey,

    /// Codec actually used for the stored payload.
    pub codec: Codec,

    /// Payload size as fetched.
    pub original_size: u64,

    /// Payload size on disk. This is what the disk budget accounts.
    pub compressed_size: u64,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryMeta {
    /// Metadata for an entry written now with an optional time-to-live.
    pub fn new(
        key: ResourceKey,
        codec: Codec,
        original_size: u64,
        compressed_size: u64,
        ttl: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        Self {
            key,
            codec,
            original_size,
            compressed_size,
            created_at: now,
            last_accessed_at: now,
            expires_at,
        }
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }
}

/// A cache entry as handed to callers: metadata plus the decoded payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub data: Bytes,
}

impl CacheEntry {
    pub fn key(&self) -> &ResourceKey {
        &self.meta.key
    }

    /// Decoded payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Logical access clock shared by the memory tier and the disk index.
///
/// Wall-clock timestamps can tie within a burst of writes; ticks never do.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Take the next access tick.
pub fn next_access_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}
