//! Two-tier resource cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: ResourceKey, EntryMeta, CacheEntry, Codec definitions
//! - [`key`]: Locator-to-key digests
//! - [`compressor`]: zstd and gzip compression/decompression
//! - [`memory`]: Byte-bounded LRU memory tier
//! - [`disk_io`]: Entry file format and async disk I/O
//! - [`locks`]: Per-key exclusive locks
//! - [`store`]: Memory + disk store that orchestrates promotion
//! - [`evictor`]: Expiry and size-budget sweeps

pub mod compressor;
pub mod disk_io;
pub mod entry;
pub mod evictor;
pub mod key;
pub mod locks;
pub mod memory;
pub mod store;
