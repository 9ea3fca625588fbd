//! Runtime configuration for linkcache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Missing fields fall back to their defaults. A value of zero in the budget
//! section means "unlimited", "never expire" or "no timer".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::entry::{CachePolicy, Codec};
use crate::cache::key::DigestKind;
use crate::transfer::retry::{RetryInterval, RetryPolicy};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "linkcache", about = "Disk-backed cache for remote resources")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "linkcache.json")]
    pub config: PathBuf,

    /// Override the cache directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch a resource through the cache.
    Fetch {
        locator: String,
        /// Write the payload here instead of printing a summary.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Tiers to read and fill (none, memory, disk, disk_and_memory).
        #[arg(long)]
        policy: Option<CachePolicy>,
    },
    /// Print the cache key for a locator.
    Key {
        locator: String,
        /// Digest to use instead of the configured one.
        #[arg(long)]
        digest: Option<DigestKind>,
    },
    /// Remove a cached resource.
    Remove { locator: String },
    /// Run one expiry and budget sweep.
    Sweep,
    /// Print store statistics and metrics.
    Stats,
    /// Remove every cached entry.
    Clear,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store configuration.
    pub store: StoreConfig,

    /// Disk budget and sweep schedule.
    pub budget: CacheBudget,

    /// Network transfer settings.
    pub transfer: TransferConfig,

    /// Key derivation.
    pub key: KeyConfig,
}

/// Memory and disk tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for entry and partial files.
    pub cache_dir: PathBuf,

    /// Memory tier budget in decoded bytes (0 = disabled).
    pub memory_capacity_bytes: u64,

    /// Codec for new disk entries.
    pub codec: Codec,

    /// Compression level (zstd 1-22, gzip clamped to 0-9).
    pub compression_level: i32,

    /// Tiers used by fetches that do not name a policy.
    pub cache_policy: CachePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("linkcache"),
            memory_capacity_bytes: 64 * 1024 * 1024, // 64 MB
            codec: Codec::Zstd,
            compression_level: 3,
            cache_policy: CachePolicy::DiskAndMemory,
        }
    }
}

/// Disk budget. Mutated at runtime only through the sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBudget {
    /// Maximum stored payload bytes on disk (0 = unlimited).
    pub max_disk_bytes: u64,

    /// Default time-to-live for new entries (0 = never expire).
    pub max_entry_age_secs: u64,

    /// Seconds between background sweeps (0 = no timer).
    pub sweep_interval_secs: u64,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_disk_bytes: 512 * 1024 * 1024, // 512 MB
            max_entry_age_secs: 7 * 24 * 60 * 60, // 7 days
            sweep_interval_secs: 300,
        }
    }
}

impl CacheBudget {
    pub fn unlimited() -> Self {
        Self {
            max_disk_bytes: 0,
            max_entry_age_secs: 0,
            sweep_interval_secs: 0,
        }
    }

    pub fn max_entry_age(&self) -> Option<Duration> {
        (self.max_entry_age_secs > 0).then(|| Duration::from_secs(self.max_entry_age_secs))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Minimum milliseconds between progress reports.
    pub progress_interval_ms: u64,

    /// Timeout for opening a response and for each body chunk.
    pub request_timeout_secs: u64,

    /// User-Agent sent by the HTTP transport.
    pub user_agent: String,

    /// Extra request headers.
    pub headers: BTreeMap<String, String>,

    /// Retry policy for network failures.
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 20,
            request_timeout_secs: 20,
            user_agent: format!("linkcache/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay between attempts.
    pub interval_secs: u64,

    /// Grow the delay linearly with each attempt.
    pub accumulate: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval_secs: 3,
            accumulate: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let interval = Duration::from_secs(self.interval_secs);
        RetryPolicy {
            max_retries: self.max_retries,
            interval: if self.accumulate {
                RetryInterval::Accumulated(interval)
            } else {
                RetryInterval::Fixed(interval)
            },
        }
    }
}

/// Key derivation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub digest: DigestKind,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Configuration rooted at `cache_dir` with every other field defaulted.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.store.cache_dir = cache_dir.into();
        config
    }
}
