//! linkcache: disk-backed cache for remote resources.
//!
//! Maps a locator (URL or path) to a deterministic key, serves the payload
//! from a memory tier or a compressed disk tier, and on a miss runs a single
//! resumable transfer shared by every concurrent caller:
//!   caller → key codec → memory → disk → transfer coordinator → transport
//!
//! A sweeper keeps disk usage within the configured budget.

pub mod cache;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod transfer;

pub use cache::entry::{CacheEntry, CachePolicy, Codec, EntryMeta, ResourceKey};
pub use cache::evictor::{SweepReport, Sweeper, SweeperHandle};
pub use cache::key::{DigestKind, KeyCodec, KeyError};
pub use cache::store::{Store, StoreError, StoreStats};
pub use config::{CacheBudget, Config};
pub use engine::{EngineError, ResourceCache, ResourceCacheBuilder};
pub use metrics::CacheMetrics;
pub use transfer::coordinator::{
    FetchHandle, NetworkError, Progress, ProgressCallback, TransferCoordinator, TransferError,
    TransferOptions,
};
pub use transfer::retry::{RetryInterval, RetryPolicy};
pub use transfer::transport::{
    DefaultTransport, FileTransport, HttpTransport, Transport, TransportError, TransportRequest,
    TransportResponse,
};
