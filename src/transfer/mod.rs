//! Network transfers into the cache.
//!
//! - [`transport`]: Transport trait with HTTP and local-file implementations
//! - [`retry`]: Retry schedule for network failures
//! - [`coordinator`]: Deduplicated, resumable fetches with progress fan-out

pub mod coordinator;
pub mod retry;
pub mod transport;
