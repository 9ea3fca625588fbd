//! Prometheus metrics for one cache instance.
//!
//! Each `CacheMetrics` owns its registry so several caches in one process
//! do not collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct CacheMetrics {
    registry: Registry,
    pub memory_hits: IntCounter,
    pub disk_hits: IntCounter,
    pub misses: IntCounter,
    pub transfers_started: IntCounter,
    /// Subscribers that joined a transfer already in flight.
    pub transfers_joined: IntCounter,
    pub transfer_failures: IntCounterVec,
    pub evictions: IntCounterVec,
    pub bytes_downloaded: IntCounter,
    pub disk_bytes: IntGauge,
    pub in_flight: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let memory_hits = IntCounter::new("linkcache_memory_hits_total", "Reads served from memory")?;
        let disk_hits = IntCounter::new("linkcache_disk_hits_total", "Reads served from disk")?;
        let misses = IntCounter::new("linkcache_misses_total", "Reads that found no entry")?;
        let transfers_started =
            IntCounter::new("linkcache_transfers_started_total", "Transfers started")?;
        let transfers_joined = IntCounter::new(
            "linkcache_transfers_deduplicated_total",
            "Fetches attached to an in-flight transfer",
        )?;
        let transfer_failures = IntCounterVec::new(
            Opts::new("linkcache_transfer_failures_total", "Failed transfers"),
            &["kind"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("linkcache_evictions_total", "Entries removed from disk"),
            &["reason"],
        )?;
        let bytes_downloaded =
            IntCounter::new("linkcache_bytes_downloaded_total", "Payload bytes received")?;
        let disk_bytes = IntGauge::new("linkcache_disk_bytes", "Stored payload bytes on disk")?;
        let in_flight = IntGauge::new("linkcache_transfers_in_flight", "Transfers in flight")?;

        registry.register(Box::new(memory_hits.clone()))?;
        registry.register(Box::new(disk_hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(transfers_started.clone()))?;
        registry.register(Box::new(transfers_joined.clone()))?;
        registry.register(Box::new(transfer_failures.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(bytes_downloaded.clone()))?;
        registry.register(Box::new(disk_bytes.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            memory_hits,
            disk_hits,
            misses,
            transfers_started,
            transfers_joined,
            transfer_failures,
            evictions,
            bytes_downloaded,
            disk_bytes,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric in this instance's registry.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("memory_hits", &self.memory_hits.get())
            .field("disk_hits", &self.disk_hits.get())
            .field("misses", &self.misses.get())
            .field("transfers_started", &self.transfers_started.get())
            .finish_non_exhaustive()
    }
}
