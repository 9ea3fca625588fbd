//! Eviction sweeper: decides which disk entries to drop.
//!
//! A sweep runs two passes over a snapshot of the disk index:
//! - Expiry: entries past their `expires_at`
//! - Budget: least recently accessed entries while disk usage exceeds
//!   `max_disk_bytes`
//!
//! Entries whose key lock is held are skipped, never waited on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::EntryMeta;
use crate::cache::store::{EvictOutcome, EvictionReason, Store};
use crate::config::CacheBudget;

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
    pub skipped_busy: usize,
    pub failed: usize,
    pub bytes_freed: u64,
    /// Disk usage after the sweep.
    pub total_bytes: u64,
    /// Still above budget because busy or failed entries could not be removed.
    pub over_budget: bool,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }

    fn record(&mut self, meta: &EntryMeta, reason: EvictionReason, outcome: EvictOutcome) -> bool {
        match outcome {
            EvictOutcome::Removed(bytes) => {
                self.bytes_freed += bytes;
                match reason {
                    EvictionReason::Budget => self.evicted += 1,
                    EvictionReason::Expired | EvictionReason::Age => self.expired += 1,
                }
                true
            }
            EvictOutcome::Busy => {
                debug!(key = %meta.key, "Entry in use, skipped by sweep");
                self.skipped_busy += 1;
                false
            }
            EvictOutcome::Missing => false,
            EvictOutcome::Failed(e) => {
                warn!(key = %meta.key, error = %e, "Failed to evict entry");
                self.failed += 1;
                false
            }
        }
    }
}

/// The sweeper. Shared between manual callers and the background task.
pub struct Sweeper {
    store: Arc<Store>,
    budget: RwLock<CacheBudget>,
}

impl Sweeper {
    pub fn new(store: Arc<Store>, budget: CacheBudget) -> Self {
        store.set_default_ttl(budget.max_entry_age());
        Self {
            store,
            budget: RwLock::new(budget),
        }
    }

    /// Run the expiry pass then the budget pass.
    pub async fn sweep(&self) -> SweepReport {
        let budget = self.budget.read().await;
        let mut report = SweepReport::default();

        let now = Utc::now();
        for meta in self.store.snapshot() {
            if meta.is_expired_at(now) {
                let outcome = self.store.try_evict(&meta.key, EvictionReason::Expired).await;
                report.record(&meta, EvictionReason::Expired, outcome);
            }
        }

        if budget.max_disk_bytes > 0 {
            for meta in self.store.snapshot() {
                if self.store.total_bytes() <= budget.max_disk_bytes {
                    break;
                }
                let outcome = self.store.try_evict(&meta.key, EvictionReason::Budget).await;
                report.record(&meta, EvictionReason::Budget, outcome);
            }
        }

        report.total_bytes = self.store.total_bytes();
        report.over_budget = budget.max_disk_bytes > 0 && report.total_bytes > budget.max_disk_bytes;

        if report.over_budget {
            warn!(
                total_bytes = report.total_bytes,
                max_disk_bytes = budget.max_disk_bytes,
                skipped_busy = report.skipped_busy,
                "Disk usage still over budget after sweep"
            );
        }
        info!(
            expired = report.expired,
            evicted = report.evicted,
            skipped_busy = report.skipped_busy,
            failed = report.failed,
            bytes_freed = report.bytes_freed,
            total_bytes = report.total_bytes,
            "Sweep complete"
        );
        report
    }

    /// Remove entries created more than `age` ago, regardless of their TTL.
    pub async fn sweep_older_than(&self, age: Duration) -> SweepReport {
        let _budget = self.budget.read().await;
        let mut report = SweepReport::default();

        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            report.total_bytes = self.store.total_bytes();
            return report;
        };

        for meta in self.store.snapshot() {
            if meta.created_at < cutoff {
                let outcome = self.store.try_evict(&meta.key, EvictionReason::Age).await;
                report.record(&meta, EvictionReason::Age, outcome);
            }
        }

        report.total_bytes = self.store.total_bytes();
        info!(
            age_secs = age.as_secs(),
            removed = report.expired,
            skipped_busy = report.skipped_busy,
            "Removed entries older than cutoff"
        );
        report
    }

    /// Replace the budget. Waits for a running sweep to finish.
    pub async fn set_budget(&self, budget: CacheBudget) {
        let mut current = self.budget.write().await;
        self.store.set_default_ttl(budget.max_entry_age());
        info!(
            max_disk_bytes = budget.max_disk_bytes,
            max_entry_age_secs = budget.max_entry_age_secs,
            sweep_interval_secs = budget.sweep_interval_secs,
            "Cache budget updated"
        );
        *current = budget;
    }

    pub async fn budget(&self) -> CacheBudget {
        self.budget.read().await.clone()
    }

    /// Sweep every `sweep_interval_secs` until the handle is shut down.
    ///
    /// The interval is re-read after each sweep, so `set_budget` takes effect
    /// without a restart. An interval of zero parks the timer.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                let interval = self.budget.read().await.sweep_interval();
                let (period, armed) = match interval {
                    Some(period) => (period, true),
                    None => (Duration::from_secs(1), false),
                };

                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if armed {
                            self.sweep().await;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Sweeper task stopped");
        });

        SweeperHandle { shutdown, task }
    }
}

/// Handle to the background sweep task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the timer and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{Codec, ResourceKey};
    use crate::config::StoreConfig;
    use crate::metrics::CacheMetrics;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn store(dir: &std::path::Path) -> Arc<Store> {
        let config = StoreConfig {
            cache_dir: dir.to_path_buf(),
            memory_capacity_bytes: 0,
            codec: Codec::None,
            compression_level: 3,
            ..StoreConfig::default()
        };
        let metrics = Arc::new(CacheMetrics::new().unwrap());
        Arc::new(Store::open(&config, None, metrics).await.unwrap())
    }

    fn key(s: &str) -> ResourceKey {
        ResourceKey::parse(s).unwrap()
    }

    fn budget(max_disk_bytes: u64) -> CacheBudget {
        CacheBudget {
            max_disk_bytes,
            max_entry_age_secs: 0,
            sweep_interval_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_unlimited_budget_keeps_everything() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path()).await;
        store.put(&key("a"), Bytes::from(vec![1u8; 100]), None).await.unwrap();

        let sweeper = Sweeper::new(store.clone(), budget(0));
        let report = sweeper.sweep().await;
        assert_eq!(report.removed(), 0);
        assert!(!report.over_budget);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_removed_first() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path()).await;
        store
            .put(&key("old"), Bytes::from(vec![1u8; 10]), Some(Duration::ZERO))
            .await
            .unwrap();
        store.put(&key("fresh"), Bytes::from(vec![2u8; 10]), None).await.unwrap();

        let sweeper = Sweeper::new(store.clone(), budget(0));
        let report = sweeper.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.bytes_freed, 10);
        assert!(!store.contains(&key("old")));
        assert!(store.contains(&key("fresh")));
    }

    #[tokio::test]
    async fn test_set_budget_updates_default_ttl() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path()).await;
        let sweeper = Sweeper::new(store.clone(), budget(0));
        assert!(store.default_ttl().is_none());

        sweeper
            .set_budget(CacheBudget {
                max_disk_bytes: 10,
                max_entry_age_secs: 60,
                sweep_interval_secs: 0,
            })
            .await;
        assert_eq!(store.default_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(sweeper.budget().await.max_disk_bytes, 10);
    }

    #[tokio::test]
    async fn test_sweep_older_than() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path()).await;
        store.put(&key("a"), Bytes::from(vec![1u8; 10]), None).await.unwrap();

        let sweeper = Sweeper::new(store.clone(), budget(0));
        let kept = sweeper.sweep_older_than(Duration::from_secs(3600)).await;
        assert_eq!(kept.removed(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = sweeper.sweep_older_than(Duration::from_millis(1)).await;
        assert_eq!(report.removed(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_background_task_sweeps_and_stops() {
        let tmp = TempDir::new().unwrap();
        let store = store(tmp.path()).await;
        store.put(&key("a"), Bytes::from(vec![1u8; 100]), None).await.unwrap();
        store.put(&key("b"), Bytes::from(vec![2u8; 100]), None).await.unwrap();

        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            CacheBudget {
                max_disk_bytes: 150,
                max_entry_age_secs: 0,
                sweep_interval_secs: 1,
            },
        ));
        let handle = sweeper.clone().spawn();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;

        assert_eq!(store.len(), 1);
        assert!(store.contains(&key("b")));
    }
}
