//! Resource cache facade.
//!
//! Wires the key codec, store, transfer coordinator and sweeper together
//! from one [`Config`] and owns the metrics registry they report to.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::entry::{CacheEntry, CachePolicy, ResourceKey};
use crate::cache::evictor::{SweepReport, Sweeper, SweeperHandle};
use crate::cache::key::{DigestKind, KeyCodec, KeyError};
use crate::cache::store::{Store, StoreError, StoreStats};
use crate::config::{CacheBudget, Config};
use crate::metrics::CacheMetrics;
use crate::transfer::coordinator::{
    FetchHandle, PayloadValidator, ProgressCallback, TransferCoordinator, TransferError,
    TransferOptions,
};
use crate::transfer::retry::RetryPolicy;
use crate::transfer::transport::{DefaultTransport, Transport, TransportError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// Builder for [`ResourceCache`].
pub struct ResourceCacheBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    codec: KeyCodec,
    validator: Option<PayloadValidator>,
    retry: Option<RetryPolicy>,
}

impl ResourceCacheBuilder {
    /// Use `transport` instead of the scheme-dispatching default.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a custom digest, selectable as `custom:<name>`.
    pub fn custom_digest<F>(mut self, name: impl Into<String>, digest: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.codec.register(name, digest);
        self
    }

    /// Reject completed payloads before they are stored.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[u8]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Replace the retry policy from the configuration, e.g. with a
    /// [`RetryPolicy::custom`] schedule.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub async fn build(self) -> Result<ResourceCache, EngineError> {
        let config = self.config;

        // Fail on an unusable digest before touching the disk.
        if let DigestKind::Custom(_) = config.key.digest {
            self.codec.compute_key("", &config.key.digest).map(|_| ()).or_else(|e| match e {
                KeyError::UnsupportedDigest(_) => Err(e),
                KeyError::InvalidKey { .. } => Ok(()),
            })?;
        }

        let metrics = Arc::new(CacheMetrics::new()?);
        let store = Arc::new(
            Store::open(&config.store, config.budget.max_entry_age(), metrics.clone()).await?,
        );

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(DefaultTransport::new(&config.transfer.user_agent)?),
        };

        let mut options = TransferOptions::from_config(&config.transfer, &config.key);
        options.validator = self.validator;
        options.cache_policy = config.store.cache_policy;
        if let Some(retry) = self.retry {
            options.retry = retry;
        }

        let coordinator = TransferCoordinator::new(
            store.clone(),
            transport,
            self.codec,
            options,
            metrics.clone(),
        );
        let sweeper = Arc::new(Sweeper::new(store.clone(), config.budget.clone()));

        info!(
            cache_dir = %config.store.cache_dir.display(),
            digest = %config.key.digest,
            cache_policy = %config.store.cache_policy,
            max_disk_bytes = config.budget.max_disk_bytes,
            "Resource cache ready"
        );

        Ok(ResourceCache {
            config,
            store,
            coordinator,
            sweeper,
            metrics,
        })
    }
}

/// The resource cache.
pub struct ResourceCache {
    config: Config,
    store: Arc<Store>,
    coordinator: TransferCoordinator,
    sweeper: Arc<Sweeper>,
    metrics: Arc<CacheMetrics>,
}

impl ResourceCache {
    pub fn builder(config: Config) -> ResourceCacheBuilder {
        ResourceCacheBuilder {
            config,
            transport: None,
            codec: KeyCodec::new(),
            validator: None,
            retry: None,
        }
    }

    /// Open with the default transport and no custom digests.
    pub async fn open(config: Config) -> Result<Self, EngineError> {
        Self::builder(config).build().await
    }

    /// Fetch `locator`, from the cache when present.
    pub async fn fetch(
        &self,
        locator: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        self.coordinator.fetch(locator, progress).await
    }

    /// Fetch through the tiers `policy` names.
    pub async fn fetch_with(
        &self,
        locator: &str,
        policy: CachePolicy,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        self.coordinator.fetch_with(locator, policy, progress).await
    }

    pub async fn subscribe(
        &self,
        locator: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<FetchHandle, TransferError> {
        self.coordinator.subscribe(locator, progress).await
    }

    pub async fn subscribe_with(
        &self,
        locator: &str,
        policy: CachePolicy,
        progress: Option<ProgressCallback>,
    ) -> Result<FetchHandle, TransferError> {
        self.coordinator.subscribe_with(locator, policy, progress).await
    }

    pub fn key_for(&self, locator: &str) -> Result<ResourceKey, KeyError> {
        self.coordinator.key_for(locator)
    }

    /// Cached payload for `locator`, looked up with the configured policy.
    /// A corrupt entry is dropped and reported as a miss.
    pub async fn get(&self, locator: &str) -> Result<Option<CacheEntry>, EngineError> {
        let key = self.key_for(locator)?;
        match self.store.get_with(&key, self.config.store.cache_policy).await {
            Ok(entry) => Ok(entry),
            Err(StoreError::Corrupt { key, reason }) => {
                warn!(key = %key, reason = %reason, "Corrupt entry treated as miss");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store `data` for `locator` without a transfer.
    pub async fn put(
        &self,
        locator: &str,
        data: Bytes,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry, EngineError> {
        self.put_with(locator, data, ttl, self.config.store.cache_policy)
            .await
    }

    pub async fn put_with(
        &self,
        locator: &str,
        data: Bytes,
        ttl: Option<Duration>,
        policy: CachePolicy,
    ) -> Result<CacheEntry, EngineError> {
        let key = self.key_for(locator)?;
        Ok(self.store.put_with(&key, data, ttl, policy).await?)
    }

    pub async fn remove(&self, locator: &str) -> Result<bool, EngineError> {
        let key = self.key_for(locator)?;
        Ok(self.store.remove(&key).await?)
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Start the background sweep timer.
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.sweeper.clone().spawn()
    }

    pub async fn set_budget(&self, budget: CacheBudget) {
        self.sweeper.set_budget(budget).await;
    }

    pub async fn budget(&self) -> CacheBudget {
        self.sweeper.budget().await
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub async fn clear(&self) -> Result<(), EngineError> {
        Ok(self.store.clear().await?)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }
}
