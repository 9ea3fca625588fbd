//! Transfer coordinator: one network transfer per key, shared by every caller.
//!
//! A fetch for a key that is not cached either joins the transfer already in
//! flight for that key or starts one on a spawned driver task. The driver:
//! - Resumes from the key's partial file with a range request
//! - Reports coalesced progress to every current subscriber
//! - Retries network failures according to the retry policy
//! - Stores the payload and broadcasts one outcome to all subscribers
//!
//! The transfer aborts only when its last subscriber leaves. Received bytes
//! stay in the partial file for the next attempt.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::disk_io::DiskIoError;
use crate::cache::entry::{CachePolicy, ResourceKey};
use crate::cache::key::{DigestKind, KeyCodec, KeyError};
use crate::cache::store::{Store, StoreError};
use crate::config::{KeyConfig, TransferConfig};
use crate::metrics::CacheMetrics;
use crate::transfer::retry::RetryPolicy;
use crate::transfer::transport::{ResponseKind, Transport, TransportError, TransportRequest};

/// Bytes received so far for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Completed fraction, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_received as f64 / total as f64),
            None => None,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Checks a completed payload before it is stored.
pub type PayloadValidator = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

/// Transient failures. The partial file is kept for resume.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Body ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
}

#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Payload rejected: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(Arc<StoreError>),

    #[error("Cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }

    /// Label used for the failure metric.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Key(_) => "key",
            TransferError::Network(_) => "network",
            TransferError::Decode(_) => "decode",
            TransferError::Storage(_) => "storage",
            TransferError::Cancelled => "cancelled",
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::Storage(Arc::new(e))
    }
}

impl From<DiskIoError> for TransferError {
    fn from(e: DiskIoError) -> Self {
        StoreError::from(e).into()
    }
}

/// Coordinator settings.
#[derive(Clone)]
pub struct TransferOptions {
    pub progress_interval: Duration,
    /// Applied to opening a response and to every body chunk.
    pub request_timeout: Duration,
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub digest: DigestKind,
    /// Tiers used by `fetch` and `subscribe`.
    pub cache_policy: CachePolicy,
    pub validator: Option<PayloadValidator>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), &KeyConfig::default())
    }
}

impl TransferOptions {
    pub fn from_config(transfer: &TransferConfig, key: &KeyConfig) -> Self {
        Self {
            progress_interval: transfer.progress_interval(),
            request_timeout: transfer.request_timeout(),
            headers: transfer
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            retry: transfer.retry.policy(),
            digest: key.digest.clone(),
            cache_policy: CachePolicy::default(),
            validator: None,
        }
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress_interval", &self.progress_interval)
            .field("request_timeout", &self.request_timeout)
            .field("headers", &self.headers)
            .field("retry", &self.retry)
            .field("digest", &self.digest)
            .field("cache_policy", &self.cache_policy)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

type Outcome = Result<Bytes, TransferError>;

struct Subscriber {
    done: oneshot::Sender<Outcome>,
    progress: Option<ProgressCallback>,
}

struct TransferState {
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    total_bytes: Option<u64>,
    bytes_received: u64,
    last_report: Option<Instant>,
}

/// A transfer shared by every subscriber of one key.
struct InFlightTransfer {
    id: Uuid,
    key: ResourceKey,
    locator: String,
    partial_path: PathBuf,
    /// Set by the subscriber that started the transfer.
    policy: CachePolicy,
    state: Mutex<TransferState>,
    /// Raised when the last subscriber leaves.
    abort: watch::Sender<bool>,
}

impl InFlightTransfer {
    fn new(key: ResourceKey, locator: String, partial_path: PathBuf, policy: CachePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            locator,
            partial_path,
            policy,
            state: Mutex::new(TransferState {
                subscribers: HashMap::new(),
                next_subscriber: 0,
                total_bytes: None,
                bytes_received: 0,
                last_report: None,
            }),
            abort: watch::channel(false).0,
        }
    }

    fn attach(&self, progress: Option<ProgressCallback>) -> (u64, oneshot::Receiver<Outcome>) {
        let (done, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, Subscriber { done, progress });
        self.abort.send_replace(false);
        (id, rx)
    }

    fn detach(&self, subscriber: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&subscriber).is_some() && state.subscribers.is_empty() {
            self.abort.send_replace(true);
        }
    }

    fn progress(&self) -> Progress {
        let state = self.state.lock();
        Progress {
            bytes_received: state.bytes_received,
            total_bytes: state.total_bytes,
        }
    }

    /// Record progress and notify subscribers if the interval has passed.
    fn report(&self, bytes_received: u64, total_bytes: Option<u64>, interval: Duration, force: bool) {
        let (progress, callbacks) = {
            let mut state = self.state.lock();
            state.bytes_received = bytes_received;
            state.total_bytes = total_bytes;

            let now = Instant::now();
            let due = match state.last_report {
                Some(last) => now.duration_since(last) >= interval,
                None => true,
            };
            if !(due || force) {
                return;
            }
            state.last_report = Some(now);

            let callbacks: Vec<ProgressCallback> = state
                .subscribers
                .values()
                .filter_map(|s| s.progress.clone())
                .collect();
            (
                Progress {
                    bytes_received,
                    total_bytes,
                },
                callbacks,
            )
        };

        for callback in callbacks {
            callback(progress);
        }
    }
}

struct CoordinatorInner {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    codec: KeyCodec,
    options: TransferOptions,
    registry: DashMap<ResourceKey, Arc<InFlightTransfer>>,
    metrics: Arc<CacheMetrics>,
}

impl CoordinatorInner {
    /// Remove the transfer and take its subscribers in one step, so no
    /// subscriber can attach after the outcome is delivered.
    fn retire(&self, transfer: &Arc<InFlightTransfer>) -> HashMap<u64, Subscriber> {
        let mut subscribers = HashMap::new();
        self.registry.remove_if(&transfer.key, |_, current| {
            if Arc::ptr_eq(current, transfer) {
                subscribers = std::mem::take(&mut current.state.lock().subscribers);
                true
            } else {
                false
            }
        });
        subscribers
    }

    /// Remove the transfer only if nobody is subscribed.
    fn retire_if_idle(&self, transfer: &Arc<InFlightTransfer>) -> bool {
        self.registry
            .remove_if(&transfer.key, |_, current| {
                Arc::ptr_eq(current, transfer) && current.state.lock().subscribers.is_empty()
            })
            .is_some()
    }

    /// Await `fut` unless every subscriber leaves first.
    async fn until_aborted<F: Future>(
        &self,
        transfer: &Arc<InFlightTransfer>,
        fut: F,
    ) -> Result<F::Output, TransferError> {
        tokio::pin!(fut);
        let mut abort = transfer.abort.subscribe();
        loop {
            // Copy out so the watch lock is not held while taking registry locks.
            let aborted = *abort.borrow_and_update();
            if aborted && self.retire_if_idle(transfer) {
                return Err(TransferError::Cancelled);
            }
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = abort.changed() => {}
            }
        }
    }
}

/// Deduplicating fetcher. Cheap to clone.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransferCoordinator {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        codec: KeyCodec,
        options: TransferOptions,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                transport,
                codec,
                options,
                registry: DashMap::new(),
                metrics,
            }),
        }
    }

    /// Fetch a resource, from the cache when present.
    pub async fn fetch(
        &self,
        locator: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        self.subscribe(locator, progress).await?.wait().await
    }

    /// Fetch through the tiers `policy` names instead of the configured ones.
    pub async fn fetch_with(
        &self,
        locator: &str,
        policy: CachePolicy,
        progress: Option<ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        self.subscribe_with(locator, policy, progress).await?.wait().await
    }

    /// Start or join the fetch for `locator` and return a handle to its outcome.
    pub async fn subscribe(
        &self,
        locator: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<FetchHandle, TransferError> {
        self.subscribe_with(locator, self.inner.options.cache_policy, progress)
            .await
    }

    /// Like [`subscribe`](Self::subscribe) with an explicit cache policy.
    ///
    /// Joining a transfer already in flight shares it, and the payload is
    /// stored with the policy of the subscriber that started it.
    pub async fn subscribe_with(
        &self,
        locator: &str,
        policy: CachePolicy,
        progress: Option<ProgressCallback>,
    ) -> Result<FetchHandle, TransferError> {
        let inner = &self.inner;
        let key = inner.codec.compute_key(locator, &inner.options.digest)?;

        match inner.store.get_with(&key, policy).await {
            Ok(Some(entry)) => return Ok(FetchHandle::ready(key, entry.data)),
            Ok(None) => {}
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(key = %key, reason = %reason, "Corrupt entry treated as miss");
            }
            Err(e) => return Err(e.into()),
        }

        let (transfer, subscriber, rx, started) = match inner.registry.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let transfer = occupied.get().clone();
                let (subscriber, rx) = transfer.attach(progress);
                inner.metrics.transfers_joined.inc();
                debug!(key = %key, transfer_id = %transfer.id, "Joined in-flight transfer");
                (transfer, subscriber, rx, false)
            }
            Entry::Vacant(vacant) => {
                let partial_path = inner.store.disk().partial_path(&key);
                let transfer = Arc::new(InFlightTransfer::new(
                    key.clone(),
                    locator.to_string(),
                    partial_path,
                    policy,
                ));
                let (subscriber, rx) = transfer.attach(progress);
                vacant.insert(transfer.clone());
                (transfer, subscriber, rx, true)
            }
        };

        if started {
            tokio::spawn(drive(self.inner.clone(), transfer.clone()));
        }

        Ok(FetchHandle {
            key,
            state: HandleState::Pending {
                transfer,
                subscriber,
                rx,
            },
        })
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn key_for(&self, locator: &str) -> Result<ResourceKey, KeyError> {
        self.inner
            .codec
            .compute_key(locator, &self.inner.options.digest)
    }
}

enum HandleState {
    Ready(Bytes),
    Pending {
        transfer: Arc<InFlightTransfer>,
        subscriber: u64,
        rx: oneshot::Receiver<Outcome>,
    },
    Cancelled,
    Done,
}

/// One subscriber's view of a fetch. Dropping it detaches the subscriber.
pub struct FetchHandle {
    key: ResourceKey,
    state: HandleState,
}

impl FetchHandle {
    fn ready(key: ResourceKey, data: Bytes) -> Self {
        Self {
            key,
            state: HandleState::Ready(data),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Whether the result came straight from the cache.
    pub fn is_cached(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    pub fn progress(&self) -> Progress {
        match &self.state {
            HandleState::Ready(data) => Progress {
                bytes_received: data.len() as u64,
                total_bytes: Some(data.len() as u64),
            },
            HandleState::Pending { transfer, .. } => transfer.progress(),
            HandleState::Cancelled | HandleState::Done => Progress::default(),
        }
    }

    /// Leave the transfer. Other subscribers are unaffected; `wait` now
    /// returns `Cancelled`.
    pub fn cancel(&mut self) {
        if let HandleState::Pending {
            transfer,
            subscriber,
            ..
        } = &self.state
        {
            transfer.detach(*subscriber);
            debug!(key = %self.key, transfer_id = %transfer.id, "Subscriber cancelled");
        }
        self.state = HandleState::Cancelled;
    }

    /// Wait for the shared outcome.
    pub async fn wait(mut self) -> Result<Bytes, TransferError> {
        let result = match &mut self.state {
            HandleState::Ready(data) => Ok(data.clone()),
            HandleState::Pending { rx, .. } => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(NetworkError::Transport(TransportError::Connection(
                    "transfer task ended without a result".to_string(),
                ))
                .into()),
            },
            HandleState::Cancelled => Err(TransferError::Cancelled),
            HandleState::Done => Err(TransferError::Cancelled),
        };
        self.state = HandleState::Done;
        result
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if let HandleState::Pending {
            transfer,
            subscriber,
            ..
        } = &self.state
        {
            transfer.detach(*subscriber);
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            HandleState::Ready(_) => "ready",
            HandleState::Pending { .. } => "pending",
            HandleState::Cancelled => "cancelled",
            HandleState::Done => "done",
        };
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .field("state", &state)
            .finish()
    }
}

/// Driver task for one transfer.
async fn drive(inner: Arc<CoordinatorInner>, transfer: Arc<InFlightTransfer>) {
    let start = Instant::now();
    inner.metrics.transfers_started.inc();
    inner.metrics.in_flight.inc();
    debug!(
        key = %transfer.key,
        transfer_id = %transfer.id,
        locator = %transfer.locator,
        partial = %transfer.partial_path.display(),
        "Transfer started"
    );

    let outcome = run(&inner, &transfer).await;
    inner.metrics.in_flight.dec();

    match &outcome {
        Ok(data) => info!(
            key = %transfer.key,
            transfer_id = %transfer.id,
            bytes = data.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Transfer complete"
        ),
        Err(TransferError::Cancelled) => {
            debug!(key = %transfer.key, transfer_id = %transfer.id, "Transfer aborted, no subscribers left");
            return;
        }
        Err(e) => {
            inner.metrics.transfer_failures.with_label_values(&[e.kind()]).inc();
            warn!(key = %transfer.key, transfer_id = %transfer.id, error = %e, "Transfer failed");
        }
    }

    let subscribers = inner.retire(&transfer);
    for (_, subscriber) in subscribers {
        let _ = subscriber.done.send(outcome.clone());
    }
}

async fn run(inner: &CoordinatorInner, transfer: &Arc<InFlightTransfer>) -> Outcome {
    // A previous transfer may have stored the key since the caller's lookup.
    match inner.store.get_with(&transfer.key, transfer.policy).await {
        Ok(Some(entry)) => return Ok(entry.data),
        Ok(None) | Err(StoreError::Corrupt { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let policy = &inner.options.retry;
    let mut retries = 0;
    let data = loop {
        match attempt(inner, transfer).await {
            Ok(data) => break data,
            Err(TransferError::Network(e)) if policy.allows(retries + 1) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    key = %transfer.key,
                    transfer_id = %transfer.id,
                    error = %e,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transfer attempt failed, retrying"
                );
                inner.until_aborted(transfer, tokio::time::sleep(delay)).await?;
            }
            Err(e) => return Err(e),
        }
    };

    let disk = inner.store.disk();
    if data.is_empty() {
        disk.remove_partial(&transfer.key).await?;
        return Err(TransferError::Decode("empty payload".to_string()));
    }
    if let Some(validator) = &inner.options.validator {
        if let Err(reason) = validator(data.as_ref()) {
            disk.remove_partial(&transfer.key).await?;
            return Err(TransferError::Decode(reason));
        }
    }

    if let Err(e) = inner
        .store
        .put_with(&transfer.key, data.clone(), None, transfer.policy)
        .await
    {
        if let Err(cleanup) = disk.remove_partial(&transfer.key).await {
            warn!(key = %transfer.key, error = %cleanup, "Failed to remove partial file");
        }
        return Err(e.into());
    }
    if let Err(e) = disk.remove_partial(&transfer.key).await {
        warn!(key = %transfer.key, error = %e, "Failed to remove partial file");
    }
    Ok(data)
}

/// One request, resuming from whatever the partial file holds.
async fn attempt(inner: &CoordinatorInner, transfer: &Arc<InFlightTransfer>) -> Outcome {
    let disk = inner.store.disk();
    let timeout = inner.options.request_timeout;

    let existing = disk.read_partial(&transfer.key).await?;
    let mut buffer = BytesMut::from(existing.as_slice());

    let response = loop {
        let request = TransportRequest {
            locator: transfer.locator.clone(),
            range_start: buffer.len() as u64,
            headers: inner.options.headers.clone(),
        };
        let opened = inner
            .until_aborted(
                transfer,
                tokio::time::timeout(timeout, inner.transport.open(&request)),
            )
            .await?;

        match opened {
            Err(_) => return Err(NetworkError::Timeout(timeout).into()),
            Ok(Err(TransportError::RangeNotSatisfiable)) if request.range_start > 0 => {
                debug!(
                    key = %transfer.key,
                    range_start = request.range_start,
                    "Range rejected, restarting from zero"
                );
                disk.remove_partial(&transfer.key).await?;
                buffer.clear();
            }
            Ok(Err(e)) => return Err(NetworkError::Transport(e).into()),
            Ok(Ok(response)) => break response,
        }
    };

    let offset = buffer.len() as u64;
    let truncate = match response.kind {
        ResponseKind::Full => {
            if offset > 0 {
                debug!(key = %transfer.key, offset, "Range ignored, restarting from zero");
                buffer.clear();
            }
            true
        }
        ResponseKind::Partial { start } if start == offset => false,
        ResponseKind::Partial { start } => {
            disk.remove_partial(&transfer.key).await?;
            return Err(NetworkError::Transport(TransportError::Connection(format!(
                "resumed at byte {start}, expected {offset}"
            )))
            .into());
        }
    };

    let total = response.total_bytes;
    let interval = inner.options.progress_interval;
    let mut file = disk.open_partial(&transfer.key, truncate).await?;
    let mut body = response.body;
    transfer.report(buffer.len() as u64, total, interval, false);

    loop {
        let next = inner
            .until_aborted(transfer, tokio::time::timeout(timeout, body.next()))
            .await?;
        let chunk = match next {
            Err(_) => return Err(NetworkError::Timeout(timeout).into()),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(NetworkError::Transport(e).into()),
            Ok(Some(Ok(chunk))) => chunk,
        };

        file.write_all(&chunk).await.map_err(DiskIoError::from)?;
        file.flush().await.map_err(DiskIoError::from)?;
        buffer.extend_from_slice(&chunk);
        inner.metrics.bytes_downloaded.inc_by(chunk.len() as u64);

        if let Some(expected) = total {
            if buffer.len() as u64 > expected {
                drop(file);
                disk.remove_partial(&transfer.key).await?;
                return Err(TransferError::Decode(format!(
                    "received {} bytes, expected {expected}",
                    buffer.len()
                )));
            }
        }
        transfer.report(buffer.len() as u64, total, interval, false);
    }

    transfer.report(buffer.len() as u64, total, interval, true);

    if let Some(expected) = total {
        let received = buffer.len() as u64;
        if received < expected {
            return Err(NetworkError::Incomplete { received, expected }.into());
        }
    }
    Ok(buffer.freeze())
}
