//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use linkcache::config::Config;
use linkcache::transfer::transport::{
    ResponseKind, Transport, TransportError, TransportRequest, TransportResponse,
};
use linkcache::{Codec, ResourceCache};

/// What the mock does for one `open` call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Serve the requested bytes.
    Serve,
    /// Serve this many body bytes, then fail the stream.
    FailAfter(usize),
    /// Serve this many body bytes, then never yield again.
    StallAfter(usize),
    /// Respond with this status.
    Status(u16),
}

/// Scripted in-memory transport.
pub struct MockTransport {
    content: Bytes,
    honor_range: bool,
    chunk_size: usize,
    advertised: Option<u64>,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<TransportRequest>>,
    opens: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            honor_range: true,
            chunk_size: 1000,
            advertised: None,
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Answer range requests with the whole body.
    pub fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Advertise this total instead of the real length.
    pub fn advertise(mut self, total: u64) -> Self {
        self.advertised = Some(total);
        self
    }

    /// Steps for successive opens; `Serve` once exhausted.
    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.lock().unwrap().extend(steps);
        self
    }

    /// Block every open until the semaphore grants a permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn range_starts(&self) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.range_start)
            .collect()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            permit.forget();
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Serve);
        if let Step::Status(code) = step {
            return Err(match code {
                416 => TransportError::RangeNotSatisfiable,
                code => TransportError::Status(code),
            });
        }

        let len = self.content.len() as u64;
        let (kind, start) = if self.honor_range && request.range_start > 0 {
            if request.range_start >= len {
                return Err(TransportError::RangeNotSatisfiable);
            }
            (
                ResponseKind::Partial {
                    start: request.range_start,
                },
                request.range_start as usize,
            )
        } else {
            (ResponseKind::Full, 0)
        };

        let remaining = self.content.slice(start..);
        let limit = match step {
            Step::FailAfter(n) | Step::StallAfter(n) => n.min(remaining.len()),
            _ => remaining.len(),
        };

        let chunks: Vec<Result<Bytes, TransportError>> = remaining
            .slice(..limit)
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let head = stream::iter(chunks);

        let body = match step {
            Step::FailAfter(_) => head
                .chain(stream::once(async {
                    Err(TransportError::Connection("connection reset".into()))
                }))
                .boxed(),
            Step::StallAfter(_) => head.chain(stream::pending()).boxed(),
            _ => head.boxed(),
        };

        Ok(TransportResponse {
            kind,
            total_bytes: Some(self.advertised.unwrap_or(len)),
            body,
        })
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Config rooted at `dir` with no retries, no timer and uncompressed entries.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_cache_dir(dir);
    config.store.codec = Codec::None;
    config.budget.max_disk_bytes = 0;
    config.budget.max_entry_age_secs = 0;
    config.budget.sweep_interval_secs = 0;
    config.transfer.retry.max_retries = 0;
    config.transfer.retry.interval_secs = 0;
    config.transfer.request_timeout_secs = 5;
    config
}

pub async fn open_cache(config: Config, transport: Arc<MockTransport>) -> ResourceCache {
    ResourceCache::builder(config)
        .transport(transport)
        .build()
        .await
        .unwrap()
}
