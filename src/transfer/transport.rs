//! Byte-stream transports used by the transfer coordinator.
//!
//! - [`HttpTransport`]: HTTP(S) via reqwest, resuming with `Range` requests
//! - [`FileTransport`]: `file://` URLs and plain paths, resuming by seeking
//! - [`DefaultTransport`]: dispatches on the locator scheme

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unsupported locator: {0}")]
    UnsupportedLocator(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// One request for a resource, optionally resuming at `range_start`.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    pub locator: String,
    /// Bytes already held; ask for the remainder only.
    pub range_start: u64,
    pub headers: Vec<(String, String)>,
}

/// Whether the body starts at byte zero or continues a partial download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Full,
    Partial { start: u64 },
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub kind: ResponseKind,
    /// Size of the whole resource, when known.
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("kind", &self.kind)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Opens byte streams for locators.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// HTTP(S) transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.locator);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connection(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connection(format!("invalid header value: {e}")))?;
            builder = builder.header(name, value);
        }
        if request.range_start > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.range_start));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let status = response.status();

        let (kind, total_bytes) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                match range {
                    Some((start, total)) => (ResponseKind::Partial { start }, total),
                    None => (
                        ResponseKind::Partial {
                            start: request.range_start,
                        },
                        response.content_length().map(|len| len + request.range_start),
                    ),
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(TransportError::RangeNotSatisfiable),
            s if s.is_success() => (ResponseKind::Full, response.content_length()),
            s => return Err(TransportError::Status(s.as_u16())),
        };

        debug!(
            locator = %request.locator,
            status = status.as_u16(),
            range_start = request.range_start,
            total_bytes = ?total_bytes,
            "HTTP response opened"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Connection(e.to_string())))
            .boxed();

        Ok(TransportResponse {
            kind,
            total_bytes,
            body,
        })
    }
}

/// Parse `bytes <start>-<end>/<total>`. The total may be `*`.
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

/// Local file transport.
#[derive(Debug, Clone, Default)]
pub struct FileTransport;

impl FileTransport {
    fn path_for(locator: &str) -> Option<PathBuf> {
        if let Some(path) = locator.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if locator.contains("://") {
            return None;
        }
        Some(PathBuf::from(locator))
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let path = Self::path_for(&request.locator)
            .ok_or_else(|| TransportError::UnsupportedLocator(request.locator.clone()))?;

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransportError::Io(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .len();

        let start = request.range_start;
        if start > 0 && start >= len {
            return Err(TransportError::RangeNotSatisfiable);
        }
        let kind = if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            ResponseKind::Partial { start }
        } else {
            ResponseKind::Full
        };

        let body = stream::unfold(Some(file), |file| async move {
            let mut file = file?;
            let mut buf = BytesMut::zeroed(FILE_CHUNK_SIZE);
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf.freeze()), Some(file)))
                }
                Err(e) => Some((Err(TransportError::Io(e.to_string())), None)),
            }
        })
        .boxed();

        Ok(TransportResponse {
            kind,
            total_bytes: Some(len),
            body,
        })
    }
}

/// Routes `http://` and `https://` to HTTP, everything else to the file transport.
#[derive(Debug, Clone)]
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        Ok(Self {
            http: HttpTransport::new(user_agent)?,
            file: FileTransport,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let scheme = request
            .locator
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("http") | Some("https") => self.http.open(request).await,
            _ => self.file.open(request).await,
        }
    }
}
