//! Moves a resolved format's bytes to the client.
//!
//! Two delivery modes share the same header rules: the proxy fetches the
//! source and forwards it in bounded chunks, the redirect hands the client the
//! locator. Once bytes have started flowing, an upstream failure can only
//! abort the transfer; it cannot become a clean error response.

use super::errors::ProxyError;
use super::types::{ResolvedFormat, SourceLocator, TargetKind};
use crate::config::{DeliveryMode, RelayConfig};
use crate::utils::format_size;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_FILENAME_CHARS: usize = 150;
const FALLBACK_FILENAME: &str = "media";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("format has no source locator")]
    SourceNotFound,

    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("transfer aborted after {bytes_sent} bytes: {reason}")]
    Aborted { bytes_sent: u64, reason: String },

    #[error("transfer cancelled after {bytes_sent} bytes")]
    Cancelled { bytes_sent: u64 },
}

impl From<RelayError> for ProxyError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::SourceNotFound => ProxyError::SourceNotFound,
            other => ProxyError::UpstreamUnavailable(other.to_string()),
        }
    }
}

/// Keeps ASCII alphanumerics, space, underscore and hyphen, then maps spaces
/// to underscores. Idempotent.
pub fn sanitize_filename(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();
    let cleaned: String = kept
        .trim()
        .replace(' ', "_")
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();

    if cleaned.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    }
}

/// Response headers shared by both delivery modes.
///
/// `content_length` is only set when it describes exactly the bytes this
/// response carries. `size_hint` is the locator's size otherwise (exact or
/// approximate), for clients that want a progress estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHeaders {
    pub filename: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub size_hint: Option<u64>,
}

impl RelayHeaders {
    pub fn for_format(resolved: &ResolvedFormat, kind: TargetKind, content_length: Option<u64>) -> Self {
        let stem = sanitize_filename(resolved.title.as_deref().unwrap_or(FALLBACK_FILENAME));
        let extension = match kind {
            TargetKind::Audio => "mp3".to_string(),
            TargetKind::Video => {
                let ext: String = resolved
                    .container
                    .chars()
                    .filter(char::is_ascii_alphanumeric)
                    .collect();
                if ext.is_empty() {
                    "mp4".to_string()
                } else {
                    ext
                }
            }
        };

        Self {
            filename: format!("{}.{}", stem, extension),
            content_type: content_type_for(resolved, kind, &extension),
            content_length,
            size_hint: None,
        }
    }

    fn with_size_hint(mut self, hint: Option<u64>) -> Self {
        self.size_hint = hint;
        self
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

fn content_type_for(resolved: &ResolvedFormat, kind: TargetKind, extension: &str) -> String {
    if kind == TargetKind::Audio {
        return "audio/mpeg".to_string();
    }
    if !resolved.mime_type.is_empty() {
        return resolved.mime_type.clone();
    }
    mime_guess::from_ext(extension)
        .first()
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| {
            if resolved.has_video {
                "video/mp4".to_string()
            } else {
                "application/octet-stream".to_string()
            }
        })
}

/// Counters for one finished transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_sent: u64,
    pub chunks: u64,
    pub largest_chunk: usize,
}

/// Re-slices an upstream byte stream into chunks of at most `chunk_size`.
///
/// Holds at most one upstream frame at a time and hands out zero-copy slices
/// of it, so working memory does not grow with the payload.
pub struct RelayStream {
    upstream: BoxStream<'static, io::Result<Bytes>>,
    pending: Bytes,
    chunk_size: usize,
    outcome: RelayOutcome,
    finished: bool,
}

impl RelayStream {
    pub fn new(upstream: BoxStream<'static, io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            upstream,
            pending: Bytes::new(),
            chunk_size: chunk_size.max(1),
            outcome: RelayOutcome::default(),
            finished: false,
        }
    }

    pub fn outcome(&self) -> RelayOutcome {
        self.outcome
    }

    fn take_chunk(&mut self) -> Bytes {
        let len = self.pending.len().min(self.chunk_size);
        let chunk = self.pending.split_to(len);
        self.outcome.bytes_sent += len as u64;
        self.outcome.chunks += 1;
        self.outcome.largest_chunk = self.outcome.largest_chunk.max(len);
        chunk
    }
}

impl Stream for RelayStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                return Poll::Ready(Some(Ok(this.take_chunk())));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(frame))) => this.pending = frame,
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    warn!(
                        "Upstream failed after {} bytes, aborting transfer: {}",
                        this.outcome.bytes_sent, e
                    );
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    info!(
                        "Relay finished: {} in {} chunks",
                        format_size(this.outcome.bytes_sent),
                        this.outcome.chunks
                    );
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            info!(
                "Relay dropped after {} bytes, releasing upstream connection",
                self.outcome.bytes_sent
            );
        }
    }
}

/// An opened upstream response, before any byte has reached the client.
pub struct UpstreamSource {
    pub content_length: Option<u64>,
    pub stream: RelayStream,
}

/// How the client will receive the bytes.
pub enum Delivery {
    Redirect {
        location: String,
        headers: RelayHeaders,
    },
    Stream {
        headers: RelayHeaders,
        body: RelayStream,
    },
}

pub struct RelayEngine {
    client: reqwest::Client,
    chunk_size: usize,
}

impl RelayEngine {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        // No overall timeout: transfers may legitimately run for a long time.
        // The read timeout still ends a stalled upstream.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            chunk_size: config.chunk_size(),
        })
    }

    /// Connects to the source and checks the status. Everything that can fail
    /// here fails before the client has seen a byte.
    pub async fn open(&self, locator: &SourceLocator) -> Result<UpstreamSource, RelayError> {
        if locator.url.is_empty() {
            return Err(RelayError::SourceNotFound);
        }

        let response = self
            .client
            .get(&locator.url)
            .headers(upstream_headers(&locator.http_headers))
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(format!("source request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamUnavailable(format!(
                "source answered HTTP {}",
                status
            )));
        }

        let content_length = response.content_length();
        debug!("Opened source (HTTP {}, length {:?})", status, content_length);

        let upstream = response
            .bytes_stream()
            .map(|frame| frame.map_err(io::Error::other))
            .boxed();

        Ok(UpstreamSource {
            content_length,
            stream: RelayStream::new(upstream, self.chunk_size),
        })
    }

    /// Prepares delivery of a freshly resolved format.
    ///
    /// A redirect carries no body, so the locator's exact or approximate size
    /// only goes out as a hint. A proxied transfer promises the length the
    /// source declares, else the exact size; an approximate size stays a hint.
    pub async fn deliver(
        &self,
        resolved: &ResolvedFormat,
        kind: TargetKind,
        mode: DeliveryMode,
    ) -> Result<Delivery, RelayError> {
        match mode {
            DeliveryMode::Redirect => {
                if resolved.locator.url.is_empty() {
                    return Err(RelayError::SourceNotFound);
                }
                let headers = RelayHeaders::for_format(resolved, kind, None)
                    .with_size_hint(resolved.locator.effective_size());
                info!("Redirecting client for format {}", resolved.format_id);
                Ok(Delivery::Redirect {
                    location: resolved.locator.url.clone(),
                    headers,
                })
            }
            DeliveryMode::Proxy => {
                let source = self.open(&resolved.locator).await?;
                let length = source.content_length.or(resolved.locator.filesize);
                let hint = match length {
                    Some(_) => None,
                    None => resolved.locator.filesize_approx,
                };
                let headers = RelayHeaders::for_format(resolved, kind, length).with_size_hint(hint);
                info!(
                    "Proxying format {} as {} ({:?} bytes)",
                    resolved.format_id, headers.filename, length
                );
                Ok(Delivery::Stream {
                    headers,
                    body: source.stream,
                })
            }
        }
    }

    /// Copies the source into `writer` chunk by chunk until it ends, fails,
    /// or `cancel` fires.
    pub async fn relay<W>(
        &self,
        locator: &SourceLocator,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let source = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled { bytes_sent: 0 }),
            source = self.open(locator) => source?,
        };
        let mut stream = source.stream;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RelayError::Cancelled {
                        bytes_sent: stream.outcome().bytes_sent,
                    });
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    writer.write_all(&chunk).await.map_err(|e| RelayError::Aborted {
                        bytes_sent: stream.outcome().bytes_sent,
                        reason: format!("destination write failed: {}", e),
                    })?;
                }
                Some(Err(e)) => {
                    let bytes_sent = stream.outcome().bytes_sent;
                    return Err(if bytes_sent == 0 {
                        RelayError::UpstreamUnavailable(format!("source failed: {}", e))
                    } else {
                        RelayError::Aborted {
                            bytes_sent,
                            reason: e.to_string(),
                        }
                    });
                }
                None => break,
            }
        }

        writer.flush().await.map_err(|e| RelayError::Aborted {
            bytes_sent: stream.outcome().bytes_sent,
            reason: format!("destination flush failed: {}", e),
        })?;

        Ok(stream.outcome())
    }
}

fn upstream_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!("Skipping invalid upstream header {}", name);
            continue;
        };
        // Bytes are forwarded verbatim, so the source must not compress them
        if name == ACCEPT_ENCODING {
            continue;
        }
        headers.insert(name, value);
    }
    headers
}
