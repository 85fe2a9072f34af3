use crate::config::ExtractorConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

use super::errors::{classify, first_line, ProxyError};

/// Options for one probe. Built from the shared config per request; the
/// per-request parts (format, cookies) are set on this copy only.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub socket_timeout_secs: u64,
    pub http_headers: Vec<(String, String)>,
    pub extra_args: Vec<String>,
    pub format: Option<String>,
    pub cookies: Option<PathBuf>,
}

impl ProbeOptions {
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            timeout: config.timeout(),
            socket_timeout_secs: config.socket_timeout_secs,
            http_headers: config
                .http_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            extra_args: config.extra_args.clone(),
            format: None,
            cookies: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_cookies(mut self, path: Option<&Path>) -> Self {
        self.cookies = path.map(Path::to_path_buf);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run extractor: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("extractor failed: {stderr}")]
    Failed { stderr: String },

    #[error("could not parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not extract media info, it may be restricted or invalid")]
    Empty,
}

impl From<ExtractError> for ProxyError {
    fn from(err: ExtractError) -> Self {
        let message = err.to_string();
        match err {
            ExtractError::Timeout(_) => ProxyError::UpstreamUnavailable(message),
            ExtractError::Failed { stderr } => classify(&stderr),
            // The extractor ran but recognised nothing at this URL
            ExtractError::Empty => ProxyError::UnsupportedSource,
            ExtractError::Spawn(_) | ExtractError::Parse(_) => {
                ProxyError::Unknown(first_line(&message))
            }
        }
    }
}

/// The external capability that turns a media URL into a metadata document.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Human-readable name of the extractor
    fn name(&self) -> &'static str;

    /// Probe the URL and return the raw metadata document
    async fn probe(&self, url: &Url, options: &ProbeOptions) -> Result<Value, ExtractError>;

    /// Test if this extractor is usable on the system
    async fn test_availability(&self) -> bool;
}

/// Probes until success, a permanent failure, or `attempts` runs out.
/// Failures come back already classified.
pub async fn probe_with_retry(
    extractor: &dyn Extractor,
    url: &Url,
    options: &ProbeOptions,
    attempts: u32,
    delay: Duration,
) -> Result<Value, ProxyError> {
    let mut attempt = 1;
    loop {
        match extractor.probe(url, options).await {
            Ok(doc) => return Ok(doc),
            Err(err) => {
                let classified = ProxyError::from(err);
                if !classified.kind().is_retryable() || attempt >= attempts {
                    return Err(classified);
                }
                warn!(
                    "{} probe attempt {}/{} for {} failed, retrying: {}",
                    extractor.name(),
                    attempt,
                    attempts,
                    url,
                    classified
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
