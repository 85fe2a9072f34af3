mod credentials;
mod errors;
mod extractor;
mod normalize;
mod relay;
mod resolve;
mod types;
mod ytdlp;

pub use credentials::CredentialScope;
pub use errors::{ErrorKind, ProxyError};
pub use extractor::{Extractor, ProbeOptions};
pub use relay::{Delivery, RelayEngine, RelayHeaders};
pub use types::{MediaInfo, ResolvedFormat, TargetKind};
pub use ytdlp::YtDlpExtractor;

#[cfg(test)]
pub(crate) use extractor::fake;
#[cfg(test)]
pub(crate) use relay::test_support;

use crate::config::{Config, DeliveryMode};
use anyhow::Result;
use credentials::scope_path;
use extractor::probe_with_retry;
use normalize::normalize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Describe and Fetch over one extractor. Holds only read-only settings, so
/// concurrent requests share nothing mutable.
pub struct MediaService {
    extractor: Arc<dyn Extractor>,
    relay: RelayEngine,
    defaults: ProbeOptions,
    attempts: u32,
    retry_delay: Duration,
    delivery: DeliveryMode,
}

impl MediaService {
    pub fn new(config: &Config, extractor: Arc<dyn Extractor>) -> Result<Self> {
        info!(
            "Media service initialized - extractor: {}, delivery: {:?}",
            extractor.name(),
            config.server.delivery
        );

        Ok(Self {
            extractor,
            relay: RelayEngine::new(&config.relay)?,
            defaults: ProbeOptions::from_config(&config.extractor),
            attempts: config.extractor.attempts(),
            retry_delay: config.extractor.retry_delay(),
            delivery: config.server.delivery,
        })
    }

    pub fn relay_engine(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    pub async fn test_setup(&self) -> Result<()> {
        if self.extractor.test_availability().await {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} is not available. Please install it or set extractor.binary.",
                self.extractor.name()
            ))
        }
    }

    /// Normalized catalog for `url`. The URL is validated before the
    /// extractor is touched.
    pub async fn describe(
        &self,
        url: &str,
        credentials: Option<&[u8]>,
    ) -> Result<MediaInfo, ProxyError> {
        let url = parse_media_url(url)?;
        info!("Describing {}", url);

        let scope = open_scope(credentials)?;
        let options = self
            .defaults
            .clone()
            .with_cookies(scope_path(scope.as_ref()));
        let result = self.probe(&url, &options).await;
        close_scope(scope);

        let info = normalize(&result?);
        info!("Found {} formats for {}", info.formats.len(), url);
        Ok(info)
    }

    /// Re-probes `url` scoped to `format_id` and returns the fresh locator.
    /// The credential scope, if any, is gone by the time this returns.
    pub async fn prepare(
        &self,
        url: &str,
        format_id: &str,
        credentials: Option<&[u8]>,
    ) -> Result<ResolvedFormat, ProxyError> {
        let url = parse_media_url(url)?;
        let format_id = format_id.trim();
        if format_id.is_empty() {
            return Err(ProxyError::invalid("Missing required parameter: itag."));
        }

        let scope = open_scope(credentials)?;
        let result = self.resolve(&url, format_id, scope.as_ref()).await;
        close_scope(scope);
        result
    }

    /// Format-scoped probe. Never reuses a locator from an earlier catalog.
    pub async fn resolve(
        &self,
        url: &Url,
        format_id: &str,
        scope: Option<&CredentialScope>,
    ) -> Result<ResolvedFormat, ProxyError> {
        info!("Resolving format {} for {}", format_id, url);
        let options = self
            .defaults
            .clone()
            .with_format(format_id)
            .with_cookies(scope_path(scope));
        let doc = self.probe(url, &options).await?;
        resolve::select_format(&doc, format_id)
    }

    /// Resolves and prepares delivery in the configured mode.
    pub async fn fetch(
        &self,
        url: &str,
        format_id: &str,
        kind: TargetKind,
        credentials: Option<&[u8]>,
    ) -> Result<Delivery, ProxyError> {
        let resolved = self.prepare(url, format_id, credentials).await?;
        Ok(self.relay.deliver(&resolved, kind, self.delivery).await?)
    }

    async fn probe(&self, url: &Url, options: &ProbeOptions) -> Result<serde_json::Value, ProxyError> {
        probe_with_retry(
            self.extractor.as_ref(),
            url,
            options,
            self.attempts,
            self.retry_delay,
        )
        .await
        .inspect_err(|e| warn!("Probe of {} failed ({}): {}", url, e.kind(), e))
    }
}

/// Accepts only absolute http(s) URLs with a host.
pub fn parse_media_url(raw: &str) -> Result<Url, ProxyError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProxyError::invalid("Missing URL parameter."));
    }
    let url = Url::parse(raw).map_err(|_| ProxyError::invalid("Invalid URL."))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ProxyError::invalid("Only http(s) URLs are supported."));
    }
    Ok(url)
}

fn open_scope(credentials: Option<&[u8]>) -> Result<Option<CredentialScope>, ProxyError> {
    CredentialScope::open_optional(credentials).map_err(|e| {
        warn!("Failed to store uploaded credentials: {}", e);
        ProxyError::Unknown("could not store uploaded credentials".to_string())
    })
}

fn close_scope(scope: Option<CredentialScope>) {
    if let Some(scope) = scope {
        // Failure is already logged; Drop has nothing left to retry
        let _ = scope.close();
    }
}
