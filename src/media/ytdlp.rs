use super::extractor::{ExtractError, Extractor, ProbeOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

pub struct YtDlpExtractor {
    binary: String,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_args(url: &Url, options: &ProbeOptions) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--skip-download".to_string(),
            "--socket-timeout".to_string(),
            options.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            "2".to_string(),
        ];

        for (name, value) in &options.http_headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }

        // Scoping the probe to one format makes yt-dlp resolve that format's URL
        if let Some(format) = &options.format {
            args.push("--format".to_string());
            args.push(format.clone());
        }

        if let Some(path) = &options.cookies {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().into_owned());
        }

        args.extend(options.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn probe(&self, url: &Url, options: &ProbeOptions) -> Result<Value, ExtractError> {
        debug!(
            "Probing {} with yt-dlp (format: {:?}, cookies: {})",
            url,
            options.format,
            options.cookies.is_some()
        );

        // kill_on_drop ties the child to this future, so a cancelled request
        // does not leave yt-dlp running behind it
        let output = tokio::time::timeout(
            options.timeout,
            Command::new(&self.binary)
                .args(Self::build_args(url, options))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExtractError::Timeout(options.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!("yt-dlp exited with {}: {}", output.status, stderr.trim());
            return Err(ExtractError::Failed { stderr });
        }

        let document: Value = serde_json::from_slice(&output.stdout)?;
        if !document.is_object() {
            return Err(ExtractError::Empty);
        }

        debug!("yt-dlp returned {} bytes of metadata", output.stdout.len());
        Ok(document)
    }

    async fn test_availability(&self) -> bool {
        match Command::new(&self.binary).arg("--version").output().await {
            Ok(output) => {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout);
                    info!("✅ yt-dlp is available, version: {}", version.trim());
                    true
                } else {
                    warn!("❌ yt-dlp command failed");
                    false
                }
            }
            Err(e) => {
                warn!("❌ yt-dlp not found at {}: {}", self.binary, e);
                false
            }
        }
    }
}
