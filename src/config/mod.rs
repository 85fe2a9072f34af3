use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

const MIN_CHUNK_SIZE: usize = 16 * 1024;
const MAX_CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

/// Process-wide settings. Loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub extractor: ExtractorConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// How bytes reach the client once a format has been resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Fetch the source ourselves and forward it chunk by chunk.
    #[default]
    Proxy,
    /// Answer with a redirect to the source and let the client fetch it.
    Redirect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub delivery: DeliveryMode,
    pub cors: bool,
    pub max_credential_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            delivery: DeliveryMode::Proxy,
            cors: true,
            max_credential_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub binary: String,
    pub timeout_secs: u64,
    pub socket_timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub http_headers: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        let mut http_headers = BTreeMap::new();
        http_headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
        http_headers.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());

        Self {
            binary: "yt-dlp".to_string(),
            timeout_secs: 30,
            socket_timeout_secs: 20,
            attempts: 3,
            retry_delay_ms: 500,
            http_headers,
            extra_args: Vec::new(),
        }
    }
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Always at least one attempt, even if configured as zero.
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to parse config file {}", path))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config)
    }

    /// Applies the `PORT` variable hosting platforms set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            self.server.listen.set_port(port);
        }
        self
    }

    pub fn get_logging_format(&self) -> &str {
        &self.logging.format
    }
}
