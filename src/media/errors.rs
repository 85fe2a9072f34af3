//! Closed error taxonomy surfaced to clients, and the classifier that maps
//! extractor failure text onto it.

use serde::Serialize;
use std::fmt;

/// Longest diagnostic excerpt handed back to a client.
const MAX_DETAIL_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    RestrictedContent,
    UnsupportedSource,
    FormatNotFound,
    SourceNotFound,
    UpstreamUnavailable,
    Unknown,
}

impl ErrorKind {
    /// Only transient upstream trouble is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::UpstreamUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::RestrictedContent => "restricted_content",
            Self::UnsupportedSource => "unsupported_source",
            Self::FormatNotFound => "format_not_found",
            Self::SourceNotFound => "source_not_found",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure already reduced to something safe to show a user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("This media is restricted or private and cannot be accessed from public servers.")]
    RestrictedContent,

    #[error("Could not extract media info from this URL. It may be unsupported, restricted or invalid.")]
    UnsupportedSource,

    #[error("Selected format is unavailable.")]
    FormatNotFound,

    #[error("Selected format has no downloadable source.")]
    SourceNotFound,

    #[error("The media source is temporarily unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Failed to process media: {0}")]
    Unknown(String),
}

impl ProxyError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::RestrictedContent => ErrorKind::RestrictedContent,
            Self::UnsupportedSource => ErrorKind::UnsupportedSource,
            Self::FormatNotFound => ErrorKind::FormatNotFound,
            Self::SourceNotFound => ErrorKind::SourceNotFound,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

const RESTRICTED_MARKERS: &[&str] = &[
    "sign in",
    "login required",
    "private video",
    "age-gated",
    "age-restricted",
    "confirm your age",
    "not a bot",
    "members-only",
    "join this channel",
    "available in your country",
    "blocked in your country",
    "from your location",
    "geo restriction",
    "geo restricted",
    "geo-restricted",
    "geographic restriction",
];

const UNSUPPORTED_MARKERS: &[&str] = &["unsupported url", "is not a valid url"];

const FORMAT_MARKERS: &[&str] = &["requested format is not available"];

const UPSTREAM_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "temporary failure in name resolution",
    "name or service not known",
    "connection reset",
    "connection refused",
    "network is unreachable",
    "remote end closed",
    "unable to download webpage",
    // Any status the extractor could not get past; checked after the
    // restriction and format markers
    "http error ",
    "too many requests",
];

/// Maps extractor failure output onto the taxonomy. Pure and total: anything
/// unrecognised becomes `Unknown` carrying the first line of the detail.
pub fn classify(detail: &str) -> ProxyError {
    let line = first_line(detail);
    let lowered = line.to_lowercase();
    let matches = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if matches(RESTRICTED_MARKERS) {
        ProxyError::RestrictedContent
    } else if matches(UNSUPPORTED_MARKERS) {
        ProxyError::UnsupportedSource
    } else if matches(FORMAT_MARKERS) {
        ProxyError::FormatNotFound
    } else if matches(UPSTREAM_MARKERS) {
        ProxyError::UpstreamUnavailable(line)
    } else if line.is_empty() {
        ProxyError::Unknown("no details available".to_string())
    } else {
        ProxyError::Unknown(line)
    }
}

/// The extractor's first `ERROR:` line (else the first non-blank line), minus
/// the prefix, capped in length. Warnings printed ahead of the error are skipped.
pub fn first_line(detail: &str) -> String {
    let mut lines = detail.lines().map(str::trim).filter(|l| !l.is_empty());
    let line = detail
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.next())
        .unwrap_or("");
    let line = line.strip_prefix("ERROR:").unwrap_or(line).trim();
    line.chars().take(MAX_DETAIL_CHARS).collect()
}
