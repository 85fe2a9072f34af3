use serde::Serialize;

/// Normalized catalog returned to clients for one media URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(rename = "lengthSeconds")]
    pub duration_seconds: Option<f64>,
    pub formats: Vec<FormatDescriptor>,
}

/// One selectable variant. `id` only round-trips into a later download
/// request; it is not stable across probes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    #[serde(rename = "itag")]
    pub id: String,
    pub container: String,
    pub quality_label: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub mime_type: String,
    #[serde(rename = "bitrate")]
    pub bitrate_kbps: Option<f64>,
    pub filesize: Option<u64>,
}

/// Short-lived fetchable address for one format's bytes. Valid for a single
/// relay attempt; never cached.
#[derive(Debug, Clone)]
pub struct SourceLocator {
    pub url: String,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    /// Headers the extractor says the source expects.
    pub http_headers: Vec<(String, String)>,
}

impl SourceLocator {
    #[cfg(test)]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filesize: None,
            filesize_approx: None,
            http_headers: Vec::new(),
        }
    }

    /// Exact size when known, otherwise the approximate one.
    pub fn effective_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// A format picked out of a fresh, format-scoped probe.
#[derive(Debug, Clone)]
pub struct ResolvedFormat {
    pub title: Option<String>,
    pub format_id: String,
    pub container: String,
    pub mime_type: String,
    pub has_video: bool,
    pub locator: SourceLocator,
}

/// What the client asked to receive. Only affects the reported extension and
/// content type; no transcoding happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetKind {
    #[default]
    Video,
    Audio,
}

impl TargetKind {
    /// Accepts both the kind names and the container names older clients send.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "video" | "mp4" | "webm" => Some(Self::Video),
            "audio" | "mp3" => Some(Self::Audio),
            _ => None,
        }
    }
}
