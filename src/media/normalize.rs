//! Turns a raw extractor document into the client-facing [`MediaInfo`].
//!
//! Nothing here fails: missing or oddly typed fields degrade to `None` or are
//! skipped, so any JSON value produces a catalog.

use super::types::{FormatDescriptor, MediaInfo};
use serde_json::Value;
use std::collections::HashSet;

/// Codec marker the extractor uses for an absent track.
const NO_CODEC: &str = "none";

pub fn normalize(doc: &Value) -> MediaInfo {
    let mut seen = HashSet::new();
    let formats = doc["formats"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter(|f| locator_url(f).is_some())
                .filter_map(describe_format)
                .filter(|f| f.has_video || f.has_audio)
                // First occurrence of an id wins
                .filter(|f| seen.insert(f.id.clone()))
                .collect()
        })
        .unwrap_or_default();

    MediaInfo {
        title: non_empty_str(&doc["title"]),
        author: non_empty_str(&doc["uploader"]).or_else(|| non_empty_str(&doc["channel"])),
        thumbnail: thumbnail(doc),
        duration_seconds: doc["duration"].as_f64(),
        formats,
    }
}

/// Builds a descriptor for one raw format entry; `None` when it has no id.
pub fn describe_format(raw: &Value) -> Option<FormatDescriptor> {
    let id = format_id(raw)?;

    Some(FormatDescriptor {
        id,
        container: non_empty_str(&raw["ext"]).unwrap_or_default(),
        quality_label: quality_label(raw),
        has_video: has_track(&raw["vcodec"]),
        has_audio: has_track(&raw["acodec"]),
        mime_type: non_empty_str(&raw["mime_type"]).unwrap_or_default(),
        bitrate_kbps: raw["abr"].as_f64(),
        filesize: raw["filesize"]
            .as_u64()
            .or_else(|| raw["filesize_approx"].as_u64()),
    })
}

/// Explicit note, then `<height>p`, then the extractor's resolution marker,
/// then "Unknown". "DASH" is removed from whichever wins; a candidate that is
/// empty after removal does not count.
pub fn quality_label(raw: &Value) -> String {
    let candidates = [
        non_empty_str(&raw["format_note"]),
        raw["height"].as_u64().map(|h| format!("{}p", h)),
        non_empty_str(&raw["resolution"]),
    ];

    candidates
        .into_iter()
        .flatten()
        .map(|label| strip_dash(&label))
        .find(|label| !label.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn strip_dash(label: &str) -> String {
    label
        .replace("DASH", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Explicit thumbnail wins; otherwise the last candidate of the list.
fn thumbnail(doc: &Value) -> Option<String> {
    non_empty_str(&doc["thumbnail"]).or_else(|| {
        doc["thumbnails"]
            .as_array()
            .and_then(|list| list.last())
            .and_then(|last| non_empty_str(&last["url"]))
    })
}

/// A track is present unless its codec is explicitly marked "none".
fn has_track(codec: &Value) -> bool {
    codec.as_str() != Some(NO_CODEC)
}

pub(crate) fn format_id(raw: &Value) -> Option<String> {
    match &raw["format_id"] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn locator_url(raw: &Value) -> Option<&str> {
    raw["url"].as_str().filter(|u| !u.is_empty())
}

pub(crate) fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
