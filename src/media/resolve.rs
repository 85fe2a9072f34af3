use super::errors::ProxyError;
use super::normalize::{format_id, locator_url, non_empty_str};
use super::types::{ResolvedFormat, SourceLocator};
use serde_json::Value;

/// Picks `wanted` out of a format-scoped probe.
///
/// The format list is searched first and its first matching entry is
/// authoritative. Sources that expose a single format report it at the top
/// level instead, so the document itself is accepted when its id matches.
pub fn select_format(doc: &Value, wanted: &str) -> Result<ResolvedFormat, ProxyError> {
    let entry = doc["formats"]
        .as_array()
        .and_then(|list| {
            list.iter()
                .find(|f| format_id(f).as_deref() == Some(wanted))
        })
        .or_else(|| (format_id(doc).as_deref() == Some(wanted)).then_some(doc))
        .ok_or(ProxyError::FormatNotFound)?;

    let url = locator_url(entry).ok_or(ProxyError::SourceNotFound)?;

    Ok(ResolvedFormat {
        title: non_empty_str(&doc["title"]),
        format_id: wanted.to_string(),
        container: non_empty_str(&entry["ext"])
            .or_else(|| non_empty_str(&doc["ext"]))
            .unwrap_or_else(|| "mp4".to_string()),
        mime_type: non_empty_str(&entry["mime_type"]).unwrap_or_default(),
        has_video: entry["vcodec"].as_str() != Some("none"),
        locator: SourceLocator {
            url: url.to_string(),
            filesize: entry["filesize"].as_u64(),
            filesize_approx: entry["filesize_approx"].as_u64(),
            http_headers: http_headers(&entry["http_headers"]),
        },
    })
}

fn http_headers(value: &Value) -> Vec<(String, String)> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
