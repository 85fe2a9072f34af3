use crate::media::{Delivery, ErrorKind, MediaInfo, MediaService, ProxyError, RelayHeaders, TargetKind};
use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Size of the media when it cannot be promised as Content-Length.
const X_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-content-length");

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MediaService>,
    pub max_credential_bytes: usize,
}

pub fn router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        .route("/get-info", get(get_info).post(post_info))
        .route("/download", get(download).post(post_download))
        .route("/favicon.ico", get(favicon))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Client-facing error body: `{"detail": ..., "kind": ...}`.
#[derive(Debug)]
pub struct ApiError(ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest | ErrorKind::UnsupportedSource => StatusCode::BAD_REQUEST,
        ErrorKind::RestrictedContent => StatusCode::FORBIDDEN,
        ErrorKind::FormatNotFound | ErrorKind::SourceNotFound => StatusCode::NOT_FOUND,
        ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("Request failed ({}): {}", kind, self.0);
        } else {
            warn!("Request rejected ({}): {}", kind, self.0);
        }

        let body = serde_json::json!({
            "detail": self.0.user_message(),
            "kind": kind,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    itag: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Fields of a multipart upload. `cookies` is the optional credential file.
#[derive(Debug, Default)]
struct UploadForm {
    url: Option<String>,
    itag: Option<String>,
    kind: Option<String>,
    cookies: Option<Bytes>,
}

async fn get_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> ApiResult<Json<MediaInfo>> {
    let url = query.url.unwrap_or_default();
    Ok(Json(state.service.describe(&url, None).await?))
}

async fn post_info(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Json<MediaInfo>> {
    let form = read_form(multipart, state.max_credential_bytes).await?;
    let url = form.url.unwrap_or_default();
    Ok(Json(
        state
            .service
            .describe(&url, form.cookies.as_deref())
            .await?,
    ))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    fetch(&state, query.url, query.itag, query.kind, None).await
}

async fn post_download(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Response> {
    let form = read_form(multipart, state.max_credential_bytes).await?;
    fetch(&state, form.url, form.itag, form.kind, form.cookies).await
}

async fn fetch(
    state: &AppState,
    url: Option<String>,
    itag: Option<String>,
    kind: Option<String>,
    cookies: Option<Bytes>,
) -> ApiResult<Response> {
    let kind_raw = kind.unwrap_or_default();
    let kind = TargetKind::parse(&kind_raw)
        .ok_or_else(|| ProxyError::invalid(format!("Unsupported type: {}", kind_raw)))?;
    let url = url.unwrap_or_default();
    let itag = itag.unwrap_or_default();

    let delivery = state
        .service
        .fetch(&url, &itag, kind, cookies.as_deref())
        .await?;
    delivery_response(delivery)
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health() -> &'static str {
    "ok"
}

async fn read_form(mut multipart: Multipart, max_credential_bytes: usize) -> Result<UploadForm, ProxyError> {
    let malformed = |e: axum::extract::multipart::MultipartError| {
        ProxyError::invalid(format!("Malformed form data: {}", e))
    };

    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "url" => form.url = Some(field.text().await.map_err(malformed)?),
            "itag" => form.itag = Some(field.text().await.map_err(malformed)?),
            "type" => form.kind = Some(field.text().await.map_err(malformed)?),
            "cookies" => {
                let bytes = field.bytes().await.map_err(malformed)?;
                if bytes.len() > max_credential_bytes {
                    return Err(ProxyError::invalid("Credential upload is too large."));
                }
                form.cookies = Some(bytes);
            }
            other => info!("Ignoring unknown form field {:?}", other),
        }
    }
    Ok(form)
}

fn delivery_response(delivery: Delivery) -> ApiResult<Response> {
    match delivery {
        Delivery::Redirect { location, headers } => {
            let location = HeaderValue::from_str(&location)
                .map_err(|_| ProxyError::Unknown("source location is not a valid header".to_string()))?;
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, location);
            apply_headers(&mut response, &headers)?;
            Ok(response)
        }
        Delivery::Stream { headers, body } => {
            let mut response = Body::from_stream(body).into_response();
            apply_headers(&mut response, &headers)?;
            Ok(response)
        }
    }
}

fn apply_headers(response: &mut Response, headers: &RelayHeaders) -> ApiResult<()> {
    let invalid = |_| ProxyError::Unknown("could not build response headers".to_string());
    let map = response.headers_mut();
    map.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&headers.content_disposition()).map_err(invalid)?,
    );
    map.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&headers.content_type).map_err(invalid)?,
    );
    if let Some(length) = headers.content_length {
        map.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(hint) = headers.size_hint {
        map.insert(X_CONTENT_LENGTH, HeaderValue::from(hint));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeliveryMode};
    use crate::media::fake::FakeExtractor;
    use crate::media::test_support::{spawn_source, spawn_stalling_source};
    use axum::body::to_bytes;
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn catalog_doc(source_url: &str) -> Value {
        json!({
            "title": "Example: Clip #1",
            "uploader": "Someone",
            "format_id": "22",
            "formats": [
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a",
                 "url": source_url, "format_note": "720p"}
            ]
        })
    }

    fn app(fake: Arc<FakeExtractor>, delivery: DeliveryMode) -> Router {
        let mut config = Config::default();
        config.server.delivery = delivery;
        config.extractor.retry_delay_ms = 0;
        let service = MediaService::new(&config, fake).unwrap();
        router(
            AppState {
                service: Arc::new(service),
                max_credential_bytes: 64,
            },
            true,
        )
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn multipart(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
        let boundary = "relayboundary";
        let mut body = String::new();
        for (name, value) in fields {
            if *name == "cookies" {
                body.push_str(&format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"cookies\"; filename=\"cookies.txt\"\r\nContent-Type: text/plain\r\n\r\n{value}\r\n"
                ));
            } else {
                body.push_str(&format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                ));
            }
        }
        body.push_str(&format!("--{boundary}--\r\n"));

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_body(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_get_info() {
        let fake = Arc::new(FakeExtractor::returning(catalog_doc("https://cdn.example.test/22")));
        let (status, _, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/get-info?url=https%3A%2F%2Fexample.test%2Fv1"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let json = json_body(&body);
        assert_eq!(json["title"], "Example: Clip #1");
        assert_eq!(json["author"], "Someone");
        assert_eq!(json["formats"][0]["itag"], "22");
        assert_eq!(json["formats"][0]["qualityLabel"], "720p");
    }

    #[tokio::test]
    async fn test_get_info_rejects_bad_url_without_probing() {
        let fake = Arc::new(FakeExtractor::returning(json!({})));
        let (status, _, body) =
            send(app(fake.clone(), DeliveryMode::Proxy), get("/get-info?url=not-a-url")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["kind"], "invalid_request");
        assert_eq!(fake.call_count(), 0);

        let (status, _, _) = send(app(fake.clone(), DeliveryMode::Proxy), get("/get-info")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_get_info_restricted() {
        let fake = Arc::new(FakeExtractor::failing(
            "ERROR: [youtube] v1: Sign in to confirm you're not a bot\nTraceback (most recent call last):",
        ));
        let (status, _, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/get-info?url=https://example.test/v1"),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        let json = json_body(&body);
        assert_eq!(json["kind"], "restricted_content");
        assert!(!json["detail"].as_str().unwrap().contains("Traceback"));
    }

    #[tokio::test]
    async fn test_download_unknown_format() {
        let fake = Arc::new(FakeExtractor::returning(catalog_doc("https://cdn.example.test/22")));
        let (status, _, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/download?url=https://example.test/v1&itag=zz"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body)["kind"], "format_not_found");
    }

    #[tokio::test]
    async fn test_download_missing_itag() {
        let fake = Arc::new(FakeExtractor::returning(json!({})));
        let (status, _, body) = send(
            app(fake.clone(), DeliveryMode::Proxy),
            get("/download?url=https://example.test/v1"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["kind"], "invalid_request");
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_download_bad_type() {
        let fake = Arc::new(FakeExtractor::returning(json!({})));
        let (status, _, _) = send(
            app(fake.clone(), DeliveryMode::Proxy),
            get("/download?url=https://example.test/v1&itag=22&type=flac"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_download_proxied() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        let source = spawn_source(200, payload.clone(), None).await;
        let fake = Arc::new(FakeExtractor::returning(catalog_doc(&source)));

        let (status, headers, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/download?url=https://example.test/v1&itag=22&type=video"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Example_Clip_1.mp4\""
        );
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CONTENT_LENGTH], "100000");
        assert_eq!(body.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_download_source_drop_aborts_body() {
        let source = spawn_source(200, vec![1u8; 4096], Some(100_000)).await;
        let fake = Arc::new(FakeExtractor::returning(catalog_doc(&source)));

        let response = app(fake, DeliveryMode::Proxy)
            .oneshot(multipart(
                "/download",
                &[("url", "https://example.test/v1"), ("itag", "22")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_download_releases_source() {
        let (source, closed) = spawn_stalling_source(vec![4u8; 4096], 100_000).await;
        let fake = Arc::new(FakeExtractor::returning(catalog_doc(&source)));

        let response = app(fake, DeliveryMode::Proxy)
            .oneshot(get("/download?url=https://example.test/v1&itag=22"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100000");

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(!first.is_empty() && first.len() <= 4096);

        // Client goes away partway through
        drop(body);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::UnsupportedSource), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::RestrictedContent), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::FormatNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::SourceNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::UpstreamUnavailable), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Unknown), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_geo_blocked_is_forbidden() {
        let fake = Arc::new(FakeExtractor::failing(
            "ERROR: [youtube] v1: The uploader has not made this video available in your country",
        ));
        let (status, _, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/get-info?url=https://example.test/v1"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json_body(&body)["kind"], "restricted_content");
    }

    #[tokio::test]
    async fn test_download_source_unreachable() {
        let source = spawn_source(503, Vec::new(), None).await;
        let fake = Arc::new(FakeExtractor::returning(catalog_doc(&source)));

        let (status, _, body) = send(
            app(fake, DeliveryMode::Proxy),
            get("/download?url=https://example.test/v1&itag=22"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(&body)["kind"], "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_download_redirect() {
        let fake = Arc::new(FakeExtractor::returning(json!({
            "title": "Song",
            "formats": [{"format_id": "140", "ext": "m4a", "vcodec": "none",
                         "url": "https://cdn.example.test/140?sig=1", "filesize_approx": 5000}]
        })));

        let (status, headers, body) = send(
            app(fake, DeliveryMode::Redirect),
            get("/download?url=https://example.test/v1&itag=140&type=mp3"),
        )
        .await;

        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers[header::LOCATION], "https://cdn.example.test/140?sig=1");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Song.mp3\""
        );
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers["x-content-length"], "5000");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_post_info_with_cookies_cleans_up() {
        let fake = Arc::new(FakeExtractor::returning(catalog_doc("https://cdn.example.test/22")));
        let (status, _, _) = send(
            app(fake.clone(), DeliveryMode::Proxy),
            multipart(
                "/get-info",
                &[("url", "https://example.test/v1"), ("cookies", "# Netscape HTTP Cookie File")],
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let call = fake.last_call().unwrap();
        assert!(call.cookies_existed);
        assert!(!call.cookies.unwrap().exists());
    }

    #[tokio::test]
    async fn test_post_oversized_cookies() {
        let fake = Arc::new(FakeExtractor::returning(json!({})));
        let big = "x".repeat(65);
        let (status, _, _) = send(
            app(fake.clone(), DeliveryMode::Proxy),
            multipart("/get-info", &[("url", "https://example.test/v1"), ("cookies", &big)]),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_favicon_and_health() {
        let fake = Arc::new(FakeExtractor::returning(json!({})));
        let (status, _, _) = send(app(fake.clone(), DeliveryMode::Proxy), get("/favicon.ico")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _, body) = send(app(fake, DeliveryMode::Proxy), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), b"ok");
    }
}
