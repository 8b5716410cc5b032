#![forbid(unsafe_code)]

//! Byte-range streaming proxy in front of the allow-listed video origins.
//!
//! Players never download a whole file through here: a request without a
//! `Range` header gets the first chunk back as `206`, and open-ended ranges are
//! closed at one chunk. Each request is handled on its own; overlapping ranges
//! for the same resource are not coalesced.

use std::{io::Read, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, error, warn};
use url::{Url, form_urlencoded};

use crate::error::{ApiError, ApiResult};
use crate::origin::{Origin, OriginResponse};
use crate::range::{ByteRange, parse_requested_range};
use crate::security::{OriginRejection, validate_origin_url};

pub const STREAM_PATH: &str = "/api/video/stream";
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Video bytes behind a given URL never change.
const CACHE_CONTROL_VALUE: &str = "public, max-age=86400, immutable";

/// In-flight bytes between the blocking origin reader and the response body.
const BRIDGE_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct StreamProxy {
    origin: Arc<dyn Origin>,
    allowed_hosts: Arc<Vec<String>>,
    chunk_size: u64,
}

impl StreamProxy {
    pub fn new(origin: Arc<dyn Origin>, allowed_hosts: Vec<String>, chunk_size: u64) -> Self {
        Self {
            origin,
            allowed_hosts: Arc::new(allowed_hosts),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Validates the request, then relays the needed bytes from the origin.
    ///
    /// URL and range validation run before any network call. Origin failures
    /// are logged and turned into a generic 500.
    pub async fn stream(&self, raw_url: Option<&str>, headers: &HeaderMap) -> ApiResult<Response> {
        let raw_url = raw_url
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;

        let url = validate_origin_url(raw_url, &self.allowed_hosts).map_err(|rejection| {
            match rejection {
                OriginRejection::Invalid => ApiError::bad_request("Invalid URL"),
                OriginRejection::HostNotAllowed => {
                    warn!(url = raw_url, "rejected stream request for disallowed host");
                    ApiError::forbidden("Domain not allowed")
                }
            }
        })?;

        let requested = match headers.get(header::RANGE) {
            Some(value) => {
                let parsed = value.to_str().ok().and_then(parse_requested_range);
                Some(parsed.ok_or_else(|| ApiError::range_not_satisfiable("Invalid range"))?)
            }
            None => None,
        };

        let result = match requested {
            Some(requested) => {
                self.stream_range(url, requested.bounded(self.chunk_size))
                    .await
            }
            None => self.stream_initial(url).await,
        };

        result.map_err(|err| {
            error!("video stream failed: {err:#}");
            ApiError::internal("Failed to stream video")
        })
    }

    /// No `Range` from the player: probe the size, then serve the first chunk.
    async fn stream_initial(&self, url: Url) -> Result<Response> {
        let origin = self.origin.clone();
        let probe_url = url.clone();
        let probe = run_blocking(move || origin.probe(&probe_url)).await?;

        let Some(total) = probe.content_length.filter(|length| *length > 0) else {
            debug!(%url, "origin size unknown, streaming full resource");
            let origin = self.origin.clone();
            let response = run_blocking(move || origin.fetch(&url, None)).await?;
            let content_length = response.content_length;
            return Ok(relay(StatusCode::OK, response, None, content_length, None));
        };

        let range = ByteRange::first_chunk(total, self.chunk_size);
        let origin = self.origin.clone();
        let response = run_blocking(move || origin.fetch(&url, Some(range))).await?;

        if response.status != StatusCode::PARTIAL_CONTENT.as_u16() {
            // Origin ignored the range; pass the full body through untouched.
            let content_length = response.content_length;
            return Ok(relay(
                StatusCode::OK,
                response,
                None,
                content_length,
                probe.content_type,
            ));
        }

        Ok(relay(
            StatusCode::PARTIAL_CONTENT,
            response,
            Some(range.content_range(total)),
            Some(range.len()),
            probe.content_type,
        ))
    }

    async fn stream_range(&self, url: Url, range: ByteRange) -> Result<Response> {
        let origin = self.origin.clone();
        let response = run_blocking(move || origin.fetch(&url, Some(range))).await?;
        let status = if response.status == StatusCode::PARTIAL_CONTENT.as_u16() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        let content_range = response.content_range.clone();
        let content_length = response.content_length;
        Ok(relay(status, response, content_range, content_length, None))
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("origin task panicked")?
}

fn relay(
    status: StatusCode,
    response: OriginResponse,
    content_range: Option<String>,
    content_length: Option<u64>,
    fallback_type: Option<String>,
) -> Response {
    let content_type = response
        .content_type
        .or(fallback_type)
        .and_then(|value| HeaderValue::from_str(&value).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let mut reply = stream_body(response.body).into_response();
    *reply.status_mut() = status;
    let headers = reply.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_VALUE),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if let Some(value) = content_range {
        insert_header(headers, header::CONTENT_RANGE, &value);
    }
    if let Some(length) = content_length {
        insert_header(headers, header::CONTENT_LENGTH, &length.to_string());
    }
    reply
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Pipes a blocking reader into a response body without buffering it whole.
fn stream_body(mut reader: Box<dyn Read + Send>) -> Body {
    let (writer, body_reader) = tokio::io::duplex(BRIDGE_BUFFER_BYTES);
    tokio::task::spawn_blocking(move || {
        let mut sink = SyncIoBridge::new(writer);
        if let Err(err) = std::io::copy(&mut reader, &mut sink) {
            // Either the origin dropped mid-body or the player went away.
            debug!("origin body relay stopped: {err}");
        }
    });
    Body::from_stream(ReaderStream::new(body_reader))
}

/// Answer to a CORS preflight on the stream endpoint.
pub fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range"),
    );
    response
}

/// Rewrites an allow-listed origin URL so playback goes through the proxy.
/// Anything else is returned unchanged.
pub fn video_source_url(raw: &str, allowed_hosts: &[String]) -> String {
    match validate_origin_url(raw, allowed_hosts) {
        Ok(url) => {
            let encoded: String = form_urlencoded::byte_serialize(url.as_str().as_bytes()).collect();
            format!("{STREAM_PATH}?url={encoded}")
        }
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::UreqOrigin;
    use crate::origin::fake::{FakeOrigin, SERVED_BODY, spawn_origin_server};
    use axum::body::to_bytes;
    use serde_json::Value;

    const CHUNK: u64 = 1024;
    const VIDEO_URL: &str = "https://abc.utfs.io/f/clip.webm";

    fn sample_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn proxy_with(origin: Arc<FakeOrigin>) -> StreamProxy {
        StreamProxy::new(origin, vec!["utfs.io".into()], CHUNK)
    }

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn header_str<'a>(response: &'a Response, name: HeaderName) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_request_without_range_returns_first_chunk() {
        let body = sample_body(3000);
        let origin = Arc::new(FakeOrigin::new(body.clone()));
        let proxy = proxy_with(origin.clone());

        let response = proxy
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-1023/3000");
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "1024");
        assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/webm");
        assert_eq!(
            header_str(&response, header::CACHE_CONTROL),
            "public, max-age=86400, immutable"
        );
        assert_eq!(header_str(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
        assert_eq!(
            *origin.ranges.lock(),
            vec![Some(ByteRange { start: 0, end: 1023 })]
        );
        assert_eq!(body_bytes(response).await, &body[..1024]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_resource_first_chunk_is_clamped() {
        let origin = Arc::new(FakeOrigin::new(sample_body(10)));
        let response = proxy_with(origin)
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-9/10");
        assert_eq!(body_bytes(response).await.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_size_streams_full_body() {
        let body = sample_body(5000);
        let mut fake = FakeOrigin::new(body.clone());
        fake.advertise_length = false;
        let origin = Arc::new(fake);

        let response = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(*origin.ranges.lock(), vec![None]);
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn explicit_range_is_forwarded_exactly() {
        let body = sample_body(3000);
        let origin = Arc::new(FakeOrigin::new(body.clone()));
        let response = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &range_headers("bytes=100-199"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            *origin.ranges.lock(),
            vec![Some(ByteRange { start: 100, end: 199 })]
        );
        assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 100-199/3000");
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
        assert_eq!(origin.probes.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(body_bytes(response).await, &body[100..200]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_range_is_bounded_to_chunk() {
        let origin = Arc::new(FakeOrigin::new(sample_body(5000)));
        let response = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &range_headers("bytes=100-"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            *origin.ranges.lock(),
            vec![Some(ByteRange {
                start: 100,
                end: 100 + CHUNK - 1
            })]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disallowed_host_is_forbidden_without_network_calls() {
        let origin = Arc::new(FakeOrigin::new(sample_body(10)));
        let err = proxy_with(origin.clone())
            .stream(Some("https://evil.example/f/clip.mp4"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_range_is_rejected_before_origin() {
        let origin = Arc::new(FakeOrigin::new(sample_body(10)));
        let err = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &range_headers("bytes=-500"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_or_invalid_url_is_bad_request() {
        let origin = Arc::new(FakeOrigin::new(sample_body(10)));
        let proxy = proxy_with(origin.clone());
        let missing = proxy.stream(None, &HeaderMap::new()).await.unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        let blank = proxy.stream(Some("  "), &HeaderMap::new()).await.unwrap_err();
        assert_eq!(blank.status, StatusCode::BAD_REQUEST);
        let invalid = proxy
            .stream(Some("not-a-url"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn origin_failure_yields_generic_error() {
        let mut fake = FakeOrigin::new(sample_body(10));
        fake.fail_requests = true;
        let err = proxy_with(Arc::new(fake))
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("refused"));

        let response = err.into_response();
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["error"], "Failed to stream video");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_content_type_defaults_to_mp4() {
        let mut fake = FakeOrigin::new(sample_body(10));
        fake.content_type = None;
        let response = proxy_with(Arc::new(fake))
            .stream(Some(VIDEO_URL), &range_headers("bytes=0-4"))
            .await
            .unwrap();
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_head_falls_back_to_full_stream() {
        let body = sample_body(3000);
        let mut fake = FakeOrigin::new(body.clone());
        fake.refuse_head = true;
        let origin = Arc::new(fake);

        let response = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(*origin.ranges.lock(), vec![None]);
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn origin_refusing_head_over_http_still_streams() {
        let addr = spawn_origin_server().await.unwrap();
        let hosts = vec!["127.0.0.1".to_string()];
        let proxy = StreamProxy::new(Arc::new(UreqOrigin::new(hosts.clone())), hosts, CHUNK);

        let url = format!("http://{addr}/video");
        let response = proxy
            .stream(Some(url.as_str()), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(body_bytes(response).await, SERVED_BODY);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn origin_ignoring_first_chunk_range_relays_full_body() {
        let body = sample_body(3000);
        let mut fake = FakeOrigin::new(body.clone());
        fake.ignore_ranges = true;
        let origin = Arc::new(fake);

        let response = proxy_with(origin.clone())
            .stream(Some(VIDEO_URL), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), "3000");
        assert_eq!(
            *origin.ranges.lock(),
            vec![Some(ByteRange { start: 0, end: 1023 })]
        );
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn origin_ignoring_explicit_range_relays_plain_ok() {
        let body = sample_body(3000);
        let mut fake = FakeOrigin::new(body.clone());
        fake.ignore_ranges = true;

        let response = proxy_with(Arc::new(fake))
            .stream(Some(VIDEO_URL), &range_headers("bytes=100-199"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_bytes(response).await, body);
    }

    #[test]
    fn preflight_allows_range_header() {
        let response = preflight_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
                .unwrap(),
            "Range"
        );
    }

    #[test]
    fn video_source_url_rewrites_only_allowed_hosts() {
        let allowed = vec!["utfs.io".to_string()];
        assert_eq!(
            video_source_url("https://utfs.io/f/a b.mp4", &allowed),
            "/api/video/stream?url=https%3A%2F%2Futfs.io%2Ff%2Fa%2520b.mp4"
        );
        assert_eq!(
            video_source_url("https://other.cdn/v.mp4", &allowed),
            "https://other.cdn/v.mp4"
        );
        assert_eq!(video_source_url("/local/v.mp4", &allowed), "/local/v.mp4");
    }
}
