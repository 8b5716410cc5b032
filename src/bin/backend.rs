#![forbid(unsafe_code)]

//! Axum backend: the byte-range video proxy, the tier policy endpoints and the
//! rate-limit check used to guard mutations.
//!
//! The proxy never buffers a whole video. Each request is relayed to the
//! origin as a bounded range and streamed back as it arrives.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::HeaderMap,
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info};
use vidstream_tools::config::{RuntimeOverrides, parse_host_list, resolve_runtime_settings};
use vidstream_tools::error::{ApiError, ApiResult};
use vidstream_tools::logging;
use vidstream_tools::origin::UreqOrigin;
use vidstream_tools::proxy::{STREAM_PATH, StreamProxy, StreamQuery, preflight_response};
use vidstream_tools::rate_limit::{RateLimitAction, RateLimitResult, RateLimiter};
use vidstream_tools::security::ensure_not_root;
use vidstream_tools::tiers::{
    AccessDecision, AdPolicy, ContentFlags, DownloadQuota, Quality, Tier, TierConfig,
    can_access_content, can_access_quality, download_quota, max_quality, should_show_ads,
};

#[derive(Debug, Clone)]
struct BackendArgs {
    listen_host: IpAddr,
    port: u16,
    allowed_hosts: Vec<String>,
    chunk_size: u64,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            // Both `--flag value` and `--flag=value` are accepted.
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = |name: &str| -> Result<String> {
                match inline.clone() {
                    Some(value) => Ok(value),
                    None => args.next().ok_or_else(|| anyhow!("{name} requires a value")),
                }
            };

            match flag.as_str() {
                "--host" => {
                    let host = value("--host")?;
                    parse_host_arg(&host)?;
                    overrides.host = Some(host);
                }
                "--port" => overrides.port = Some(parse_port_arg(&value("--port")?)?),
                "--allowed-hosts" => {
                    let hosts = parse_host_list(&value("--allowed-hosts")?);
                    if hosts.is_empty() {
                        bail!("--allowed-hosts needs at least one host");
                    }
                    overrides.allowed_hosts = Some(hosts);
                }
                "--chunk-size" => {
                    overrides.chunk_size = Some(parse_chunk_arg(&value("--chunk-size")?)?)
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(overrides)?;
        Ok(Self {
            listen_host: parse_host_arg(&settings.host)?,
            port: settings.port,
            allowed_hosts: settings.allowed_hosts,
            chunk_size: settings.chunk_size,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/VIDSTREAM_HOST")
}

fn parse_chunk_arg(value: &str) -> Result<u64> {
    match value.parse::<u64>() {
        Ok(0) => bail!("--chunk-size must be greater than zero"),
        Ok(size) => Ok(size),
        Err(err) => Err(err).context("expected a chunk size in bytes"),
    }
}

/// Shared by every handler. Cloning only bumps reference counts.
#[derive(Clone)]
struct AppState {
    proxy: StreamProxy,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    fn new(allowed_hosts: Vec<String>, chunk_size: u64, limiter: Arc<RateLimiter>) -> Self {
        let origin = Arc::new(UreqOrigin::new(allowed_hosts.clone()));
        Self {
            proxy: StreamProxy::new(origin, allowed_hosts, chunk_size),
            limiter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let BackendArgs {
        listen_host,
        port,
        allowed_hosts,
        chunk_size,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    info!(hosts = ?allowed_hosts, chunk_size, "stream proxy configured");
    let state = AppState::new(allowed_hosts, chunk_size, RateLimiter::shared());
    let app = build_router(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_video).options(stream_preflight))
        .route("/api/tiers", get(list_tiers))
        .route("/api/tiers/{tier}", get(get_tier))
        .route("/api/access", post(check_access))
        .route("/api/rate-limit/{action}", post(check_rate_limit))
        .fallback(endpoint_not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn stream_video(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    state.proxy.stream(query.url.as_deref(), &headers).await
}

async fn stream_preflight() -> Response {
    preflight_response()
}

async fn list_tiers() -> Json<[&'static TierConfig; 4]> {
    Json(TierConfig::all())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TierSummary {
    #[serde(flatten)]
    config: &'static TierConfig,
    downloads: DownloadQuota,
    ads: AdPolicy,
}

async fn get_tier(AxumPath(tier): AxumPath<String>) -> ApiResult<Json<TierSummary>> {
    let tier = Tier::parse(&tier).ok_or_else(|| ApiError::not_found("unknown tier"))?;
    Ok(Json(TierSummary {
        config: tier.config(),
        downloads: download_quota(tier),
        ads: should_show_ads(tier),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct AccessRequest {
    /// Missing or unknown tiers are treated as free.
    tier: Option<String>,
    quality: Option<String>,
    #[serde(default)]
    video: ContentFlags,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessResponse {
    tier: Tier,
    max_quality: Quality,
    quality_allowed: bool,
    content: AccessDecision,
}

async fn check_access(Json(request): Json<AccessRequest>) -> Json<AccessResponse> {
    let tier = Tier::parse_or_free(request.tier.as_deref());
    let quality_allowed = request
        .quality
        .as_deref()
        .is_none_or(|quality| can_access_quality(tier, quality));
    Json(AccessResponse {
        tier,
        max_quality: max_quality(tier),
        quality_allowed,
        content: can_access_content(tier, &request.video),
    })
}

#[derive(Debug, Deserialize)]
struct RateLimitRequest {
    identifier: String,
}

/// A rejection is reported in the body, so this answers 200 either way.
async fn check_rate_limit(
    State(state): State<AppState>,
    AxumPath(action): AxumPath<String>,
    Json(request): Json<RateLimitRequest>,
) -> ApiResult<Json<RateLimitResult>> {
    let action = RateLimitAction::parse(&action)
        .ok_or_else(|| ApiError::not_found("unknown rate limit action"))?;
    let identifier = request.identifier.trim();
    if identifier.is_empty() {
        return Err(ApiError::bad_request("identifier is required"));
    }
    let result = state
        .limiter
        .check(identifier, action.as_str(), action.config());
    if !result.success {
        info!(
            action = action.as_str(),
            reset_in_seconds = result.reset_in_seconds,
            "rate limit reached"
        );
    }
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use serde_json::{Value, json};
    use vidstream_tools::config::default_allowed_hosts;

    fn args(values: &[&str]) -> Result<BackendArgs> {
        BackendArgs::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn test_state() -> AppState {
        AppState::new(default_allowed_hosts(), 1024, Arc::new(RateLimiter::new()))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn cli_flags_accept_both_forms() {
        let parsed = args(&[
            "--host",
            "0.0.0.0",
            "--port=9000",
            "--allowed-hosts",
            "cdn.example.com, .Media.Example.org",
            "--chunk-size=2048",
        ])
        .unwrap();
        assert_eq!(parsed.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.port, 9000);
        assert_eq!(
            parsed.allowed_hosts,
            ["cdn.example.com", "media.example.org"]
        );
        assert_eq!(parsed.chunk_size, 2048);
    }

    #[test]
    fn cli_rejects_bad_values() {
        assert!(args(&["--port", "http"]).is_err());
        assert!(args(&["--chunk-size", "0"]).is_err());
        assert!(args(&["--host", "not-an-ip"]).is_err());
        assert!(args(&["--port"]).is_err());
        assert!(args(&["--verbose"]).is_err());
        assert!(args(&["--allowed-hosts", " , "]).is_err());
    }

    #[tokio::test]
    async fn tiers_are_listed_in_order() {
        let Json(tiers) = list_tiers().await;
        let names: Vec<Tier> = tiers.iter().map(|config| config.tier).collect();
        assert_eq!(names, Tier::ALL);
    }

    #[tokio::test]
    async fn tier_lookup_includes_quota_and_ads() {
        let Json(summary) = get_tier(AxumPath("PREMIUM".into())).await.unwrap();
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["tier"], "premium");
        assert_eq!(value["maxQuality"], "1080p");
        assert_eq!(value["ads"]["showAds"], false);

        let err = get_tier(AxumPath("platinum".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn access_check_applies_quality_and_content_gates() {
        let request: AccessRequest = serde_json::from_value(json!({
            "tier": "premium",
            "quality": "4k",
            "video": { "isVipOnly": true }
        }))
        .unwrap();
        let Json(response) = check_access(Json(request)).await;
        assert!(!response.quality_allowed);
        assert!(!response.content.allowed);

        let request: AccessRequest = serde_json::from_value(json!({
            "video": { "isPremiumOnly": true }
        }))
        .unwrap();
        let Json(response) = check_access(Json(request)).await;
        assert_eq!(response.tier, Tier::Free);
        assert!(response.quality_allowed);
        let reason = response.content.reason.unwrap();
        assert!(reason.contains("Upgrade to Premium"));
    }

    #[tokio::test]
    async fn rate_limit_endpoint_reports_rejection_as_value() {
        let state = test_state();
        let call = |state: AppState| {
            check_rate_limit(
                State(state),
                AxumPath("upload".into()),
                Json(RateLimitRequest {
                    identifier: "user-7".into(),
                }),
            )
        };
        for expected in (0..5).rev() {
            let Json(result) = call(state.clone()).await.unwrap();
            assert!(result.success);
            assert_eq!(result.remaining, expected);
        }
        let Json(result) = call(state.clone()).await.unwrap();
        assert!(!result.success);
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value["remaining"], 0);
        assert!(value["resetInSeconds"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn rate_limit_endpoint_validates_input() {
        let err = check_rate_limit(
            State(test_state()),
            AxumPath("delete".into()),
            Json(RateLimitRequest {
                identifier: "x".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = check_rate_limit(
            State(test_state()),
            AxumPath("comment".into()),
            Json(RateLimitRequest {
                identifier: "  ".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_rejects_hosts_outside_allow_list() {
        let query = StreamQuery {
            url: Some("https://evil.example.com/video.mp4".into()),
        };
        let err = stream_video(State(test_state()), Query(query), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let response = err.into_response();
        assert_eq!(json_body(response).await["error"], "Domain not allowed");
    }

    #[tokio::test]
    async fn unknown_routes_are_json_404() {
        let response = endpoint_not_found().await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "endpoint not found");
    }
}
