#![forbid(unsafe_code)]

//! Viewer-side companion: keeps videos for offline playback and runs the
//! intercepting video cache in front of the backend.
//!
//! `viewer serve` listens locally, answers `/offline/{id}` from the offline
//! store and sends everything else through the video cache to the backend.
//! Control messages (`{"type":"GET_CACHE_SIZE"}` and friends) are read from
//! stdin one JSON object per line; replies go to stdout the same way.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    signal,
};
use tracing::{error, info, warn};
use vidstream_tools::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use vidstream_tools::error::{ApiError, ApiResult};
use vidstream_tools::logging;
use vidstream_tools::offline::{OfflineStore, PlayableVideo};
use vidstream_tools::origin::UreqOrigin;
use vidstream_tools::range::resolve_range;
use vidstream_tools::security::{ensure_not_root, validate_origin_url};
use vidstream_tools::video_cache::{
    CacheStorage, ControlHandle, FetchRequest, UreqUpstream, VideoCacheWorker, WorkerMessage,
    spawn_control,
};

/// Offline storage and local video cache for the vidstream player
#[derive(Parser, Debug)]
#[command(name = "viewer")]
#[command(about = "Offline storage and local video cache for the vidstream player", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the `.env` file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Offline database path (OFFLINE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Comma separated hosts videos may be downloaded from (STREAM_ALLOWED_HOSTS)
    #[arg(long, global = true)]
    allowed_hosts: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a video and keep it for offline playback
    Save {
        /// Identifier the video is stored under
        id: String,
        /// Origin URL of the video file
        url: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        thumbnail: Option<String>,
    },
    /// List saved videos as JSON lines
    List,
    /// Remove a saved video
    Delete { id: String },
    /// Print the bytes used by saved videos
    Usage,
    /// Write a saved video to disk
    Export {
        id: String,
        /// Target file, or a directory to place `<id>.<ext>` in
        #[arg(long)]
        out: PathBuf,
    },
    /// Serve offline videos and the video cache over HTTP
    Serve {
        /// Backend base URL (VIEWER_UPSTREAM)
        #[arg(long)]
        upstream: Option<String>,
        /// Listen port (VIEWER_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Optional cap on cached body bytes
        #[arg(long)]
        cache_quota: Option<u64>,
    },
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        let mut overrides = RuntimeOverrides {
            offline_db: self.db.clone(),
            allowed_hosts: self
                .allowed_hosts
                .as_deref()
                .map(vidstream_tools::config::parse_host_list),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        };
        if let Command::Serve { upstream, port, .. } = &self.command {
            overrides.upstream = upstream.clone();
            overrides.viewer_port = *port;
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    ensure_not_root("viewer")?;

    let settings = resolve_runtime_settings(cli.overrides())?;
    let origin = Arc::new(UreqOrigin::new(settings.allowed_hosts.clone()));
    let store = OfflineStore::open(&settings.offline_db, origin).await?;

    match cli.command {
        Command::Save {
            id,
            url,
            title,
            thumbnail,
        } => save(&store, &settings, &id, &url, &title, thumbnail.as_deref()).await,
        Command::List => {
            for meta in store.list().await? {
                println!("{}", serde_json::to_string(&meta)?);
            }
            Ok(())
        }
        Command::Delete { id } => {
            if store.delete(&id).await? {
                info!(%id, "deleted offline video");
                Ok(())
            } else {
                Err(anyhow!("no offline video with id {id}"))
            }
        }
        Command::Usage => {
            println!("{}", store.total_bytes_used().await?);
            Ok(())
        }
        Command::Export { id, out } => export(&store, &id, &out).await,
        Command::Serve { cache_quota, .. } => serve(store, &settings, cache_quota).await,
    }
}

async fn save(
    store: &OfflineStore,
    settings: &RuntimeSettings,
    id: &str,
    url: &str,
    title: &str,
    thumbnail: Option<&str>,
) -> Result<()> {
    validate_origin_url(url, &settings.allowed_hosts)
        .map_err(|rejection| anyhow!("refusing to download {url}: {rejection:?}"))?;

    let mut last_tenth = 0;
    let meta = store
        .save(id, title, url, thumbnail, move |loaded, total| {
            let tenth = loaded.saturating_mul(10) / total.max(1);
            if tenth > last_tenth {
                last_tenth = tenth;
                info!("downloaded {loaded}/{total} bytes");
            }
        })
        .await?;
    println!("{}", serde_json::to_string(&meta)?);
    Ok(())
}

async fn export(store: &OfflineStore, id: &str, out: &Path) -> Result<()> {
    let video = store
        .load(id)
        .await?
        .ok_or_else(|| anyhow!("no offline video with id {id}"))?;
    let target = if out.is_dir() {
        out.join(export_file_name(id, &video.meta.mime_type))
    } else {
        out.to_path_buf()
    };
    tokio::fs::write(&target, &video.data)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    info!(path = %target.display(), "exported offline video");
    Ok(())
}

fn export_file_name(id: &str, mime_type: &str) -> String {
    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    format!("{id}.{extension}")
}

#[derive(Clone)]
struct ViewerState {
    store: Arc<OfflineStore>,
    worker: Arc<VideoCacheWorker>,
}

async fn serve(store: OfflineStore, settings: &RuntimeSettings, quota: Option<u64>) -> Result<()> {
    let storage = Arc::new(match quota {
        Some(bytes) => CacheStorage::with_quota(bytes),
        None => CacheStorage::new(),
    });
    let upstream = Arc::new(UreqUpstream::new(&settings.upstream)?);
    let worker = Arc::new(VideoCacheWorker::new(storage, upstream));
    worker.install();
    worker.activate();

    let control = spawn_control(Arc::clone(&worker));
    tokio::spawn(async move {
        if let Err(err) = run_control_channel(control).await {
            error!("control channel stopped: {err:#}");
        }
    });

    let state = ViewerState {
        store: Arc::new(store),
        worker,
    };
    let app = build_router(state);

    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;
    let addr = SocketAddr::new(host, settings.viewer_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(upstream = %settings.upstream, "viewer listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running viewer server")?;
    Ok(())
}

fn build_router(state: ViewerState) -> Router {
    Router::new()
        .route("/offline/{id}", get(serve_offline))
        .fallback(intercept)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn run_control_channel(control: ControlHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        let Some(reply) = handle_control_line(&control, &line).await? else {
            continue;
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Returns the encoded reply, or `None` for blank and unreadable lines.
async fn handle_control_line(control: &ControlHandle, line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let message: WorkerMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            warn!("ignoring control message {line:?}: {err}");
            return Ok(None);
        }
    };
    let reply = control.send(message).await?;
    Ok(Some(serde_json::to_string(&reply)?))
}

async fn serve_offline(
    State(state): State<ViewerState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let video = state
        .store
        .load(&id)
        .await
        .map_err(|err| {
            error!(%id, "loading offline video failed: {err:#}");
            ApiError::internal("Failed to load offline video")
        })?
        .ok_or_else(|| ApiError::not_found("video not saved offline"))?;
    Ok(playable_response(video, headers.get(header::RANGE)))
}

/// Serves a stored video with the usual single-range semantics.
fn playable_response(video: PlayableVideo, range: Option<&HeaderValue>) -> Response {
    let size = video.data.len() as u64;
    let mut response = match range {
        None => Response::new(Body::from(video.data.clone())),
        Some(value) => match value.to_str().ok().and_then(|value| resolve_range(value, size)) {
            Some(range) => {
                let body = video.data.slice(range.start as usize..=range.end as usize);
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = StatusCode::PARTIAL_CONTENT;
                if let Ok(value) = HeaderValue::from_str(&range.content_range(size)) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
                response
            }
            None => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                return response;
            }
        },
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&video.meta.mime_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    response
}

async fn intercept(
    State(state): State<ViewerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = fetch_request(&method, &uri, &headers, body);
    match state.worker.handle_fetch(request).await {
        Ok(outcome) => outcome.response.into_response(),
        Err(err) => {
            warn!(%uri, "upstream request failed: {err:#}");
            ApiError::new(StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
        }
    }
}

fn fetch_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> FetchRequest {
    let url = uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |value| value.as_str().to_string());
    let mut request = FetchRequest::new(method.as_str(), url).with_body(body);
    request.range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    request.headers = headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect();
    request
}
