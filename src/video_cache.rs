#![forbid(unsafe_code)]

//! Intercepting blob cache that sits between the player and the backend.
//!
//! Video requests are answered from a named in-memory store when possible.
//! Misses go to the network and successful responses are written back in a
//! detached task, so the caller never waits on the cache. Other requests pass
//! straight through.

use std::{
    collections::{HashMap, VecDeque},
    io::Read,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::STREAM_PATH;

/// Every store this application creates starts with this prefix.
pub const APP_CACHE_PREFIX: &str = "vidstream-";
pub const VIDEO_CACHE_NAME: &str = "vidstream-video-cache-v1";

pub const MAX_CACHE_ENTRIES: usize = 200;
pub const EVICTION_BATCH: usize = 50;

pub const OFFLINE_UNAVAILABLE_MESSAGE: &str = "Video not available offline";

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".ogg", ".mov", ".m4v", ".mkv"];
const CDN_PATH_PREFIXES: &[&str] = &["/f/"];

/// Upstream bodies larger than this are refused rather than buffered.
pub const MAX_UPSTREAM_BODY: u64 = 256 * 1024 * 1024;

/// Request headers the interceptor never forwards; the client sets its own.
const UNFORWARDED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "accept-encoding",
    "range",
];

/// Headers copied from an upstream response into a snapshot.
const KEPT_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-range",
    "accept-ranges",
    "cache-control",
    "access-control-allow-origin",
];

/// A fully buffered response. Cloning shares the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn offline_unavailable() -> Self {
        Self::new(
            503,
            vec![("content-type".into(), "text/plain".into())],
            Bytes::from_static(OFFLINE_UNAVAILABLE_MESSAGE.as_bytes()),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 2xx, which includes 206 partial content.
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl IntoResponse for ResponseSnapshot {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes())
                && let Ok(value) = HeaderValue::from_str(value)
            {
                headers.append(name, value);
            }
        }
        response
    }
}

/// URL-keyed entries in insertion order. Re-inserting a key moves it to the
/// newest position.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, ResponseSnapshot>,
    order: VecDeque<String>,
}

impl CacheStore {
    pub fn get(&self, key: &str) -> Option<&ResponseSnapshot> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: String, snapshot: ResponseSnapshot) {
        if self.entries.insert(key.clone(), snapshot).is_some() {
            self.order.retain(|existing| existing != &key);
        }
        self.order.push_back(key);
    }

    /// Removes up to `count` of the oldest entries and returns their keys.
    pub fn evict_oldest(&mut self, count: usize) -> Vec<String> {
        let mut evicted = Vec::with_capacity(count.min(self.order.len()));
        while evicted.len() < count {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn body_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|snapshot| snapshot.body.len() as u64)
            .sum()
    }
}

/// Named stores, with an optional quota on the summed body size.
#[derive(Debug, Default)]
pub struct CacheStorage {
    stores: Mutex<HashMap<String, CacheStore>>,
    quota_bytes: Option<u64>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn open(&self, name: &str) {
        self.stores.lock().entry(name.to_string()).or_default();
    }

    pub fn has(&self, name: &str) -> bool {
        self.stores.lock().contains_key(name)
    }

    pub fn delete(&self, name: &str) -> bool {
        self.stores.lock().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn lookup(&self, name: &str, key: &str) -> Option<ResponseSnapshot> {
        self.stores.lock().get(name)?.get(key).cloned()
    }

    /// Inserts into `name` (creating it when missing), then trims the store
    /// by `batch` oldest entries whenever it exceeds `max_entries`. Returns
    /// the number of evicted entries.
    pub fn put(
        &self,
        name: &str,
        key: &str,
        snapshot: ResponseSnapshot,
        max_entries: usize,
        batch: usize,
    ) -> Result<usize> {
        let mut stores = self.stores.lock();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = stores.values().map(CacheStore::body_bytes).sum();
            let replaced = stores
                .get(name)
                .and_then(|store| store.get(key))
                .map_or(0, |existing| existing.body.len() as u64);
            let needed = used - replaced + snapshot.body.len() as u64;
            if needed > quota {
                bail!("cache quota exceeded: {needed} of {quota} bytes");
            }
        }
        let store = stores.entry(name.to_string()).or_default();
        store.put(key.to_string(), snapshot);
        let mut evicted = 0;
        if store.len() > max_entries {
            evicted = store.evict_oldest(batch).len();
        }
        Ok(evicted)
    }

    pub fn len(&self, name: &str) -> usize {
        self.stores.lock().get(name).map_or(0, CacheStore::len)
    }

    pub fn keys(&self, name: &str) -> Vec<String> {
        self.stores
            .lock()
            .get(name)
            .map(|store| store.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn body_bytes(&self, name: &str) -> u64 {
        self.stores.lock().get(name).map_or(0, CacheStore::body_bytes)
    }
}

/// A request as seen by the interceptor. `url` is the path and query the
/// player asked for; `headers` and `body` travel unchanged to the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub range: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            range: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Headers worth forwarding, minus the ones tied to this connection.
    pub fn forwarded_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(name, _)| {
                !UNFORWARDED_HEADERS
                    .iter()
                    .any(|skipped| name.eq_ignore_ascii_case(skipped))
            })
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Store key. Ranged requests are keyed per range so one cached chunk is
    /// never served for another.
    pub fn cache_key(&self) -> String {
        match &self.range {
            Some(range) => format!("{}#{}", self.url, range.trim()),
            None => self.url.clone(),
        }
    }
}

/// Network side of the interceptor. Calls block.
pub trait Upstream: Send + Sync + 'static {
    /// Returns the upstream's response for any status. `Err` means the
    /// network itself failed.
    fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot>;
}

/// [`Upstream`] that forwards to the backend over HTTP.
#[derive(Clone)]
pub struct UreqUpstream {
    agent: ureq::Agent,
    base: Url,
    max_body: u64,
}

impl UreqUpstream {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid upstream URL {base}"))?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(60))
            .build();
        Ok(Self {
            agent,
            base,
            max_body: MAX_UPSTREAM_BODY,
        })
    }

    pub fn with_max_body(mut self, max_body: u64) -> Self {
        self.max_body = max_body;
        self
    }
}

/// Buffers `reader` whole, or fails once it yields more than `limit` bytes.
fn read_capped(reader: impl Read, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("body exceeds {limit} bytes"),
        ));
    }
    Ok(body)
}

impl Upstream for UreqUpstream {
    fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot> {
        let target = self
            .base
            .join(&request.url)
            .with_context(|| format!("resolving {}", request.url))?;
        let mut call = self.agent.request(&request.method, target.as_str());
        if let Some(range) = &request.range {
            call = call.set("Range", range);
        }
        for (name, value) in request.forwarded_headers() {
            call = call.set(name, value);
        }
        let sent = if request.body.is_empty() {
            call.call()
        } else {
            call.send_bytes(&request.body)
        };
        let response = match sent {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(err).with_context(|| format!("{} {target}", request.method)),
        };

        let status = response.status();
        let headers = KEPT_HEADERS
            .iter()
            .filter_map(|name| {
                response
                    .header(name)
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = read_capped(response.into_reader(), self.max_body)
            .with_context(|| format!("reading body of {target}"))?;
        Ok(ResponseSnapshot::new(status, headers, body))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
    /// Network failed but a concurrent request had filled the cache.
    CacheAfterNetworkError,
    Offline,
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: ResponseSnapshot,
    pub source: FetchSource,
}

pub fn is_video_request(method: &str, url: &str) -> bool {
    if !method.eq_ignore_ascii_case("GET") {
        return false;
    }
    let Some(path) = request_path(url) else {
        return false;
    };
    let lower = path.to_ascii_lowercase();
    lower == STREAM_PATH
        || CDN_PATH_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
        || VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn request_path(url: &str) -> Option<String> {
    let parsed = Url::parse(url)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(url)))
        .ok()?;
    Some(parsed.path().to_string())
}

pub struct VideoCacheWorker {
    storage: Arc<CacheStorage>,
    upstream: Arc<dyn Upstream>,
    cache_name: String,
    state: Mutex<WorkerState>,
    claimed: Mutex<bool>,
    writes: TaskTracker,
}

impl VideoCacheWorker {
    pub fn new(storage: Arc<CacheStorage>, upstream: Arc<dyn Upstream>) -> Self {
        Self::with_cache_name(storage, upstream, VIDEO_CACHE_NAME)
    }

    pub fn with_cache_name(
        storage: Arc<CacheStorage>,
        upstream: Arc<dyn Upstream>,
        cache_name: &str,
    ) -> Self {
        Self {
            storage,
            upstream,
            cache_name: cache_name.to_string(),
            state: Mutex::new(WorkerState::Installing),
            claimed: Mutex::new(false),
            writes: TaskTracker::new(),
        }
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn controls_clients(&self) -> bool {
        *self.claimed.lock()
    }

    pub fn install(&self) {
        self.storage.open(&self.cache_name);
        info!(cache = %self.cache_name, "video cache installed");
    }

    /// Drops stores left behind by older versions of this application and
    /// takes control of clients. Returns the names that were deleted.
    pub fn activate(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .storage
            .names()
            .into_iter()
            .filter(|name| name.starts_with(APP_CACHE_PREFIX) && name != &self.cache_name)
            .collect();
        for name in &stale {
            self.storage.delete(name);
            info!(cache = %name, "deleted stale video cache");
        }
        *self.state.lock() = WorkerState::Active;
        *self.claimed.lock() = true;
        stale
    }

    /// Passthrough errors propagate; video requests always produce a
    /// response.
    pub async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchOutcome> {
        if self.state() != WorkerState::Active || !is_video_request(&request.method, &request.url) {
            let response = self.network(request).await?;
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Passthrough,
            });
        }

        let key = request.cache_key();
        if let Some(response) = self.storage.lookup(&self.cache_name, &key) {
            debug!(%key, "video cache hit");
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Cache,
            });
        }

        match self.network(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.spawn_cache_write(key, response.clone());
                }
                Ok(FetchOutcome {
                    response,
                    source: FetchSource::Network,
                })
            }
            Err(err) => {
                debug!(%key, "video fetch failed: {err:#}");
                if let Some(response) = self.storage.lookup(&self.cache_name, &key) {
                    return Ok(FetchOutcome {
                        response,
                        source: FetchSource::CacheAfterNetworkError,
                    });
                }
                Ok(FetchOutcome {
                    response: ResponseSnapshot::offline_unavailable(),
                    source: FetchSource::Offline,
                })
            }
        }
    }

    async fn network(&self, request: FetchRequest) -> Result<ResponseSnapshot> {
        let upstream = Arc::clone(&self.upstream);
        tokio::task::spawn_blocking(move || upstream.fetch(&request))
            .await
            .context("upstream task panicked")?
    }

    fn spawn_cache_write(&self, key: String, snapshot: ResponseSnapshot) {
        let storage = Arc::clone(&self.storage);
        let name = self.cache_name.clone();
        self.writes.spawn(async move {
            match storage.put(&name, &key, snapshot, MAX_CACHE_ENTRIES, EVICTION_BATCH) {
                Ok(0) => debug!(%key, "cached video response"),
                Ok(evicted) => debug!(%key, evicted, "cached video response and evicted oldest entries"),
                Err(err) => warn!(%key, "failed to cache video response: {err:#}"),
            }
        });
    }

    /// Waits for every background cache write started so far.
    pub async fn flush_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    pub fn clear(&self) -> bool {
        self.storage.delete(&self.cache_name)
    }

    pub fn cache_size(&self) -> u64 {
        self.storage.body_bytes(&self.cache_name)
    }

    pub fn handle_message(&self, message: WorkerMessage) -> WorkerReply {
        match message {
            WorkerMessage::ClearVideoCache => {
                let existed = self.clear();
                info!(existed, "video cache cleared");
                WorkerReply::VideoCacheCleared
            }
            WorkerMessage::GetCacheSize => WorkerReply::CacheSize {
                size: self.cache_size(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    ClearVideoCache,
    GetCacheSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    VideoCacheCleared,
    CacheSize { size: u64 },
}

type ControlRequest = (WorkerMessage, oneshot::Sender<WorkerReply>);

/// Sender half of the worker's message channel.
#[derive(Clone)]
pub struct ControlHandle {
    sender: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub async fn send(&self, message: WorkerMessage) -> Result<WorkerReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send((message, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("video cache worker stopped"))?;
        reply_rx.await.context("video cache worker dropped the reply")
    }
}

/// Serves control messages until every [`ControlHandle`] is dropped.
pub fn spawn_control(worker: Arc<VideoCacheWorker>) -> ControlHandle {
    let (sender, mut receiver) = mpsc::channel::<ControlRequest>(16);
    tokio::spawn(async move {
        while let Some((message, reply)) = receiver.recv().await {
            let answer = worker.handle_message(message);
            if reply.send(answer).is_err() {
                debug!("control message sender went away before the reply");
            }
        }
    });
    ControlHandle { sender }
}
