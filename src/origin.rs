#![forbid(unsafe_code)]

//! Blocking client for the upstream hosts that store video binaries.
//!
//! The proxy and the offline store talk to the origin through the [`Origin`]
//! trait so tests can swap in an in-memory fake. Calls block, so async
//! callers run them inside `tokio::task::spawn_blocking`.

use std::{io::Read, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;
use url::Url;

use crate::range::ByteRange;
use crate::security::validate_origin_url;

const MAX_REDIRECTS: usize = 5;

/// Result of a metadata-only (`HEAD`) request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginProbe {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Status line, the headers the proxy relays, and a streaming body.
pub struct OriginResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// The origin answered, but with an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginStatus(pub u16);

impl std::fmt::Display for OriginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "origin responded with HTTP {}", self.0)
    }
}

impl std::error::Error for OriginStatus {}

pub trait Origin: Send + Sync + 'static {
    /// Looks up size and type. An origin that refuses `HEAD` yields an empty
    /// probe; only transport failures are errors.
    fn probe(&self, url: &Url) -> Result<OriginProbe>;

    /// Issues a GET, ranged when `range` is set. Statuses >= 400 are errors.
    fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<OriginResponse>;
}

/// [`Origin`] backed by a shared `ureq` agent.
///
/// Redirects are followed by hand so every hop is checked against the same
/// allow-list as the original URL.
#[derive(Clone)]
pub struct UreqOrigin {
    agent: ureq::Agent,
    allowed_hosts: Vec<String>,
}

impl UreqOrigin {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .redirects(0)
            .build();
        Self {
            agent,
            allowed_hosts,
        }
    }

    fn send(&self, method: &str, url: &Url, range: Option<ByteRange>) -> Result<ureq::Response> {
        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.agent.request(method, current.as_str());
            if let Some(range) = range {
                request = request.set("Range", &range.header_value());
            }
            let response = match request.call() {
                Ok(response) => response,
                Err(ureq::Error::Status(code, _)) => {
                    return Err(anyhow::Error::new(OriginStatus(code)))
                        .with_context(|| format!("{method} {current}"));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("{method} {current}"));
                }
            };

            if !(300..400).contains(&response.status()) {
                return Ok(response);
            }

            let location = response
                .header("Location")
                .ok_or_else(|| anyhow!("origin redirect without Location header"))?;
            let next = current
                .join(location)
                .with_context(|| format!("resolving redirect target {location}"))?;
            current = validate_origin_url(next.as_str(), &self.allowed_hosts)
                .map_err(|_| anyhow!("origin redirected to a disallowed host: {next}"))?;
            debug!(target_url = %current, "following origin redirect");
        }
        bail!("too many redirects for {url}")
    }
}

impl Origin for UreqOrigin {
    fn probe(&self, url: &Url) -> Result<OriginProbe> {
        let response = match self.send("HEAD", url, None) {
            Ok(response) => response,
            Err(err) if err.downcast_ref::<OriginStatus>().is_some() => {
                debug!(%url, "origin refused HEAD: {err:#}");
                return Ok(OriginProbe::default());
            }
            Err(err) => return Err(err),
        };
        Ok(OriginProbe {
            content_length: header_u64(&response, "Content-Length"),
            content_type: header_string(&response, "Content-Type"),
        })
    }

    fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<OriginResponse> {
        let response = self.send("GET", url, range)?;
        Ok(OriginResponse {
            status: response.status(),
            content_type: header_string(&response, "Content-Type"),
            content_length: header_u64(&response, "Content-Length"),
            content_range: header_string(&response, "Content-Range"),
            body: Box::new(response.into_reader()),
        })
    }
}

fn header_string(response: &ureq::Response, name: &str) -> Option<String> {
    response
        .header(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_u64(response: &ureq::Response, name: &str) -> Option<u64> {
    response
        .header(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
}
