#![forbid(unsafe_code)]

//! Shared security helpers: the origin allow-list that keeps the stream proxy
//! from being used as an open relay, and the not-root startup guard.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use url::Url;

/// Why a proxied URL was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginRejection {
    /// Not an absolute http(s) URL.
    Invalid,
    /// Parsed fine but the host is not on the allow-list.
    HostNotAllowed,
}

/// Parses `raw` and checks its host against `allowed_hosts`.
///
/// A host passes when it equals an allow-listed entry or is a subdomain of one
/// (`cdn.utfs.io` passes for `utfs.io`, `evilutfs.io` does not). Only http and
/// https are accepted so `file:` and friends never reach the origin client.
pub fn validate_origin_url(raw: &str, allowed_hosts: &[String]) -> Result<Url, OriginRejection> {
    let url = Url::parse(raw.trim()).map_err(|_| OriginRejection::Invalid)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OriginRejection::Invalid);
    }
    let Some(host) = url.host_str() else {
        return Err(OriginRejection::Invalid);
    };
    if host_is_allowed(host, allowed_hosts) {
        Ok(url)
    } else {
        Err(OriginRejection::HostNotAllowed)
    }
}

pub fn host_is_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.as_str();
        host == allowed
            || host
                .strip_suffix(allowed)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Fails fast when a binary is started as root. The proxy fetches
/// caller-chosen URLs, so it should never hold more privileges than needed.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}
