#![forbid(unsafe_code)]

//! HTTP `Range` header handling shared by the stream proxy and the viewer's
//! offline playback route.

/// Inclusive byte range, as written in `Range`/`Content-Range` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for an outgoing `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Value for a `Content-Range` response header.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }

    /// First chunk of a resource of `total` bytes. `total` and `chunk_size`
    /// must both be non-zero.
    pub fn first_chunk(total: u64, chunk_size: u64) -> Self {
        Self {
            start: 0,
            end: (chunk_size - 1).min(total - 1),
        }
    }
}

/// `bytes=START-` or `bytes=START-END` as sent by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl RequestedRange {
    /// Closes an open-ended range at `chunk_size` bytes so a single proxied
    /// request never asks the origin for the rest of the file.
    pub fn bounded(self, chunk_size: u64) -> ByteRange {
        let end = self
            .end
            .unwrap_or_else(|| self.start.saturating_add(chunk_size.saturating_sub(1)));
        ByteRange {
            start: self.start,
            end,
        }
    }
}

/// Strict parser for the proxy: exactly `bytes=<digits>-<digits?>`.
///
/// Suffix ranges, multiple ranges and other units are rejected, as is an end
/// before the start.
pub fn parse_requested_range(value: &str) -> Option<RequestedRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = rest.split_once('-')?;
    if !is_digits(start_str) {
        return None;
    }
    let start = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        None
    } else if is_digits(end_str) {
        Some(end_str.parse().ok()?)
    } else {
        return None;
    };
    if end.is_some_and(|end| end < start) {
        return None;
    }
    Some(RequestedRange { start, end })
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

/// Lenient parser used when serving a body of known `size` locally. Accepts
/// suffix ranges (`bytes=-N`) and clamps the end to the last byte.
pub fn resolve_range(value: &str, size: u64) -> Option<ByteRange> {
    let value = value.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || size == 0 {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        let start = size.saturating_sub(suffix_len);
        return Some(ByteRange {
            start,
            end: size - 1,
        });
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        end_str.parse::<u64>().ok()?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some(ByteRange { start, end })
}
