#![forbid(unsafe_code)]

//! In-memory sliding-window rate limiter for mutation endpoints.
//!
//! Each `(action, identifier)` pair keeps the instants of its recent requests.
//! The map is local to this process: running several backend instances
//! multiplies the effective limit by the instance count.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Minimum age before the sweep drops a timestamp. Keys with a longer window
/// keep their timestamps for the whole window.
pub const SWEEP_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimitConfig {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub success: bool,
    pub remaining: u32,
    pub reset_in_seconds: u64,
}

/// Mutations guarded by the limiter, with their default budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitAction {
    Comment,
    Upload,
    Like,
}

impl RateLimitAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "comment" => Some(Self::Comment),
            "upload" => Some(Self::Upload),
            "like" => Some(Self::Like),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Upload => "upload",
            Self::Like => "like",
        }
    }

    pub fn config(self) -> RateLimitConfig {
        match self {
            Self::Comment => RateLimitConfig {
                limit: 10,
                window_seconds: 60,
            },
            Self::Upload => RateLimitConfig {
                limit: 5,
                window_seconds: 60 * 60,
            },
            Self::Like => RateLimitConfig {
                limit: 30,
                window_seconds: 60,
            },
        }
    }
}

/// Recent request instants of one key, with the window they were checked
/// under.
#[derive(Debug)]
struct KeyHistory {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl KeyHistory {
    fn retention(&self) -> Duration {
        self.window.max(SWEEP_RETENTION)
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, KeyHistory>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a shared limiter and starts its periodic sweep. The sweep task
    /// ends on its own once the last `Arc` is dropped.
    pub fn shared() -> Arc<Self> {
        let limiter = Arc::new(Self::new());
        spawn_sweeper(&limiter, SWEEP_INTERVAL);
        limiter
    }

    pub fn check(&self, identifier: &str, action: &str, config: RateLimitConfig) -> RateLimitResult {
        self.check_at(identifier, action, config, Instant::now())
    }

    /// Pruning and insertion happen under one lock, so concurrent checks
    /// against the same key cannot both take the last slot.
    pub fn check_at(
        &self,
        identifier: &str,
        action: &str,
        config: RateLimitConfig,
        now: Instant,
    ) -> RateLimitResult {
        let window = config.window();
        let key = format!("{action}:{identifier}");
        let mut entries = self.entries.lock();
        let history = entries.entry(key).or_insert_with(|| KeyHistory {
            window,
            stamps: VecDeque::new(),
        });
        history.window = window;
        let timestamps = &mut history.stamps;

        while timestamps
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= config.limit as usize {
            let reset_in_seconds = timestamps
                .front()
                .and_then(|oldest| oldest.checked_add(window))
                .map_or(config.window_seconds, |reset_at| {
                    ceil_secs(reset_at.saturating_duration_since(now))
                });
            return RateLimitResult {
                success: false,
                remaining: 0,
                reset_in_seconds,
            };
        }

        timestamps.push_back(now);
        let used = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        RateLimitResult {
            success: true,
            remaining: config.limit.saturating_sub(used),
            reset_in_seconds: config.window_seconds,
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drops timestamps older than both [`SWEEP_RETENTION`] and their key's
    /// window, then removes keys left empty. Returns how many keys were
    /// removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, history| {
            let retention = history.retention();
            history
                .stamps
                .retain(|stamp| now.saturating_duration_since(*stamp) < retention);
            !history.stamps.is_empty()
        });
        before - entries.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Runs [`RateLimiter::sweep`] every `interval` until the limiter is dropped.
pub fn spawn_sweeper(limiter: &Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<RateLimiter> = Arc::downgrade(limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(limiter) = weak.upgrade() else {
                break;
            };
            let removed = limiter.sweep();
            if removed > 0 {
                debug!(removed, "rate limiter sweep dropped idle keys");
            }
        }
    })
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
