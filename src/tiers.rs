#![forbid(unsafe_code)]

//! Subscription tiers and the capability limits attached to each of them.
//!
//! Everything here is a pure lookup over a static table. Callers resolve the
//! user's current tier from account state themselves and treat a missing or
//! unknown tier as [`Tier::Free`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription level. Variant order is the access order used by
/// [`has_min_tier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Lite,
    Premium,
    Vip,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Lite, Tier::Premium, Tier::Vip];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "lite" => Some(Self::Lite),
            "premium" => Some(Self::Premium),
            "vip" => Some(Self::Vip),
            _ => None,
        }
    }

    pub fn parse_or_free(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(Self::Free)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Lite => "lite",
            Self::Premium => "premium",
            Self::Vip => "vip",
        }
    }

    pub fn config(self) -> &'static TierConfig {
        TierConfig::for_tier(self)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendition height ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "4k")]
    K4,
}

impl Quality {
    /// Exact label match; `"1080P"` or `" 720p"` are not recognized.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "360p" => Some(Self::P360),
            "480p" => Some(Self::P480),
            "720p" => Some(Self::P720),
            "1080p" => Some(Self::P1080),
            "4k" => Some(Self::K4),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::K4 => "4k",
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            Self::P360 => 0,
            Self::P480 => 1,
            Self::P720 => 2,
            Self::P1080 => 3,
            Self::K4 => 4,
        }
    }
}

/// Ordinal used when a quality label is not recognized. It is the 480p slot,
/// so unknown labels are never treated as a high rendition.
pub const UNKNOWN_QUALITY_ORDINAL: u8 = 1;

pub fn quality_ordinal(label: &str) -> u8 {
    Quality::parse(label)
        .map(Quality::ordinal)
        .unwrap_or(UNKNOWN_QUALITY_ORDINAL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierFeatures {
    pub ad_free: bool,
    pub exclusive_content: bool,
    pub early_access: bool,
    pub super_chat: bool,
    pub tipping: bool,
    pub encrypted_downloads: bool,
    pub priority_support: bool,
    pub analytics: bool,
    pub unlimited_playlists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub tier: Tier,
    pub name: &'static str,
    /// Monthly price in cents.
    pub price_cents: u32,
    pub features: TierFeatures,
    pub max_quality: Quality,
    /// `-1` means unlimited, `0` means downloads are not part of the plan.
    pub max_downloads_per_month: i32,
}

const UNLIMITED_DOWNLOADS: i32 = -1;

static FREE: TierConfig = TierConfig {
    tier: Tier::Free,
    name: "Free",
    price_cents: 0,
    features: TierFeatures {
        ad_free: false,
        exclusive_content: false,
        early_access: false,
        super_chat: false,
        tipping: false,
        encrypted_downloads: false,
        priority_support: false,
        analytics: false,
        unlimited_playlists: false,
    },
    max_quality: Quality::P480,
    max_downloads_per_month: 0,
};

static LITE: TierConfig = TierConfig {
    tier: Tier::Lite,
    name: "Lite",
    price_cents: 499,
    features: TierFeatures {
        ad_free: false,
        exclusive_content: false,
        early_access: false,
        super_chat: true,
        tipping: true,
        encrypted_downloads: false,
        priority_support: false,
        analytics: false,
        unlimited_playlists: false,
    },
    max_quality: Quality::P720,
    max_downloads_per_month: 5,
};

static PREMIUM: TierConfig = TierConfig {
    tier: Tier::Premium,
    name: "Premium",
    price_cents: 999,
    features: TierFeatures {
        ad_free: true,
        exclusive_content: true,
        early_access: false,
        super_chat: true,
        tipping: true,
        encrypted_downloads: true,
        priority_support: false,
        analytics: true,
        unlimited_playlists: true,
    },
    max_quality: Quality::P1080,
    max_downloads_per_month: 50,
};

static VIP: TierConfig = TierConfig {
    tier: Tier::Vip,
    name: "VIP",
    price_cents: 1999,
    features: TierFeatures {
        ad_free: true,
        exclusive_content: true,
        early_access: true,
        super_chat: true,
        tipping: true,
        encrypted_downloads: true,
        priority_support: true,
        analytics: true,
        unlimited_playlists: true,
    },
    max_quality: Quality::K4,
    max_downloads_per_month: UNLIMITED_DOWNLOADS,
};

impl TierConfig {
    pub fn for_tier(tier: Tier) -> &'static TierConfig {
        match tier {
            Tier::Free => &FREE,
            Tier::Lite => &LITE,
            Tier::Premium => &PREMIUM,
            Tier::Vip => &VIP,
        }
    }

    pub fn all() -> [&'static TierConfig; 4] {
        Tier::ALL.map(TierConfig::for_tier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuota {
    pub allowed: bool,
    pub max_per_month: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdPolicy {
    pub show_ads: bool,
    pub reduced_frequency: bool,
}

/// Gating flags of a single video, as stored by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFlags {
    #[serde(default)]
    pub is_vip_only: bool,
    #[serde(default)]
    pub is_premium_only: bool,
    #[serde(default)]
    pub early_access_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

pub fn max_quality(tier: Tier) -> Quality {
    tier.config().max_quality
}

/// True when `requested` is at or below the tier's ceiling. Unknown labels
/// compare as 480p.
pub fn can_access_quality(tier: Tier, requested: &str) -> bool {
    quality_ordinal(requested) <= max_quality(tier).ordinal()
}

pub fn download_quota(tier: Tier) -> DownloadQuota {
    let max_per_month = tier.config().max_downloads_per_month;
    DownloadQuota {
        allowed: max_per_month != 0,
        max_per_month,
    }
}

/// Applies the monthly quota to a usage count.
pub fn can_download(tier: Tier, used_this_month: u32) -> bool {
    match tier.config().max_downloads_per_month {
        0 => false,
        UNLIMITED_DOWNLOADS => true,
        max if max > 0 => used_this_month < max.unsigned_abs(),
        _ => false,
    }
}

pub fn should_show_ads(tier: Tier) -> AdPolicy {
    if tier.config().features.ad_free {
        return AdPolicy {
            show_ads: false,
            reduced_frequency: false,
        };
    }
    AdPolicy {
        show_ads: true,
        reduced_frequency: tier == Tier::Lite,
    }
}

pub fn has_min_tier(tier: Tier, required: Tier) -> bool {
    tier >= required
}

pub fn can_access_content(tier: Tier, video: &ContentFlags) -> AccessDecision {
    can_access_content_at(tier, video, Utc::now())
}

/// Gates run in a fixed order and the first failing one decides the reason.
pub fn can_access_content_at(
    tier: Tier,
    video: &ContentFlags,
    now: DateTime<Utc>,
) -> AccessDecision {
    if video.is_vip_only && tier != Tier::Vip {
        return AccessDecision::deny("This video is exclusive to VIP members. Upgrade to VIP to watch.");
    }
    if video.is_premium_only && !has_min_tier(tier, Tier::Premium) {
        return AccessDecision::deny("This video is for Premium members. Upgrade to Premium to watch.");
    }
    if let Some(until) = video.early_access_until
        && until > now
        && tier != Tier::Vip
    {
        return AccessDecision::deny(format!(
            "Early access for VIP members. Available to everyone on {}.",
            until.format("%Y-%m-%d")
        ));
    }
    AccessDecision::allow()
}
