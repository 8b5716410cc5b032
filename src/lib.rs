#![forbid(unsafe_code)]

//! Shared code for the vidstream `backend` and `viewer` binaries.

pub mod config;
pub mod error;
pub mod logging;
pub mod offline;
pub mod origin;
pub mod proxy;
pub mod range;
pub mod rate_limit;
pub mod security;
pub mod tiers;
pub mod video_cache;
