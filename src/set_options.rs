// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-write options: TTL, tags and compression.
//!
//! # Example
//!
//! ```rust
//! use cache_engine::{CacheTtl, CompressMode, SetOptions};
//!
//! // Default: 30 minutes, no tags, compress when large
//! let opts = SetOptions::default();
//! assert_eq!(opts.ttl.as_secs(), 1800);
//!
//! // A player snapshot that must die with the player's other entries
//! let opts = SetOptions::new(CacheTtl::Long)
//!     .tag("player:42")
//!     .tag("combat:42")
//!     .compress(CompressMode::Never);
//! assert_eq!(opts.tags.len(), 2);
//! ```

use std::time::Duration;

/// Standard cache lifetimes.
///
/// Pick the preset closest to how quickly the underlying data changes.
/// `Custom` exists for the rare entry that needs an exact lifetime;
/// `Custom(0)` stores without expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheTtl {
    /// 5 minutes - volatile data (shop rotations, presence)
    Short,
    /// 30 minutes - the default
    #[default]
    Medium,
    /// 1 hour - player snapshots
    Long,
    /// 24 hours - rarely changing reference data
    VeryLong,
    /// Custom duration in seconds
    Custom(u64),
}

impl CacheTtl {
    #[must_use]
    pub fn custom_secs(secs: u64) -> Self {
        Self::Custom(secs)
    }

    #[must_use]
    pub fn as_secs(self) -> u64 {
        match self {
            CacheTtl::Short => 5 * 60,
            CacheTtl::Medium => 30 * 60,
            CacheTtl::Long => 60 * 60,
            CacheTtl::VeryLong => 24 * 60 * 60,
            CacheTtl::Custom(secs) => secs,
        }
    }

    #[must_use]
    pub fn to_duration(self) -> Duration {
        Duration::from_secs(self.as_secs())
    }
}

impl From<Duration> for CacheTtl {
    /// Exact preset when the duration matches one, otherwise `Custom`.
    fn from(d: Duration) -> Self {
        match d.as_secs() {
            300 => CacheTtl::Short,
            1800 => CacheTtl::Medium,
            3600 => CacheTtl::Long,
            86_400 => CacheTtl::VeryLong,
            secs => CacheTtl::Custom(secs),
        }
    }
}

/// Whether to compress a payload before storing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    /// Compress only above the configured size threshold
    #[default]
    Auto,
    Always,
    Never,
}

impl From<Option<bool>> for CompressMode {
    fn from(force: Option<bool>) -> Self {
        match force {
            None => Self::Auto,
            Some(true) => Self::Always,
            Some(false) => Self::Never,
        }
    }
}

/// Options for a single cache write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: CacheTtl,
    /// Tags for group invalidation (duplicates are ignored)
    pub tags: Vec<String>,
    pub compress: CompressMode,
}

impl SetOptions {
    #[must_use]
    pub fn new(ttl: CacheTtl) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Options with an exact TTL in seconds.
    #[must_use]
    pub fn ttl_secs(secs: u64) -> Self {
        Self::new(CacheTtl::from(Duration::from_secs(secs)))
    }

    /// Add one tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Add several tags.
    #[must_use]
    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().fold(self, |opts, tag| opts.tag(tag))
    }

    #[must_use]
    pub fn compress(mut self, mode: CompressMode) -> Self {
        self.compress = mode;
        self
    }
}
