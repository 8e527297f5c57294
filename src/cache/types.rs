// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the tagged cache.

use serde::Serialize;
use thiserror::Error;

use crate::entry::CodecError;
use crate::metrics::MetricsSnapshot;
use crate::set_options::{CacheTtl, SetOptions};
use crate::storage::traits::MemoryInfo;

/// Outcome of a cache read.
///
/// [`super::TaggedCache::get`] folds everything but `Hit` into the
/// caller's default; `lookup` keeps the cases apart for callers that care
/// why a value is missing.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Key not present
    Miss,
    /// Present but undecodable (counted as a hit in metrics)
    Corrupt,
    /// Backend disabled or unreachable
    Unavailable,
}

impl<T> Lookup<T> {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            _ => None,
        }
    }
}

/// Outcome of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in the backend
    Written,
    /// Backend disabled or unreachable; nothing was stored
    Degraded,
}

impl WriteOutcome {
    #[must_use]
    pub fn is_written(self) -> bool {
        self == Self::Written
    }
}

/// Errors surfaced by the write path. Backend failures never appear here.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot serialize value for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode entry for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: CodecError,
    },
}

/// One operation inside [`super::TaggedCache::apply_batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Write a value (tags attached as in `set`)
    Set {
        key: String,
        value: serde_json::Value,
        options: SetOptions,
    },
    /// Delete a key without touching its tag sets
    Delete { key: String },
    /// Change a key's lifetime; fails if the key is absent
    Expire { key: String, ttl: CacheTtl },
}

impl BatchOp {
    pub fn set(key: impl Into<String>, value: serde_json::Value, options: SetOptions) -> Self {
        Self::Set { key: key.into(), value, options }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn expire(key: impl Into<String>, ttl: CacheTtl) -> Self {
        Self::Expire { key: key.into(), ttl }
    }
}

/// Result of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Total operations in the batch
    pub total: usize,
    /// Successfully applied operations
    pub succeeded: usize,
    /// Failed operations
    pub failed: usize,
}

impl BatchResult {
    /// Check if all operations succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Built without a backend
    Disabled,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Qualitative reading of the hit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceRating {
    Excellent,
    Good,
    Fair,
    Poor,
    /// No reads recorded yet
    NoData,
}

impl PerformanceRating {
    #[must_use]
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        if !snapshot.has_traffic() {
            return Self::NoData;
        }
        match snapshot.hit_rate {
            r if r >= 0.8 => Self::Excellent,
            r if r >= 0.6 => Self::Good,
            r if r >= 0.4 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

impl std::fmt::Display for PerformanceRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
            Self::NoData => write!(f, "no_data"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend: Option<&'static str>,
    pub ping: bool,
    pub ping_ms: Option<f64>,
    pub hit_rate: f64,
    pub performance: PerformanceRating,
}

/// Process-local breaker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub enabled: bool,
    pub available: bool,
    pub backend: Option<&'static str>,
    pub counters: MetricsSnapshot,
    pub breaker: BreakerStats,
    pub memory: Option<MemoryInfo>,
    pub memory_pressure: Option<f64>,
}
