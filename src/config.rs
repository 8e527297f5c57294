// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache engine.
//!
//! # Example
//!
//! ```
//! use cache_engine::CacheEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheEngineConfig::default();
//! assert_eq!(config.compression_threshold, 1024);
//! assert_eq!(config.breaker.max_failures, 3);
//!
//! // Partial JSON: everything omitted falls back to its default
//! let config = CacheEngineConfig::from_json(r#"{
//!     "redis_url": "redis://localhost:6379",
//!     "key_prefix": "game:",
//!     "breaker": { "max_failures": 5 }
//! }"#).unwrap();
//! assert_eq!(config.breaker.max_failures, 5);
//! assert_eq!(config.breaker.failure_window_secs, 300);
//! assert!(config.cleanup().namespaces[0].pattern.starts_with("game:"));
//! ```

use serde::Deserialize;

use crate::cleanup::policy::{default_namespaces, NamespacePolicy};
use crate::pattern::glob_match;

const HOUR: u64 = 3600;

/// Configuration for the cache engine.
///
/// All fields have sensible defaults. Set `redis_url` for production;
/// without it [`crate::TaggedCache::connect`] builds a disabled cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheEngineConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix shared by every cache key (default: "scope:")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Prefix for tag index sets (default: "tag:")
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Extra lifetime of a tag set beyond its entries' TTL
    #[serde(default = "default_tag_ttl_buffer_secs")]
    pub tag_ttl_buffer_secs: u64,

    /// Serialized payloads above this size are compressed (auto mode)
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// zstd level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Page size for `delete_by_pattern` scans
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Namespace → default TTL table (`set_default`, cleanup)
    #[serde(default)]
    pub ttl_defaults: TtlDefaults,

    /// Cleanup engine settings. Namespace patterns follow `key_prefix`
    /// unless given explicitly.
    #[serde(default)]
    pub cleanup: Option<CleanupConfig>,
}

fn default_key_prefix() -> String { "scope:".into() }
fn default_tag_prefix() -> String { "tag:".into() }
fn default_tag_ttl_buffer_secs() -> u64 { 300 }
fn default_compression_threshold() -> usize { 1024 }
fn default_compression_level() -> i32 { crate::compression::DEFAULT_COMPRESSION_LEVEL }
fn default_scan_page_size() -> usize { 500 }

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            tag_prefix: default_tag_prefix(),
            tag_ttl_buffer_secs: default_tag_ttl_buffer_secs(),
            compression_threshold: default_compression_threshold(),
            compression_level: default_compression_level(),
            scan_page_size: default_scan_page_size(),
            breaker: BreakerConfig::default(),
            ttl_defaults: TtlDefaults::default(),
            cleanup: None,
        }
    }
}

impl CacheEngineConfig {
    /// Parse a JSON config; omitted fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(json)?;
        config.resolve_cleanup();
        Ok(config)
    }

    /// Cleanup settings, with default namespaces under `key_prefix`.
    #[must_use]
    pub fn cleanup(&self) -> CleanupConfig {
        self.cleanup
            .clone()
            .unwrap_or_else(|| CleanupConfig::for_prefix(&self.key_prefix))
    }

    fn resolve_cleanup(&mut self) {
        let prefix = self.key_prefix.clone();
        let cleanup = self.cleanup.get_or_insert_with(|| CleanupConfig::for_prefix(&prefix));
        if cleanup.namespaces.is_empty() {
            cleanup.namespaces = default_namespaces(&prefix);
        }
    }
}

/// Shared compute circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Prefix of the backend-held failure counters
    #[serde(default = "default_breaker_key_prefix")]
    pub key_prefix: String,
    /// Failures within the window that open the circuit
    #[serde(default = "default_max_failures")]
    pub max_failures: u64,
    /// Lifetime of the failure counter
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

impl BreakerConfig {
    #[must_use]
    pub fn limits(&self) -> BreakerLimits {
        BreakerLimits {
            max_failures: self.max_failures,
            failure_window_secs: self.failure_window_secs,
        }
    }
}

/// Thresholds of one breaker-protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerLimits {
    pub max_failures: u64,
    pub failure_window_secs: u64,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        BreakerConfig::default().limits()
    }
}

fn default_breaker_key_prefix() -> String { "cb_failures:".into() }
fn default_max_failures() -> u64 { 3 }
fn default_failure_window_secs() -> u64 { 300 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_breaker_key_prefix(),
            max_failures: default_max_failures(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

/// One row of the namespace → default TTL table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TtlRule {
    /// Glob matched against the full key
    pub pattern: String,
    pub hours: u64,
}

impl TtlRule {
    pub fn new(pattern: impl Into<String>, hours: u64) -> Self {
        Self { pattern: pattern.into(), hours }
    }
}

/// Default TTLs by namespace. First matching rule wins.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlDefaults {
    #[serde(default = "default_ttl_rules")]
    pub rules: Vec<TtlRule>,
    #[serde(default = "default_fallback_hours")]
    pub fallback_hours: u64,
}

// Leaderboard first: its keys often mention players too
fn default_ttl_rules() -> Vec<TtlRule> {
    vec![
        TtlRule::new("*leaderboard*", 48),
        TtlRule::new("*player*", 24),
        TtlRule::new("*session*", 8),
        TtlRule::new("*temp*", 2),
    ]
}
fn default_fallback_hours() -> u64 { 6 }

impl Default for TtlDefaults {
    fn default() -> Self {
        Self {
            rules: default_ttl_rules(),
            fallback_hours: default_fallback_hours(),
        }
    }
}

impl TtlDefaults {
    /// Default TTL in seconds for `key`.
    #[must_use]
    pub fn ttl_for(&self, key: &str) -> u64 {
        self.rules
            .iter()
            .find(|rule| glob_match(&rule.pattern, key))
            .map_or(self.fallback_hours, |rule| rule.hours)
            .saturating_mul(HOUR)
    }
}

/// Cleanup engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub namespaces: Vec<NamespacePolicy>,

    /// Size floor for the "large & cold" rule
    #[serde(default = "default_large_key_bytes")]
    pub large_key_bytes: u64,

    /// Orphans with less remaining TTL than this are deleted
    #[serde(default = "default_orphan_ttl_threshold_secs")]
    pub orphan_ttl_threshold_secs: u64,

    /// used/max above which low-priority TTLs are halved
    #[serde(default = "default_memory_pressure_threshold")]
    pub memory_pressure_threshold: f64,

    /// Halved TTLs never go below this
    #[serde(default = "default_pressure_ttl_floor_secs")]
    pub pressure_ttl_floor_secs: u64,

    /// Keys sampled for the TTL distribution check
    #[serde(default = "default_herd_sample_size")]
    pub herd_sample_size: usize,
    #[serde(default = "default_herd_bucket_secs")]
    pub herd_bucket_secs: u64,
    /// Share of the sample in one bucket that counts as clustering
    #[serde(default = "default_herd_fraction_threshold")]
    pub herd_fraction_threshold: f64,
    #[serde(default = "default_herd_min_sample")]
    pub herd_min_sample: usize,

    /// Errors kept verbatim in the report
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// Runs longer than this get a recommendation (never aborted)
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,

    /// Orphan count that triggers a naming recommendation
    #[serde(default = "default_orphan_alert_threshold")]
    pub orphan_alert_threshold: u64,

    /// TTL assignments that trigger a "set TTLs at write time" recommendation
    #[serde(default = "default_no_expiry_alert_threshold")]
    pub no_expiry_alert_threshold: u64,
}

fn default_large_key_bytes() -> u64 { 1024 }
fn default_orphan_ttl_threshold_secs() -> u64 { HOUR }
fn default_memory_pressure_threshold() -> f64 { 0.8 }
fn default_pressure_ttl_floor_secs() -> u64 { 1800 }
fn default_herd_sample_size() -> usize { 1000 }
fn default_herd_bucket_secs() -> u64 { 300 }
fn default_herd_fraction_threshold() -> f64 { 0.25 }
fn default_herd_min_sample() -> usize { 20 }
fn default_max_errors() -> usize { 10 }
fn default_time_budget_secs() -> u64 { 300 }
fn default_orphan_alert_threshold() -> u64 { 100 }
fn default_no_expiry_alert_threshold() -> u64 { 100 }

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::for_prefix(&default_key_prefix())
    }
}

impl CleanupConfig {
    /// Defaults with the stock namespaces under `prefix`.
    #[must_use]
    pub fn for_prefix(prefix: &str) -> Self {
        Self {
            namespaces: default_namespaces(prefix),
            large_key_bytes: default_large_key_bytes(),
            orphan_ttl_threshold_secs: default_orphan_ttl_threshold_secs(),
            memory_pressure_threshold: default_memory_pressure_threshold(),
            pressure_ttl_floor_secs: default_pressure_ttl_floor_secs(),
            herd_sample_size: default_herd_sample_size(),
            herd_bucket_secs: default_herd_bucket_secs(),
            herd_fraction_threshold: default_herd_fraction_threshold(),
            herd_min_sample: default_herd_min_sample(),
            max_errors: default_max_errors(),
            time_budget_secs: default_time_budget_secs(),
            orphan_alert_threshold: default_orphan_alert_threshold(),
            no_expiry_alert_threshold: default_no_expiry_alert_threshold(),
        }
    }
}
