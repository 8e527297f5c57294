// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Cache Engine
//!
//! A tagged, compressed, self-cleaning cache over Redis for game services.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaggedCache                          │
//! │  • get / set / delete, typed via serde                     │
//! │  • Tag invalidation (player, guild, global)                │
//! │  • Process-local hit/miss counters                         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌────────────────────┐
//! │  Entry Codec   │  │    Tag Index     │  │  Circuit Breaker   │
//! │  header + zstd │  │  tag:{name} sets │  │  cb_failures:{key} │
//! └────────────────┘  └──────────────────┘  └────────────────────┘
//!          │                    │                     │
//!          └────────────────────┼─────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  KvBackend (Redis / memory)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                               ▲
//!                               │ paged scans
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CleanupEngine                         │
//! │  • Namespace aging, orphan reclaim, memory pressure        │
//! │  • TTL clustering report                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cache_engine::{keys, CacheEngineConfig, CacheTtl, SetOptions, TaggedCache};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheEngineConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let cache = TaggedCache::connect(config).await.expect("Failed to connect");
//!
//!     let key = cache.keys().player_power(42);
//!     let opts = SetOptions::new(CacheTtl::Medium).tags(keys::player_tags(42));
//!     cache.set(&key, &json!({"atk": 100}), opts).await.expect("Failed to encode");
//!
//!     // Player state changed: drop everything derived from it
//!     cache.invalidate_player(42).await;
//!     assert_eq!(cache.get(&key, json!(null)).await, json!(null));
//! }
//! ```
//!
//! ## Degraded Mode
//!
//! The cache never fails a caller because Redis is down. Reads return the
//! caller's default, writes report [`WriteOutcome::Degraded`], and cleanup
//! reports [`CleanupStatus::BackendUnavailable`]. A cache built without a
//! `redis_url` runs permanently in this mode.
//!
//! ## Modules
//!
//! - [`cache`]: The [`TaggedCache`] API
//! - [`entry`]: Blob layout (header, tags, optional zstd body)
//! - [`tags`]: Tag set maintenance
//! - [`cleanup`]: The [`CleanupEngine`] and its policies
//! - [`storage`]: Backends (Redis, memory)
//! - [`resilience`]: Backend-held circuit breaker, retry logic
//! - [`keys`]: Key and tag templates

pub mod cache;
pub mod cleanup;
pub mod compression;
pub mod config;
pub mod entry;
pub mod keys;
pub mod metrics;
pub mod pattern;
pub mod resilience;
pub mod set_options;
pub mod storage;
pub mod tags;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cache::{
    BatchOp, BatchResult, BreakerStats, CacheError, HealthReport, HealthStatus, Lookup, MetricsReport,
    PerformanceRating, TaggedCache, WriteOutcome,
};
pub use cleanup::policy::{NamespacePolicy, Priority};
pub use cleanup::report::{CleanupReport, CleanupStats, CleanupStatus};
pub use cleanup::CleanupEngine;
pub use config::{BreakerConfig, BreakerLimits, CacheEngineConfig, CleanupConfig, TtlDefaults};
pub use entry::{CodecError, Entry, EntryCodec};
pub use metrics::{CacheMetrics, LatencyTimer, MetricsSnapshot};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitState, ComputeError};
pub use resilience::retry::RetryConfig;
pub use set_options::{CacheTtl, CompressMode, SetOptions};
pub use storage::memory::InMemoryBackend;
pub use storage::redis::RedisBackend;
pub use storage::traits::{KvBackend, MemoryInfo, PipelineOp, PipelineReply, StorageError, TtlStatus};
