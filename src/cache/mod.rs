// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The tagged cache.
//!
//! [`TaggedCache`] is the API game code talks to. It never fails because
//! the backend is down: reads fall back to the caller's default, writes and
//! deletes become no-ops, and the outcome types say which happened. The
//! only errors that surface are a value that cannot be serialized and,
//! from [`TaggedCache::get_or_compute`], an open circuit or a failed fetch.
//!
//! There is no locking. Concurrent writers to the same key race with
//! last-write-wins semantics, batches are pipelined but not atomic, and
//! callers must tolerate stale or missing reads.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cache_engine::{CacheEngineConfig, CacheTtl, SetOptions, TaggedCache};
//! use cache_engine::storage::memory::InMemoryBackend;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = TaggedCache::new(Arc::new(InMemoryBackend::new()), CacheEngineConfig::default());
//!
//! let opts = SetOptions::new(CacheTtl::Medium).tags(["player:42", "combat:42"]);
//! cache.set("scope:player:power:42", &json!({"atk": 100}), opts).await.unwrap();
//! assert_eq!(cache.get("scope:player:power:42", json!(null)).await, json!({"atk": 100}));
//!
//! cache.delete_by_tags(["player:42"]).await;
//! assert_eq!(cache.get("scope:player:power:42", json!(null)).await, json!(null));
//! # }
//! ```

pub mod types;

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cleanup::report::CleanupReport;
use crate::cleanup::CleanupEngine;
use crate::config::{BreakerLimits, CacheEngineConfig};
use crate::entry::{EncodedEntry, EntryCodec};
use crate::keys::{self, CacheKeys};
use crate::metrics::{self, CacheMetrics, LatencyTimer, MetricsSnapshot};
use crate::resilience::circuit_breaker::{CircuitBreaker, ComputeError};
use crate::set_options::SetOptions;
use crate::storage::redis::RedisBackend;
use crate::storage::traits::{KvBackend, PipelineOp, PipelineReply, StorageError};
use crate::tags::TagIndex;

/// Writes between sweeps of expired version counters.
const VERSION_PRUNE_INTERVAL: u64 = 1024;

/// Last version written for a key, and when that write expires.
#[derive(Debug, Clone, Copy)]
struct KeyVersion {
    version: u64,
    expires_at: Option<Instant>,
}

impl KeyVersion {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub use types::{
    BatchOp, BatchResult, BreakerStats, CacheError, HealthReport, HealthStatus, Lookup, MetricsReport,
    PerformanceRating, WriteOutcome,
};

/// Tagged, compressed, breaker-protected cache over a [`KvBackend`].
pub struct TaggedCache {
    backend: Option<Arc<dyn KvBackend>>,
    config: CacheEngineConfig,
    codec: EntryCodec,
    tags: TagIndex,
    keys: CacheKeys,
    metrics: Arc<CacheMetrics>,
    breaker: CircuitBreaker,
    /// Per-key write counters (informational, never checked on read).
    /// Entries go once the written TTL has passed.
    versions: DashMap<String, KeyVersion>,
    writes: AtomicU64,
}

impl TaggedCache {
    /// Create a cache over `backend`.
    pub fn new(backend: Arc<dyn KvBackend>, config: CacheEngineConfig) -> Self {
        Self::build(Some(backend), config)
    }

    /// A cache with no backend: every read misses, every write degrades.
    pub fn disabled(config: CacheEngineConfig) -> Self {
        Self::build(None, config)
    }

    /// Connect to `config.redis_url`, or build a disabled cache if unset.
    ///
    /// ```rust,no_run
    /// # use cache_engine::{CacheEngineConfig, TaggedCache};
    /// # async fn example() {
    /// let config = CacheEngineConfig {
    ///     redis_url: Some("redis://localhost:6379".into()),
    ///     ..Default::default()
    /// };
    /// // An unreachable Redis should not take the service down with it
    /// let cache = match TaggedCache::connect(config.clone()).await {
    ///     Ok(cache) => cache,
    ///     Err(_) => TaggedCache::disabled(config),
    /// };
    /// # }
    /// ```
    pub async fn connect(config: CacheEngineConfig) -> Result<Self, StorageError> {
        let Some(url) = config.redis_url.clone() else {
            info!("No redis_url configured, cache disabled");
            return Ok(Self::disabled(config));
        };
        let backend = RedisBackend::connect(&url).await?;
        info!("Cache connected to Redis");
        Ok(Self::new(Arc::new(backend), config))
    }

    fn build(backend: Option<Arc<dyn KvBackend>>, config: CacheEngineConfig) -> Self {
        Self {
            codec: EntryCodec::new(config.compression_threshold, config.compression_level),
            tags: TagIndex::new(config.tag_prefix.clone(), config.tag_ttl_buffer_secs),
            keys: CacheKeys::new(config.key_prefix.clone()),
            metrics: Arc::new(CacheMetrics::new()),
            breaker: CircuitBreaker::new("compute", config.breaker.clone()),
            versions: DashMap::new(),
            writes: AtomicU64::new(0),
            backend,
            config,
        }
    }

    /// Use an externally owned metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    #[must_use]
    pub fn backend(&self) -> Option<&dyn KvBackend> {
        self.backend.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &CacheEngineConfig {
        &self.config
    }

    /// Key builder under the configured prefix.
    #[must_use]
    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    #[must_use]
    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a value, keeping miss, corruption and outage apart.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        let _timer = LatencyTimer::new("get");
        let Some(backend) = self.backend() else {
            return Lookup::Unavailable;
        };

        let blob = match backend.get(key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                self.metrics.record_miss();
                return Lookup::Miss;
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, using default");
                metrics::record_backend_error(backend.name(), "get");
                self.metrics.record_miss();
                return Lookup::Unavailable;
            }
        };

        self.metrics.record_hit();
        match self.codec.decode(&blob).and_then(|entry| entry.value::<T>()) {
            Ok(value) => Lookup::Hit(value),
            Err(e) => {
                debug!(key, error = %e, "Undecodable cache entry, treating as miss");
                metrics::record_operation("get", "corrupt");
                Lookup::Corrupt
            }
        }
    }

    /// Read a value, or `default` on miss, corruption or outage.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.lookup(key).await.into_option().unwrap_or(default)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a value with its tags.
    ///
    /// Returns `Degraded` (not an error) when the backend is unavailable.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<WriteOutcome, CacheError> {
        let _timer = LatencyTimer::new("set");
        let ttl = options.ttl.as_secs();
        let encoded = self.encode(key, value, &options)?;

        let Some(backend) = self.backend() else {
            metrics::record_operation("set", "degraded");
            return Ok(WriteOutcome::Degraded);
        };

        let mut ops = Vec::with_capacity(1 + options.tags.len() * 2);
        ops.push(PipelineOp::Set { key: key.to_string(), value: encoded.blob, ttl_secs: ttl });
        ops.extend(self.tags.attach_ops(key, &options.tags, ttl));

        match backend.pipeline(&ops).await {
            Ok(_) => {
                self.metrics.record_sets(1);
                metrics::record_operation("set", "success");
                Ok(WriteOutcome::Written)
            }
            Err(e) => {
                warn!(key, error = %e, "Cache write failed, continuing without cache");
                metrics::record_backend_error(backend.name(), "set");
                metrics::record_operation("set", "degraded");
                Ok(WriteOutcome::Degraded)
            }
        }
    }

    /// Store a value with the namespace's default TTL.
    pub async fn set_default<T, I, S>(&self, key: &str, value: &T, tags: I) -> Result<WriteOutcome, CacheError>
    where
        T: Serialize + ?Sized,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ttl = self.config.ttl_defaults.ttl_for(key);
        self.set(key, value, SetOptions::ttl_secs(ttl).tags(tags)).await
    }

    fn encode<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &SetOptions,
    ) -> Result<EncodedEntry, CacheError> {
        let payload = serde_json::to_vec(value).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;
        let encoded = self
            .codec
            .encode(payload, &options.tags, self.next_version(key, options.ttl.as_secs()), options.ttl.as_secs(), options.compress)
            .map_err(|source| CacheError::Encode {
                key: key.to_string(),
                source,
            })?;
        if let Some(stats) = encoded.stats {
            metrics::record_compression(stats.original_bytes, stats.compressed_bytes);
        }
        Ok(encoded)
    }

    fn next_version(&self, key: &str, ttl_secs: u64) -> u64 {
        if self.writes.fetch_add(1, Ordering::Relaxed) % VERSION_PRUNE_INTERVAL == VERSION_PRUNE_INTERVAL - 1 {
            self.prune_versions();
        }

        let now = Instant::now();
        let expires_at = (ttl_secs > 0).then(|| now + Duration::from_secs(ttl_secs));
        let mut slot = self
            .versions
            .entry(key.to_string())
            .or_insert(KeyVersion { version: 0, expires_at });
        // An expired key starts over, like a fresh write
        let previous = if slot.is_expired(now) { 0 } else { slot.version };
        *slot = KeyVersion { version: previous + 1, expires_at };
        slot.version
    }

    /// Forget version counters whose entries have expired.
    fn prune_versions(&self) {
        let now = Instant::now();
        self.versions.retain(|_, v| !v.is_expired(now));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Deletes and invalidation
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete a key and drop it from its tag sets.
    ///
    /// Returns whether a key was removed (`false` when the backend is down).
    pub async fn delete(&self, key: &str) -> bool {
        let _timer = LatencyTimer::new("delete");
        let Some(backend) = self.backend() else {
            return false;
        };

        let tags = match backend.get(key).await {
            Ok(Some(blob)) => self.codec.read_tags(&blob),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(key, error = %e, "Cache delete failed");
                metrics::record_backend_error(backend.name(), "delete");
                return false;
            }
        };

        let mut ops = self.tags.detach_ops(key, &tags);
        ops.push(PipelineOp::delete(key));
        match backend.pipeline(&ops).await {
            Ok(replies) => {
                self.versions.remove(key);
                let removed = replies.last().is_some_and(PipelineReply::changed);
                if removed {
                    self.metrics.record_deletes(1);
                }
                metrics::record_operation("delete", if removed { "success" } else { "miss" });
                removed
            }
            Err(e) => {
                warn!(key, error = %e, "Cache delete failed");
                metrics::record_backend_error(backend.name(), "delete");
                false
            }
        }
    }

    /// Delete every key matching a glob. Tag sets are left to expire.
    ///
    /// Returns the number of keys removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> usize {
        let _timer = LatencyTimer::new("delete_by_pattern");
        let Some(backend) = self.backend() else {
            return 0;
        };

        let keys = match self.scan_all(backend, pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern, error = %e, "Pattern scan failed");
                metrics::record_backend_error(backend.name(), "scan");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        let ops: Vec<PipelineOp> = keys.iter().map(PipelineOp::delete).collect();
        let deleted = match backend.pipeline(&ops).await {
            Ok(replies) => replies.iter().filter(|r| r.changed()).count(),
            Err(e) => {
                warn!(pattern, keys = keys.len(), error = %e, "Pattern delete failed");
                metrics::record_backend_error(backend.name(), "delete_by_pattern");
                return 0;
            }
        };

        for key in &keys {
            self.versions.remove(key);
        }
        self.metrics.record_deletes(deleted as u64);
        metrics::record_keys_deleted("delete_by_pattern", deleted);
        info!(pattern, deleted, "Deleted keys by pattern");
        deleted
    }

    async fn scan_all(&self, backend: &dyn KvBackend, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (page, next) = backend.scan(pattern, cursor, self.config.scan_page_size).await?;
            // SCAN may return a key more than once
            keys.extend(page.into_iter().filter(|k| seen.insert(k.clone())));
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Delete every key carrying any of `tags`, plus the tag sets.
    ///
    /// Deleted keys are also removed from their other tag sets. Counts one
    /// invalidation per call. Returns the number of keys removed.
    pub async fn delete_by_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _timer = LatencyTimer::new("delete_by_tags");
        let tags: Vec<String> = tags.into_iter().map(|t| t.as_ref().to_string()).collect();
        self.metrics.record_invalidation();
        let Some(backend) = self.backend() else {
            return 0;
        };

        let mut total = 0;
        for tag in &tags {
            match self.invalidate_tag(backend, tag).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Tag invalidation failed");
                    metrics::record_backend_error(backend.name(), "delete_by_tags");
                }
            }
        }

        self.metrics.record_deletes(total as u64);
        metrics::record_keys_deleted("delete_by_tags", total);
        debug!(tags = ?tags, deleted = total, "Invalidated tags");
        total
    }

    async fn invalidate_tag(&self, backend: &dyn KvBackend, tag: &String) -> Result<usize, StorageError> {
        let set_key = self.tags.set_key(tag);
        let members = backend.members(&set_key).await?;

        let mut ops = Vec::new();
        if !members.is_empty() {
            // Read members' headers to find their other tags
            let reads: Vec<PipelineOp> = members.iter().map(PipelineOp::get).collect();
            let blobs = backend.pipeline(&reads).await?;
            for (member, reply) in members.iter().zip(blobs) {
                if let PipelineReply::Value(Some(blob)) = reply {
                    let siblings: Vec<String> =
                        self.codec.read_tags(&blob).into_iter().filter(|t| t != tag).collect();
                    ops.extend(self.tags.detach_ops(member, &siblings));
                }
                ops.push(PipelineOp::delete(member));
            }
        }
        ops.push(PipelineOp::delete(&set_key));

        let replies = backend.pipeline(&ops).await?;
        let deleted = ops
            .iter()
            .zip(&replies)
            .filter(|(op, reply)| matches!(op, PipelineOp::Delete { key } if *key != set_key) && reply.changed())
            .count();

        for member in &members {
            self.versions.remove(member);
        }
        Ok(deleted)
    }

    /// Invalidate everything derived from one player's state.
    pub async fn invalidate_player(&self, player_id: u64) -> usize {
        self.delete_by_tags(keys::player_tags(player_id)).await
    }

    pub async fn invalidate_guild(&self, guild_id: u64) -> usize {
        self.delete_by_tags([keys::guild_tag(guild_id)]).await
    }

    pub async fn invalidate_global(&self) -> usize {
        self.delete_by_tags([keys::GLOBAL_TAG]).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply many writes in one pipelined round trip.
    ///
    /// Not atomic. A `Delete` succeeds whether or not the key existed; an
    /// `Expire` on a missing key fails. Values that cannot be encoded fail
    /// without affecting the rest of the batch.
    pub async fn apply_batch(&self, batch: Vec<BatchOp>) -> BatchResult {
        let _timer = LatencyTimer::new("batch");
        let total = batch.len();
        let Some(backend) = self.backend() else {
            return BatchResult { total, succeeded: 0, failed: total };
        };

        let mut ops = Vec::new();
        // Position of each operation's primary command in `ops`
        let mut primaries = Vec::with_capacity(total);
        let mut failed = 0;

        for op in batch {
            match op {
                BatchOp::Set { key, value, options } => match self.encode(&key, &value, &options) {
                    Ok(encoded) => {
                        let ttl = options.ttl.as_secs();
                        primaries.push(ops.len());
                        ops.push(PipelineOp::Set { key: key.clone(), value: encoded.blob, ttl_secs: ttl });
                        ops.extend(self.tags.attach_ops(&key, &options.tags, ttl));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping unencodable batch entry");
                        failed += 1;
                    }
                },
                BatchOp::Delete { key } => {
                    self.versions.remove(&key);
                    primaries.push(ops.len());
                    ops.push(PipelineOp::delete(key));
                }
                BatchOp::Expire { key, ttl } => {
                    primaries.push(ops.len());
                    ops.push(PipelineOp::expire(key, ttl.as_secs()));
                }
            }
        }

        if ops.is_empty() {
            return BatchResult { total, succeeded: 0, failed };
        }

        let replies = match backend.pipeline(&ops).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!(ops = ops.len(), error = %e, "Batch pipeline failed");
                metrics::record_backend_error(backend.name(), "batch");
                return BatchResult { total, succeeded: 0, failed: total };
            }
        };

        let (mut sets, mut deletes, mut succeeded) = (0u64, 0u64, 0usize);
        for &idx in &primaries {
            let ok = match (&ops[idx], replies.get(idx)) {
                (PipelineOp::Set { .. }, Some(PipelineReply::Done)) => {
                    sets += 1;
                    true
                }
                (PipelineOp::Delete { .. }, Some(reply)) => {
                    if reply.changed() {
                        deletes += 1;
                    }
                    true
                }
                (PipelineOp::Expire { .. }, Some(reply)) => reply.changed(),
                _ => false,
            };
            if ok {
                succeeded += 1;
            }
        }

        self.metrics.record_sets(sets);
        self.metrics.record_deletes(deletes);
        let result = BatchResult { total, succeeded, failed: total - succeeded };
        metrics::record_operation("batch", if result.is_success() { "success" } else { "partial" });
        debug!(total, succeeded, "Applied batch");
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Breaker-protected compute
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the cached value or compute, cache and return it.
    ///
    /// Uses the configured breaker limits.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        fetch: F,
    ) -> Result<T, ComputeError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.get_or_compute_with(key, options, self.config.breaker.limits(), fetch)
            .await
    }

    /// [`Self::get_or_compute`] with explicit breaker limits.
    ///
    /// A cached `null` counts as a miss. When `limits.max_failures`
    /// fetches for `key` failed within the window (across all workers
    /// sharing the backend), returns [`ComputeError::CircuitOpen`] without
    /// calling `fetch`. Any success closes the circuit.
    #[tracing::instrument(skip(self, options, fetch))]
    pub async fn get_or_compute_with<T, F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        limits: BreakerLimits,
        fetch: F,
    ) -> Result<T, ComputeError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if let Lookup::Hit(value) = self.lookup::<serde_json::Value>(key).await {
            if !value.is_null() {
                match serde_json::from_value::<T>(value) {
                    Ok(hit) => return Ok(hit),
                    Err(e) => debug!(error = %e, "Cached value has the wrong shape, recomputing"),
                }
            }
        }

        let backend = self.backend();
        if !self.breaker.admit_within(backend, key, limits).await {
            return Err(ComputeError::CircuitOpen { key: key.to_string() });
        }

        match fetch().await {
            Ok(value) => {
                if let Err(e) = self.set(key, &value, options).await {
                    warn!(error = %e, "Computed value could not be cached");
                }
                self.breaker.record_success(backend, key).await;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Compute failed");
                self.breaker.record_failure_within(backend, key, limits).await;
                Err(ComputeError::Fetch(e))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Observability and maintenance
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero the process-local cache and breaker counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        self.breaker.reset_metrics();
    }

    fn breaker_stats(&self) -> BreakerStats {
        BreakerStats {
            calls: self.breaker.calls_total(),
            successes: self.breaker.successes(),
            failures: self.breaker.failures(),
            rejections: self.breaker.rejections(),
        }
    }

    /// Counters plus backend availability and memory.
    pub async fn metrics_report(&self) -> MetricsReport {
        let counters = self.metrics.snapshot();
        metrics::set_hit_rate(counters.hit_rate);

        let Some(backend) = self.backend() else {
            return MetricsReport {
                enabled: false,
                available: false,
                backend: None,
                counters,
                breaker: self.breaker_stats(),
                memory: None,
                memory_pressure: None,
            };
        };

        let available = matches!(backend.ping().await, Ok(true));
        let memory = if available {
            backend.memory_info().await.unwrap_or_else(|e| {
                debug!(error = %e, "Memory info unavailable");
                None
            })
        } else {
            None
        };
        let memory_pressure = memory.map(|m| m.pressure());
        if let Some(pressure) = memory_pressure {
            metrics::set_memory_pressure(pressure);
        }

        MetricsReport {
            enabled: true,
            available,
            backend: Some(backend.name()),
            counters,
            breaker: self.breaker_stats(),
            memory,
            memory_pressure,
        }
    }

    /// Ping the backend and rate the hit rate.
    pub async fn health(&self) -> HealthReport {
        let counters = self.metrics.snapshot();
        let performance = PerformanceRating::from_snapshot(&counters);

        let Some(backend) = self.backend() else {
            return HealthReport {
                status: HealthStatus::Disabled,
                backend: None,
                ping: false,
                ping_ms: None,
                hit_rate: counters.hit_rate,
                performance,
            };
        };

        let start = Instant::now();
        let ping = match backend.ping().await {
            Ok(pong) => pong,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Health ping failed");
                false
            }
        };
        let ping_ms = ping.then(|| start.elapsed().as_secs_f64() * 1000.0);
        metrics::set_backend_healthy(backend.name(), ping);

        HealthReport {
            status: if ping { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
            backend: Some(backend.name()),
            ping,
            ping_ms,
            hit_rate: counters.hit_rate,
            performance,
        }
    }

    /// Cleanup engine over this cache's backend and configuration.
    #[must_use]
    pub fn cleanup_engine(&self) -> CleanupEngine {
        CleanupEngine::new(
            self.backend.clone(),
            self.config.cleanup(),
            self.config.ttl_defaults.clone(),
            self.config.key_prefix.clone(),
        )
    }

    /// Run one cleanup pass. Send `true` on `cancel` to stop between pages.
    pub async fn run_cleanup(&self, cancel: watch::Receiver<bool>) -> CleanupReport {
        self.prune_versions();
        self.cleanup_engine().run(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::set_options::{CacheTtl, CompressMode};
    use crate::storage::memory::InMemoryBackend;
    use crate::storage::traits::{MemoryInfo, TtlStatus};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (TaggedCache, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = TaggedCache::new(backend.clone(), CacheEngineConfig::default());
        (cache, backend)
    }

    fn tagged(ttl: u64, tags: &[&str]) -> SetOptions {
        SetOptions::ttl_secs(ttl).tags(tags.iter().copied())
    }

    async fn members(backend: &InMemoryBackend, tag: &str) -> Vec<String> {
        let mut m = backend.members(&format!("tag:{tag}")).await.unwrap();
        m.sort();
        m
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let (cache, _) = cache();
        let value = json!({"atk": 100, "def": 50});

        let outcome = cache.set("scope:player:power:1", &value, SetOptions::default()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(cache.get("scope:player:power:1", Value::Null).await, value);

        let snap = cache.metrics();
        assert_eq!((snap.hits, snap.misses, snap.sets), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_typed_values() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Power {
            atk: u32,
            bonuses: Vec<String>,
        }

        let (cache, _) = cache();
        let power = Power { atk: 7, bonuses: vec!["leader".into()] };
        cache.set("scope:player:power:2", &power, SetOptions::default()).await.unwrap();

        let read: Option<Power> = cache.lookup("scope:player:power:2").await.into_option();
        assert_eq!(read, Some(power));
    }

    #[tokio::test]
    async fn test_miss_returns_default_and_counts() {
        let (cache, _) = cache();
        assert_eq!(cache.get("scope:nothing", 7u32).await, 7);
        assert!(matches!(cache.lookup::<Value>("scope:nothing").await, Lookup::Miss));
        assert_eq!(cache.metrics().misses, 2);
        assert_eq!(cache.metrics().hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_large_value_compressed_transparently() {
        let (cache, backend) = cache();
        let board: Vec<Value> = (0..200).map(|i| json!({"rank": i, "player": 1000 + i})).collect();

        cache.set("scope:leaderboard:power:page:1", &board, SetOptions::default()).await.unwrap();
        let stored = backend.get("scope:leaderboard:power:page:1").await.unwrap().unwrap();
        assert!(stored.len() < serde_json::to_vec(&board).unwrap().len());

        let read: Vec<Value> = cache.get("scope:leaderboard:power:page:1", Vec::new()).await;
        assert_eq!(read, board);
    }

    #[tokio::test]
    async fn test_forced_compression_small_value() {
        let (cache, _) = cache();
        let opts = SetOptions::default().compress(CompressMode::Always);
        cache.set("scope:temp:x", &json!([1, 2, 3]), opts).await.unwrap();
        assert_eq!(cache.get("scope:temp:x", json!(null)).await, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_raw_values_are_returned_as_is() {
        let (cache, backend) = cache();
        backend.set_with_ttl("scope:legacy:json", br#"{"old":1}"#, 60).await.unwrap();
        backend.set_with_ttl("scope:legacy:text", b"hello", 60).await.unwrap();

        assert_eq!(cache.get("scope:legacy:json", Value::Null).await, json!({"old": 1}));
        assert_eq!(cache.get("scope:legacy:text", String::new()).await, "hello");
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_soft_miss_counted_as_hit() {
        let (cache, backend) = cache();
        let mut blob = crate::entry::ENTRY_MAGIC.to_vec();
        blob.extend_from_slice(&[0, 0, 0, 50, b'{']);
        backend.set_with_ttl("scope:bad", &blob, 60).await.unwrap();

        assert!(matches!(cache.lookup::<Value>("scope:bad").await, Lookup::Corrupt));
        assert_eq!(cache.get("scope:bad", json!("fallback")).await, json!("fallback"));
        assert_eq!(cache.metrics().hits, 2);
        assert_eq!(cache.metrics().misses, 0);
    }

    #[tokio::test]
    async fn test_set_writes_ttl_and_tag_sets() {
        let (cache, backend) = cache();
        cache.set("scope:player:power:42", &json!({"atk": 100}), tagged(1800, &["player:42"])).await.unwrap();

        assert!(matches!(backend.ttl("scope:player:power:42").await.unwrap(), TtlStatus::Remaining(s) if s > 1790 && s <= 1800));
        assert!(matches!(backend.ttl("tag:player:42").await.unwrap(), TtlStatus::Remaining(s) if s > 2090 && s <= 2100));
        assert_eq!(members(&backend, "player:42").await, vec!["scope:player:power:42"]);
    }

    #[tokio::test]
    async fn test_version_increments_per_write() {
        let (cache, backend) = cache();
        for _ in 0..3 {
            cache.set("scope:temp:v", &1, SetOptions::default()).await.unwrap();
        }
        let blob = backend.get("scope:temp:v").await.unwrap().unwrap();
        match cache.codec.decode(&blob).unwrap() {
            crate::entry::Entry::Wrapped(entry) => assert_eq!(entry.version, 3),
            crate::entry::Entry::Raw(_) => panic!("expected wrapped entry"),
        }
    }

    #[tokio::test]
    async fn test_short_ttl_write_keeps_long_member_invalidatable() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheEngineConfig { tag_ttl_buffer_secs: 0, ..Default::default() };
        let cache = TaggedCache::new(backend.clone(), config);

        cache.set("scope:player:power:1", &json!({"atk": 100}), tagged(3600, &["player:1"])).await.unwrap();
        cache.set("scope:temp:y", &1, tagged(1, &["player:1"])).await.unwrap();
        assert!(matches!(backend.ttl("tag:player:1").await.unwrap(), TtlStatus::Remaining(s) if s > 3500));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.delete_by_tags(["player:1"]).await, 1);
        assert_eq!(cache.get("scope:player:power:1", Value::Null).await, Value::Null);
    }

    #[tokio::test]
    async fn test_expired_versions_are_pruned() {
        let (cache, _) = cache();
        for i in 0..500 {
            cache.set(&format!("scope:session:{i}"), &i, SetOptions::ttl_secs(1)).await.unwrap();
        }
        cache.set("scope:player:power:1", &1, SetOptions::ttl_secs(3600)).await.unwrap();
        assert_eq!(cache.versions.len(), 501);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let (_tx, cancel) = watch::channel(false);
        cache.run_cleanup(cancel).await;

        assert_eq!(cache.versions.len(), 1);
        assert!(cache.versions.contains_key("scope:player:power:1"));
    }

    #[tokio::test]
    async fn test_versions_pruned_during_writes() {
        let (cache, _) = cache();
        for i in 0..10 {
            cache.set(&format!("scope:temp:{i}"), &i, SetOptions::ttl_secs(1)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        for _ in 0..VERSION_PRUNE_INTERVAL {
            cache.set("scope:player:power:1", &1, SetOptions::ttl_secs(60)).await.unwrap();
        }
        assert_eq!(cache.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_version_restarts_after_expiry() {
        let (cache, backend) = cache();
        cache.set("scope:temp:v", &1, SetOptions::ttl_secs(1)).await.unwrap();
        cache.set("scope:temp:v", &1, SetOptions::ttl_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        cache.set("scope:temp:v", &1, SetOptions::ttl_secs(60)).await.unwrap();
        let blob = backend.get("scope:temp:v").await.unwrap().unwrap();
        match cache.codec.decode(&blob).unwrap() {
            crate::entry::Entry::Wrapped(entry) => assert_eq!(entry.version, 1),
            crate::entry::Entry::Raw(_) => panic!("expected wrapped entry"),
        }
    }

    #[tokio::test]
    async fn test_set_default_uses_namespace_ttl() {
        let (cache, backend) = cache();
        cache.set_default("scope:session:abc", &json!({"user": 1}), ["social:1"]).await.unwrap();

        match backend.ttl("scope:session:abc").await.unwrap() {
            TtlStatus::Remaining(s) => assert!(s > 8 * 3600 - 10 && s <= 8 * 3600),
            other => panic!("unexpected ttl {other:?}"),
        }
        assert_eq!(members(&backend, "social:1").await, vec!["scope:session:abc"]);
    }

    #[tokio::test]
    async fn test_delete_removes_key_and_tag_membership() {
        let (cache, backend) = cache();
        cache.set("scope:player:power:5", &1, tagged(600, &["player:5", "combat:5"])).await.unwrap();
        cache.set("scope:player:quests:5", &2, tagged(600, &["player:5"])).await.unwrap();

        assert!(cache.delete("scope:player:power:5").await);
        assert!(!cache.delete("scope:player:power:5").await);

        assert_eq!(members(&backend, "player:5").await, vec!["scope:player:quests:5"]);
        assert!(members(&backend, "combat:5").await.is_empty());
        assert_eq!(cache.metrics().deletes, 1);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let (cache, backend) = cache();
        for i in 0..30 {
            cache.set(&format!("scope:player:power:{i}"), &i, SetOptions::default()).await.unwrap();
        }
        cache.set("scope:guild:1", &1, SetOptions::default()).await.unwrap();

        assert_eq!(cache.delete_by_pattern("scope:player:*").await, 30);
        assert_eq!(backend.len(), 1);
        assert_eq!(cache.delete_by_pattern("scope:player:*").await, 0);
        assert_eq!(cache.metrics().deletes, 30);
    }

    #[tokio::test]
    async fn test_tag_invalidation_completeness() {
        let (cache, backend) = cache();
        cache.set("k1", &"v1", tagged(600, &["p:1"])).await.unwrap();
        cache.set("k2", &"v2", tagged(600, &["p:1"])).await.unwrap();

        assert_eq!(cache.delete_by_tags(["p:1"]).await, 2);
        assert_eq!(cache.get("k1", "default".to_string()).await, "default");
        assert_eq!(cache.get("k2", "default".to_string()).await, "default");
        assert!(members(&backend, "p:1").await.is_empty());

        let snap = cache.metrics();
        assert_eq!(snap.deletes, 2);
        assert_eq!(snap.invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidation_clears_sibling_tag_sets() {
        let (cache, backend) = cache();
        let key = "scope:player:power:42";
        cache
            .set(key, &json!({"atk": 100}), tagged(1800, &["player:42", "combat:42"]))
            .await
            .unwrap();
        cache.set("scope:player:combat_log:42", &1, tagged(1800, &["combat:42"])).await.unwrap();

        assert_eq!(cache.delete_by_tags(["player:42"]).await, 1);

        assert_eq!(cache.get(key, Value::Null).await, Value::Null);
        assert!(members(&backend, "player:42").await.is_empty());
        assert_eq!(members(&backend, "combat:42").await, vec!["scope:player:combat_log:42"]);
    }

    #[tokio::test]
    async fn test_invalidating_both_tags_clears_both() {
        let (cache, backend) = cache();
        cache
            .set("scope:player:power:42", &1, tagged(1800, &["player:42", "combat:42"]))
            .await
            .unwrap();

        assert_eq!(cache.delete_by_tags(["player:42", "combat:42"]).await, 1);
        assert!(members(&backend, "player:42").await.is_empty());
        assert!(members(&backend, "combat:42").await.is_empty());
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_helpers() {
        let (cache, _) = cache();
        let k = cache.keys().clone();
        cache.set(&k.player_power(9), &1, SetOptions::default().tag(keys::player_tag(9))).await.unwrap();
        cache.set(&k.collection_stats(9), &2, SetOptions::default().tag(keys::collection_tag(9))).await.unwrap();
        cache.set(&k.guild_data(3), &3, SetOptions::default().tag(keys::guild_tag(3))).await.unwrap();
        cache.set(&k.leaderboard("power", 1), &4, SetOptions::default().tag(keys::GLOBAL_TAG)).await.unwrap();

        assert_eq!(cache.invalidate_player(9).await, 2);
        assert_eq!(cache.invalidate_guild(3).await, 1);
        assert_eq!(cache.invalidate_global().await, 1);
        assert_eq!(cache.metrics().invalidations, 3);
    }

    #[tokio::test]
    async fn test_apply_batch() {
        let (cache, backend) = cache();
        backend.set_with_ttl("scope:temp:old", b"1", 60).await.unwrap();

        let result = cache
            .apply_batch(vec![
                BatchOp::set("scope:temp:a", json!(1), tagged(60, &["batch"])),
                BatchOp::set("scope:temp:b", json!({"x": 2}), SetOptions::new(CacheTtl::Short)),
                BatchOp::delete("scope:temp:old"),
                BatchOp::expire("scope:temp:a", CacheTtl::Long),
                BatchOp::expire("scope:temp:missing", CacheTtl::Long),
            ])
            .await;

        assert_eq!(result, BatchResult { total: 5, succeeded: 4, failed: 1 });
        assert_eq!(cache.get("scope:temp:b", Value::Null).await, json!({"x": 2}));
        assert!(matches!(backend.ttl("scope:temp:a").await.unwrap(), TtlStatus::Remaining(s) if s > 3590));
        assert_eq!(members(&backend, "batch").await, vec!["scope:temp:a"]);
        assert_eq!(backend.get("scope:temp:old").await.unwrap(), None);
        assert_eq!(cache.metrics().sets, 2);
        assert_eq!(cache.metrics().deletes, 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_result() {
        let (cache, _) = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<u32, ComputeError<String>> = cache
                .get_or_compute("scope:player:power:1", SetOptions::default(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(99)
                })
                .await;
            assert_eq!(value.unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_then_resets_on_success() {
        let (cache, _) = cache();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let key = "scope:player:power:7";

        let failing = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, String>("db down".into())
        };

        for _ in 0..3 {
            let err = cache.get_or_compute(key, SetOptions::default(), failing).await.unwrap_err();
            assert!(matches!(err, ComputeError::Fetch(ref e) if e == "db down"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Open: fetch is not invoked
        let err = cache.get_or_compute(key, SetOptions::default(), failing).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Window lapses (counter gone), one success resets the count
        let breaker_key = cache.breaker().counter_key(key);
        cache.backend().unwrap().delete(&breaker_key).await.unwrap();
        let ok: Result<u32, ComputeError<String>> =
            cache.get_or_compute(key, SetOptions::default(), || async { Ok(5) }).await;
        assert_eq!(ok.unwrap(), 5);
        cache.delete(key).await;

        // Reopening takes max_failures failures again
        for _ in 0..2 {
            let err = cache.get_or_compute(key, SetOptions::default(), failing).await.unwrap_err();
            assert!(!err.is_circuit_open());
        }
        let err = cache.get_or_compute(key, SetOptions::default(), failing).await.unwrap_err();
        assert!(!err.is_circuit_open());
        let err = cache.get_or_compute(key, SetOptions::default(), failing).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn test_cached_null_is_recomputed() {
        let (cache, _) = cache();
        cache.set("scope:temp:n", &Value::Null, SetOptions::default()).await.unwrap();
        let value: Result<u32, ComputeError<String>> =
            cache.get_or_compute("scope:temp:n", SetOptions::default(), || async { Ok(1) }).await;
        assert_eq!(value.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_per_call_breaker_limits() {
        let (cache, _) = cache();
        let limits = BreakerLimits { max_failures: 1, failure_window_secs: 60 };
        let _ = cache
            .get_or_compute_with("scope:temp:c", SetOptions::default(), limits, || async {
                Err::<u32, String>("boom".into())
            })
            .await;
        let err = cache
            .get_or_compute_with("scope:temp:c", SetOptions::default(), limits, || async { Ok::<u32, String>(1) })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn test_disabled_cache_degrades() {
        let cache = TaggedCache::disabled(CacheEngineConfig::default());
        assert!(!cache.is_enabled());

        assert_eq!(cache.set("k", &1, SetOptions::default()).await.unwrap(), WriteOutcome::Degraded);
        assert!(matches!(cache.lookup::<u32>("k").await, Lookup::Unavailable));
        assert_eq!(cache.get("k", 5).await, 5);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.delete_by_pattern("*").await, 0);
        assert_eq!(cache.delete_by_tags(["t"]).await, 0);
        assert_eq!(cache.apply_batch(vec![BatchOp::delete("k")]).await.failed, 1);

        let computed: Result<u32, ComputeError<String>> =
            cache.get_or_compute("k", SetOptions::default(), || async { Ok(3) }).await;
        assert_eq!(computed.unwrap(), 3);

        assert_eq!(cache.health().await.status, HealthStatus::Disabled);
        assert!(!cache.metrics_report().await.enabled);
    }

    #[tokio::test]
    async fn test_serialization_error_surfaces() {
        let (cache, _) = cache();
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = cache.set("k", &bad, SetOptions::default()).await.unwrap_err();
        assert!(matches!(err, CacheError::Serialize { .. }));
    }

    #[tokio::test]
    async fn test_health_and_rating() {
        let (cache, _) = cache();
        let health = cache.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.ping);
        assert!(health.ping_ms.is_some());
        assert_eq!(health.performance, PerformanceRating::NoData);

        cache.set("k", &1, SetOptions::default()).await.unwrap();
        for _ in 0..4 {
            cache.get("k", 0).await;
        }
        cache.get("missing", 0).await;
        assert_eq!(cache.health().await.performance, PerformanceRating::Excellent);
    }

    #[tokio::test]
    async fn test_metrics_report_includes_memory() {
        let (cache, backend) = cache();
        backend.set_memory_info(Some(MemoryInfo { used_bytes: 50, max_bytes: 100 }));
        let report = cache.metrics_report().await;
        assert!(report.enabled && report.available);
        assert_eq!(report.backend, Some("memory"));
        assert_eq!(report.memory_pressure, Some(0.5));
    }

    #[tokio::test]
    async fn test_reset_metrics() {
        let (cache, _) = cache();
        cache.get("k", 0).await;
        cache.set("k", &1, SetOptions::default()).await.unwrap();
        cache.reset_metrics();
        let snap = cache.metrics();
        assert_eq!((snap.hits, snap.misses, snap.sets), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_injected_metrics_are_shared() {
        let shared = Arc::new(CacheMetrics::new());
        let backend: Arc<dyn KvBackend> = Arc::new(InMemoryBackend::new());
        let a = TaggedCache::new(backend.clone(), CacheEngineConfig::default()).with_metrics(shared.clone());
        let b = TaggedCache::new(backend, CacheEngineConfig::default()).with_metrics(shared.clone());

        a.get("x", 0).await;
        b.get("y", 0).await;
        assert_eq!(shared.misses(), 2);
    }
}
