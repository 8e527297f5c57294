// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-engine.
//!
//! Two layers:
//! - [`CacheMetrics`]: process-local counters owned by a cache instance.
//!   They back `hit_rate`, health reports and `reset_metrics`.
//! - Free functions emitting through the `metrics` crate facade. The host
//!   process chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, set, delete, delete_by_pattern, delete_by_tags, batch
//! - `status`: hit, miss, corrupt, success, degraded, error
//! - `outcome`: cleanup classification or breaker decision

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;

/// Process-local cache counters.
///
/// Not shared between workers; aggregation across processes is the
/// exporter's job.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

impl MetricsSnapshot {
    /// Whether any read has been recorded.
    #[must_use]
    pub fn has_traffic(&self) -> bool {
        self.hits + self.misses > 0
    }
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        record_operation("get", "hit");
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        record_operation("get", "miss");
    }

    pub fn record_sets(&self, count: u64) {
        self.sets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        counter!("cache_engine_invalidations_total").increment(1);
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// hits / (hits + misses), 0.0 before any read.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }
}

/// Record a cache operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "cache_engine_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "cache_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record keys removed by a bulk delete
pub fn record_keys_deleted(operation: &str, count: usize) {
    counter!(
        "cache_engine_keys_deleted_total",
        "operation" => operation.to_string()
    )
    .increment(count as u64);
}

/// Record a compressed write
pub fn record_compression(original_bytes: usize, compressed_bytes: usize) {
    counter!("cache_engine_compressed_writes_total").increment(1);
    counter!("cache_engine_compression_saved_bytes_total")
        .increment(original_bytes.saturating_sub(compressed_bytes) as u64);
}

/// Record a backend error
pub fn record_backend_error(backend: &str, operation: &str) {
    counter!(
        "cache_engine_backend_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "cache_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set backend memory pressure (0.0 - 1.0)
pub fn set_memory_pressure(pressure: f64) {
    gauge!("cache_engine_memory_pressure").set(pressure);
}

/// Set process-local hit rate
pub fn set_hit_rate(rate: f64) {
    gauge!("cache_engine_hit_rate").set(rate);
}

/// Record a compute breaker decision (success, failure, rejected)
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "cache_engine_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record cleanup classifications (expired, stale_too_old, orphaned, ...)
pub fn record_cleanup_keys(outcome: &str, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        "cache_engine_cleanup_keys_total",
        "outcome" => outcome.to_string()
    )
    .increment(count);
}

/// Record a finished cleanup run
pub fn record_cleanup_run(status: &str, duration: Duration, bytes_freed: u64) {
    counter!(
        "cache_engine_cleanup_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("cache_engine_cleanup_seconds").record(duration.as_secs_f64());
    counter!("cache_engine_cleanup_freed_bytes_total").increment(bytes_freed);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
