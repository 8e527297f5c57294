// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for expensive recomputations.
//!
//! Guards the compute side of `get_or_compute`: when the same key's fetch
//! keeps failing (a downstream outage, a poisoned input) the breaker opens
//! and callers fail fast instead of hammering the dependency.
//!
//! The failure count lives **in the backend**, not in this process, under
//! `{prefix}{cache key}` with the failure window as its TTL. Every worker
//! sharing the backend therefore sees the same open/closed state.
//!
//! States:
//! - Closed: failures below the threshold, calls pass through
//! - Open: threshold reached within the window, calls are rejected
//!
//! There is no half-open trial call: the circuit closes when the counter's TTL
//! lapses or as soon as any worker's fetch succeeds.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::{BreakerConfig, BreakerLimits};
use crate::storage::traits::KvBackend;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for breaker-protected computations
#[derive(Debug, thiserror::Error)]
pub enum ComputeError<E> {
    /// Too many recent failures for this key; fetch was not called
    #[error("circuit open for '{key}', recomputation rejected")]
    CircuitOpen { key: String },

    /// The fetch function failed
    #[error("fetch failed: {0}")]
    Fetch(#[source] E),
}

impl<E> ComputeError<E> {
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// A named breaker backed by shared failure counters.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Backend key of the failure counter for `key`.
    #[must_use]
    pub fn counter_key(&self, key: &str) -> String {
        format!("{}{key}", self.config.key_prefix)
    }

    /// Current failure count for `key`.
    ///
    /// An unreadable counter counts as zero: the breaker must never turn
    /// a backend outage into a compute outage.
    pub async fn failure_count(&self, backend: &dyn KvBackend, key: &str) -> u64 {
        match backend.get(&self.counter_key(key)).await {
            Ok(Some(raw)) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                debug!(circuit = %self.name, key, error = %e, "Failure counter unreadable, treating circuit as closed");
                0
            }
        }
    }

    pub async fn state(&self, backend: &dyn KvBackend, key: &str) -> CircuitState {
        self.state_within(backend, key, self.config.limits()).await
    }

    pub async fn state_within(&self, backend: &dyn KvBackend, key: &str, limits: BreakerLimits) -> CircuitState {
        if self.failure_count(backend, key).await >= limits.max_failures {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Admit or reject a computation for `key` under the configured limits.
    pub async fn admit(&self, backend: Option<&dyn KvBackend>, key: &str) -> bool {
        self.admit_within(backend, key, self.config.limits()).await
    }

    /// Admit or reject a computation for `key`.
    ///
    /// Counts the call; a rejection also counts as one.
    pub async fn admit_within(&self, backend: Option<&dyn KvBackend>, key: &str, limits: BreakerLimits) -> bool {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let Some(backend) = backend else {
            return true;
        };
        if self.state_within(backend, key, limits).await == CircuitState::Open {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            warn!(circuit = %self.name, key, "Circuit open, rejecting recomputation");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return false;
        }
        true
    }

    /// A fetch for `key` succeeded: close the circuit.
    pub async fn record_success(&self, backend: Option<&dyn KvBackend>, key: &str) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "success");
        if let Some(backend) = backend {
            if let Err(e) = backend.delete(&self.counter_key(key)).await {
                debug!(circuit = %self.name, key, error = %e, "Failed to reset failure counter");
            }
        }
    }

    /// A fetch for `key` failed: bump the shared counter.
    pub async fn record_failure(&self, backend: Option<&dyn KvBackend>, key: &str) -> Option<i64> {
        self.record_failure_within(backend, key, self.config.limits()).await
    }

    /// Bump the shared counter, (re)starting its window.
    ///
    /// Returns the new count when the backend accepted the increment.
    pub async fn record_failure_within(
        &self,
        backend: Option<&dyn KvBackend>,
        key: &str,
        limits: BreakerLimits,
    ) -> Option<i64> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "failure");
        let backend = backend?;
        match backend
            .incr_with_expiry(&self.counter_key(key), limits.failure_window_secs)
            .await
        {
            Ok(count) => {
                if count.max(0) as u64 >= limits.max_failures {
                    warn!(circuit = %self.name, key, failures = count, "Circuit opened");
                } else {
                    debug!(circuit = %self.name, key, failures = count, "Compute failure recorded");
                }
                Some(count)
            }
            Err(e) => {
                warn!(circuit = %self.name, key, error = %e, "Failed to record compute failure");
                None
            }
        }
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful fetches
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed fetches
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Reset the process-local counters (shared state is untouched)
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}
