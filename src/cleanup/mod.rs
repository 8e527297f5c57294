// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background cleanup of aged, oversized and orphaned keys.
//!
//! A run makes four passes over the backend, one page at a time:
//!
//! 1. **Namespaces**: every configured pattern is scanned with its
//!    priority's page size. Keys without an expiry get the namespace
//!    default, keys living longer than `max_age_hours` are deleted, and
//!    large keys close to expiry are deleted early.
//! 2. **Orphans**: keys under the key prefix that match no namespace and
//!    expire within the hour are deleted.
//! 3. **Memory pressure**: above the pressure threshold, low-priority
//!    namespaces have their remaining TTLs halved (never below the floor).
//! 4. **TTL distribution**: a sample of remaining TTLs is bucketed and
//!    buckets holding a large share are reported. Nothing is changed.
//!
//! The cancel signal is checked before every page. A cancelled run still
//! reports what it did.
//!
//! ```rust,no_run
//! # use cache_engine::{CacheEngineConfig, TaggedCache};
//! # async fn example(cache: TaggedCache) {
//! let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
//! let report = cache.run_cleanup(cancel_rx).await;
//! println!("{} keys reclaimed, {} bytes", report.stats.deleted(), report.stats.bytes_freed);
//! # drop(cancel_tx);
//! # }
//! ```

pub mod policy;
pub mod report;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CleanupConfig, TtlDefaults};
use crate::metrics;
use crate::pattern::glob_match;
use crate::storage::traits::{KvBackend, PipelineOp, PipelineReply, StorageError, TtlStatus};

use policy::{classify, herd_risks, is_reclaimable_orphan, pressure_ttl, KeyAction, NamespacePolicy, Priority};
use report::{CleanupReport, CleanupStats, CleanupStatus};

/// Page size for passes not tied to a namespace.
const SWEEP_PAGE_SIZE: usize = 100;

/// The cancel signal fired.
struct Cancelled;

/// What a page lookup learned about one key.
struct KeyInfo {
    key: String,
    ttl: TtlStatus,
    size: Option<u64>,
}

/// Runs cleanup passes against a backend.
#[derive(Clone)]
pub struct CleanupEngine {
    backend: Option<Arc<dyn KvBackend>>,
    config: CleanupConfig,
    ttl_defaults: TtlDefaults,
    key_prefix: String,
}

impl CleanupEngine {
    pub fn new(
        backend: Option<Arc<dyn KvBackend>>,
        config: CleanupConfig,
        ttl_defaults: TtlDefaults,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            config,
            ttl_defaults,
            key_prefix: key_prefix.into(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Run every pass once.
    ///
    /// Never fails: backend errors are counted in the report and the run
    /// moves on to the next page or pass.
    #[tracing::instrument(skip(self, cancel), fields(prefix = %self.key_prefix))]
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> CleanupReport {
        let start = Instant::now();
        let Some(backend) = self.backend.as_deref() else {
            debug!("Cleanup skipped, cache disabled");
            metrics::record_cleanup_run(CleanupStatus::BackendUnavailable.as_str(), start.elapsed(), 0);
            return CleanupReport::unavailable();
        };
        if !matches!(backend.ping().await, Ok(true)) {
            warn!(backend = backend.name(), "Cleanup skipped, backend not answering");
            metrics::record_cleanup_run(CleanupStatus::BackendUnavailable.as_str(), start.elapsed(), 0);
            return CleanupReport::unavailable();
        }

        let mut stats = CleanupStats::new(self.config.max_errors);
        let memory_pressure = match backend.memory_info().await {
            Ok(info) => info.map(|m| m.pressure()),
            Err(e) => {
                stats.record_error(format!("memory info: {e}"));
                None
            }
        };

        let mut ttl_sample = Vec::new();
        let outcome = self
            .run_passes(backend, &cancel, &mut stats, memory_pressure, &mut ttl_sample)
            .await;
        let status = match outcome {
            Ok(()) => CleanupStatus::Completed,
            Err(Cancelled) => CleanupStatus::Cancelled,
        };

        let risks = herd_risks(
            &ttl_sample,
            self.config.herd_bucket_secs,
            self.config.herd_fraction_threshold,
            self.config.herd_min_sample,
        );
        for risk in &risks {
            warn!(
                bucket_start_secs = risk.bucket_start_secs,
                bucket_end_secs = risk.bucket_end_secs,
                keys = risk.keys,
                fraction = risk.fraction,
                "Clustered expiries, thundering herd risk"
            );
        }

        let elapsed = start.elapsed();
        let recommendations = self.recommendations(&stats, elapsed, memory_pressure, risks.len());
        let secs = elapsed.as_secs_f64();
        let keys_per_second = if secs > 0.0 { stats.scanned as f64 / secs } else { 0.0 };

        record_metrics(status, elapsed, &stats);
        info!(
            status = %status,
            scanned = stats.scanned,
            expired = stats.expired,
            stale_too_old = stats.stale_too_old,
            stale_large_cold = stats.stale_large_cold,
            orphaned = stats.orphaned,
            ttl_updated = stats.ttl_updated,
            ttl_reduced = stats.ttl_reduced,
            bytes_freed = stats.bytes_freed,
            errors = stats.error_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cleanup finished"
        );

        CleanupReport {
            status,
            stats,
            elapsed_ms: elapsed.as_millis() as u64,
            keys_per_second,
            memory_pressure,
            herd_risks: risks,
            sampled_keys: ttl_sample.len(),
            recommendations,
        }
    }

    async fn run_passes(
        &self,
        backend: &dyn KvBackend,
        cancel: &watch::Receiver<bool>,
        stats: &mut CleanupStats,
        memory_pressure: Option<f64>,
        ttl_sample: &mut Vec<u64>,
    ) -> Result<(), Cancelled> {
        for policy in &self.config.namespaces {
            self.sweep_namespace(backend, cancel, stats, policy).await?;
        }
        self.sweep_orphans(backend, cancel, stats).await?;

        if let Some(pressure) = memory_pressure.filter(|p| *p > self.config.memory_pressure_threshold) {
            warn!(pressure, "Memory pressure high, shortening low-priority TTLs");
            for policy in self.config.namespaces.iter().filter(|p| p.priority == Priority::Low) {
                self.relieve_pressure(backend, cancel, stats, policy).await?;
            }
        }

        self.sample_ttls(backend, cancel, stats, ttl_sample).await
    }

    /// Pass 1 for one namespace.
    async fn sweep_namespace(
        &self,
        backend: &dyn KvBackend,
        cancel: &watch::Receiver<bool>,
        stats: &mut CleanupStats,
        policy: &NamespacePolicy,
    ) -> Result<(), Cancelled> {
        let mut cursor = 0;
        loop {
            check_cancel(cancel)?;
            let Some((keys, next)) = scan_page(backend, &policy.pattern, cursor, policy.priority.page_size(), stats).await
            else {
                return Ok(());
            };

            let infos = inspect(backend, &keys, true, stats).await;
            let mut ops = Vec::new();
            let mut planned = Vec::new();
            for info in infos {
                stats.scanned += 1;
                stats.namespace(&policy.pattern).scanned += 1;
                let default_ttl = self.ttl_defaults.ttl_for(&info.key);
                let action = classify(info.ttl, info.size, policy, self.config.large_key_bytes, default_ttl);
                match action {
                    KeyAction::Expired => {
                        stats.expired += 1;
                        stats.namespace(&policy.pattern).expired += 1;
                    }
                    KeyAction::AssignTtl(ttl) => {
                        ops.push(PipelineOp::expire(&info.key, ttl));
                        planned.push((action, info.size));
                    }
                    KeyAction::DeleteTooOld | KeyAction::DeleteLargeCold => {
                        ops.push(PipelineOp::delete(&info.key));
                        planned.push((action, info.size));
                    }
                    KeyAction::Keep => {}
                }
            }

            if !ops.is_empty() {
                match backend.pipeline(&ops).await {
                    Ok(replies) => {
                        for ((action, size), reply) in planned.into_iter().zip(replies) {
                            if reply.changed() {
                                apply_action(stats, &policy.pattern, action, size);
                            }
                        }
                    }
                    Err(e) => stats.record_error(format!("{}: {e}", policy.pattern)),
                }
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Pass 2: keys under the prefix that belong to no namespace.
    async fn sweep_orphans(
        &self,
        backend: &dyn KvBackend,
        cancel: &watch::Receiver<bool>,
        stats: &mut CleanupStats,
    ) -> Result<(), Cancelled> {
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor = 0;
        loop {
            check_cancel(cancel)?;
            let Some((keys, next)) = scan_page(backend, &pattern, cursor, SWEEP_PAGE_SIZE, stats).await else {
                return Ok(());
            };

            let orphans: Vec<String> = keys.into_iter().filter(|k| !self.in_namespace(k)).collect();
            let infos = inspect(backend, &orphans, true, stats).await;
            let (ops, sizes): (Vec<PipelineOp>, Vec<Option<u64>>) = infos
                .into_iter()
                .filter(|info| is_reclaimable_orphan(info.ttl, self.config.orphan_ttl_threshold_secs))
                .map(|info| (PipelineOp::delete(info.key), info.size))
                .unzip();

            if !ops.is_empty() {
                match backend.pipeline(&ops).await {
                    Ok(replies) => {
                        for (size, reply) in sizes.into_iter().zip(replies) {
                            if reply.changed() {
                                stats.orphaned += 1;
                                stats.bytes_freed += size.unwrap_or(0);
                            }
                        }
                    }
                    Err(e) => stats.record_error(format!("orphans: {e}")),
                }
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    fn in_namespace(&self, key: &str) -> bool {
        self.config.namespaces.iter().any(|p| glob_match(&p.pattern, key))
    }

    /// Pass 3 for one low-priority namespace.
    async fn relieve_pressure(
        &self,
        backend: &dyn KvBackend,
        cancel: &watch::Receiver<bool>,
        stats: &mut CleanupStats,
        policy: &NamespacePolicy,
    ) -> Result<(), Cancelled> {
        let mut cursor = 0;
        loop {
            check_cancel(cancel)?;
            let Some((keys, next)) = scan_page(backend, &policy.pattern, cursor, policy.priority.page_size(), stats).await
            else {
                return Ok(());
            };

            let ops: Vec<PipelineOp> = inspect(backend, &keys, false, stats)
                .await
                .into_iter()
                .filter_map(|info| {
                    let reduced = pressure_ttl(info.ttl.remaining_secs()?, self.config.pressure_ttl_floor_secs)?;
                    Some(PipelineOp::expire(info.key, reduced))
                })
                .collect();

            if !ops.is_empty() {
                match backend.pipeline(&ops).await {
                    Ok(replies) => {
                        let reduced = replies.iter().filter(|r| r.changed()).count() as u64;
                        stats.ttl_reduced += reduced;
                        stats.namespace(&policy.pattern).ttl_reduced += reduced;
                    }
                    Err(e) => stats.record_error(format!("pressure {}: {e}", policy.pattern)),
                }
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Pass 4: collect remaining TTLs for the distribution check.
    async fn sample_ttls(
        &self,
        backend: &dyn KvBackend,
        cancel: &watch::Receiver<bool>,
        stats: &mut CleanupStats,
        sample: &mut Vec<u64>,
    ) -> Result<(), Cancelled> {
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor = 0;
        while sample.len() < self.config.herd_sample_size {
            check_cancel(cancel)?;
            let Some((mut keys, next)) = scan_page(backend, &pattern, cursor, SWEEP_PAGE_SIZE, stats).await else {
                return Ok(());
            };
            keys.truncate(self.config.herd_sample_size - sample.len());

            sample.extend(
                inspect(backend, &keys, false, stats)
                    .await
                    .into_iter()
                    .filter_map(|info| info.ttl.remaining_secs()),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    fn recommendations(
        &self,
        stats: &CleanupStats,
        elapsed: Duration,
        memory_pressure: Option<f64>,
        herd_buckets: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if stats.orphaned > self.config.orphan_alert_threshold {
            out.push(format!(
                "{} orphaned keys removed; add namespace policies for their key patterns",
                stats.orphaned
            ));
        }
        if stats.error_count > self.config.max_errors as u64 {
            out.push(format!("{} errors during cleanup; check backend health", stats.error_count));
        }
        if elapsed.as_secs() > self.config.time_budget_secs {
            out.push(format!(
                "Cleanup took {}s (budget {}s); run it more often or narrow the namespaces",
                elapsed.as_secs(),
                self.config.time_budget_secs
            ));
        }
        if let Some(pressure) = memory_pressure.filter(|p| *p > self.config.memory_pressure_threshold) {
            out.push(format!(
                "Memory pressure at {:.0}%; raise maxmemory or shorten TTLs",
                pressure * 100.0
            ));
        }
        if herd_buckets > 0 {
            out.push(format!(
                "{herd_buckets} TTL bucket(s) hold clustered expiries; add jitter to TTLs at write time"
            ));
        }
        if stats.ttl_updated > self.config.no_expiry_alert_threshold {
            out.push(format!(
                "{} keys had no expiry; set TTLs when writing them",
                stats.ttl_updated
            ));
        }
        out
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), Cancelled> {
    if *cancel.borrow() {
        return Err(Cancelled);
    }
    Ok(())
}

/// One scan page, or `None` (error recorded) if the scan failed.
async fn scan_page(
    backend: &dyn KvBackend,
    pattern: &str,
    cursor: u64,
    page_size: usize,
    stats: &mut CleanupStats,
) -> Option<(Vec<String>, u64)> {
    match backend.scan(pattern, cursor, page_size).await {
        Ok(page) => Some(page),
        Err(e) => {
            stats.record_error(format!("scan {pattern}: {e}"));
            None
        }
    }
}

/// Pipeline `TTL` (and optionally `MEMORY USAGE`) for a page of keys.
async fn inspect(backend: &dyn KvBackend, keys: &[String], with_size: bool, stats: &mut CleanupStats) -> Vec<KeyInfo> {
    if keys.is_empty() {
        return Vec::new();
    }
    let per_key = if with_size { 2 } else { 1 };
    let mut ops = Vec::with_capacity(keys.len() * per_key);
    for key in keys {
        ops.push(PipelineOp::ttl(key));
        if with_size {
            ops.push(PipelineOp::memory_usage(key));
        }
    }

    let replies = match backend.pipeline(&ops).await {
        Ok(replies) => replies,
        Err(e) => {
            stats.record_error(format!("inspect: {e}"));
            return Vec::new();
        }
    };

    let mut infos = Vec::with_capacity(keys.len());
    for (key, chunk) in keys.iter().zip(replies.chunks(per_key)) {
        match parse_info(chunk) {
            Ok((ttl, size)) => infos.push(KeyInfo { key: key.clone(), ttl, size }),
            Err(e) => stats.record_error(format!("{key}: {e}")),
        }
    }
    infos
}

fn parse_info(chunk: &[PipelineReply]) -> Result<(TtlStatus, Option<u64>), StorageError> {
    let ttl = match chunk.first() {
        Some(PipelineReply::Ttl(ttl)) => *ttl,
        other => {
            return Err(StorageError::Protocol {
                command: "TTL",
                detail: format!("unexpected reply {other:?}"),
            })
        }
    };
    let size = match chunk.get(1) {
        Some(PipelineReply::Size(size)) => *size,
        _ => None,
    };
    Ok((ttl, size))
}

fn apply_action(stats: &mut CleanupStats, pattern: &str, action: KeyAction, size: Option<u64>) {
    let freed = if action.is_delete() { size.unwrap_or(0) } else { 0 };
    stats.bytes_freed += freed;
    match action {
        KeyAction::AssignTtl(_) => stats.ttl_updated += 1,
        KeyAction::DeleteTooOld => stats.stale_too_old += 1,
        KeyAction::DeleteLargeCold => stats.stale_large_cold += 1,
        KeyAction::Expired | KeyAction::Keep => {}
    }

    let ns = stats.namespace(pattern);
    ns.bytes_freed += freed;
    match action {
        KeyAction::AssignTtl(_) => ns.ttl_updated += 1,
        KeyAction::DeleteTooOld => ns.stale_too_old += 1,
        KeyAction::DeleteLargeCold => ns.stale_large_cold += 1,
        KeyAction::Expired | KeyAction::Keep => {}
    }
}

fn record_metrics(status: CleanupStatus, elapsed: Duration, stats: &CleanupStats) {
    metrics::record_cleanup_keys("expired", stats.expired);
    metrics::record_cleanup_keys("stale_too_old", stats.stale_too_old);
    metrics::record_cleanup_keys("stale_large_cold", stats.stale_large_cold);
    metrics::record_cleanup_keys("orphaned", stats.orphaned);
    metrics::record_cleanup_keys("ttl_updated", stats.ttl_updated);
    metrics::record_cleanup_keys("ttl_reduced", stats.ttl_reduced);
    metrics::record_cleanup_run(status.as_str(), elapsed, stats.bytes_freed);
}
