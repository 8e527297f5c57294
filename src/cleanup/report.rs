// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cleanup run accounting.

use std::collections::BTreeMap;

use serde::Serialize;

use super::policy::HerdRisk;

/// How a cleanup run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    Completed,
    /// Stopped early by the cancel signal; counts cover the pages done
    Cancelled,
    /// No backend, or it did not answer a ping; nothing was touched
    BackendUnavailable,
}

impl CleanupStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}

impl std::fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts for one namespace pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub scanned: u64,
    pub expired: u64,
    pub stale_too_old: u64,
    pub stale_large_cold: u64,
    pub ttl_updated: u64,
    pub ttl_reduced: u64,
    pub bytes_freed: u64,
}

/// Accumulator for a cleanup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub scanned: u64,
    pub expired: u64,
    pub stale_too_old: u64,
    pub stale_large_cold: u64,
    pub orphaned: u64,
    pub ttl_updated: u64,
    pub ttl_reduced: u64,
    /// Sum of the backend-reported sizes of deleted keys
    pub bytes_freed: u64,
    /// Keyed by namespace pattern
    pub per_namespace: BTreeMap<String, NamespaceStats>,
    /// First `max_errors` error messages
    pub errors: Vec<String>,
    pub error_count: u64,
    #[serde(skip)]
    max_errors: usize,
}

impl CleanupStats {
    #[must_use]
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            ..Default::default()
        }
    }

    pub(crate) fn namespace(&mut self, pattern: &str) -> &mut NamespaceStats {
        self.per_namespace.entry(pattern.to_string()).or_default()
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        self.error_count += 1;
        if self.errors.len() < self.max_errors {
            self.errors.push(error.into());
        }
    }

    /// Keys deleted by any rule.
    #[must_use]
    pub fn deleted(&self) -> u64 {
        self.stale_too_old + self.stale_large_cold + self.orphaned
    }
}

/// Result of [`super::CleanupEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub status: CleanupStatus,
    pub stats: CleanupStats,
    pub elapsed_ms: u64,
    pub keys_per_second: f64,
    /// used/max at the start of the run, when the backend reports it
    pub memory_pressure: Option<f64>,
    pub herd_risks: Vec<HerdRisk>,
    /// Keys contributing to the TTL distribution check
    pub sampled_keys: usize,
    pub recommendations: Vec<String>,
}

impl CleanupReport {
    pub(crate) fn unavailable() -> Self {
        Self {
            status: CleanupStatus::BackendUnavailable,
            stats: CleanupStats::default(),
            elapsed_ms: 0,
            keys_per_second: 0.0,
            memory_pressure: None,
            herd_risks: Vec::new(),
            sampled_keys: 0,
            recommendations: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == CleanupStatus::Completed
    }
}
