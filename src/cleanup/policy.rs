// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Aging policies and the per-key decisions made from them.
//!
//! Everything here is pure: given what the backend reported about a key
//! (remaining TTL, footprint) and the namespace's policy, decide what to
//! do. The engine in [`super`] handles the I/O.

use serde::{Deserialize, Serialize};

use crate::storage::traits::TtlStatus;

const HOUR: u64 = 3600;

/// Scan priority of a namespace. Only affects page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Keys per scan page.
    #[must_use]
    pub fn page_size(self) -> usize {
        match self {
            Priority::High => 200,
            Priority::Medium => 150,
            Priority::Low => 100,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Aging policy for one namespace glob (e.g. `scope:player:*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    pub pattern: String,
    /// Keys with more remaining TTL than this are deleted
    pub max_age_hours: u64,
    /// Large keys with less remaining TTL than this are deleted
    pub stale_threshold_hours: u64,
    pub priority: Priority,
}

impl NamespacePolicy {
    pub fn new(pattern: impl Into<String>, max_age_hours: u64, stale_threshold_hours: u64, priority: Priority) -> Self {
        Self {
            pattern: pattern.into(),
            max_age_hours,
            stale_threshold_hours,
            priority,
        }
    }

    #[must_use]
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_hours.saturating_mul(HOUR)
    }

    #[must_use]
    pub fn stale_threshold_secs(&self) -> u64 {
        self.stale_threshold_hours.saturating_mul(HOUR)
    }
}

/// Namespaces shipped by default, keyed under `prefix`.
#[must_use]
pub fn default_namespaces(prefix: &str) -> Vec<NamespacePolicy> {
    vec![
        NamespacePolicy::new(format!("{prefix}player:*"), 72, 6, Priority::High),
        NamespacePolicy::new(format!("{prefix}leaderboard:*"), 96, 12, Priority::Medium),
        NamespacePolicy::new(format!("{prefix}guild:*"), 72, 6, Priority::Medium),
        NamespacePolicy::new(format!("{prefix}session:*"), 24, 2, Priority::Low),
        NamespacePolicy::new(format!("{prefix}shop:*"), 24, 2, Priority::Low),
        NamespacePolicy::new(format!("{prefix}temp:*"), 6, 1, Priority::Low),
    ]
}

/// What to do with a key inside a configured namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Already gone between scan and TTL query
    Expired,
    /// No expiry set: give it the namespace default
    AssignTtl(u64),
    /// Remaining TTL beyond the namespace's max age
    DeleteTooOld,
    /// Close to expiry and bigger than the size floor
    DeleteLargeCold,
    Keep,
}

impl KeyAction {
    #[must_use]
    pub fn is_delete(self) -> bool {
        matches!(self, Self::DeleteTooOld | Self::DeleteLargeCold)
    }
}

/// Classify a namespaced key.
///
/// `size` is the backend-reported footprint; unknown sizes never count
/// as large.
#[must_use]
pub fn classify(
    ttl: TtlStatus,
    size: Option<u64>,
    policy: &NamespacePolicy,
    large_key_bytes: u64,
    default_ttl_secs: u64,
) -> KeyAction {
    let remaining = match ttl {
        TtlStatus::Absent => return KeyAction::Expired,
        TtlStatus::NoExpiry => return KeyAction::AssignTtl(default_ttl_secs),
        TtlStatus::Remaining(secs) => secs,
    };

    if remaining > policy.max_age_secs() {
        return KeyAction::DeleteTooOld;
    }
    let large = size.is_some_and(|bytes| bytes > large_key_bytes);
    if remaining < policy.stale_threshold_secs() && large {
        return KeyAction::DeleteLargeCold;
    }
    KeyAction::Keep
}

/// Whether a key outside every namespace should be reclaimed.
///
/// Keys without an expiry are left alone; they are reported, not guessed at.
#[must_use]
pub fn is_reclaimable_orphan(ttl: TtlStatus, threshold_secs: u64) -> bool {
    matches!(ttl, TtlStatus::Remaining(secs) if secs < threshold_secs)
}

/// Halved TTL under memory pressure, floored at `floor_secs`.
///
/// `None` when the result would not shorten the key's life.
#[must_use]
pub fn pressure_ttl(remaining_secs: u64, floor_secs: u64) -> Option<u64> {
    let reduced = (remaining_secs / 2).max(floor_secs);
    (reduced < remaining_secs).then_some(reduced)
}

/// A TTL bucket holding a suspicious share of the sampled keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HerdRisk {
    pub bucket_start_secs: u64,
    pub bucket_end_secs: u64,
    pub keys: usize,
    /// Share of the sample in this bucket (0.0 - 1.0)
    pub fraction: f64,
}

/// Bucket remaining TTLs and report buckets above `max_fraction` of the sample.
///
/// Samples smaller than `min_sample` are too noisy to judge and yield nothing.
#[must_use]
pub fn herd_risks(ttls: &[u64], bucket_secs: u64, max_fraction: f64, min_sample: usize) -> Vec<HerdRisk> {
    if ttls.len() < min_sample.max(1) || bucket_secs == 0 {
        return Vec::new();
    }

    let mut buckets = std::collections::BTreeMap::<u64, usize>::new();
    for ttl in ttls {
        *buckets.entry(ttl / bucket_secs).or_default() += 1;
    }

    let total = ttls.len() as f64;
    buckets
        .into_iter()
        .filter_map(|(bucket, keys)| {
            let fraction = keys as f64 / total;
            (fraction > max_fraction).then(|| HerdRisk {
                bucket_start_secs: bucket * bucket_secs,
                bucket_end_secs: (bucket + 1) * bucket_secs,
                keys,
                fraction,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_policy() -> NamespacePolicy {
        NamespacePolicy::new("scope:temp:*", 6, 1, Priority::Low)
    }

    #[test]
    fn test_page_size_by_priority() {
        assert_eq!(Priority::High.page_size(), 200);
        assert_eq!(Priority::Medium.page_size(), 150);
        assert_eq!(Priority::Low.page_size(), 100);
    }

    #[test]
    fn test_priority_deserializes_lowercase() {
        let p: Priority = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(p, Priority::Medium);
    }

    #[test]
    fn test_classify_absent_and_no_expiry() {
        let policy = temp_policy();
        assert_eq!(classify(TtlStatus::Absent, None, &policy, 1024, 7200), KeyAction::Expired);
        assert_eq!(classify(TtlStatus::NoExpiry, Some(10), &policy, 1024, 7200), KeyAction::AssignTtl(7200));
    }

    #[test]
    fn test_classify_too_old() {
        let policy = temp_policy();
        let action = classify(TtlStatus::Remaining(7 * HOUR), Some(10), &policy, 1024, 7200);
        assert_eq!(action, KeyAction::DeleteTooOld);
        assert!(action.is_delete());
    }

    #[test]
    fn test_classify_large_and_cold() {
        let policy = temp_policy();
        assert_eq!(
            classify(TtlStatus::Remaining(600), Some(4096), &policy, 1024, 7200),
            KeyAction::DeleteLargeCold
        );
        // Cold but small
        assert_eq!(classify(TtlStatus::Remaining(600), Some(100), &policy, 1024, 7200), KeyAction::Keep);
        // Cold, size unknown
        assert_eq!(classify(TtlStatus::Remaining(600), None, &policy, 1024, 7200), KeyAction::Keep);
        // Large but warm
        assert_eq!(
            classify(TtlStatus::Remaining(3 * HOUR), Some(4096), &policy, 1024, 7200),
            KeyAction::Keep
        );
    }

    #[test]
    fn test_classify_boundaries_are_exclusive() {
        let policy = temp_policy();
        assert_eq!(classify(TtlStatus::Remaining(6 * HOUR), None, &policy, 1024, 0), KeyAction::Keep);
        assert_eq!(classify(TtlStatus::Remaining(HOUR), Some(5000), &policy, 1024, 0), KeyAction::Keep);
        assert_eq!(classify(TtlStatus::Remaining(100), Some(1024), &policy, 1024, 0), KeyAction::Keep);
    }

    #[test]
    fn test_orphan_threshold() {
        assert!(is_reclaimable_orphan(TtlStatus::Remaining(600), 3600));
        assert!(!is_reclaimable_orphan(TtlStatus::Remaining(7200), 3600));
        assert!(!is_reclaimable_orphan(TtlStatus::NoExpiry, 3600));
        assert!(!is_reclaimable_orphan(TtlStatus::Absent, 3600));
    }

    #[test]
    fn test_pressure_ttl_halves_with_floor() {
        assert_eq!(pressure_ttl(20_000, 1800), Some(10_000));
        assert_eq!(pressure_ttl(3000, 1800), Some(1800));
        assert_eq!(pressure_ttl(1800, 1800), None);
        assert_eq!(pressure_ttl(1000, 1800), None);
    }

    #[test]
    fn test_herd_risk_detects_cluster() {
        let mut ttls = vec![3600; 30];
        ttls.extend((0..10).map(|i| i * 1000));
        let risks = herd_risks(&ttls, 300, 0.25, 20);

        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].bucket_start_secs, 3600);
        assert_eq!(risks[0].bucket_end_secs, 3900);
        assert_eq!(risks[0].keys, 30);
        assert!(risks[0].fraction > 0.7);
    }

    #[test]
    fn test_herd_risk_ignores_spread_and_small_samples() {
        let spread: Vec<u64> = (0..100).map(|i| i * 300).collect();
        assert!(herd_risks(&spread, 300, 0.25, 20).is_empty());

        let tiny = vec![60; 5];
        assert!(herd_risks(&tiny, 300, 0.25, 20).is_empty());
    }

    #[test]
    fn test_default_namespaces_use_prefix() {
        let namespaces = default_namespaces("scope:");
        assert!(namespaces.iter().all(|n| n.pattern.starts_with("scope:")));
        let temp = namespaces.iter().find(|n| n.pattern == "scope:temp:*").unwrap();
        assert_eq!(temp.priority, Priority::Low);
        assert_eq!(temp.max_age_secs(), 6 * HOUR);
    }
}
