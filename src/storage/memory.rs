// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backend.
//!
//! A `DashMap`-backed stand-in for Redis with the same TTL, set and scan
//! semantics. Expired keys are dropped lazily on access, so a key past its
//! deadline is indistinguishable from one that was never written.
//!
//! Used by the test-suite and by single-process deployments that want the
//! engine's policy layer without running Redis.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{KvBackend, MemoryInfo, PipelineOp, PipelineReply, StorageError, TtlStatus};
use crate::pattern::glob_match;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Members(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn footprint(&self, key: &str) -> u64 {
        let value = match &self.value {
            Value::Bytes(bytes) => bytes.len(),
            Value::Members(members) => members.iter().map(String::len).sum(),
        };
        (key.len() + value) as u64
    }
}

/// Open scans kept at once; starting another drops the least recent.
const MAX_OPEN_SCANS: usize = 32;
/// A scan not continued for this long is dropped.
const SCAN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keys an unfinished scan has yet to visit.
#[derive(Debug)]
struct PendingScan {
    keys: Vec<String>,
    touched: Instant,
}

fn deadline(ttl_secs: u64) -> Option<Instant> {
    (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs))
}

pub struct InMemoryBackend {
    data: DashMap<String, Slot>,
    /// Memory limit reported by `memory_info` (0 = unlimited)
    max_bytes: u64,
    /// Fixed memory reading, for simulating pressure
    memory_override: RwLock<Option<MemoryInfo>>,
    /// Keys still to visit, by scan cursor
    scans: DashMap<u64, PendingScan>,
    next_cursor: AtomicU64,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory_limit(0)
    }

    /// Report `max_bytes` as the memory limit in [`KvBackend::memory_info`].
    #[must_use]
    pub fn with_memory_limit(max_bytes: u64) -> Self {
        Self {
            data: DashMap::new(),
            max_bytes,
            memory_override: RwLock::new(None),
            scans: DashMap::new(),
            next_cursor: AtomicU64::new(1),
        }
    }

    /// Pin the memory reading regardless of actual contents.
    pub fn set_memory_info(&self, info: Option<MemoryInfo>) {
        *self.memory_override.write() = info;
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn live(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        let slot = self.data.get(key).map(|r| r.value().clone())?;
        if slot.is_expired(now) {
            self.data.remove_if(key, |_, s| s.is_expired(now));
            return None;
        }
        Some(slot)
    }

    fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot { value: Value::Bytes(bytes), .. }) => Ok(Some(bytes)),
            Some(_) => Err(wrong_type("GET", key)),
        }
    }

    fn write_bytes(&self, key: &str, value: &[u8], ttl_secs: u64) {
        self.data.insert(
            key.to_string(),
            Slot { value: Value::Bytes(value.to_vec()), expires_at: deadline(ttl_secs) },
        );
    }

    fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.data.remove(key) {
            Some((_, slot)) => !slot.is_expired(now),
            None => false,
        }
    }

    fn ttl_of(&self, key: &str) -> TtlStatus {
        match self.live(key) {
            None => TtlStatus::Absent,
            Some(Slot { expires_at: None, .. }) => TtlStatus::NoExpiry,
            Some(Slot { expires_at: Some(at), .. }) => {
                TtlStatus::Remaining(at.saturating_duration_since(Instant::now()).as_secs())
            }
        }
    }

    fn set_expiry(&self, key: &str, ttl_secs: u64) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        match self.data.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = deadline(ttl_secs);
                true
            }
            None => false,
        }
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        // Drop an expired slot first so the set starts fresh
        let _ = self.live(key);
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Members(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Members(members) => Ok(members.insert(member.to_string())),
            Value::Bytes(_) => Err(wrong_type("SADD", key)),
        }
    }

    fn set_add_extend(&self, key: &str, member: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let before = self.ttl_of(key);
        let added = self.set_add(key, member)?;
        let raise = ttl_secs == 0
            || match before {
                TtlStatus::Absent => true,
                TtlStatus::NoExpiry => false,
                TtlStatus::Remaining(current) => current < ttl_secs,
            };
        if raise {
            if let Some(mut slot) = self.data.get_mut(key) {
                slot.expires_at = deadline(ttl_secs);
            }
        }
        Ok(added)
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        let Some(mut slot) = self.data.get_mut(key) else {
            return Ok(false);
        };
        let removed = match &mut slot.value {
            Value::Members(members) => members.remove(member),
            Value::Bytes(_) => return Err(wrong_type("SREM", key)),
        };
        let now_empty = matches!(&slot.value, Value::Members(m) if m.is_empty());
        drop(slot);
        // Redis deletes a set once its last member is removed
        if now_empty {
            self.data.remove_if(key, |_, s| matches!(&s.value, Value::Members(m) if m.is_empty()));
        }
        Ok(removed)
    }

    /// Drop idle scans, then the least recent ones beyond the cap.
    fn reap_scans(&self) {
        let now = Instant::now();
        self.scans.retain(|_, scan| now.duration_since(scan.touched) < SCAN_IDLE_TIMEOUT);

        let excess = (self.scans.len() + 1).saturating_sub(MAX_OPEN_SCANS);
        if excess > 0 {
            let mut open: Vec<(u64, Instant)> = self.scans.iter().map(|e| (*e.key(), e.value().touched)).collect();
            open.sort_unstable_by_key(|(_, touched)| *touched);
            for (cursor, _) in open.into_iter().take(excess) {
                self.scans.remove(&cursor);
            }
        }
    }

    fn size_of(&self, key: &str) -> Option<u64> {
        self.live(key).map(|slot| slot.footprint(key))
    }

    fn apply(&self, op: &PipelineOp) -> Result<PipelineReply, StorageError> {
        Ok(match op {
            PipelineOp::Set { key, value, ttl_secs } => {
                self.write_bytes(key, value, *ttl_secs);
                PipelineReply::Done
            }
            PipelineOp::Delete { key } => PipelineReply::Changed(self.remove(key)),
            PipelineOp::Expire { key, ttl_secs } => PipelineReply::Changed(self.set_expiry(key, *ttl_secs)),
            PipelineOp::SetAdd { key, member } => PipelineReply::Changed(self.set_add(key, member)?),
            PipelineOp::SetAddExtend { key, member, ttl_secs } => {
                PipelineReply::Changed(self.set_add_extend(key, member, *ttl_secs)?)
            }
            PipelineOp::SetRemove { key, member } => PipelineReply::Changed(self.set_remove(key, member)?),
            PipelineOp::Get { key } => PipelineReply::Value(self.read_bytes(key)?),
            PipelineOp::Ttl { key } => PipelineReply::Ttl(self.ttl_of(key)),
            PipelineOp::MemoryUsage { key } => PipelineReply::Size(self.size_of(key)),
        })
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(command: &'static str, key: &str) -> StorageError {
    StorageError::Protocol {
        command,
        detail: format!("WRONGTYPE operation against key '{key}'"),
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_bytes(key)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        self.write_bytes(key, value, ttl_secs);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.remove(key))
    }

    async fn scan(&self, pattern: &str, cursor: u64, page_size: usize) -> Result<(Vec<String>, u64), StorageError> {
        // Each scan walks a sorted snapshot taken at cursor 0, so keys
        // deleted mid-scan never shift later pages
        let mut pending = if cursor == 0 {
            self.reap_scans();
            let now = Instant::now();
            let mut keys: Vec<String> = self
                .data
                .iter()
                .filter(|e| !e.value().is_expired(now))
                .map(|e| e.key().clone())
                .collect();
            keys.sort_unstable();
            keys
        } else {
            self.scans
                .remove(&cursor)
                .map(|(_, scan)| scan.keys)
                .ok_or_else(|| StorageError::Protocol {
                    command: "SCAN",
                    detail: format!("unknown cursor {cursor}"),
                })?
        };

        let rest = pending.split_off(page_size.max(1).min(pending.len()));
        let page = pending
            .into_iter()
            .filter(|k| glob_match(pattern, k) && self.live(k).is_some())
            .collect();
        let next = if rest.is_empty() {
            0
        } else {
            let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
            self.scans.insert(id, PendingScan { keys: rest, touched: Instant::now() });
            id
        };
        Ok((page, next))
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus, StorageError> {
        Ok(self.ttl_of(key))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        Ok(self.set_expiry(key, ttl_secs))
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError> {
        let current = match self.read_bytes(key)? {
            None => 0,
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| StorageError::Protocol {
                    command: "INCR",
                    detail: format!("value at '{key}' is not an integer"),
                })?,
        };
        let next = current + 1;
        self.write_bytes(key, next.to_string().as_bytes(), ttl_secs);
        Ok(next)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Slot { value: Value::Members(members), .. }) => Ok(members.into_iter().collect()),
            Some(_) => Err(wrong_type("SMEMBERS", key)),
        }
    }

    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<Vec<PipelineReply>, StorageError> {
        ops.iter().map(|op| self.apply(op)).collect()
    }

    async fn memory_info(&self) -> Result<Option<MemoryInfo>, StorageError> {
        if let Some(info) = *self.memory_override.read() {
            return Ok(Some(info));
        }
        if self.max_bytes == 0 {
            return Ok(None);
        }
        let now = Instant::now();
        let used_bytes = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.value().footprint(e.key()))
            .sum();
        Ok(Some(MemoryInfo { used_bytes, max_bytes: self.max_bytes }))
    }

    async fn ping(&self) -> Result<bool, StorageError> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
