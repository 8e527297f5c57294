// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend adapter contract.
//!
//! The engine never talks to Redis (or anything else) directly. Everything
//! goes through [`KvBackend`], a deliberately small key-value surface:
//! strings with TTLs, sets for the tag index, a cursor scan, and a
//! pipeline for batching many commands into one round trip.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend is not configured or cannot be reached.
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Reply shape did not match the command that was sent.
    #[error("Unexpected backend reply for {command}: {detail}")]
    Protocol {
        command: &'static str,
        detail: String,
    },
}

/// Remaining lifetime of a key as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist (Redis `TTL` → -2)
    Absent,
    /// Key exists without an expiry (Redis `TTL` → -1)
    NoExpiry,
    /// Seconds until the key expires
    Remaining(u64),
}

impl TtlStatus {
    /// Decode a raw Redis `TTL` reply.
    #[must_use]
    pub fn from_redis(raw: i64) -> Self {
        match raw {
            -1 => Self::NoExpiry,
            n if n < 0 => Self::Absent,
            n => Self::Remaining(n as u64),
        }
    }

    #[must_use]
    pub fn remaining_secs(self) -> Option<u64> {
        match self {
            Self::Remaining(secs) => Some(secs),
            _ => None,
        }
    }
}

/// Backend memory usage (Redis `INFO memory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl MemoryInfo {
    /// used / max, or 0.0 when the backend has no memory limit.
    #[must_use]
    pub fn pressure(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.max_bytes as f64
    }
}

/// A single command inside a pipeline.
///
/// A TTL of `0` on [`PipelineOp::Set`] stores the value without expiry.
/// On [`PipelineOp::SetAddExtend`] it makes the set persistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    Set { key: String, value: Vec<u8>, ttl_secs: u64 },
    Delete { key: String },
    Expire { key: String, ttl_secs: u64 },
    SetAdd { key: String, member: String },
    /// `SADD`, then raise the set's lifetime to at least `ttl_secs`.
    /// Never shortens it, and never adds an expiry to a set without one.
    SetAddExtend { key: String, member: String, ttl_secs: u64 },
    SetRemove { key: String, member: String },
    Get { key: String },
    Ttl { key: String },
    MemoryUsage { key: String },
}

impl PipelineOp {
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn expire(key: impl Into<String>, ttl_secs: u64) -> Self {
        Self::Expire { key: key.into(), ttl_secs }
    }

    pub fn ttl(key: impl Into<String>) -> Self {
        Self::Ttl { key: key.into() }
    }

    pub fn memory_usage(key: impl Into<String>) -> Self {
        Self::MemoryUsage { key: key.into() }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    /// Command name (for logs and protocol errors).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "SET",
            Self::Delete { .. } => "DEL",
            Self::Expire { .. } => "EXPIRE",
            Self::SetAdd { .. } => "SADD",
            Self::SetAddExtend { .. } => "SADD EXTEND",
            Self::SetRemove { .. } => "SREM",
            Self::Get { .. } => "GET",
            Self::Ttl { .. } => "TTL",
            Self::MemoryUsage { .. } => "MEMORY USAGE",
        }
    }
}

/// Reply to a [`PipelineOp`], in the same position as the op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineReply {
    /// `SET` acknowledged
    Done,
    /// `DEL`, `EXPIRE`, `SADD`, `SREM`: whether anything changed
    /// (for `SADD EXTEND`, whether the member was new)
    Changed(bool),
    Value(Option<Vec<u8>>),
    Ttl(TtlStatus),
    /// Memory footprint in bytes, `None` if the key is gone or the
    /// backend cannot tell
    Size(Option<u64>),
}

impl PipelineReply {
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed(true))
    }
}

/// Generic key-value backend used by the cache and the cleanup engine.
///
/// Implementations must be safe to share between tasks. No operation is
/// expected to be atomic with any other; pipelines only save round trips.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value. `ttl_secs == 0` means no expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError>;

    /// Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// One page of a cursor scan. A returned cursor of `0` ends the scan.
    async fn scan(&self, pattern: &str, cursor: u64, page_size: usize) -> Result<(Vec<String>, u64), StorageError>;

    async fn ttl(&self, key: &str) -> Result<TtlStatus, StorageError>;

    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError>;

    /// Atomically increment an integer key and (re)set its expiry.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError>;

    /// Members of a set key (empty when absent).
    async fn members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Execute many commands in one round trip. Replies line up with `ops`.
    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<Vec<PipelineReply>, StorageError>;

    /// Memory usage, if the backend exposes it.
    async fn memory_info(&self) -> Result<Option<MemoryInfo>, StorageError> {
        Ok(None)
    }

    async fn ping(&self) -> Result<bool, StorageError>;

    /// Short backend name for logs and metrics labels.
    fn name(&self) -> &'static str;
}
