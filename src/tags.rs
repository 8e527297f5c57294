// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag index: one backend set of keys per tag.
//!
//! Membership is maintained on explicit writes and deletes only. Entries
//! that simply expire stay listed until their tag set expires too, which
//! is why a tag set's lifetime is only ever raised: it outlives its
//! longest-lived entry by `buffer` seconds, and a member without expiry
//! makes the set persistent. A stale member costs one failed `DEL` on the next
//! invalidation and nothing else.

use crate::storage::traits::{KvBackend, PipelineOp, StorageError};

#[derive(Debug, Clone)]
pub struct TagIndex {
    prefix: String,
    buffer_secs: u64,
}

impl TagIndex {
    pub fn new(prefix: impl Into<String>, buffer_secs: u64) -> Self {
        Self {
            prefix: prefix.into(),
            buffer_secs,
        }
    }

    /// Backend key of a tag's set.
    #[must_use]
    pub fn set_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.prefix)
    }

    /// Lifetime of a tag set holding an entry with `entry_ttl_secs`.
    ///
    /// `0` (no expiry) stays `0`.
    #[must_use]
    pub fn set_ttl(&self, entry_ttl_secs: u64) -> u64 {
        if entry_ttl_secs == 0 {
            0
        } else {
            entry_ttl_secs.saturating_add(self.buffer_secs)
        }
    }

    /// Ops that add `key` to each tag set and extend the set's lifetime.
    ///
    /// A set never expires before any of its members.
    #[must_use]
    pub fn attach_ops(&self, key: &str, tags: &[String], entry_ttl_secs: u64) -> Vec<PipelineOp> {
        let ttl_secs = self.set_ttl(entry_ttl_secs);
        tags.iter()
            .map(|tag| PipelineOp::SetAddExtend {
                key: self.set_key(tag),
                member: key.to_string(),
                ttl_secs,
            })
            .collect()
    }

    /// Ops that remove `key` from each tag set.
    #[must_use]
    pub fn detach_ops<'a, I>(&self, key: &str, tags: I) -> Vec<PipelineOp>
    where
        I: IntoIterator<Item = &'a String>,
    {
        tags.into_iter()
            .map(|tag| PipelineOp::SetRemove { key: self.set_key(tag), member: key.to_string() })
            .collect()
    }

    /// Keys currently listed under `tag`.
    pub async fn members(&self, backend: &dyn KvBackend, tag: &str) -> Result<Vec<String>, StorageError> {
        backend.members(&self.set_key(tag)).await
    }
}
