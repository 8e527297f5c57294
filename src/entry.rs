// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entry blob format.
//!
//! A stored value is either a **wrapped** entry written by this crate or a
//! **raw** value written by something else (older services, manual
//! `SET`s). The two are told apart by a 4-byte magic prefix that can never
//! start valid UTF-8, so no JSON or text value is ever mistaken for a
//! wrapped entry.
//!
//! ```text
//! ┌───────────┬──────────────────┬────────────────┬─────────────────────┐
//! │ magic (4) │ header len (u32) │ header (JSON)  │ payload             │
//! │ CA C4 E0 01│ big-endian       │ tags, version, │ JSON value, zstd    │
//! │           │                  │ created_at,    │ compressed when the │
//! │           │                  │ ttl, compressed│ header says so      │
//! └───────────┴──────────────────┴────────────────┴─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use cache_engine::entry::{Entry, EntryCodec};
//! use cache_engine::CompressMode;
//!
//! let codec = EntryCodec::new(1024, 3);
//! let encoded = codec
//!     .encode(br#"{"atk":100}"#.to_vec(), &["player:42".to_string()], 1, 1800, CompressMode::Auto)
//!     .unwrap();
//! assert!(!encoded.compressed);
//!
//! match codec.decode(&encoded.blob).unwrap() {
//!     Entry::Wrapped(entry) => assert_eq!(entry.tags, vec!["player:42"]),
//!     Entry::Raw(_) => unreachable!(),
//! }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::{self, CompressionError, CompressionStats};
use crate::set_options::CompressMode;

/// Discriminant of a wrapped entry. `0xCA 0xC4` is not valid UTF-8.
pub const ENTRY_MAGIC: [u8; 4] = [0xCA, 0xC4, 0xE0, 0x01];

const LEN_BYTES: usize = 4;
const PREAMBLE: usize = ENTRY_MAGIC.len() + LEN_BYTES;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("entry truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("invalid entry header: {0}")]
    Header(#[source] serde_json::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("invalid payload: {0}")]
    Payload(#[source] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    #[serde(default)]
    tags: Vec<String>,
    version: u64,
    /// Epoch millis
    created_at: u64,
    ttl: u64,
    compressed: bool,
}

/// A decoded wrapped entry. `payload` is always decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub tags: Vec<String>,
    /// Write counter; informational, never checked on read
    pub version: u64,
    pub created_at_ms: u64,
    pub declared_ttl_secs: u64,
    /// Whether the stored payload was compressed
    pub compressed: bool,
}

/// Result of decoding a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Wrapped(CacheEntry),
    /// Bytes without the entry magic, returned as stored
    Raw(Vec<u8>),
}

impl Entry {
    /// Tags of a wrapped entry; raw values have none.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        match self {
            Entry::Wrapped(entry) => &entry.tags,
            Entry::Raw(_) => &[],
        }
    }

    /// Deserialize the inner value.
    ///
    /// Raw bytes are parsed as JSON first; bytes that are not JSON but
    /// are valid UTF-8 are treated as a bare string.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Entry::Wrapped(entry) => serde_json::from_slice(&entry.payload).map_err(CodecError::Payload),
            Entry::Raw(bytes) => raw_value(bytes),
        }
    }
}

fn raw_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(json_err) => match std::str::from_utf8(bytes) {
            Ok(text) => serde_json::from_value(serde_json::Value::String(text.to_owned()))
                .map_err(|_| CodecError::Payload(json_err)),
            Err(_) => Err(CodecError::Payload(json_err)),
        },
    }
}

/// An encoded blob ready to store.
#[derive(Debug, Clone)]
pub struct EncodedEntry {
    pub blob: Vec<u8>,
    pub compressed: bool,
    /// Present when compression ran
    pub stats: Option<CompressionStats>,
}

/// Encodes and decodes entry blobs.
#[derive(Debug, Clone)]
pub struct EntryCodec {
    threshold: usize,
    level: i32,
}

impl EntryCodec {
    #[must_use]
    pub fn new(threshold: usize, level: i32) -> Self {
        Self { threshold, level }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether a payload of `len` bytes gets compressed under `mode`.
    #[must_use]
    pub fn should_compress(&self, len: usize, mode: CompressMode) -> bool {
        match mode {
            CompressMode::Always => true,
            CompressMode::Never => false,
            CompressMode::Auto => len > self.threshold,
        }
    }

    /// Wrap a serialized payload and its metadata into one blob.
    pub fn encode(
        &self,
        payload: Vec<u8>,
        tags: &[String],
        version: u64,
        ttl_secs: u64,
        mode: CompressMode,
    ) -> Result<EncodedEntry, CodecError> {
        let compressed = self.should_compress(payload.len(), mode);
        let (body, stats) = if compressed {
            let packed = compression::compress(&payload, self.level)?;
            let stats = CompressionStats::new(payload.len(), packed.len());
            (packed, Some(stats))
        } else {
            (payload, None)
        };

        let header = EntryHeader {
            tags: tags.to_vec(),
            version,
            created_at: now_millis(),
            ttl: ttl_secs,
            compressed,
        };
        let header = serde_json::to_vec(&header).map_err(CodecError::Header)?;
        let header_len = u32::try_from(header.len()).map_err(|_| CodecError::Truncated {
            needed: header.len(),
            actual: u32::MAX as usize,
        })?;

        let mut blob = Vec::with_capacity(PREAMBLE + header.len() + body.len());
        blob.extend_from_slice(&ENTRY_MAGIC);
        blob.extend_from_slice(&header_len.to_be_bytes());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&body);

        Ok(EncodedEntry { blob, compressed, stats })
    }

    /// Decode a stored blob, decompressing the payload if flagged.
    pub fn decode(&self, blob: &[u8]) -> Result<Entry, CodecError> {
        let Some((header, body)) = split(blob)? else {
            return Ok(Entry::Raw(blob.to_vec()));
        };

        let payload = if header.compressed {
            compression::decompress(body)?
        } else {
            body.to_vec()
        };

        Ok(Entry::Wrapped(CacheEntry {
            payload,
            tags: header.tags,
            version: header.version,
            created_at_ms: header.created_at,
            declared_ttl_secs: header.ttl,
            compressed: header.compressed,
        }))
    }

    /// Tags of a stored blob, reading only the header.
    ///
    /// Raw and unreadable blobs have no tags.
    #[must_use]
    pub fn read_tags(&self, blob: &[u8]) -> Vec<String> {
        match split(blob) {
            Ok(Some((header, _))) => header.tags,
            _ => Vec::new(),
        }
    }
}

/// Split a wrapped blob into header and body; `None` for raw bytes.
fn split(blob: &[u8]) -> Result<Option<(EntryHeader, &[u8])>, CodecError> {
    if !blob.starts_with(&ENTRY_MAGIC) {
        return Ok(None);
    }
    if blob.len() < PREAMBLE {
        return Err(CodecError::Truncated { needed: PREAMBLE, actual: blob.len() });
    }

    let mut len = [0u8; LEN_BYTES];
    len.copy_from_slice(&blob[ENTRY_MAGIC.len()..PREAMBLE]);
    let header_len = u32::from_be_bytes(len) as usize;
    let header_end = PREAMBLE.saturating_add(header_len);
    if blob.len() < header_end {
        return Err(CodecError::Truncated { needed: header_end, actual: blob.len() });
    }

    let header: EntryHeader = serde_json::from_slice(&blob[PREAMBLE..header_end]).map_err(CodecError::Header)?;
    Ok(Some((header, &blob[header_end..])))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn codec() -> EntryCodec {
        EntryCodec::new(1024, 3)
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_small_payload_is_not_compressed() {
        let payload = serde_json::to_vec(&json!({"atk": 100})).unwrap();
        let encoded = codec().encode(payload.clone(), &[], 1, 60, CompressMode::Auto).unwrap();
        assert!(!encoded.compressed);
        assert!(encoded.stats.is_none());

        let Entry::Wrapped(entry) = codec().decode(&encoded.blob).unwrap() else {
            panic!("expected wrapped entry");
        };
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.version, 1);
        assert_eq!(entry.declared_ttl_secs, 60);
        assert!(entry.created_at_ms > 0);
    }

    #[test]
    fn test_large_payload_is_compressed_transparently() {
        let rows: Vec<Value> = (0..100).map(|i| json!({"rank": i, "score": 1000 - i})).collect();
        let payload = serde_json::to_vec(&rows).unwrap();
        assert!(payload.len() > 1024);

        let encoded = codec().encode(payload.clone(), &tags(&["global"]), 3, 600, CompressMode::Auto).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.blob.len() < payload.len());
        assert!(encoded.stats.unwrap().savings > 0.0);

        let entry = codec().decode(&encoded.blob).unwrap();
        let decoded: Vec<Value> = entry.value().unwrap();
        assert_eq!(decoded, rows);
        assert_eq!(entry.tags(), &["global".to_string()]);
    }

    #[test]
    fn test_compress_mode_overrides_threshold() {
        let small = b"[1,2,3]".to_vec();
        let forced = codec().encode(small.clone(), &[], 1, 0, CompressMode::Always).unwrap();
        assert!(forced.compressed);
        assert_eq!(codec().decode(&forced.blob).unwrap().value::<Vec<u32>>().unwrap(), vec![1, 2, 3]);

        let big = vec![b'7'; 4096];
        let never = codec().encode(big, &[], 1, 0, CompressMode::Never).unwrap();
        assert!(!never.compressed);
    }

    #[test]
    fn test_raw_json_value() {
        let entry = codec().decode(br#"{"legacy":true}"#).unwrap();
        assert!(matches!(entry, Entry::Raw(_)));
        assert!(entry.tags().is_empty());
        assert_eq!(entry.value::<Value>().unwrap(), json!({"legacy": true}));
    }

    #[test]
    fn test_raw_text_value_becomes_string() {
        let entry = codec().decode(b"plain text").unwrap();
        assert_eq!(entry.value::<String>().unwrap(), "plain text");
        assert_eq!(entry.value::<Value>().unwrap(), json!("plain text"));
    }

    #[test]
    fn test_raw_binary_is_a_payload_error() {
        let entry = codec().decode(&[0xFF, 0xFE, 0x00]).unwrap();
        assert!(matches!(entry.value::<Value>(), Err(CodecError::Payload(_))));
    }

    #[test]
    fn test_truncated_blobs() {
        let mut blob = ENTRY_MAGIC.to_vec();
        blob.push(0);
        assert!(matches!(codec().decode(&blob), Err(CodecError::Truncated { .. })));

        let mut blob = ENTRY_MAGIC.to_vec();
        blob.extend_from_slice(&100u32.to_be_bytes());
        blob.extend_from_slice(b"{}");
        assert!(matches!(codec().decode(&blob), Err(CodecError::Truncated { needed: 108, .. })));
    }

    #[test]
    fn test_corrupt_header() {
        let mut blob = ENTRY_MAGIC.to_vec();
        blob.extend_from_slice(&3u32.to_be_bytes());
        blob.extend_from_slice(b"xyz");
        assert!(matches!(codec().decode(&blob), Err(CodecError::Header(_))));
        assert!(codec().read_tags(&blob).is_empty());
    }

    #[test]
    fn test_corrupt_compressed_body() {
        let encoded = codec().encode(vec![b'a'; 2000], &[], 1, 0, CompressMode::Auto).unwrap();
        let mut blob = encoded.blob;
        let len = blob.len();
        blob.truncate(len - 10);
        assert!(matches!(codec().decode(&blob), Err(CodecError::Compression(_))));
    }

    #[test]
    fn test_read_tags_skips_payload() {
        let encoded = codec()
            .encode(vec![b'x'; 5000], &tags(&["player:42", "combat:42"]), 2, 1800, CompressMode::Auto)
            .unwrap();
        assert_eq!(codec().read_tags(&encoded.blob), tags(&["player:42", "combat:42"]));
        assert!(codec().read_tags(b"raw").is_empty());
    }
}
