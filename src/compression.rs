// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! zstd compression for large cache payloads.
//!
//! The entry codec decides *whether* to compress (size threshold or an
//! explicit request) and records the decision in the entry header. This
//! module only does the byte work, so decompression never has to guess.
//!
//! # Example
//!
//! ```
//! use cache_engine::compression::{compress, decompress};
//!
//! let payload = br#"{"leaderboard":[1,2,3,4,5,6,7,8,9,10]}"#.repeat(50);
//! let packed = compress(&payload, 3).unwrap();
//! assert!(packed.len() < payload.len());
//! assert_eq!(decompress(&packed).unwrap(), payload);
//! ```

/// Default zstd level: cheap enough for the write path.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Compress bytes at the given zstd level (1-22).
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress zstd bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

/// Compression statistics for a single operation.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    /// original / compressed
    pub ratio: f64,
    /// Space saved (0.0 - 1.0); negative when compression grew the data
    pub savings: f64,
}

impl CompressionStats {
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            ratio,
            savings,
        }
    }
}
