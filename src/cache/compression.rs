//! Value Codec
//!
//! LZ4 compression for values above a size threshold, with fallback to the
//! raw value whenever compression fails or does not shrink the payload.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{Codec, CodecConfig};
//!
//! let codec = Codec::new(CodecConfig { threshold_bytes: 16, level: 4 });
//!
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data";
//! let encoded = codec.encode(data, true);
//!
//! let decoded = codec.decode(&encoded.bytes, encoded.compressed).unwrap();
//! assert_eq!(decoded.as_ref(), data);
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Codec configuration
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    /// Values strictly larger than this are compressed
    pub threshold_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024, // 1KB minimum
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Short algorithm name for logs and errors
    fn name(&self) -> &'static str;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compressor (size-prefixed blocks)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Result of encoding a value for storage
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Bytes to store
    pub bytes: Bytes,
    /// Whether `bytes` is compressed
    pub compressed: bool,
    /// Size before compression
    pub original_size: u64,
}

/// Threshold-driven codec shared by every tier
pub struct Codec {
    config: CodecConfig,
    compressor: Box<dyn Compressor>,
}

impl Codec {
    /// Create an LZ4 codec
    pub fn new(config: CodecConfig) -> Self {
        Self::with_compressor(config, Box::new(Lz4Compressor::with_level(config.level)))
    }

    /// Create with a custom compressor
    pub fn with_compressor(config: CodecConfig, compressor: Box<dyn Compressor>) -> Self {
        Self { config, compressor }
    }

    /// Encode a value. Never fails: on any compression problem the raw value
    /// is stored with the flag unset.
    pub fn encode(&self, data: &[u8], compression_enabled: bool) -> Encoded {
        let original_size = data.len() as u64;
        let raw = || Encoded {
            bytes: Bytes::copy_from_slice(data),
            compressed: false,
            original_size,
        };

        if !compression_enabled || original_size <= self.config.threshold_bytes {
            return raw();
        }

        match self.compressor.compress(data) {
            // Only use compressed if it's actually smaller
            Ok(compressed) if compressed.len() < data.len() => Encoded {
                bytes: Bytes::from(compressed),
                compressed: true,
                original_size,
            },
            Ok(_) => raw(),
            Err(e) => {
                tracing::warn!(
                    "Compression with {} failed, storing uncompressed: {}",
                    self.compressor.name(),
                    e
                );
                raw()
            }
        }
    }

    /// Decode a stored value
    pub fn decode(&self, data: &Bytes, compressed: bool) -> Result<Bytes> {
        if !compressed {
            return Ok(data.clone());
        }
        let decompressed = self.compressor.decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Get configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}
