//! Payload Compression
//!
//! LZ4 block compression applied to serialized cache payloads that exceed a
//! size threshold. Compressed payloads travel with
//! [`OperationFlags::COMPRESSED`](crate::domain::OperationFlags::COMPRESSED)
//! set so the reader knows to inflate them.
//!
//! # Example
//!
//! ```
//! use clustra::compression::{CompressionConfig, PayloadCompressor};
//!
//! let compressor = PayloadCompressor::new(CompressionConfig { enabled: true, threshold_bytes: 16 });
//! let data = b"repeat repeat repeat repeat repeat repeat repeat repeat".to_vec();
//!
//! let (packed, compressed) = compressor.compress(&data);
//! assert!(compressed);
//! assert_eq!(compressor.decompress(&packed).unwrap().as_ref(), data.as_slice());
//! ```

use bytes::Bytes;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Compression settings derived from [`ClientConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads smaller than this are sent uncompressed
    pub threshold_bytes: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: 1024,
        }
    }
}

impl From<&ClientConfig> for CompressionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            enabled: config.compression_enabled,
            threshold_bytes: config.compression_threshold_bytes,
        }
    }
}

// =============================================================================
// Compressor
// =============================================================================

/// Threshold-gated LZ4 compressor.
#[derive(Debug, Clone, Default)]
pub struct PayloadCompressor {
    config: CompressionConfig,
}

impl PayloadCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> CompressionConfig {
        self.config
    }

    /// Compress `data` if enabled and large enough.
    ///
    /// Returns the bytes to send and whether they are compressed. Falls back
    /// to the original bytes when compression fails or does not shrink them.
    pub fn compress(&self, data: &[u8]) -> (Bytes, bool) {
        if !self.config.enabled || (data.len() as u64) < self.config.threshold_bytes {
            return (Bytes::copy_from_slice(data), false);
        }

        match lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true) {
            Ok(packed) if packed.len() < data.len() => (Bytes::from(packed), true),
            Ok(_) => (Bytes::copy_from_slice(data), false),
            Err(e) => {
                tracing::warn!("Compression failed, sending uncompressed: {}", e);
                (Bytes::copy_from_slice(data), false)
            }
        }
    }

    /// Inflate a payload produced by [`compress`](Self::compress).
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        lz4::block::decompress(data, None)
            .map(Bytes::from)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(threshold: u64) -> PayloadCompressor {
        PayloadCompressor::new(CompressionConfig {
            enabled: true,
            threshold_bytes: threshold,
        })
    }

    #[test]
    fn test_small_payload_is_not_compressed() {
        let (out, compressed) = enabled(1024).compress(b"tiny");
        assert!(!compressed);
        assert_eq!(out.as_ref(), b"tiny");
    }

    #[test]
    fn test_disabled_never_compresses() {
        let data = vec![b'a'; 8192];
        let (out, compressed) = PayloadCompressor::default().compress(&data);
        assert!(!compressed);
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let compressor = enabled(64);
        let data = vec![b'z'; 4096];

        let (packed, compressed) = compressor.compress(&data);
        assert!(compressed);
        assert!(packed.len() < data.len());
        assert_eq!(compressor.decompress(&packed).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_corrupt_input_reports_error() {
        let result = enabled(0).decompress(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(result, Err(Error::DecompressionFailed { .. })));
    }
}
