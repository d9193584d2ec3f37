/*!
Payload compression applied before a payload is staged.

The compressor also names the `Content-Encoding` the collector must be told
about, so a staged file and the headers of its request always agree.
*/

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::config::PayloadCompression;
use crate::{Result, SpoolError};

/// Transforms encoded payloads into their on-the-wire form
pub trait PayloadCompressor: Send + Sync {
    /// Compress an encoded payload
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Reverse [`PayloadCompressor::compress`]
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Value of the `Content-Encoding` header, `None` for identity
    fn content_encoding(&self) -> Option<&'static str>;
}

/// Gzip compressor; OTLP/HTTP collectors accept `Content-Encoding: gzip`
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: Compression,
}

impl GzipCompressor {
    /// Create a gzip compressor with the default level (6)
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Create a gzip compressor with a level from 0 (store) to 9 (best)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadCompressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .map_err(|e| SpoolError::compression(format!("Failed to compress payload: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| SpoolError::compression(format!("Failed to finish compression: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoded = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut decoded)
            .map_err(|e| SpoolError::compression(format!("Failed to decompress payload: {}", e)))?;
        Ok(decoded)
    }

    fn content_encoding(&self) -> Option<&'static str> {
        Some("gzip")
    }
}

/// Pass-through compressor
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl PayloadCompressor for Identity {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn content_encoding(&self) -> Option<&'static str> {
        None
    }
}

/// Build the compressor selected by the exporter configuration
pub fn compressor_for(setting: PayloadCompression) -> Arc<dyn PayloadCompressor> {
    match setting {
        PayloadCompression::None => Arc::new(Identity),
        PayloadCompression::Gzip => Arc::new(GzipCompressor::new()),
    }
}
