//! Payload compression applied before records are stored.

use std::fmt::Debug;

use bytes::Bytes;
use recordqueue_types::{CompressionAlgorithm, CompressionInformation};

use crate::error::{Error, Result};

/// Compresses record payloads.
pub trait Compressor: Debug + Send + Sync + 'static {
    /// Compresses `payload`.
    ///
    /// Returns the bytes to store and, if they differ from the input, a description of how they
    /// were produced.
    fn compress(&self, payload: Bytes) -> Result<(Bytes, Option<CompressionInformation>)>;
}

/// Stores payloads unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, payload: Bytes) -> Result<(Bytes, Option<CompressionInformation>)> {
        Ok((payload, None))
    }
}

/// Compresses payloads of at least `threshold` bytes with zstd.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompression {
    threshold: usize,
    level: i32,
}

impl ZstdCompression {
    /// Creates a compressor that skips payloads smaller than `threshold`.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Sets the zstd compression level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self::new(512)
    }
}

impl Compressor for ZstdCompression {
    fn compress(&self, payload: Bytes) -> Result<(Bytes, Option<CompressionInformation>)> {
        if payload.len() < self.threshold {
            return Ok((payload, None));
        }

        let compressed = zstd::bulk::compress(&payload, self.level).map_err(Error::Io)?;
        if compressed.len() >= payload.len() {
            return Ok((payload, None));
        }

        let info = CompressionInformation {
            algorithm: CompressionAlgorithm::Zstd,
            uncompressed_size: payload.len() as u64,
        };
        Ok((compressed.into(), Some(info)))
    }
}

/// Restores a payload compressed by a [`Compressor`].
pub fn decompress(payload: &[u8], info: Option<&CompressionInformation>) -> Result<Bytes> {
    match info.map(|info| (info.algorithm, info.uncompressed_size)) {
        None | Some((CompressionAlgorithm::None, _)) => Ok(Bytes::copy_from_slice(payload)),
        Some((CompressionAlgorithm::Zstd, size)) => {
            let decompressed = zstd::bulk::decompress(payload, size as usize).map_err(Error::Io)?;
            Ok(decompressed.into())
        }
    }
}
