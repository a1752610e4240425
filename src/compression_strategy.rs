// SPDX-License-Identifier: MIT
//! Compression decisions for cache sections and snapshot payloads
//!
//! Payloads written by this crate are JSON (schema tables, columnar scalar
//! data, vector snapshots), so in practice almost everything compresses. The
//! engine still samples the payload before paying for zlib:
//! - tiny payloads are stored raw (zlib framing would outgrow them)
//! - high-entropy payloads are stored raw
//! - everything else is compressed with the fast zlib level

/// Payloads below this size are never compressed in smart mode
pub const DEFAULT_MIN_SIZE: usize = 256;

/// How the engine decides whether to compress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// Sample size and entropy, compress when it pays off
    Smart,
    /// Compress every payload
    Always,
    /// Store every payload raw
    Never,
}

impl CompressionMode {
    /// Parse a mode name as used in `MX_CACHE_COMPRESSION`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "smart" => Some(Self::Smart),
            "always" => Some(Self::Always),
            "never" | "none" | "off" => Some(Self::Never),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub mode: CompressionMode,
    /// Smallest payload smart mode will consider compressing
    pub min_size: usize,
}

impl CompressionConfig {
    /// Sampled decisions (recommended)
    pub fn smart() -> Self {
        Self {
            mode: CompressionMode::Smart,
            min_size: DEFAULT_MIN_SIZE,
        }
    }

    pub fn always() -> Self {
        Self {
            mode: CompressionMode::Always,
            min_size: 0,
        }
    }

    pub fn never() -> Self {
        Self {
            mode: CompressionMode::Never,
            min_size: 0,
        }
    }

    pub fn with_mode(mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::Smart => Self::smart(),
            CompressionMode::Always => Self::always(),
            CompressionMode::Never => Self::never(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::smart()
    }
}

/// Compression engine that handles compression decisions
#[derive(Debug, Clone, Copy)]
pub struct CompressionEngine {
    config: CompressionConfig,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> CompressionConfig {
        self.config
    }

    /// Determine if a payload should be compressed
    pub fn should_compress(&self, data: &[u8]) -> bool {
        if !cfg!(feature = "compression") {
            return false;
        }

        match self.config.mode {
            CompressionMode::Always => true,
            CompressionMode::Never => false,
            CompressionMode::Smart => {
                data.len() >= self.config.min_size && self.looks_compressible(data)
            }
        }
    }

    /// Compress when the policy says so; returns the bytes and whether they are compressed
    pub fn encode(&self, data: Vec<u8>) -> std::io::Result<(Vec<u8>, bool)> {
        if self.should_compress(&data) {
            Ok((compress(&data)?, true))
        } else {
            Ok((data, false))
        }
    }

    /// Check if data looks compressible based on simple heuristics
    fn looks_compressible(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }

        let sample_size = data.len().min(4096);
        let sample = &data[..sample_size];

        let mut byte_counts = [0u32; 256];
        for &byte in sample {
            byte_counts[byte as usize] += 1;
        }

        // If most bytes are the same, it's compressible
        let max_count = byte_counts.iter().max().copied().unwrap_or(0);
        let repetition_ratio = max_count as f64 / sample_size as f64;
        if repetition_ratio > 0.5 {
            return true;
        }

        calculate_entropy(sample) < 7.0
    }
}

impl Default for CompressionEngine {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Shannon entropy of a byte sample, in bits per byte
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u32; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &counts {
        if count > 0 {
            let probability = count as f64 / len;
            entropy -= probability * probability.log2();
        }
    }

    entropy
}

/// Compress data using zlib at the fast level
#[cfg(feature = "compression")]
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let estimated_size = data.len().saturating_mul(6) / 10;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(estimated_size.max(256)), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(not(feature = "compression"))]
pub fn compress(_data: &[u8]) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "built without the compression feature",
    ))
}

/// Decompress zlib data
#[cfg(feature = "compression")]
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decompressed = Vec::with_capacity(data.len().saturating_mul(3).max(1024));
    ZlibDecoder::new(data).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

#[cfg(not(feature = "compression"))]
pub fn decompress(_data: &[u8]) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "payload is compressed but the compression feature is disabled",
    ))
}
