// SPDX-License-Identifier: MIT
use crate::compression_strategy::{CompressionConfig, CompressionMode};

/// Options applied when a [`crate::Dataset`] is opened
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetConfig {
    /// Delete and ignore an existing cache
    pub skip_cache: bool,
    /// Do not ingest the MXS stream at open
    pub skip_mxs: bool,
    /// Bound on records read per stream
    pub max_records: Option<usize>,
    /// Fail a dump when a timestamp has no vector row
    pub strict_vectors: bool,
    /// Compression of cache sections and snapshot payloads
    pub compression: CompressionMode,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            skip_cache: false,
            skip_mxs: false,
            max_records: None,
            strict_vectors: true,
            compression: CompressionMode::Smart,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl DatasetConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            skip_cache: env_flag("MX_SKIP_CACHE").unwrap_or(defaults.skip_cache),
            skip_mxs: env_flag("MX_SKIP_MXS").unwrap_or(defaults.skip_mxs),
            max_records: std::env::var("MX_MAX_RECORDS")
                .ok()
                .and_then(|s| s.parse().ok()),
            strict_vectors: env_flag("MX_STRICT_VECTORS").unwrap_or(defaults.strict_vectors),
            compression: std::env::var("MX_CACHE_COMPRESSION")
                .ok()
                .and_then(|s| CompressionMode::from_name(&s))
                .unwrap_or(defaults.compression),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_records == Some(0) {
            return Err("MX_MAX_RECORDS must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub fn skip_mxs(mut self, skip: bool) -> Self {
        self.skip_mxs = skip;
        self
    }

    pub fn max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn strict_vectors(mut self, strict: bool) -> Self {
        self.strict_vectors = strict;
        self
    }

    pub fn compression_config(&self) -> CompressionConfig {
        CompressionConfig::with_mode(self.compression)
    }
}
