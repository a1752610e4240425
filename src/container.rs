// SPDX-License-Identifier: MIT
//! Cache container: five JSON sections behind a fixed header
//!
//! ```text
//! +-------------------------+
//! | CacheHeader (64 bytes)  |  magic, version, compression bits, sizes
//! +-------------------------+
//! | SHA-256 x 5 (160 bytes) |  digest of every uncompressed section
//! +-------------------------+
//! | Manifest                |
//! | MX1 (schema table)      |
//! | MX2 (object index)      |
//! | MXS (scalar surface)    |
//! | VecAggs                 |  empty = not persisted
//! +-------------------------+
//! ```
//!
//! Section offsets follow from the header alone. The file is always
//! written to a temporary sibling and renamed over the target.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compression_strategy::{decompress, CompressionConfig, CompressionEngine};
use crate::format::{CacheHeader, SectionType, CACHE_HEADER_SIZE, DIGEST_SIZE, DIGEST_TABLE_SIZE};

/// Errors raised while reading or writing the cache container
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cache container: {0}")]
    InvalidFormat(String),

    #[error("Section {0} failed its digest check")]
    Digest(&'static str),

    #[error("Section {0} missing")]
    SectionMissing(&'static str),

    #[error("Section {0} already added")]
    SectionExists(&'static str),

    #[error("Section {section}: {reason}")]
    Serialization {
        section: &'static str,
        reason: String,
    },

    #[error("Duplicate columns: {}", .0.join(", "))]
    DuplicateColumns(Vec<String>),
}

/// A cache container read into memory
#[derive(Debug)]
pub struct CacheContainer {
    header: CacheHeader,
    data: Vec<u8>,
}

impl CacheContainer {
    /// Take ownership of the file bytes and validate the layout
    pub fn from_vec(data: Vec<u8>) -> Result<Self, ContainerError> {
        if data.len() < CACHE_HEADER_SIZE + DIGEST_TABLE_SIZE {
            return Err(ContainerError::InvalidFormat("container too small".to_string()));
        }

        let header = CacheHeader::from_bytes(&data[..CACHE_HEADER_SIZE])
            .map_err(ContainerError::InvalidFormat)?;
        header.validate().map_err(ContainerError::InvalidFormat)?;
        if header.total_size() != data.len() as u64 {
            return Err(ContainerError::InvalidFormat(format!(
                "header describes {} bytes, file has {}",
                header.total_size(),
                data.len()
            )));
        }

        Ok(Self { header, data })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_vec(data)
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn raw_section(&self, section: SectionType) -> &[u8] {
        let offset = self.header.section_offset(section) as usize;
        let size = self.header.section_size(section) as usize;
        &self.data[offset..offset + size]
    }

    fn digest(&self, section: SectionType) -> &[u8] {
        let start = CACHE_HEADER_SIZE + section.index() * DIGEST_SIZE;
        &self.data[start..start + DIGEST_SIZE]
    }

    pub fn has_section(&self, section: SectionType) -> bool {
        self.header.section_size(section) > 0
    }

    /// Decompressed, digest-checked section payload
    pub fn section(&self, section: SectionType) -> Result<Vec<u8>, ContainerError> {
        let raw = self.raw_section(section);
        let payload = if self.header.is_compressed(section) {
            decompress(raw)?
        } else {
            raw.to_vec()
        };

        if Sha256::digest(&payload).as_slice() != self.digest(section) {
            return Err(ContainerError::Digest(section.name()));
        }
        Ok(payload)
    }

    /// Deserialize a JSON section; an empty section is reported missing
    pub fn read_json<T: DeserializeOwned>(&self, section: SectionType) -> Result<T, ContainerError> {
        if !self.has_section(section) {
            return Err(ContainerError::SectionMissing(section.name()));
        }
        let payload = self.section(section)?;
        serde_json::from_slice(&payload).map_err(|e| ContainerError::Serialization {
            section: section.name(),
            reason: e.to_string(),
        })
    }
}

/// Builder for cache containers
pub struct ContainerWriter {
    header: CacheHeader,
    sections: [Option<Vec<u8>>; SectionType::COUNT],
    digests: [[u8; DIGEST_SIZE]; SectionType::COUNT],
    compression_engine: CompressionEngine,
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::smart())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            header: CacheHeader::new(),
            sections: Default::default(),
            digests: [[0u8; DIGEST_SIZE]; SectionType::COUNT],
            compression_engine: CompressionEngine::new(config),
        }
    }

    /// Add a raw section payload
    pub fn add_section(&mut self, section: SectionType, data: Vec<u8>) -> Result<(), ContainerError> {
        let index = section.index();
        if self.sections[index].is_some() {
            return Err(ContainerError::SectionExists(section.name()));
        }

        self.digests[index].copy_from_slice(Sha256::digest(&data).as_slice());
        let (payload, compressed) = self.compression_engine.encode(data)?;
        self.header.set_compressed(section, compressed);
        self.header.set_section_size(section, payload.len() as u64);
        self.sections[index] = Some(payload);
        Ok(())
    }

    /// Serialize a value as JSON into a section
    pub fn add_json<T: Serialize + ?Sized>(
        &mut self,
        section: SectionType,
        value: &T,
    ) -> Result<(), ContainerError> {
        let data = serde_json::to_vec(value).map_err(|e| ContainerError::Serialization {
            section: section.name(),
            reason: e.to_string(),
        })?;
        self.add_section(section, data)
    }

    /// Assemble the container bytes; sections never added stay empty
    pub fn finish(self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.header.total_size() as usize);
        self.header.write_to_buffer(&mut buffer);
        for digest in &self.digests {
            buffer.extend_from_slice(digest);
        }
        for (section, payload) in SectionType::all().iter().zip(&self.sections) {
            match payload {
                Some(payload) => buffer.extend_from_slice(payload),
                None => debug!("Section {} left empty", section.name()),
            }
        }
        buffer
    }

    /// Write the container to `path` through a temporary sibling file
    pub fn write_to_path(self, path: &Path) -> Result<u64, ContainerError> {
        let bytes = self.finish();
        let temp_path = temp_sibling(path);
        debug!("Writing cache container to temp file: {:?}", temp_path);

        let written = std::fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            warn!("Failed to write cache container {:?}: {}", temp_path, e);
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        if let Err(e) = std::fs::rename(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        debug!("Cache container {:?} written: {} bytes", path, bytes.len());
        Ok(bytes.len() as u64)
    }
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}
