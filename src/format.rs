// SPDX-License-Identifier: MIT
//! On-disk layouts of the derived files
//!
//! Two binary layouts live here: the cache container header (`<base>.h5`)
//! with its section table, and the snapshot store header
//! (`<base><dotres>.vec.h5`). Both are little-endian and fixed-size so that
//! any section or entry can be located without parsing what precedes it.

use std::io::{Read, Write};

/// Cache container magic bytes: "MXC\x01\x00\x00\x00\x00"
pub const CACHE_MAGIC: &[u8; 8] = &[77, 88, 67, 1, 0, 0, 0, 0];

/// Cache container format version
pub const CACHE_VERSION: u32 = 1;

/// Cache header size in bytes
pub const CACHE_HEADER_SIZE: usize = 64;

/// Size of one section digest (SHA-256)
pub const DIGEST_SIZE: usize = 32;

/// Size of the digest table that follows the header
pub const DIGEST_TABLE_SIZE: usize = DIGEST_SIZE * SectionType::COUNT;

/// Snapshot store magic bytes: "MXV\x01\x00\x00\x00\x00"
pub const STORE_MAGIC: &[u8; 8] = &[77, 88, 86, 1, 0, 0, 0, 0];

/// Snapshot store format version
pub const STORE_VERSION: u32 = 1;

/// Snapshot store header size in bytes
pub const STORE_HEADER_SIZE: usize = 32;

/// Header and entry flags
pub mod flags {
    /// Section payload is zlib-compressed (cache header, bit per section)
    pub const fn compress_section(index: usize) -> u32 {
        1 << index
    }

    /// Snapshot store has a persisted anchor
    pub const STORE_ANCHOR_SET: u32 = 0x0000_0001;

    /// Snapshot entry payload is zlib-compressed
    pub const ENTRY_COMPRESSED: u32 = 0x0000_0001;
}

/// Logical sections of the cache container, in file order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    /// Manifest (key prefix, sidecar link, offset policy, anchor)
    Manifest,

    /// Channel table parsed from the MX1 schema
    Schema,

    /// Object index parsed from the MX2 file
    ObjectIndex,

    /// Scalar surface, column-major
    Scalars,

    /// Aggregate surface
    VecAggs,
}

impl SectionType {
    pub const COUNT: usize = 5;

    /// All sections in file order
    pub fn all() -> &'static [SectionType] {
        &[
            SectionType::Manifest,
            SectionType::Schema,
            SectionType::ObjectIndex,
            SectionType::Scalars,
            SectionType::VecAggs,
        ]
    }

    /// Position in the header's size and digest tables
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Suffix of the section's logical key
    pub fn name(&self) -> &'static str {
        match self {
            SectionType::Manifest => "manifest",
            SectionType::Schema => "MX1",
            SectionType::ObjectIndex => "MX2",
            SectionType::Scalars => "MXS",
            SectionType::VecAggs => "VecAggs",
        }
    }
}

/// Fill `buf` as far as the reader allows; returns the byte count read
///
/// Unlike `read_exact`, a short count at end of input is not an error.
pub(crate) fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn le_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

/// Cache container header (64 bytes)
///
/// ```text
/// 0..8    magic "MXC\x01\0\0\0\0"
/// 8..12   version
/// 12..16  flags (bit i: section i compressed)
/// 16..56  section sizes, u64 x 5, in SectionType order
/// 56..64  reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub sizes: [u64; SectionType::COUNT],
}

impl CacheHeader {
    pub fn new() -> Self {
        Self {
            magic: *CACHE_MAGIC,
            version: CACHE_VERSION,
            flags: 0,
            sizes: [0; SectionType::COUNT],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != CACHE_HEADER_SIZE {
            return Err(format!(
                "Header must be {} bytes, got {}",
                CACHE_HEADER_SIZE,
                bytes.len()
            ));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let mut sizes = [0u64; SectionType::COUNT];
        for (i, size) in sizes.iter_mut().enumerate() {
            *size = le_u64(bytes, 16 + i * 8);
        }

        Ok(Self {
            magic,
            version: le_u32(bytes, 8),
            flags: le_u32(bytes, 12),
            sizes,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.magic != *CACHE_MAGIC {
            return Err(format!(
                "Invalid magic bytes: expected {:?}, got {:?}",
                *CACHE_MAGIC, self.magic
            ));
        }

        if self.version != CACHE_VERSION {
            return Err(format!(
                "Unsupported version: expected {}, got {}",
                CACHE_VERSION, self.version
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn is_compressed(&self, section: SectionType) -> bool {
        (self.flags & flags::compress_section(section.index())) != 0
    }

    pub fn set_compressed(&mut self, section: SectionType, compressed: bool) {
        let bit = flags::compress_section(section.index());
        if compressed {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    #[inline]
    pub fn section_size(&self, section: SectionType) -> u64 {
        self.sizes[section.index()]
    }

    pub fn set_section_size(&mut self, section: SectionType, size: u64) {
        self.sizes[section.index()] = size;
    }

    /// Offset of a section from the start of the file
    #[inline]
    pub fn section_offset(&self, section: SectionType) -> u64 {
        let base = (CACHE_HEADER_SIZE + DIGEST_TABLE_SIZE) as u64;
        base + self.sizes[..section.index()].iter().sum::<u64>()
    }

    /// Total file size described by this header
    pub fn total_size(&self) -> u64 {
        (CACHE_HEADER_SIZE + DIGEST_TABLE_SIZE) as u64 + self.sizes.iter().sum::<u64>()
    }

    pub fn write_to_buffer(&self, buffer: &mut Vec<u8>) {
        buffer.reserve(CACHE_HEADER_SIZE);
        buffer.extend_from_slice(&self.magic);
        buffer.extend_from_slice(&self.version.to_le_bytes());
        buffer.extend_from_slice(&self.flags.to_le_bytes());
        for size in &self.sizes {
            buffer.extend_from_slice(&size.to_le_bytes());
        }
        buffer.extend_from_slice(&[0u8; 8]);
    }
}

impl Default for CacheHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot store header (32 bytes)
///
/// ```text
/// 0..8    magic "MXV\x01\0\0\0\0"
/// 8..12   version
/// 12..16  flags (bit0: anchor set)
/// 16..24  anchor, microseconds since the Unix epoch
/// 24..32  reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub anchor_micros: i64,
}

impl StoreHeader {
    pub fn new() -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: STORE_VERSION,
            flags: 0,
            anchor_micros: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != STORE_HEADER_SIZE {
            return Err(format!(
                "Header must be {} bytes, got {}",
                STORE_HEADER_SIZE,
                bytes.len()
            ));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        let header = Self {
            magic,
            version: le_u32(bytes, 8),
            flags: le_u32(bytes, 12),
            anchor_micros: le_i64(bytes, 16),
        };
        if header.magic != *STORE_MAGIC {
            return Err("Invalid magic bytes".to_string());
        }
        if header.version != STORE_VERSION {
            return Err(format!(
                "Unsupported version: expected {}, got {}",
                STORE_VERSION, header.version
            ));
        }
        Ok(header)
    }

    pub fn anchor(&self) -> Option<i64> {
        ((self.flags & flags::STORE_ANCHOR_SET) != 0).then_some(self.anchor_micros)
    }

    pub fn set_anchor(&mut self, micros: i64) {
        self.flags |= flags::STORE_ANCHOR_SET;
        self.anchor_micros = micros;
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, std::io::Error> {
        let mut header = [0u8; STORE_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        Self::from_bytes(&header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
        writer.write_all(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut bytes = [0u8; STORE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.anchor_micros.to_le_bytes());
        bytes
    }
}

impl Default for StoreHeader {
    fn default() -> Self {
        Self::new()
    }
}
