// SPDX-License-Identifier: MIT
//! Snapshot store: vector rows keyed by milliseconds from an anchor
//!
//! ```text
//! +--------------------+
//! | StoreHeader (32)   |  magic, version, anchor
//! +--------------------+
//! | entry              |  u32 key_len | key "/<ms>" | u32 flags | u64 len | payload
//! | entry              |
//! | ...                |
//! +--------------------+
//! ```
//!
//! Entries are only ever appended. The key index is rebuilt by scanning
//! the entry headers whenever the file is opened; a torn trailing entry is
//! ignored and cut off before the next append.
//!
//! The file is held only by a [`StoreWriter`] or [`StoreReader`] session,
//! which callers create for one operation and drop when it ends.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::compression_strategy::{decompress, CompressionEngine};
use crate::format::{flags, read_up_to, StoreHeader, STORE_HEADER_SIZE};
use crate::timestamp::millis_from;
use crate::value::VectorRow;

/// Errors raised by the snapshot store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot store: {0}")]
    InvalidFormat(String),

    #[error("Snapshot {key} unreadable: {reason}")]
    Payload { key: String, reason: String },
}

/// `/<ms>` key of a snapshot entry
pub fn entry_key(millis: i64) -> String {
    format!("/{millis}")
}

fn parse_key(key: &str) -> Option<i64> {
    key.strip_prefix('/')?.parse().ok()
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: u64,
    len: u64,
    compressed: bool,
}

type KeyIndex = BTreeMap<i64, EntryLocation>;

/// First and last stored timestamps and entry count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSummary {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub count: usize,
    /// Entries breaking the key or ordering rules (full check only)
    pub violations: usize,
}

/// Handle on the store file; opens sessions on demand
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    engine: CompressionEngine,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, engine: CompressionEngine) -> Self {
        Self {
            path: path.into(),
            engine,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// True when the store exists and was last written before `source`
    pub fn is_older_than(&self, source: &Path) -> bool {
        let source = std::fs::metadata(source).and_then(|m| m.modified()).ok();
        matches!((self.modified(), source), (Some(store), Some(source)) if store < source)
    }

    /// Remove the store file; returns whether there was one
    pub fn delete(&self) -> Result<bool, StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Deleted snapshot store {:?}", self.path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open for appending, creating the file when needed
    pub fn writer(&self) -> Result<StoreWriter, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let file_len = file.metadata()?.len();

        let (header, index, end) = if file_len == 0 {
            let header = StoreHeader::new();
            header.write_to(&mut file)?;
            (header, KeyIndex::new(), STORE_HEADER_SIZE as u64)
        } else {
            let header = read_header(&mut file)?;
            let (index, end) = scan_entries(&mut file, file_len)?;
            if end < file_len {
                warn!(
                    "Snapshot store {:?}: cutting {} bytes of torn entry",
                    self.path,
                    file_len - end
                );
                file.set_len(end)?;
            }
            (header, index, end)
        };

        Ok(StoreWriter {
            file,
            header,
            index,
            end,
            engine: self.engine,
        })
    }

    /// Open for lookups
    pub fn reader(&self) -> Result<StoreReader, StoreError> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let header = read_header(&mut file)?;
        let (index, end) = scan_entries(&mut file, file_len)?;
        if end < file_len {
            warn!(
                "Snapshot store {:?}: ignoring {} bytes of torn entry",
                self.path,
                file_len - end
            );
        }
        Ok(StoreReader {
            file: BufReader::new(file),
            header,
            index,
        })
    }

    /// Persisted anchor; `None` when the store is missing or has none
    pub fn anchor(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        if !self.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        Ok(read_header(&mut file)?.anchor().and_then(from_micros))
    }

    /// Summary of the stored snapshots; `None` when the store is missing or empty
    pub fn summarize(&self, full_check: bool) -> Result<Option<StoreSummary>, StoreError> {
        if !self.exists() {
            return Ok(None);
        }
        self.reader()?.summarize(full_check)
    }
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn read_header(file: &mut File) -> Result<StoreHeader, StoreError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = [0u8; STORE_HEADER_SIZE];
    file.read_exact(&mut bytes)?;
    StoreHeader::from_bytes(&bytes).map_err(StoreError::InvalidFormat)
}

/// Index every complete entry; returns the index and where the last one ends
fn scan_entries<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
) -> Result<(KeyIndex, u64), StoreError> {
    let mut index = KeyIndex::new();
    let mut end = STORE_HEADER_SIZE as u64;
    reader.seek(SeekFrom::Start(end))?;

    loop {
        let mut len_bytes = [0u8; 4];
        let got = read_up_to(reader, &mut len_bytes)?;
        if got < 4 {
            break;
        }
        let key_len = u32::from_le_bytes(len_bytes) as u64;
        if end + 4 + key_len + 12 > file_len {
            break;
        }

        let mut key = vec![0u8; key_len as usize];
        reader.read_exact(&mut key)?;
        let mut meta = [0u8; 12];
        reader.read_exact(&mut meta)?;
        let mut raw_flags = [0u8; 4];
        raw_flags.copy_from_slice(&meta[0..4]);
        let mut raw_len = [0u8; 8];
        raw_len.copy_from_slice(&meta[4..12]);
        let entry_flags = u32::from_le_bytes(raw_flags);
        let payload_len = u64::from_le_bytes(raw_len);

        let offset = end + 4 + key_len + 12;
        if offset + payload_len > file_len {
            break;
        }

        let key = String::from_utf8_lossy(&key);
        match parse_key(&key) {
            Some(millis) => {
                index.entry(millis).or_insert(EntryLocation {
                    offset,
                    len: payload_len,
                    compressed: entry_flags & flags::ENTRY_COMPRESSED != 0,
                });
            }
            None => warn!("Snapshot store entry with unusable key {:?} skipped", key),
        }

        end = offset + payload_len;
        reader.seek(SeekFrom::Start(end))?;
    }

    Ok((index, end))
}

fn read_row<R: Read + Seek>(
    reader: &mut R,
    millis: i64,
    location: EntryLocation,
) -> Result<VectorRow, StoreError> {
    let payload_error = |reason: String| StoreError::Payload {
        key: entry_key(millis),
        reason,
    };

    reader.seek(SeekFrom::Start(location.offset))?;
    let mut payload = vec![0u8; location.len as usize];
    reader.read_exact(&mut payload)?;
    if location.compressed {
        payload = decompress(&payload).map_err(|e| payload_error(e.to_string()))?;
    }
    serde_json::from_slice(&payload).map_err(|e| payload_error(e.to_string()))
}

/// Append session
pub struct StoreWriter {
    file: File,
    header: StoreHeader,
    index: KeyIndex,
    end: u64,
    engine: CompressionEngine,
}

impl StoreWriter {
    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.header.anchor().and_then(from_micros)
    }

    /// Persist the anchor in the header
    pub fn set_anchor(&mut self, anchor: DateTime<Utc>) -> Result<(), StoreError> {
        self.header.set_anchor(anchor.timestamp_micros());
        self.file.seek(SeekFrom::Start(0))?;
        self.header.write_to(&mut self.file)?;
        Ok(())
    }

    pub fn contains(&self, millis: i64) -> bool {
        self.index.contains_key(&millis)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Store a row under `millis` unless the key is taken; returns whether it was written
    pub fn put(&mut self, millis: i64, row: &VectorRow) -> Result<bool, StoreError> {
        if self.index.contains_key(&millis) {
            return Ok(false);
        }

        let key = entry_key(millis);
        let json = serde_json::to_vec(row).map_err(|e| StoreError::Payload {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let (payload, compressed) = self.engine.encode(json)?;

        let mut entry = Vec::with_capacity(4 + key.len() + 12 + payload.len());
        entry.extend_from_slice(&(key.len() as u32).to_le_bytes());
        entry.extend_from_slice(key.as_bytes());
        let entry_flags = if compressed { flags::ENTRY_COMPRESSED } else { 0 };
        entry.extend_from_slice(&entry_flags.to_le_bytes());
        entry.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        let offset = self.end + entry.len() as u64;
        entry.extend_from_slice(&payload);

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&entry)?;
        self.end += entry.len() as u64;
        self.index.insert(
            millis,
            EntryLocation {
                offset,
                len: payload.len() as u64,
                compressed,
            },
        );
        Ok(true)
    }

    pub fn get(&mut self, millis: i64) -> Result<Option<VectorRow>, StoreError> {
        match self.index.get(&millis).copied() {
            Some(location) => read_row(&mut self.file, millis, location).map(Some),
            None => Ok(None),
        }
    }

    /// Flush and release the file
    pub fn finish(mut self) -> Result<(), StoreError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Lookup session
pub struct StoreReader {
    file: BufReader<File>,
    header: StoreHeader,
    index: KeyIndex,
}

impl StoreReader {
    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.header.anchor().and_then(from_micros)
    }

    /// Stored keys, ascending
    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.index.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&mut self, millis: i64) -> Result<Option<VectorRow>, StoreError> {
        match self.index.get(&millis).copied() {
            Some(location) => read_row(&mut self.file, millis, location).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot of `timestamp`
    ///
    /// The key computed from the anchor is tried first. Unless `fast`, the
    /// row found there must carry `timestamp`; otherwise all keys are scanned
    /// for a row that does.
    pub fn find(
        &mut self,
        timestamp: DateTime<Utc>,
        fast: bool,
    ) -> Result<Option<VectorRow>, StoreError> {
        let Some(anchor) = self.anchor() else {
            return Ok(None);
        };

        let millis = millis_from(anchor, timestamp);
        if let Some(row) = self.get(millis)? {
            if fast || row.timestamp == timestamp {
                return Ok(Some(row));
            }
        }
        if fast {
            return Ok(None);
        }

        debug!("Snapshot for {} not under key {}; scanning", timestamp, entry_key(millis));
        let keys: Vec<i64> = self.keys().collect();
        for key in keys {
            if let Some(row) = self.get(key)? {
                if row.timestamp == timestamp {
                    return Ok(Some(row));
                }
            }
        }
        Ok(None)
    }

    /// Rows for the timestamps that have one, in request order
    pub fn get_many(
        &mut self,
        timestamps: &[DateTime<Utc>],
        fast: bool,
    ) -> Result<Vec<VectorRow>, StoreError> {
        let mut rows = Vec::with_capacity(timestamps.len());
        for &timestamp in timestamps {
            if let Some(row) = self.find(timestamp, fast)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// First/last timestamp and count, optionally verifying every entry
    ///
    /// The full check counts entries whose key is not the millisecond
    /// offset of their timestamp from the anchor, and entries whose
    /// timestamp does not increase over the previous key's.
    pub fn summarize(&mut self, full_check: bool) -> Result<Option<StoreSummary>, StoreError> {
        let (Some(first_key), Some(last_key)) = (
            self.index.keys().next().copied(),
            self.index.keys().next_back().copied(),
        ) else {
            return Ok(None);
        };

        let first = self.get(first_key)?.map(|row| row.timestamp);
        let last = self.get(last_key)?.map(|row| row.timestamp);
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(None);
        };

        let mut violations = 0;
        if full_check {
            let anchor = self.anchor().unwrap_or(first);
            let keys: Vec<i64> = self.keys().collect();
            let mut previous: Option<DateTime<Utc>> = None;
            for key in keys {
                let Some(row) = self.get(key)? else { continue };
                if millis_from(anchor, row.timestamp) != key {
                    warn!(
                        "Snapshot key {} does not match timestamp {}",
                        entry_key(key),
                        row.timestamp
                    );
                    violations += 1;
                }
                if previous.is_some_and(|p| row.timestamp <= p) {
                    warn!("Snapshot {} not after its predecessor", row.timestamp);
                    violations += 1;
                }
                previous = Some(row.timestamp);
            }
        }

        Ok(Some(StoreSummary {
            first,
            last,
            count: self.index.len(),
            violations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression_strategy::CompressionConfig;
    use crate::value::Vector;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn row(seconds: i64) -> VectorRow {
        VectorRow {
            timestamp: at(seconds),
            vectors: vec![Vector::Reals(vec![seconds as f32; 64])],
        }
    }

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(
            dir.path().join("model.1.vec.h5"),
            CompressionEngine::new(CompressionConfig::smart()),
        )
    }

    fn fill(store: &SnapshotStore, seconds: &[i64]) {
        let mut writer = store.writer().unwrap();
        writer.set_anchor(at(0)).unwrap();
        for &s in seconds {
            writer.put(millis_from(at(0), at(s)), &row(s)).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut writer = store.writer().unwrap();
        assert!(writer.put(0, &row(0)).unwrap());
        assert!(!writer.put(0, &row(7)).unwrap());
        assert_eq!(writer.get(0).unwrap().unwrap(), row(0));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_reopen_keeps_entries_and_anchor() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fill(&store, &[0, 1, 2]);

        assert_eq!(store.anchor().unwrap(), Some(at(0)));
        let mut reader = store.reader().unwrap();
        assert_eq!(reader.keys().collect::<Vec<_>>(), [0, 1000, 2000]);
        assert_eq!(reader.get(1000).unwrap().unwrap(), row(1));

        let mut writer = store.writer().unwrap();
        assert!(writer.contains(2000));
        assert!(writer.put(3000, &row(3)).unwrap());
        writer.finish().unwrap();
        assert_eq!(store.reader().unwrap().len(), 4);
    }

    #[test]
    fn test_find_scans_on_drift() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut writer = store.writer().unwrap();
        writer.set_anchor(at(0)).unwrap();
        // row for t=5 stored under the key of t=4
        writer.put(4000, &row(5)).unwrap();
        writer.finish().unwrap();

        let mut reader = store.reader().unwrap();
        assert_eq!(reader.find(at(5), false).unwrap(), Some(row(5)));
        assert_eq!(reader.find(at(5), true).unwrap(), None);
        // fast mode trusts whatever sits under the key
        assert_eq!(reader.find(at(4), true).unwrap(), Some(row(5)));
        assert_eq!(reader.find(at(4), false).unwrap(), None);
    }

    #[test]
    fn test_get_many_skips_missing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fill(&store, &[0, 2]);
        let rows = store
            .reader()
            .unwrap()
            .get_many(&[at(0), at(1), at(2)], false)
            .unwrap();
        assert_eq!(rows, vec![row(0), row(2)]);
    }

    #[test]
    fn test_summarize() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.summarize(false).unwrap(), None);

        fill(&store, &[0, 1, 2, 3]);
        let summary = store.summarize(true).unwrap().unwrap();
        assert_eq!(summary.first, at(0));
        assert_eq!(summary.last, at(3));
        assert_eq!(summary.count, 4);
        assert_eq!(summary.violations, 0);

        let mut writer = store.writer().unwrap();
        writer.put(10_000, &row(4)).unwrap();
        writer.finish().unwrap();
        assert_eq!(store.summarize(true).unwrap().unwrap().violations, 1);
    }

    #[test]
    fn test_torn_tail_is_ignored_then_cut() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fill(&store, &[0, 1]);

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(&[5, 0, 0, 0, b'/', b'9']).unwrap();
        drop(file);

        assert_eq!(store.reader().unwrap().len(), 2);
        let mut writer = store.writer().unwrap();
        assert!(writer.put(2000, &row(2)).unwrap());
        writer.finish().unwrap();
        let mut reader = store.reader().unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.get(2000).unwrap().unwrap(), row(2));
    }

    #[test]
    fn test_delete_and_staleness() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(!store.delete().unwrap());
        assert!(!store.is_older_than(&dir.path().join("missing.MXS")));

        fill(&store, &[0]);
        assert!(store.exists());
        assert!(store.delete().unwrap());
        assert!(!store.exists());
    }
}
