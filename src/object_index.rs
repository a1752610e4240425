// SPDX-License-Identifier: MIT
//! MX2 object index reader
//!
//! The MX2 file is a sequence of blocks, each a 64-byte header followed by
//! `DataLength` bytes of data:
//!
//! ```text
//! 0..12   ObjType        (space/NUL padded)
//! 12..24  AttrType
//! 24..28  DataType       CHAR | INT4 | ...
//! 28..32  DataTypeLength i32 LE
//! 32..60  padding
//! 60..64  DataLength     i32 LE
//! ```
//!
//! Only CHAR (object keys) and INT4 (pipe point counts) blocks are decoded.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::format::read_up_to;
use crate::value::trim_text;

/// Size of one MX2 block header
pub const MX2_HEADER_SIZE: usize = 64;

/// Object type of pipes
pub const OBJTYPE_PIPE: &str = "ROHR";

/// Attribute holding the interior point count of every pipe
pub const ATTR_POINT_COUNT: &str = "N_OF_POINTS";

/// Errors raised while loading the object index
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("object index missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded data of one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum IndexData {
    Chars(Vec<String>),
    Ints(Vec<i32>),
    /// Data type not decoded
    Skipped,
}

/// One MX2 block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub objtype: String,
    pub attrtype: String,
    pub data_type: String,
    pub data_type_length: usize,
    pub data_length: usize,
    pub data: IndexData,
}

/// Parsed MX2 file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectIndex {
    records: Vec<IndexRecord>,
}

impl ObjectIndex {
    pub fn from_records(records: Vec<IndexRecord>) -> Self {
        Self { records }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IndexError::Missing(path.to_path_buf()));
        }
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        let index = Self::read(&mut file)?;
        debug!("Object index {:?} parsed: {} blocks", path, index.records.len());
        Ok(index)
    }

    /// Read blocks until the input is exhausted
    ///
    /// A block whose data is not consumed exactly is followed by a seek to
    /// the offset the headers add up to.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, IndexError> {
        let mut records = Vec::new();
        let mut expected = reader.stream_position()?;

        loop {
            let mut header = [0u8; MX2_HEADER_SIZE];
            let got = read_up_to(reader, &mut header)?;
            if got == 0 {
                break;
            }
            if got < MX2_HEADER_SIZE {
                error!(
                    "MX2 header at offset {} truncated: {} of {} bytes",
                    expected, got, MX2_HEADER_SIZE
                );
                break;
            }

            let objtype = trim_text(&header[0..12]);
            let attrtype = trim_text(&header[12..24]);
            let data_type = trim_text(&header[24..28]);
            let data_type_length = le_i32(&header[28..32]);
            let data_length = le_i32(&header[60..64]);
            let (Ok(data_type_length), Ok(data_length)) =
                (usize::try_from(data_type_length), usize::try_from(data_length))
            else {
                error!(
                    "MX2 header at offset {} has negative lengths ({}, {})",
                    expected, data_type_length, data_length
                );
                break;
            };

            let data = match Self::read_data(reader, &data_type, data_type_length, data_length)? {
                Some(data) => data,
                None => {
                    error!("MX2 block {}/{} at offset {} truncated", objtype, attrtype, expected);
                    break;
                }
            };

            records.push(IndexRecord {
                objtype,
                attrtype,
                data_type,
                data_type_length,
                data_length,
                data,
            });

            expected += (MX2_HEADER_SIZE + data_length) as u64;
            let position = reader.stream_position()?;
            if position != expected {
                warn!(
                    "MX2 block misaligned: at offset {}, expected {}; seeking",
                    position, expected
                );
                reader.seek(SeekFrom::Start(expected))?;
            }
        }

        Ok(Self { records })
    }

    /// Returns `None` when the input ends inside the block
    fn read_data<R: Read + Seek>(
        reader: &mut R,
        data_type: &str,
        data_type_length: usize,
        data_length: usize,
    ) -> Result<Option<IndexData>, IndexError> {
        match data_type {
            "CHAR" if data_type_length > 0 => {
                let count = data_length / data_type_length;
                let mut raw = vec![0u8; count * data_type_length];
                if read_up_to(reader, &mut raw)? < raw.len() {
                    return Ok(None);
                }
                Ok(Some(IndexData::Chars(
                    raw.chunks(data_type_length).map(trim_text).collect(),
                )))
            }
            "INT4" => {
                let count = data_length / 4;
                let mut raw = vec![0u8; count * 4];
                if read_up_to(reader, &mut raw)? < raw.len() {
                    return Ok(None);
                }
                Ok(Some(IndexData::Ints(raw.chunks_exact(4).map(le_i32).collect())))
            }
            _ => {
                reader.seek(SeekFrom::Current(data_length as i64))?;
                Ok(Some(IndexData::Skipped))
            }
        }
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Object types present, in file order
    pub fn objtypes(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for record in &self.records {
            if !seen.contains(&record.objtype.as_str()) {
                seen.push(&record.objtype);
            }
        }
        seen
    }

    /// Ordered primary keys of an object type
    pub fn keys(&self, objtype: &str) -> Option<&[String]> {
        self.records.iter().find_map(|record| match &record.data {
            IndexData::Chars(keys)
                if record.objtype == objtype
                    && (record.attrtype.eq_ignore_ascii_case("tk")
                        || record.attrtype.eq_ignore_ascii_case("pk")) =>
            {
                Some(keys.as_slice())
            }
            _ => None,
        })
    }

    /// Interior point count of every pipe, in pipe key order
    pub fn n_of_points(&self) -> Option<&[i32]> {
        self.records.iter().find_map(|record| match &record.data {
            IndexData::Ints(counts)
                if record.objtype == OBJTYPE_PIPE && record.attrtype == ATTR_POINT_COUNT =>
            {
                Some(counts.as_slice())
            }
            _ => None,
        })
    }

    /// Element index of an object inside the vector channels of its type
    pub fn position(&self, objtype: &str, pk: &str) -> Option<usize> {
        self.keys(objtype)?.iter().position(|key| key == pk)
    }

    /// Split a dynamic-width pipe vector into one slice per pipe
    ///
    /// Returns `None` when the point counts do not add up to the vector length.
    pub fn pipe_segments<'a, T>(&self, values: &'a [T]) -> Option<Vec<&'a [T]>> {
        let counts = self.n_of_points()?;
        let mut segments = Vec::with_capacity(counts.len());
        let mut start = 0usize;
        for &count in counts {
            let end = start + usize::try_from(count).ok()?;
            segments.push(values.get(start..end)?);
            start = end;
        }
        (start == values.len()).then_some(segments)
    }
}

fn le_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(raw)
}

/// Build one MX2 block (header plus data)
pub fn encode_block(
    objtype: &str,
    attrtype: &str,
    data_type: &str,
    data_type_length: usize,
    data: &[u8],
) -> Vec<u8> {
    fn padded(text: &str, width: usize) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(width, b' ');
        bytes.truncate(width);
        bytes
    }

    let mut block = Vec::with_capacity(MX2_HEADER_SIZE + data.len());
    block.extend_from_slice(&padded(objtype, 12));
    block.extend_from_slice(&padded(attrtype, 12));
    block.extend_from_slice(&padded(data_type, 4));
    block.extend_from_slice(&(data_type_length as i32).to_le_bytes());
    block.extend_from_slice(&[0u8; 28]);
    block.extend_from_slice(&(data.len() as i32).to_le_bytes());
    block.extend_from_slice(data);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chars(values: &[&str], width: usize) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| {
                let mut b = v.as_bytes().to_vec();
                b.resize(width, b' ');
                b
            })
            .collect()
    }

    fn ints(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn sample() -> Vec<u8> {
        let mut file = Vec::new();
        file.extend(encode_block("KNOT", "tk", "CHAR", 20, &chars(&["5289899964753656852", "42"], 20)));
        file.extend(encode_block("ROHR", "tk", "CHAR", 20, &chars(&["7", "8"], 20)));
        file.extend(encode_block("ROHR", "N_OF_POINTS", "INT4", 4, &ints(&[3, 2])));
        file.extend(encode_block("ROHR", "L", "REAL", 4, &[0u8; 8]));
        file
    }

    #[test]
    fn test_read_blocks() {
        let index = ObjectIndex::read(&mut Cursor::new(sample())).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.objtypes(), ["KNOT", "ROHR"]);
        assert_eq!(index.keys("KNOT").unwrap(), ["5289899964753656852", "42"]);
        assert_eq!(index.n_of_points().unwrap(), [3, 2]);
        assert_eq!(index.records()[3].data, IndexData::Skipped);
    }

    #[test]
    fn test_position_and_segments() {
        let index = ObjectIndex::read(&mut Cursor::new(sample())).unwrap();
        assert_eq!(index.position("KNOT", "42"), Some(1));
        assert_eq!(index.position("KNOT", "missing"), None);

        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let segments = index.pipe_segments(&values).unwrap();
        assert_eq!(segments, vec![&values[..3], &values[3..]]);
        assert!(index.pipe_segments(&values[..4]).is_none());
    }

    #[test]
    fn test_misaligned_block_is_healed() {
        let mut file = encode_block("ROHR", "X", "INT4", 4, &[1, 0, 0, 0, 2, 0]);
        file.extend(encode_block("KNOT", "tk", "CHAR", 4, b"K1  "));
        let index = ObjectIndex::read(&mut Cursor::new(file)).unwrap();
        assert_eq!(index.records()[0].data, IndexData::Ints(vec![1]));
        assert_eq!(index.keys("KNOT").unwrap(), ["K1"]);
    }

    #[test]
    fn test_truncated_header_ends_reading() {
        let mut file = sample();
        file.extend_from_slice(&[b'X'; 10]);
        let index = ObjectIndex::read(&mut Cursor::new(file)).unwrap();
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_empty_input() {
        let index = ObjectIndex::read(&mut Cursor::new(Vec::new())).unwrap();
        assert!(index.is_empty());
        assert!(index.n_of_points().is_none());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ObjectIndex::from_file("/nonexistent/model.MX2"),
            Err(IndexError::Missing(_))
        ));
    }
}
