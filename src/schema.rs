// SPDX-License-Identifier: MIT
//! MX1 schema loader
//!
//! The MX1 file is XML with one `XL1` element per channel. Each element
//! declares where the channel lives inside a fixed-width record and how its
//! bytes are typed. Channels are kept in declaration order; that order is
//! the record layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cid;

/// ATTRTYPE of the timestamp channel
pub const ATTR_TIMESTAMP: &str = "TIMESTAMP";
/// ATTRTYPE of the snapshot type channel
pub const ATTR_SNAPSHOTTYPE: &str = "SNAPSHOTTYPE";
/// ATTRTYPE of the solver version channel
pub const ATTR_CVERSO: &str = "CVERSO";
/// OBJTYPE of general (meta) channels
pub const OBJTYPE_GENERAL: &str = "ALLG";

/// Flag bit marking channels whose width comes from the MX2 index
const FLAG_MX2_DEFINED: u32 = 0x4;

/// Errors raised while loading a schema
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("schema malformed: {0}")]
    Malformed(String),

    #[error("schema invalid: no timestamp")]
    NoTimestamp,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Element type of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    Char,
    Int4,
    Real,
    /// Vector of 32-bit floats
    Rvec,
    Unknown(String),
}

impl ElementType {
    pub fn from_code(code: &str) -> Self {
        match code {
            "CHAR" => ElementType::Char,
            "INT4" => ElementType::Int4,
            "REAL" => ElementType::Real,
            "RVEC" => ElementType::Rvec,
            other => ElementType::Unknown(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ElementType::Unknown(_))
    }
}

/// One `XL1` declaration plus its derived attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub objtype: String,
    pub name1: String,
    pub name2: String,
    pub objtype_pk: String,
    pub attrtype: String,
    pub data_type: String,
    pub data_length: usize,
    pub data_type_length: usize,
    pub data_offset: usize,
    pub flags: u32,

    pub cid: String,
    pub cid_without_pk: Option<String>,
    pub item_count: usize,
    pub is_vector: bool,
    pub is_mx2_vector: bool,
    pub is_mx2_rvec: bool,
}

impl Channel {
    /// Build a channel from its declared fields and derive the rest
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        objtype: &str,
        name1: &str,
        name2: &str,
        objtype_pk: &str,
        attrtype: &str,
        data_type: &str,
        data_length: usize,
        data_type_length: usize,
        data_offset: usize,
        flags: u32,
    ) -> Result<Self, SchemaError> {
        if data_type_length == 0 {
            return Err(SchemaError::Malformed(format!(
                "{}: DATATYPELENGTH is 0",
                cid::compose(objtype, name1, name2, objtype_pk, attrtype)
            )));
        }

        let cid = cid::compose(objtype, name1, name2, objtype_pk, attrtype);
        let item_count = data_length / data_type_length;
        // Channels of objects without a real key are per-object vectors even with one element
        let is_vector = item_count > 1 || (objtype_pk.len() < 3 && objtype != OBJTYPE_GENERAL);
        let is_mx2_vector = is_vector && (flags & FLAG_MX2_DEFINED) != 0;
        let is_mx2_rvec = is_mx2_vector && data_type == "RVEC";

        Ok(Self {
            objtype: objtype.to_string(),
            name1: name1.to_string(),
            name2: name2.to_string(),
            objtype_pk: objtype_pk.to_string(),
            attrtype: attrtype.to_string(),
            data_type: data_type.to_string(),
            data_length,
            data_type_length,
            data_offset,
            flags,
            cid_without_pk: cid::normalize(&cid),
            cid,
            item_count,
            is_vector,
            is_mx2_vector,
            is_mx2_rvec,
        })
    }

    pub fn element_type(&self) -> ElementType {
        ElementType::from_code(&self.data_type)
    }

    fn from_attributes(attributes: &HashMap<String, String>, position: usize) -> Result<Self, SchemaError> {
        let text = |key: &str, required: bool| -> Result<String, SchemaError> {
            match attributes.get(key) {
                Some(value) => Ok(value.trim().to_string()),
                None if required => Err(SchemaError::Malformed(format!(
                    "XL1 #{position}: attribute {key} missing"
                ))),
                None => Ok(String::new()),
            }
        };
        let integer = |key: &str| -> Result<i64, SchemaError> {
            let raw = text(key, true)?;
            raw.parse::<i64>().map_err(|_| {
                SchemaError::Malformed(format!("XL1 #{position}: {key}={raw:?} is not an integer"))
            })
        };
        let size = |key: &str| -> Result<usize, SchemaError> {
            let value = integer(key)?;
            usize::try_from(value).map_err(|_| {
                SchemaError::Malformed(format!("XL1 #{position}: {key}={value} is negative"))
            })
        };

        let flags = integer("FLAGS")?;
        Self::new(
            &text("OBJTYPE", true)?,
            &text("NAME1", false)?,
            &text("NAME2", false)?,
            &text("OBJTYPE_PK", false)?,
            &text("ATTRTYPE", true)?,
            &text("DATATYPE", true)?,
            size("DATALENGTH")?,
            size("DATATYPELENGTH")?,
            size("DATAOFFSET")?,
            u32::try_from(flags).map_err(|_| {
                SchemaError::Malformed(format!("XL1 #{position}: FLAGS={flags} out of range"))
            })?,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaTable {
    channels: Vec<Channel>,
}

/// Parsed MX1 schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SchemaTable", into = "SchemaTable")]
pub struct Schema {
    channels: Vec<Channel>,
    timestamp: usize,
    snapshot_type: Option<usize>,
    cverso: Option<usize>,
    scalars: Vec<usize>,
    vectors: Vec<usize>,
}

impl TryFrom<SchemaTable> for Schema {
    type Error = SchemaError;

    fn try_from(table: SchemaTable) -> Result<Self, Self::Error> {
        Schema::from_channels(table.channels)
    }
}

impl From<Schema> for SchemaTable {
    fn from(schema: Schema) -> Self {
        SchemaTable {
            channels: schema.channels,
        }
    }
}

impl Schema {
    /// Load and parse an MX1 file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SchemaError::Missing(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let schema = Self::parse(&decode_text(&bytes))?;
        debug!(
            "Schema {:?} parsed: {} channels, record length {}",
            path,
            schema.channels.len(),
            schema.record_length()
        );
        Ok(schema)
    }

    /// Parse MX1 XML text
    pub fn parse(xml: &str) -> Result<Self, SchemaError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut channels = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                    if element.name().as_ref() != b"XL1" {
                        continue;
                    }
                    let mut attributes = HashMap::new();
                    for attribute in element.attributes() {
                        let attribute =
                            attribute.map_err(|e| SchemaError::Malformed(e.to_string()))?;
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                        let value = attribute
                            .unescape_value()
                            .map_err(|e| SchemaError::Malformed(e.to_string()))?
                            .into_owned();
                        attributes.insert(key, value);
                    }
                    channels.push(Channel::from_attributes(&attributes, channels.len())?);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(SchemaError::Malformed(format!(
                        "XML error at byte {}: {}",
                        reader.error_position(),
                        e
                    )))
                }
            }
        }

        Self::from_channels(channels)
    }

    /// Validate a channel list and index its housekeeping channels
    pub fn from_channels(channels: Vec<Channel>) -> Result<Self, SchemaError> {
        let find = |attr: &str| channels.iter().position(|c| c.attrtype == attr);
        let timestamp = find(ATTR_TIMESTAMP).ok_or(SchemaError::NoTimestamp)?;
        let snapshot_type = find(ATTR_SNAPSHOTTYPE);
        let cverso = find(ATTR_CVERSO);

        for channel in &channels {
            let numeric = matches!(
                channel.element_type(),
                ElementType::Int4 | ElementType::Real | ElementType::Rvec
            );
            if numeric && channel.data_type_length != 4 {
                return Err(SchemaError::Malformed(format!(
                    "{}: DATATYPE={} with DATATYPELENGTH={} (expected 4)",
                    channel.cid, channel.data_type, channel.data_type_length
                )));
            }
        }

        let mut scalars = Vec::new();
        let mut vectors = Vec::new();
        for (index, channel) in channels.iter().enumerate() {
            if index == timestamp || !channel.element_type().is_known() {
                continue;
            }
            if channel.is_vector {
                vectors.push(index);
            } else {
                scalars.push(index);
            }
        }

        Ok(Self {
            channels,
            timestamp,
            snapshot_type,
            cverso,
            scalars,
            vectors,
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn timestamp_index(&self) -> usize {
        self.timestamp
    }

    pub fn timestamp_channel(&self) -> &Channel {
        &self.channels[self.timestamp]
    }

    pub fn snapshot_type_index(&self) -> Option<usize> {
        self.snapshot_type
    }

    pub fn cverso_index(&self) -> Option<usize> {
        self.cverso
    }

    /// Channel indices of the scalar surface columns (TIMESTAMP excluded)
    pub fn scalar_indices(&self) -> &[usize] {
        &self.scalars
    }

    /// Channel indices of the vector snapshot channels
    pub fn vector_indices(&self) -> &[usize] {
        &self.vectors
    }

    pub fn scalar_cids(&self) -> Vec<String> {
        self.scalars.iter().map(|&i| self.channels[i].cid.clone()).collect()
    }

    pub fn vector_cids(&self) -> Vec<String> {
        self.vectors.iter().map(|&i| self.channels[i].cid.clone()).collect()
    }

    /// Record length declared by the last channel
    pub fn record_length(&self) -> usize {
        self.channels
            .last()
            .map(|c| c.data_offset + c.data_length)
            .unwrap_or(0)
    }

    /// SHA-256 over the channel table
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for channel in &self.channels {
            hasher.update(channel.cid.as_bytes());
            hasher.update(channel.data_type.as_bytes());
            hasher.update((channel.data_length as u64).to_le_bytes());
            hasher.update((channel.data_type_length as u64).to_le_bytes());
            hasher.update((channel.data_offset as u64).to_le_bytes());
            hasher.update(channel.flags.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// MX1 files are UTF-8 or Latin-1
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MX1: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MX1>
  <XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="4639827058859487185" ATTRTYPE="CVERSO" DATATYPE="CHAR" DATALENGTH="80" DATATYPELENGTH="80" DATAOFFSET="0" FLAGS="0"/>
  <XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="4639827058859487185" ATTRTYPE="TIMESTAMP" DATATYPE="CHAR" DATALENGTH="32" DATATYPELENGTH="32" DATAOFFSET="80" FLAGS="0"/>
  <XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="4639827058859487185" ATTRTYPE="SNAPSHOTTYPE" DATATYPE="CHAR" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="112" FLAGS="0"/>
  <XL1 OBJTYPE="KNOT" NAME1="K1" NAME2="" OBJTYPE_PK="5289899964753656852" ATTRTYPE="PH" DATATYPE="REAL" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="116" FLAGS="0"/>
  <XL1 OBJTYPE="KNOT" NAME1="*" NAME2="*" OBJTYPE_PK="*" ATTRTYPE="PH" DATATYPE="REAL" DATALENGTH="12" DATATYPELENGTH="4" DATAOFFSET="120" FLAGS="0"/>
  <XL1 OBJTYPE="ROHR" NAME1="*" NAME2="*" OBJTYPE_PK="*" ATTRTYPE="PVEC" DATATYPE="RVEC" DATALENGTH="20" DATATYPELENGTH="4" DATAOFFSET="132" FLAGS="4"/>
  <XL1 OBJTYPE="PUMP" NAME1="*" NAME2="*" OBJTYPE_PK="*" ATTRTYPE="QM" DATATYPE="REAL" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="152" FLAGS="0"/>
  <XL1 OBJTYPE="KNOT" NAME1="K1" NAME2="" OBJTYPE_PK="5289899964753656852" ATTRTYPE="XX" DATATYPE="BLOB" DATALENGTH="8" DATATYPELENGTH="8" DATAOFFSET="156" FLAGS="0"/>
</MX1>"#;

    #[test]
    fn test_parse_channels_in_order() {
        let schema = Schema::parse(MX1).unwrap();
        assert_eq!(schema.channels().len(), 8);
        assert_eq!(schema.timestamp_index(), 1);
        assert_eq!(schema.cverso_index(), Some(0));
        assert_eq!(schema.snapshot_type_index(), Some(2));
        assert_eq!(schema.record_length(), 164);
    }

    #[test]
    fn test_scalar_vector_split() {
        let schema = Schema::parse(MX1).unwrap();
        // CVERSO, SNAPSHOTTYPE and the keyed KNOT channel; BLOB is not decodable
        assert_eq!(schema.scalar_indices(), &[0, 2, 3]);
        // multi-element KNOT, RVEC pipe vector, and the single-element PUMP without key
        assert_eq!(schema.vector_indices(), &[4, 5, 6]);
        assert!(schema.scalar_cids().iter().all(|c| !c.ends_with("~TIMESTAMP")));
    }

    #[test]
    fn test_single_keyed_rvec_is_scalar() {
        let xml = r#"<MX1>
<XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="4639827058859487185" ATTRTYPE="TIMESTAMP" DATATYPE="CHAR" DATALENGTH="32" DATATYPELENGTH="32" DATAOFFSET="0" FLAGS="0"/>
<XL1 OBJTYPE="ROHR" NAME1="R1" NAME2="" OBJTYPE_PK="5289899964753656852" ATTRTYPE="PVEC" DATATYPE="RVEC" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="32" FLAGS="0"/>
<XL1 OBJTYPE="ROHR" NAME1="*" NAME2="*" OBJTYPE_PK="*" ATTRTYPE="PVEC" DATATYPE="RVEC" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="36" FLAGS="4"/>
</MX1>"#;
        let schema = Schema::parse(xml).unwrap();
        assert!(!schema.channel(1).unwrap().is_vector);
        assert_eq!(schema.scalar_cids(), vec!["ROHR~R1~~5289899964753656852~PVEC"]);
        // a single element without key is still a vector
        assert_eq!(schema.vector_indices(), &[2]);
    }

    #[test]
    fn test_derived_attributes() {
        let schema = Schema::parse(MX1).unwrap();
        let pvec = schema.channel(5).unwrap();
        assert_eq!(pvec.item_count, 5);
        assert!(pvec.is_vector && pvec.is_mx2_vector && pvec.is_mx2_rvec);

        let knot = schema.channel(4).unwrap();
        assert!(knot.is_vector && !knot.is_mx2_vector);
        assert_eq!(knot.cid, "KNOT~*~*~*~PH");
        assert_eq!(knot.cid_without_pk, None);

        let ph = schema.channel(3).unwrap();
        assert_eq!(ph.cid, "KNOT~K1~~5289899964753656852~PH");
        assert_eq!(ph.cid_without_pk.as_deref(), Some("KNOT~K1~~PH"));
    }

    #[test]
    fn test_missing_timestamp() {
        let xml = r#"<MX1><XL1 OBJTYPE="KNOT" NAME1="" NAME2="" OBJTYPE_PK="123" ATTRTYPE="PH" DATATYPE="REAL" DATALENGTH="4" DATATYPELENGTH="4" DATAOFFSET="0" FLAGS="0"/></MX1>"#;
        assert!(matches!(Schema::parse(xml), Err(SchemaError::NoTimestamp)));
    }

    #[test]
    fn test_non_integer_field() {
        let xml = r#"<MX1><XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="123" ATTRTYPE="TIMESTAMP" DATATYPE="CHAR" DATALENGTH="x32" DATATYPELENGTH="32" DATAOFFSET="0" FLAGS="0"/></MX1>"#;
        assert!(matches!(Schema::parse(xml), Err(SchemaError::Malformed(_))));
    }

    #[test]
    fn test_numeric_width_must_be_four() {
        let xml = r#"<MX1>
<XL1 OBJTYPE="ALLG" NAME1="" NAME2="" OBJTYPE_PK="123" ATTRTYPE="TIMESTAMP" DATATYPE="CHAR" DATALENGTH="32" DATATYPELENGTH="32" DATAOFFSET="0" FLAGS="0"/>
<XL1 OBJTYPE="KNOT" NAME1="" NAME2="" OBJTYPE_PK="123" ATTRTYPE="PH" DATATYPE="REAL" DATALENGTH="8" DATATYPELENGTH="8" DATAOFFSET="32" FLAGS="0"/>
</MX1>"#;
        assert!(matches!(Schema::parse(xml), Err(SchemaError::Malformed(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = Schema::from_file("/nonexistent/model.1.MX1").unwrap_err();
        assert!(matches!(err, SchemaError::Missing(_)));
        assert!(err.to_string().starts_with("schema missing"));
    }

    #[test]
    fn test_serde_recomputes_indices() {
        let schema = Schema::parse(MX1).unwrap();
        let json = serde_json::to_vec(&schema).unwrap();
        let back: Schema = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, schema);
        assert_eq!(back.fingerprint(), schema.fingerprint());
    }

    #[test]
    fn test_latin1_fallback() {
        assert_eq!(decode_text(&[b'K', 0xfc, b'l']), "K\u{fc}l");
    }
}
