// SPDX-License-Identifier: MIT
//! Fixed-width record codec
//!
//! A [`DecodingPlan`] is derived from the schema once: one [`PlanItem`] per
//! channel in declaration order, packed little-endian with no gaps. The plan
//! decodes a record into one [`Slot`] per channel and encodes slots back
//! into identical bytes.
//!
//! The plan also has a compact text form, one token per channel:
//!
//! ```text
//! C32      32-byte character scalar
//! C20x3    3 character elements of 20 bytes
//! I  R     int / real scalar
//! I4 R4    int / real vector of 4 elements
//! V120     float vector of 120 elements
//! X8       8 opaque bytes
//! ```

use std::fmt;
use std::ops::Range;

use tracing::warn;

use crate::schema::{ElementType, Schema};
use crate::value::{Slot, Value, Vector};

/// Errors raised by the record codec
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decoding plan covers {plan} bytes, schema declares {declared}")]
    LengthMismatch { plan: usize, declared: usize },

    #[error("record too short: {got} of {expected} bytes")]
    ShortRecord { expected: usize, got: usize },

    #[error("expected {expected} slots, got {got}")]
    SlotMismatch { expected: usize, got: usize },

    #[error("slot {index} does not fit plan item {token}")]
    SlotType { index: usize, token: String },

    #[error("{field} value needs {got} bytes, field holds {width}")]
    FieldWidth {
        field: &'static str,
        width: usize,
        got: usize,
    },

    #[error("invalid plan token {0:?}")]
    BadToken(String),

    #[error("unrecognized solver version {0:?}")]
    Version(String),

    #[error("unparseable timestamp {0:?}")]
    Timestamp(String),

    #[error("unknown snapshot type {0:?}")]
    SnapshotType(String),
}

/// Decoding instruction for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanItem {
    Chars { len: usize },
    CharVec { width: usize, count: usize },
    Int,
    IntVec { count: usize },
    Real,
    RealVec { count: usize },
    FloatVec { count: usize },
    Skip { len: usize },
}

impl PlanItem {
    /// Bytes this item occupies in a record
    pub fn byte_width(&self) -> usize {
        match *self {
            PlanItem::Chars { len } | PlanItem::Skip { len } => len,
            PlanItem::CharVec { width, count } => width * count,
            PlanItem::Int | PlanItem::Real => 4,
            PlanItem::IntVec { count }
            | PlanItem::RealVec { count }
            | PlanItem::FloatVec { count } => 4 * count,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, PlanItem::Skip { .. })
    }

    fn parse(token: &str) -> Result<Self, CodecError> {
        let bad = || CodecError::BadToken(token.to_string());
        let number = |text: &str| text.parse::<usize>().map_err(|_| bad());
        let (kind, rest) = token.split_at(token.chars().next().map_or(0, char::len_utf8));

        match kind {
            "C" => match rest.split_once('x') {
                Some((width, count)) => Ok(PlanItem::CharVec {
                    width: number(width)?,
                    count: number(count)?,
                }),
                None => Ok(PlanItem::Chars { len: number(rest)? }),
            },
            "I" if rest.is_empty() => Ok(PlanItem::Int),
            "I" => Ok(PlanItem::IntVec { count: number(rest)? }),
            "R" if rest.is_empty() => Ok(PlanItem::Real),
            "R" => Ok(PlanItem::RealVec { count: number(rest)? }),
            "V" => Ok(PlanItem::FloatVec { count: number(rest)? }),
            "X" => Ok(PlanItem::Skip { len: number(rest)? }),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for PlanItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanItem::Chars { len } => write!(f, "C{len}"),
            PlanItem::CharVec { width, count } => write!(f, "C{width}x{count}"),
            PlanItem::Int => f.write_str("I"),
            PlanItem::IntVec { count } => write!(f, "I{count}"),
            PlanItem::Real => f.write_str("R"),
            PlanItem::RealVec { count } => write!(f, "R{count}"),
            PlanItem::FloatVec { count } => write!(f, "V{count}"),
            PlanItem::Skip { len } => write!(f, "X{len}"),
        }
    }
}

/// Ordered per-channel decoding instructions for one record layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodingPlan {
    items: Vec<PlanItem>,
    offsets: Vec<usize>,
    record_length: usize,
}

impl DecodingPlan {
    fn from_items(items: Vec<PlanItem>) -> Self {
        let mut offsets = Vec::with_capacity(items.len());
        let mut offset = 0;
        for item in &items {
            offsets.push(offset);
            offset += item.byte_width();
        }
        Self {
            items,
            offsets,
            record_length: offset,
        }
    }

    /// Derive the plan from the schema's channel table
    pub fn from_schema(schema: &Schema) -> Result<Self, CodecError> {
        let items: Vec<PlanItem> = schema
            .channels()
            .iter()
            .map(|channel| match channel.element_type() {
                ElementType::Char if channel.is_vector => PlanItem::CharVec {
                    width: channel.data_type_length,
                    count: channel.item_count,
                },
                ElementType::Char => PlanItem::Chars {
                    len: channel.data_length,
                },
                ElementType::Int4 if channel.is_vector => PlanItem::IntVec {
                    count: channel.item_count,
                },
                ElementType::Int4 => PlanItem::Int,
                ElementType::Real if channel.is_vector => PlanItem::RealVec {
                    count: channel.item_count,
                },
                ElementType::Real => PlanItem::Real,
                ElementType::Rvec if channel.is_vector => PlanItem::FloatVec {
                    count: channel.item_count,
                },
                // a single keyed element is read like a REAL
                ElementType::Rvec => PlanItem::Real,
                ElementType::Unknown(code) => {
                    warn!(
                        "Channel {} has unknown element type {:?}; skipping {} bytes",
                        channel.cid, code, channel.data_length
                    );
                    PlanItem::Skip {
                        len: channel.data_length,
                    }
                }
            })
            .collect();

        let plan = Self::from_items(items);
        let declared = schema.record_length();
        if plan.record_length != declared {
            return Err(CodecError::LengthMismatch {
                plan: plan.record_length,
                declared,
            });
        }
        Ok(plan)
    }

    /// Restore a plan from its text form
    pub fn from_packed(packed: &str) -> Result<Self, CodecError> {
        let items = packed
            .split_whitespace()
            .map(PlanItem::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_items(items))
    }

    pub fn to_packed(&self) -> String {
        self.items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn record_length(&self) -> usize {
        self.record_length
    }

    /// Byte range of a channel inside a record
    pub fn field_range(&self, index: usize) -> Option<Range<usize>> {
        let item = self.items.get(index)?;
        let start = self.offsets[index];
        Some(start..start + item.byte_width())
    }

    /// Decode one record into a slot per channel
    pub fn decode(&self, record: &[u8]) -> Result<Vec<Slot>, CodecError> {
        if record.len() < self.record_length {
            return Err(CodecError::ShortRecord {
                expected: self.record_length,
                got: record.len(),
            });
        }

        let slots = self
            .items
            .iter()
            .zip(&self.offsets)
            .map(|(item, &offset)| {
                let field = &record[offset..offset + item.byte_width()];
                match *item {
                    PlanItem::Chars { .. } => Slot::Scalar(Value::Chars(field.to_vec())),
                    PlanItem::CharVec { width, .. } if width > 0 => Slot::Vector(Vector::Chars(
                        field.chunks(width).map(<[u8]>::to_vec).collect(),
                    )),
                    PlanItem::CharVec { .. } => Slot::Vector(Vector::Chars(Vec::new())),
                    PlanItem::Int => Slot::Scalar(Value::Int(le_i32(field))),
                    PlanItem::IntVec { .. } => {
                        Slot::Vector(Vector::Ints(field.chunks_exact(4).map(le_i32).collect()))
                    }
                    PlanItem::Real => Slot::Scalar(Value::Real(le_f32(field))),
                    PlanItem::RealVec { .. } | PlanItem::FloatVec { .. } => {
                        Slot::Vector(Vector::Reals(field.chunks_exact(4).map(le_f32).collect()))
                    }
                    PlanItem::Skip { .. } => Slot::Skipped,
                }
            })
            .collect();
        Ok(slots)
    }

    /// Encode one slot per channel back into a record
    ///
    /// Character fields shorter than their width are padded with spaces;
    /// skipped channels are written as zero bytes.
    pub fn encode(&self, slots: &[Slot]) -> Result<Vec<u8>, CodecError> {
        if slots.len() != self.items.len() {
            return Err(CodecError::SlotMismatch {
                expected: self.items.len(),
                got: slots.len(),
            });
        }

        let mut record = Vec::with_capacity(self.record_length);
        for (index, (item, slot)) in self.items.iter().zip(slots).enumerate() {
            let mismatch = || CodecError::SlotType {
                index,
                token: item.to_string(),
            };
            match (*item, slot) {
                (PlanItem::Chars { len }, Slot::Scalar(Value::Chars(bytes))) => {
                    put_chars(&mut record, bytes, len)?;
                }
                (PlanItem::CharVec { width, count }, Slot::Vector(Vector::Chars(elements))) => {
                    if elements.len() != count {
                        return Err(mismatch());
                    }
                    for element in elements {
                        put_chars(&mut record, element, width)?;
                    }
                }
                (PlanItem::Int, Slot::Scalar(Value::Int(v))) => {
                    record.extend_from_slice(&v.to_le_bytes());
                }
                (PlanItem::IntVec { count }, Slot::Vector(Vector::Ints(values))) => {
                    if values.len() != count {
                        return Err(mismatch());
                    }
                    for v in values {
                        record.extend_from_slice(&v.to_le_bytes());
                    }
                }
                (PlanItem::Real, Slot::Scalar(Value::Real(v))) => {
                    record.extend_from_slice(&v.to_le_bytes());
                }
                (
                    PlanItem::RealVec { count } | PlanItem::FloatVec { count },
                    Slot::Vector(Vector::Reals(values)),
                ) => {
                    if values.len() != count {
                        return Err(mismatch());
                    }
                    for v in values {
                        record.extend_from_slice(&v.to_le_bytes());
                    }
                }
                (PlanItem::Skip { len }, Slot::Skipped) => {
                    record.resize(record.len() + len, 0);
                }
                _ => return Err(mismatch()),
            }
        }
        Ok(record)
    }
}

fn put_chars(record: &mut Vec<u8>, bytes: &[u8], width: usize) -> Result<(), CodecError> {
    if bytes.len() > width {
        return Err(CodecError::FieldWidth {
            field: "CHAR",
            width,
            got: bytes.len(),
        });
    }
    record.extend_from_slice(bytes);
    record.resize(record.len() + (width - bytes.len()), b' ');
    Ok(())
}

fn le_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(raw)
}

fn le_f32(bytes: &[u8]) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    f32::from_le_bytes(raw)
}
