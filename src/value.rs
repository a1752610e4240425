// SPDX-License-Identifier: MIT
//! Decoded record values
//!
//! A record decodes into one [`Slot`] per schema channel. Character data
//! keeps its raw bytes (padding included) so that re-encoding is exact; in
//! JSON it is written as hex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single scalar value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    #[serde(with = "hex_bytes")]
    Chars(Vec<u8>),
    Int(i32),
    #[serde(with = "real")]
    Real(f32),
}

impl Value {
    /// Numeric view; `None` for character data
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Chars(_) => None,
            Value::Int(v) => Some(*v as f64),
            Value::Real(v) => Some(*v as f64),
        }
    }

    /// Text view of character data with padding removed
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Chars(bytes) => Some(trim_text(bytes)),
            _ => None,
        }
    }
}

/// Values of one vector channel at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Vector {
    #[serde(with = "hex_list")]
    Chars(Vec<Vec<u8>>),
    Ints(Vec<i32>),
    #[serde(with = "reals")]
    Reals(Vec<f32>),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Vector::Chars(v) => v.len(),
            Vector::Ints(v) => v.len(),
            Vector::Reals(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widened numeric copy; `None` for character vectors
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Vector::Chars(_) => None,
            Vector::Ints(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Vector::Reals(v) => Some(v.iter().map(|&x| x as f64).collect()),
        }
    }
}

/// One decoded channel of a record
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Scalar(Value),
    Vector(Vector),
    /// Channel of an unknown element type, carried as opaque bytes
    Skipped,
}

/// The vector channels of one record, as kept by the snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRow {
    pub timestamp: DateTime<Utc>,
    /// Aligned with the schema's vector channel order
    pub vectors: Vec<Vector>,
}

/// Decode character bytes as UTF-8 (lossy) and strip trailing padding
pub fn trim_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// JSON numbers cannot hold NaN or infinities; those travel as strings
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum JsonFloat {
    Number(f64),
    Special(String),
}

impl JsonFloat {
    pub(crate) fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            JsonFloat::Number(value)
        } else if value.is_nan() {
            JsonFloat::Special("NaN".to_string())
        } else if value > 0.0 {
            JsonFloat::Special("inf".to_string())
        } else {
            JsonFloat::Special("-inf".to_string())
        }
    }

    pub(crate) fn to_f64<E: serde::de::Error>(&self) -> Result<f64, E> {
        match self {
            JsonFloat::Number(v) => Ok(*v),
            JsonFloat::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("invalid float literal {other:?}"))),
            },
        }
    }
}

mod real {
    use super::JsonFloat;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f32(*value)
        } else {
            JsonFloat::from_f64(*value as f64).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(JsonFloat::deserialize(deserializer)?.to_f64::<D::Error>()? as f32)
    }
}

pub(crate) mod reals {
    use super::JsonFloat;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            if value.is_finite() {
                seq.serialize_element(value)?;
            } else {
                seq.serialize_element(&JsonFloat::from_f64(*value as f64))?;
            }
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        Vec::<JsonFloat>::deserialize(deserializer)?
            .iter()
            .map(|v| v.to_f64::<D::Error>().map(|x| x as f32))
            .collect()
    }
}

pub(crate) mod reals64 {
    use super::JsonFloat;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| JsonFloat::from_f64(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<JsonFloat>::deserialize(deserializer)?
            .iter()
            .map(|v| v.to_f64::<D::Error>())
            .collect()
    }
}
