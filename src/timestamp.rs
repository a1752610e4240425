// SPDX-License-Identifier: MIT
//! Record housekeeping fields: solver version, timestamp, snapshot type
//!
//! Solvers before minor version 10 write timestamps with a `+01:00` suffix
//! that has to be compensated by one hour to get the intended wall time.
//! Newer solvers write naive UTC padded with spaces. The policy is decided
//! once from the CVERSO field and used for both reading and writing.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::value::trim_text;

static CVERSO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SIR 3S (\d{2})-(\d{2})-(\d{2})-(\d{2})")
        .expect("Invalid regex pattern for solver versions")
});

/// Write format without offset suffix
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Solver version parsed from the CVERSO channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl SolverVersion {
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let text = trim_text(raw);
        let caps = CVERSO
            .captures(&text)
            .ok_or_else(|| CodecError::Version(text.clone()))?;
        let field = |i: usize| -> Result<u32, CodecError> {
            caps[i]
                .parse()
                .map_err(|_| CodecError::Version(text.clone()))
        };
        Ok(Self {
            major: field(1)?,
            minor: field(2)?,
            patch: field(3)?,
            build: field(4)?,
        })
    }
}

/// How timestamps carry (or don't carry) a UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetPolicy {
    /// Naive UTC, no suffix
    Naive,
    /// `+01:00` suffix, read value shifted by one hour
    PlusOneHour,
}

impl OffsetPolicy {
    pub fn for_version(version: SolverVersion) -> Self {
        if version.minor < 10 {
            OffsetPolicy::PlusOneHour
        } else {
            OffsetPolicy::Naive
        }
    }

    /// Suffix appended when writing
    pub fn suffix(&self) -> &'static str {
        match self {
            OffsetPolicy::Naive => "",
            OffsetPolicy::PlusOneHour => "+01:00",
        }
    }

    fn read_shift(&self) -> Duration {
        match self {
            OffsetPolicy::Naive => Duration::zero(),
            OffsetPolicy::PlusOneHour => Duration::hours(1),
        }
    }
}

/// Decode a TIMESTAMP field
///
/// Text with an explicit offset is converted to UTC and then shifted by
/// the policy; naive text is taken as UTC.
pub fn decode_timestamp(raw: &[u8], policy: OffsetPolicy) -> Result<DateTime<Utc>, CodecError> {
    let text = trim_text(raw);
    let text = text.trim();

    if let Ok(aware) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(aware.with_timezone(&Utc) + policy.read_shift());
    }

    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| CodecError::Timestamp(text.to_string()))
}

/// Encode a timestamp into a TIMESTAMP field of `width` bytes
pub fn encode_timestamp(
    timestamp: DateTime<Utc>,
    policy: OffsetPolicy,
    width: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut text = timestamp.format(TIMESTAMP_FORMAT).to_string();
    text.push_str(policy.suffix());
    if text.len() > width {
        return Err(CodecError::FieldWidth {
            field: "TIMESTAMP",
            width,
            got: text.len(),
        });
    }
    let mut bytes = text.into_bytes();
    bytes.resize(width, b' ');
    Ok(bytes)
}

/// Whole milliseconds from `anchor` to `timestamp`, truncated toward zero
pub fn millis_from(anchor: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
    let delta = timestamp - anchor;
    match delta.num_microseconds() {
        Some(micros) => micros / 1000,
        None => delta.num_milliseconds(),
    }
}

/// SNAPSHOTTYPE tag carried in every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotType {
    /// Initial steady state
    Stat,
    /// Regular time step
    Time,
    /// Closing minimum record
    Tmin,
    /// Closing maximum record
    Tmax,
}

impl SnapshotType {
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let text = trim_text(raw);
        match text.as_str() {
            "STAT" => Ok(SnapshotType::Stat),
            "TIME" => Ok(SnapshotType::Time),
            "TMIN" => Ok(SnapshotType::Tmin),
            "TMAX" => Ok(SnapshotType::Tmax),
            _ => Err(CodecError::SnapshotType(text)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Stat => "STAT",
            SnapshotType::Time => "TIME",
            SnapshotType::Tmin => "TMIN",
            SnapshotType::Tmax => "TMAX",
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").unwrap();
        Utc.from_utc_datetime(&naive)
    }

    #[test]
    fn test_version_policy() {
        let old = SolverVersion::parse(b"SIR 3S 90-09-00-01 3S Consult     ").unwrap();
        assert_eq!(old.minor, 9);
        assert_eq!(OffsetPolicy::for_version(old), OffsetPolicy::PlusOneHour);

        let new = SolverVersion::parse(
            b"SIR 3S 90-11-00-02 3S Consult, 30827 Garbsen - 02.09.2018 09:47 - M-1-0-1",
        )
        .unwrap();
        assert_eq!(new.major, 90);
        assert_eq!(new.minor, 11);
        assert_eq!(OffsetPolicy::for_version(new), OffsetPolicy::Naive);
    }

    #[test]
    fn test_version_mismatch_is_error() {
        assert!(matches!(
            SolverVersion::parse(b"unknown producer"),
            Err(CodecError::Version(_))
        ));
    }

    #[test]
    fn test_decode_with_offset() {
        let ts = decode_timestamp(b"2018-03-03 00:00:00.000000+01:00", OffsetPolicy::PlusOneHour)
            .unwrap();
        assert_eq!(ts, utc("2018-03-03 00:00:00"));
    }

    #[test]
    fn test_decode_naive_with_padding() {
        let ts = decode_timestamp(b"2019-01-01 00:00:12.500000      ", OffsetPolicy::Naive).unwrap();
        assert_eq!(ts, utc("2019-01-01 00:00:12.5"));
    }

    #[test]
    fn test_encode_is_inverse_of_decode() {
        for (raw, policy) in [
            (&b"2018-03-03 00:00:03.000000+01:00"[..], OffsetPolicy::PlusOneHour),
            (&b"2004-09-22 08:30:15.250000      "[..], OffsetPolicy::Naive),
        ] {
            let ts = decode_timestamp(raw, policy).unwrap();
            assert_eq!(encode_timestamp(ts, policy, 32).unwrap(), raw);
        }
    }

    #[test]
    fn test_encode_too_narrow() {
        let err = encode_timestamp(utc("2018-03-03 00:00:00"), OffsetPolicy::PlusOneHour, 20);
        assert!(matches!(err, Err(CodecError::FieldWidth { .. })));
    }

    #[test]
    fn test_bad_timestamp() {
        assert!(decode_timestamp(b"not a time", OffsetPolicy::Naive).is_err());
    }

    #[test]
    fn test_millis_truncate() {
        let anchor = utc("2019-01-01 00:00:00");
        assert_eq!(millis_from(anchor, utc("2019-01-01 00:00:12.5")), 12_500);
        assert_eq!(millis_from(anchor, utc("2019-01-01 00:00:00.0009")), 0);
        assert_eq!(millis_from(utc("2019-01-01 00:00:01"), anchor), -1000);
    }

    #[test]
    fn test_snapshot_type() {
        assert_eq!(SnapshotType::parse(b"TMAX").unwrap(), SnapshotType::Tmax);
        assert_eq!(SnapshotType::Stat.to_string(), "STAT");
        assert!(SnapshotType::parse(b"XXXX").is_err());
    }
}
