//! Shared test fixtures and utilities for all test types
//!
//! Synthesizes MX1/MX2/MXS/ZIP inputs inside a temporary directory. Record
//! bytes are assembled by hand (little-endian, channel order) so that the
//! crate's codec is checked against an independent layout.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use mx_dataset::object_index::encode_block;
use mx_dataset::timestamp::encode_timestamp;
use mx_dataset::{DatasetPaths, OffsetPolicy};

/// Solver version writing `+01:00` timestamps
pub const VERSION_OLD: &str = "SIR 3S 90-09-00-01 3S Consult";
/// Solver version writing naive timestamps
pub const VERSION_NEW: &str = "SIR 3S 90-11-00-02 3S Consult";

const GENERAL_PK: &str = "4639827058859487185";
const KEY_WIDTH: usize = 20;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `2018-03-03 00:00:00` plus `seconds`
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 3, 3, 0, 0, 0).unwrap() + Duration::seconds(seconds)
}

/// A keyed scalar REAL channel
#[derive(Debug, Clone)]
pub struct ScalarChannel {
    pub objtype: String,
    pub pk: String,
    pub attrtype: String,
}

impl ScalarChannel {
    pub fn new(objtype: &str, pk: &str, attrtype: &str) -> Self {
        Self {
            objtype: objtype.to_string(),
            pk: pk.to_string(),
            attrtype: attrtype.to_string(),
        }
    }

    pub fn cid(&self) -> String {
        format!("{}~~~{}~{}", self.objtype, self.pk, self.attrtype)
    }
}

/// A per-object vector channel (`OBJTYPE~*~*~*~ATTRTYPE`)
#[derive(Debug, Clone)]
pub struct VectorChannel {
    pub objtype: String,
    pub attrtype: String,
    /// `REAL` or `RVEC`
    pub data_type: String,
    pub count: usize,
    pub flags: u32,
}

impl VectorChannel {
    pub fn real(objtype: &str, attrtype: &str, count: usize) -> Self {
        Self {
            objtype: objtype.to_string(),
            attrtype: attrtype.to_string(),
            data_type: "REAL".to_string(),
            count,
            flags: 0,
        }
    }

    /// Pipe vector whose width comes from the MX2 point counts
    pub fn rvec(objtype: &str, attrtype: &str, count: usize) -> Self {
        Self {
            objtype: objtype.to_string(),
            attrtype: attrtype.to_string(),
            data_type: "RVEC".to_string(),
            count,
            flags: 4,
        }
    }

    pub fn cid(&self) -> String {
        format!("{}~*~*~*~{}", self.objtype, self.attrtype)
    }
}

/// One record to synthesize
#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub snapshot: &'static str,
    pub scalars: Vec<f32>,
    pub vectors: Vec<Vec<f32>>,
}

impl Record {
    pub fn time(timestamp: DateTime<Utc>, scalars: Vec<f32>, vectors: Vec<Vec<f32>>) -> Self {
        Self {
            timestamp,
            snapshot: "TIME",
            scalars,
            vectors,
        }
    }

    pub fn with_snapshot(mut self, snapshot: &'static str) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// A model run on disk: MX1 and MX2 written, streams on demand
pub struct TestModel {
    pub dir: TempDir,
    pub mx1: PathBuf,
    /// CVERSO text; `None` leaves out the CVERSO and SNAPSHOTTYPE channels
    pub version: Option<&'static str>,
    pub scalars: Vec<ScalarChannel>,
    pub vectors: Vec<VectorChannel>,
}

impl TestModel {
    pub fn new(
        version: Option<&'static str>,
        scalars: Vec<ScalarChannel>,
        vectors: Vec<VectorChannel>,
        mx2_blocks: Vec<Vec<u8>>,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mx1 = dir.path().join("M-1-0-1.MX1");

        let model = Self {
            dir,
            mx1,
            version,
            scalars,
            vectors,
        };
        std::fs::write(&model.mx1, model.mx1_xml()).expect("Failed to write MX1");
        std::fs::write(model.paths().mx2, mx2_blocks.concat()).expect("Failed to write MX2");
        model
    }

    pub fn paths(&self) -> DatasetPaths {
        DatasetPaths::from_mx1(&self.mx1)
    }

    pub fn policy(&self) -> OffsetPolicy {
        if self.version == Some(VERSION_OLD) {
            OffsetPolicy::PlusOneHour
        } else {
            OffsetPolicy::Naive
        }
    }

    pub fn scalar_cids(&self) -> Vec<String> {
        self.scalars.iter().map(ScalarChannel::cid).collect()
    }

    pub fn vector_cids(&self) -> Vec<String> {
        self.vectors.iter().map(VectorChannel::cid).collect()
    }

    pub fn record_length(&self) -> usize {
        let housekeeping = if self.version.is_some() { 80 + 4 } else { 0 };
        housekeeping + 32 + 4 * self.scalars.len() + self.vectors.iter().map(|v| 4 * v.count).sum::<usize>()
    }

    fn mx1_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MX1>\n");
        let mut offset = 0;
        let mut push = |objtype: &str, pk: &str, attr: &str, dt: &str, len: usize, dtl: usize, flags: u32| {
            let (name1, name2) = if pk == "*" { ("*", "*") } else { ("", "") };
            xml.push_str(&format!(
                "  <XL1 OBJTYPE=\"{objtype}\" NAME1=\"{name1}\" NAME2=\"{name2}\" OBJTYPE_PK=\"{pk}\" \
                 ATTRTYPE=\"{attr}\" DATATYPE=\"{dt}\" DATALENGTH=\"{len}\" DATATYPELENGTH=\"{dtl}\" \
                 DATAOFFSET=\"{offset}\" FLAGS=\"{flags}\"/>\n"
            ));
            offset += len;
        };

        if self.version.is_some() {
            push("ALLG", GENERAL_PK, "CVERSO", "CHAR", 80, 80, 0);
        }
        push("ALLG", GENERAL_PK, "TIMESTAMP", "CHAR", 32, 32, 0);
        if self.version.is_some() {
            push("ALLG", GENERAL_PK, "SNAPSHOTTYPE", "CHAR", 4, 4, 0);
        }
        for channel in &self.scalars {
            push(&channel.objtype, &channel.pk, &channel.attrtype, "REAL", 4, 4, 0);
        }
        for channel in &self.vectors {
            push(
                &channel.objtype,
                "*",
                &channel.attrtype,
                &channel.data_type,
                4 * channel.count,
                4,
                channel.flags,
            );
        }
        xml.push_str("</MX1>\n");
        xml
    }

    /// Raw bytes of one record
    pub fn record(&self, record: &Record) -> Vec<u8> {
        assert_eq!(record.scalars.len(), self.scalars.len());
        assert_eq!(record.vectors.len(), self.vectors.len());

        let mut bytes = Vec::with_capacity(self.record_length());
        if let Some(version) = self.version {
            bytes.extend(padded(version, 80));
        }
        bytes.extend(encode_timestamp(record.timestamp, self.policy(), 32).unwrap());
        if self.version.is_some() {
            bytes.extend(padded(record.snapshot, 4));
        }
        for value in &record.scalars {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for (values, channel) in record.vectors.iter().zip(&self.vectors) {
            assert_eq!(values.len(), channel.count);
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        assert_eq!(bytes.len(), self.record_length());
        bytes
    }

    pub fn stream_bytes(&self, records: &[Record]) -> Vec<u8> {
        records.iter().flat_map(|r| self.record(r)).collect()
    }

    /// Write records to `name` inside the model directory
    pub fn write_stream(&self, name: &str, records: &[Record]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, self.stream_bytes(records)).expect("Failed to write stream");
        path
    }

    /// Write the model's own MXS stream
    pub fn write_mxs(&self, records: &[Record]) -> PathBuf {
        let path = self.paths().mxs;
        std::fs::write(&path, self.stream_bytes(records)).expect("Failed to write MXS");
        path
    }

    /// Write a zip archive with one stream per member
    pub fn write_zip(&self, members: &[(&str, &[Record])]) -> PathBuf {
        let path = self.paths().zip;
        write_zip(&path, members.iter().map(|(name, records)| (*name, self.stream_bytes(records))));
        path
    }
}

pub fn write_zip<'a>(path: &Path, members: impl Iterator<Item = (&'a str, Vec<u8>)>) {
    let file = std::fs::File::create(path).expect("Failed to create zip");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in members {
        zip.start_file(name, options).expect("Failed to start zip member");
        zip.write_all(&bytes).expect("Failed to write zip member");
    }
    zip.finish().expect("Failed to finish zip");
}

pub fn padded(text: &str, width: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(width, b' ');
    bytes
}

/// MX2 block of object keys
pub fn key_block(objtype: &str, keys: &[&str]) -> Vec<u8> {
    let data: Vec<u8> = keys.iter().flat_map(|k| padded(k, KEY_WIDTH)).collect();
    encode_block(objtype, "tk", "CHAR", KEY_WIDTH, &data)
}

/// MX2 block of pipe point counts
pub fn point_block(counts: &[i32]) -> Vec<u8> {
    let data: Vec<u8> = counts.iter().flat_map(|c| c.to_le_bytes()).collect();
    encode_block("ROHR", "N_OF_POINTS", "INT4", 4, &data)
}

/// Two nodes, one pipe with three points: the layout of a single-pipe model
///
/// Without a version the schema has no CVERSO and SNAPSHOTTYPE channels, so
/// the scalar surface holds exactly the four node channels.
pub fn single_pipe(version: Option<&'static str>) -> TestModel {
    TestModel::new(
        version,
        vec![
            ScalarChannel::new("KNOT", "5289899964753656852", "PH"),
            ScalarChannel::new("KNOT", "5289899964753656852", "QM"),
            ScalarChannel::new("KNOT", "5642914844465475844", "PH"),
            ScalarChannel::new("KNOT", "5642914844465475844", "QM"),
        ],
        vec![
            VectorChannel::real("KNOT", "PH", 2),
            VectorChannel::rvec("ROHR", "PVEC", 3),
        ],
        vec![
            key_block("KNOT", &["5289899964753656852", "5642914844465475844"]),
            key_block("ROHR", &["4737064599036143765"]),
            point_block(&[3]),
        ],
    )
}

/// Scalar row of the single-pipe model (constant over time)
pub fn single_pipe_scalars() -> Vec<f32> {
    vec![0.0, -176.7, 4.2, 176.7]
}

/// Vector row of the single-pipe model at `step`
pub fn single_pipe_vectors(step: i64) -> Vec<Vec<f32>> {
    let s = step as f32;
    vec![vec![4.2 + s, 0.5 * s], vec![1.0 + s, 2.0, 3.0 - s]]
}

/// TIME records of the single-pipe model for the given seconds
pub fn single_pipe_records(seconds: std::ops::Range<i64>) -> Vec<Record> {
    seconds
        .map(|s| Record::time(at(s), single_pipe_scalars(), single_pipe_vectors(s)))
        .collect()
}

/// Number of vector channels of the heating network model
pub const NETWORK_CHANNELS: usize = 41;
/// Elements per vector channel of the heating network model
pub const NETWORK_WIDTH: usize = 32;

/// Heating network: 41 vector channels of 32 elements each
pub fn heating_network() -> TestModel {
    let objtypes = ["KNOT", "ROHR", "VENT", "PUMP", "WBLZ"];
    let vectors = (0..NETWORK_CHANNELS)
        .map(|i| VectorChannel::real(objtypes[i % objtypes.len()], &format!("A{i:02}"), NETWORK_WIDTH))
        .collect();
    let keys: Vec<String> = (0..NETWORK_WIDTH).map(|i| format!("{}", 1000 + i)).collect();
    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
    TestModel::new(
        Some(VERSION_NEW),
        vec![ScalarChannel::new("KNOT", "5289899964753656852", "PH")],
        vectors,
        objtypes.iter().map(|o| key_block(o, &keys)).collect(),
    )
}

/// Deterministic vector value of the heating network
pub fn network_value(step: i64, channel: usize, element: usize) -> f32 {
    let phase = (channel * 7 + element * 3) as f32;
    ((step as f32) * 0.5 + phase).sin() * 10.0 + channel as f32
}

pub fn network_vectors(step: i64) -> Vec<Vec<f32>> {
    (0..NETWORK_CHANNELS)
        .map(|c| (0..NETWORK_WIDTH).map(|e| network_value(step, c, e)).collect())
        .collect()
}

/// Five time steps the way the solver writes them
///
/// STAT and TIME at the first step, TIME for every step, TMIN and TMAX
/// repeating the last step.
pub fn network_run() -> Vec<Record> {
    let mut records = vec![Record::time(at(0), vec![1.0], network_vectors(0)).with_snapshot("STAT")];
    for step in 0..5 {
        records.push(Record::time(at(step * 60), vec![1.0 + step as f32], network_vectors(step)));
    }
    let lows = (0..NETWORK_CHANNELS)
        .map(|c| {
            (0..NETWORK_WIDTH)
                .map(|e| (0..5).map(|s| network_value(s, c, e)).fold(f32::INFINITY, f32::min))
                .collect()
        })
        .collect();
    let highs = (0..NETWORK_CHANNELS)
        .map(|c| {
            (0..NETWORK_WIDTH)
                .map(|e| (0..5).map(|s| network_value(s, c, e)).fold(f32::NEG_INFINITY, f32::max))
                .collect()
        })
        .collect();
    records.push(Record::time(at(240), vec![5.0], lows).with_snapshot("TMIN"));
    records.push(Record::time(at(240), vec![5.0], highs).with_snapshot("TMAX"));
    records
}
