// SPDX-License-Identifier: MIT
//! Streaming ingest of MXS record streams and zipped MXS archives
//!
//! Every record is decoded with the dataset's plan. Scalar values are
//! buffered and finished into a surface at the end of the pass; vector
//! values go straight to the snapshot store under their millisecond key.
//! Records whose key is already stored contribute to the aggregate surface
//! when they are solver aggregates (`TMIN`, `TMAX`) or the repeated first
//! time step.

use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateKind, AggregateSurface};
use crate::codec::DecodingPlan;
use crate::error::{Context, ErrorKind, MxError, Result};
use crate::format::read_up_to;
use crate::scalar::{PendingScalars, ScalarSurface};
use crate::schema::Schema;
use crate::snapshot_store::{SnapshotStore, StoreError, StoreWriter};
use crate::timestamp::{decode_timestamp, millis_from, OffsetPolicy, SnapshotType, SolverVersion};
use crate::value::{Slot, Value, Vector, VectorRow};

/// How freshly read rows combine with the existing scalar surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Replace the surface with the rows read
    #[default]
    Replace,
    /// Merge the rows read into the surface; existing rows win
    Append,
}

/// Options of one ingest call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    pub mode: IngestMode,
    /// Delete the snapshot store before reading
    pub fresh_snapshot_cache: bool,
    /// Stop after this many decoded records (per member for archives)
    pub max_records: Option<usize>,
}

impl IngestOptions {
    pub fn replace() -> Self {
        Self::default()
    }

    pub fn append() -> Self {
        Self {
            mode: IngestMode::Append,
            ..Self::default()
        }
    }

    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh_snapshot_cache = fresh;
        self
    }

    pub fn max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }
}

/// Dataset state an ingest reads and updates
pub(crate) struct IngestContext<'a> {
    pub schema: &'a Schema,
    pub plan: &'a DecodingPlan,
    pub store: &'a SnapshotStore,
    pub policy: &'a mut Option<OffsetPolicy>,
    pub scalars: &'a mut ScalarSurface,
    pub aggregates: &'a mut AggregateSurface,
}

/// Ingest one record stream; returns the number of snapshots written
pub(crate) fn ingest_stream(
    ctx: IngestContext<'_>,
    path: &Path,
    options: IngestOptions,
) -> Result<usize> {
    const OP: &str = "ingest_stream";

    if !path.exists() {
        return Err(MxError::new(OP, ErrorKind::StreamMissing(path.to_path_buf())));
    }
    prepare_store(ctx.store, path, options.fresh_snapshot_cache).op(OP)?;

    let mut input = BufReader::new(File::open(path).op(OP)?);
    let mut pass = Pass::start(ctx, OP)?;
    let records = pass.read(&mut input, options.max_records, path)?;
    let written = pass.finish(options.mode)?;

    info!(
        "Ingested {} records from {:?}: {} new snapshots",
        records, path, written
    );
    Ok(written)
}

/// Ingest every member of a zip archive in name order
pub(crate) fn ingest_archive(
    ctx: IngestContext<'_>,
    path: &Path,
    options: IngestOptions,
) -> Result<usize> {
    const OP: &str = "ingest_archive";

    if !path.exists() {
        return Err(MxError::new(OP, ErrorKind::ArchiveMissing(path.to_path_buf())));
    }
    prepare_store(ctx.store, path, options.fresh_snapshot_cache).op(OP)?;

    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path).op(OP)?)).op(OP)?;
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();

    let mut pass = Pass::start(ctx, OP)?;
    let mut records = 0;
    for name in &names {
        let mut member = archive.by_name(name).op(OP)?;
        if member.is_dir() {
            continue;
        }
        debug!("Reading archive member {}", name);
        records += pass.read(&mut member, options.max_records, Path::new(name))?;

        if let Some(max) = options.max_records {
            if pass.pending.unique_len() >= max {
                debug!("Record bound {} reached after member {}", max, name);
                break;
            }
        }
    }
    let written = pass.finish(options.mode)?;

    info!(
        "Ingested {} records from {} members of {:?}: {} new snapshots",
        records,
        names.len(),
        path,
        written
    );
    Ok(written)
}

/// Delete the store when asked to or when it predates the source
fn prepare_store(
    store: &SnapshotStore,
    source: &Path,
    fresh: bool,
) -> std::result::Result<(), StoreError> {
    if fresh || store.is_older_than(source) {
        if store.delete()? {
            debug!(
                "Snapshot store {:?} recreated (fresh: {}, source {:?})",
                store.path(),
                fresh,
                source
            );
        }
    }
    Ok(())
}

/// One ingest pass over one or more streams
struct Pass<'a> {
    ctx: IngestContext<'a>,
    op: &'static str,
    writer: StoreWriter,
    anchor: Option<DateTime<Utc>>,
    vector_cids: Vec<String>,
    pending: PendingScalars,
    written: usize,
}

impl<'a> Pass<'a> {
    fn start(ctx: IngestContext<'a>, op: &'static str) -> Result<Self> {
        let writer = ctx.store.writer().op(op)?;
        let vector_cids = ctx.schema.vector_cids();
        let pending = PendingScalars::new(ctx.schema.scalar_cids());
        Ok(Self {
            ctx,
            op,
            writer,
            anchor: None,
            vector_cids,
            pending,
            written: 0,
        })
    }

    /// Read records until the input ends, decoding fails or the bound is hit
    fn read<R: Read>(
        &mut self,
        input: &mut R,
        max_records: Option<usize>,
        source: &Path,
    ) -> Result<usize> {
        let record_length = self.ctx.plan.record_length();
        let mut record = vec![0u8; record_length];
        let mut records = 0;

        while max_records.map_or(true, |max| records < max) {
            let got = read_up_to(input, &mut record).op(self.op)?;
            if got == 0 {
                break;
            }
            if got < record_length {
                warn!(
                    "{:?}: trailing partial record ({} of {} bytes) ignored",
                    source, got, record_length
                );
                break;
            }
            if self.process(&record, source)?.is_break() {
                break;
            }
            records += 1;
        }

        debug!("{:?}: {} records decoded", source, records);
        Ok(records)
    }

    fn process(&mut self, record: &[u8], source: &Path) -> Result<ControlFlow<()>> {
        let op = self.op;
        let slots = match self.ctx.plan.decode(record) {
            Ok(slots) => slots,
            Err(e) => {
                warn!("{:?}: record undecodable, stopping: {}", source, e);
                return Ok(ControlFlow::Break(()));
            }
        };

        let policy = self.latch_policy(record)?;
        let schema = self.ctx.schema;
        let timestamp =
            decode_timestamp(self.field(record, schema.timestamp_index()), policy).op(op)?;
        let snapshot = match schema.snapshot_type_index() {
            Some(index) => SnapshotType::parse(self.field(record, index)).op(op)?,
            None => SnapshotType::Time,
        };

        let scalars: Vec<Value> = schema
            .scalar_indices()
            .iter()
            .filter_map(|&i| match &slots[i] {
                Slot::Scalar(value) => Some(value.clone()),
                _ => None,
            })
            .collect();
        let vectors: Vec<Vector> = schema
            .vector_indices()
            .iter()
            .filter_map(|&i| match &slots[i] {
                Slot::Vector(vector) => Some(vector.clone()),
                _ => None,
            })
            .collect();
        self.pending.push(timestamp, scalars);

        let anchor = self.anchor(timestamp)?;
        let key = millis_from(anchor, timestamp);
        if !self.writer.contains(key) {
            let row = VectorRow { timestamp, vectors };
            self.writer.put(key, &row).op(op)?;
            self.written += 1;
            return Ok(ControlFlow::Continue(()));
        }

        let range = match snapshot {
            SnapshotType::Tmin | SnapshotType::Tmax => Some((anchor, timestamp)),
            SnapshotType::Time if timestamp == anchor => Some((timestamp, timestamp)),
            _ => None,
        };
        if let (Some((left, right)), Some(kind)) = (range, AggregateKind::from_snapshot(snapshot)) {
            let added = self
                .ctx
                .aggregates
                .insert_snapshot(kind, left, right, &self.vector_cids, &vectors);
            debug!("{} at {}: {} aggregate rows", kind, timestamp, added);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn field<'r>(&self, record: &'r [u8], index: usize) -> &'r [u8] {
        self.ctx
            .plan
            .field_range(index)
            .and_then(|range| record.get(range))
            .unwrap_or(&[])
    }

    /// Decide the offset policy from the first record seen by this dataset
    fn latch_policy(&mut self, record: &[u8]) -> Result<OffsetPolicy> {
        if let Some(policy) = *self.ctx.policy {
            return Ok(policy);
        }
        let policy = match self.ctx.schema.cverso_index() {
            Some(index) => {
                let version = SolverVersion::parse(self.field(record, index)).op(self.op)?;
                let policy = OffsetPolicy::for_version(version);
                debug!("Solver version {:?}: timestamp policy {:?}", version, policy);
                policy
            }
            None => {
                warn!("Schema has no CVERSO channel; timestamps taken as naive UTC");
                OffsetPolicy::Naive
            }
        };
        *self.ctx.policy = Some(policy);
        Ok(policy)
    }

    /// Store anchor, else the surface minimum, else the first timestamp read
    fn anchor(&mut self, timestamp: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Some(anchor) = self.anchor {
            return Ok(anchor);
        }
        let anchor = match self.writer.anchor() {
            Some(anchor) => anchor,
            None => {
                let anchor = self.ctx.scalars.first().unwrap_or(timestamp);
                self.writer.set_anchor(anchor).op(self.op)?;
                anchor
            }
        };
        debug!("Snapshot anchor {}", anchor);
        self.anchor = Some(anchor);
        Ok(anchor)
    }

    /// Close the store and merge the rows read into the scalar surface
    fn finish(self, mode: IngestMode) -> Result<usize> {
        let op = self.op;
        self.writer.finish().op(op)?;
        let fresh = self.pending.finish();
        match mode {
            IngestMode::Replace => *self.ctx.scalars = fresh,
            IngestMode::Append => self
                .ctx
                .scalars
                .append(fresh)
                .map_err(|e| MxError::new(op, ErrorKind::ColumnMismatch(e)))?,
        }
        Ok(self.written)
    }
}
