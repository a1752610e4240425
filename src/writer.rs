// SPDX-License-Identifier: MIT
//! MXS writer: emit the scalar surface as a record stream
//!
//! Every row of the scalar surface becomes one record. Scalar values are
//! put back at their channel positions, the vector channels come from the
//! snapshot store and the timestamp is formatted with the offset policy
//! latched when the dataset was read.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::codec::DecodingPlan;
use crate::error::{Context, ErrorKind, MxError, Result};
use crate::scalar::ScalarSurface;
use crate::schema::Schema;
use crate::snapshot_store::SnapshotStore;
use crate::timestamp::{encode_timestamp, OffsetPolicy};
use crate::value::{Slot, Value, Vector, VectorRow};

/// Counts reported by a dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpReport {
    /// Records written
    pub written: usize,
    /// Records whose vectors were found in the snapshot store
    pub resolved_from_store: usize,
}

/// Writes records laid out by one schema
pub struct MxsWriter<'a> {
    schema: &'a Schema,
    plan: &'a DecodingPlan,
    policy: OffsetPolicy,
    strict_vectors: bool,
}

impl<'a> MxsWriter<'a> {
    pub fn new(schema: &'a Schema, plan: &'a DecodingPlan, policy: OffsetPolicy) -> Self {
        Self {
            schema,
            plan,
            policy,
            strict_vectors: true,
        }
    }

    /// When off, a timestamp without a stored snapshot reuses the last row found
    pub fn strict_vectors(mut self, strict: bool) -> Self {
        self.strict_vectors = strict;
        self
    }

    /// Write every row of `scalars` to `path`
    pub fn dump(
        &self,
        scalars: &ScalarSurface,
        store: &SnapshotStore,
        path: &Path,
    ) -> Result<DumpReport> {
        const OP: &str = "dump";

        let columns = self.column_mapping(scalars).map_err(|e| MxError::new(OP, e))?;
        let has_vectors = !self.schema.vector_indices().is_empty();
        let mut reader = if has_vectors {
            if !store.exists() {
                return Err(MxError::new(
                    OP,
                    ErrorKind::SnapshotStoreMissing(store.path().to_path_buf()),
                ));
            }
            Some(store.reader().op(OP)?)
        } else {
            None
        };

        let mut output = BufWriter::new(File::create(path).op(OP)?);
        let mut report = DumpReport::default();
        let mut last_row: Option<VectorRow> = None;
        let width = self.schema.timestamp_channel().data_length;

        for (timestamp, values) in scalars.iter() {
            let vectors = match reader.as_mut() {
                None => Vec::new(),
                Some(reader) => match reader.find(timestamp, true).op(OP)? {
                    Some(row) => {
                        report.resolved_from_store += 1;
                        let vectors = row.vectors.clone();
                        last_row = Some(row);
                        vectors
                    }
                    None if self.strict_vectors => {
                        return Err(MxError::new(OP, ErrorKind::SnapshotNotFound(timestamp)));
                    }
                    None => match &last_row {
                        Some(row) => {
                            debug!("No snapshot for {}; reusing {}", timestamp, row.timestamp);
                            row.vectors.clone()
                        }
                        None => {
                            return Err(MxError::new(OP, ErrorKind::SnapshotNotFound(timestamp)))
                        }
                    },
                },
            };

            let stamp = encode_timestamp(timestamp, self.policy, width).op(OP)?;
            let slots = self.slots(stamp, values, &columns, vectors);
            let record = self.plan.encode(&slots).op(OP)?;
            output.write_all(&record).op(OP)?;
            report.written += 1;
        }
        output.flush().op(OP)?;

        if report.resolved_from_store < report.written && has_vectors {
            warn!(
                "{:?}: {} of {} records reuse an earlier snapshot",
                path,
                report.written - report.resolved_from_store,
                report.written
            );
        }
        info!(
            "Dumped {} records to {:?} ({} resolved from store)",
            report.written, path, report.resolved_from_store
        );
        Ok(report)
    }

    /// Surface column of every scalar channel
    fn column_mapping(&self, scalars: &ScalarSurface) -> std::result::Result<Vec<usize>, ErrorKind> {
        self.schema
            .scalar_indices()
            .iter()
            .map(|&index| {
                let cid = &self.schema.channels()[index].cid;
                scalars
                    .column_position(cid)
                    .or_else(|| {
                        scalars
                            .column_for_cid_without_pk(cid)
                            .and_then(|column| scalars.column_position(column))
                    })
                    .ok_or_else(|| ErrorKind::ColumnMismatch(format!("no column for {cid}")))
            })
            .collect()
    }

    /// One slot per channel in declaration order
    fn slots(
        &self,
        stamp: Vec<u8>,
        values: &[Value],
        columns: &[usize],
        vectors: Vec<Vector>,
    ) -> Vec<Slot> {
        let mut slots = vec![Slot::Skipped; self.schema.channels().len()];
        slots[self.schema.timestamp_index()] = Slot::Scalar(Value::Chars(stamp));
        for (&index, &column) in self.schema.scalar_indices().iter().zip(columns) {
            slots[index] = Slot::Scalar(values[column].clone());
        }
        for (&index, vector) in self.schema.vector_indices().iter().zip(vectors) {
            slots[index] = Slot::Vector(vector);
        }
        slots
    }
}
