// SPDX-License-Identifier: MIT
//! The [`Dataset`]: one MX model run and everything derived from it

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregate::{self, AggregateRequest, AggregateSurface, Aggregates};
use crate::cache::{self, CacheTables};
use crate::codec::DecodingPlan;
use crate::compression_strategy::CompressionEngine;
use crate::config::DatasetConfig;
use crate::error::{Context, ErrorKind, MxError, Result};
use crate::object_index::{ObjectIndex, OBJTYPE_PIPE};
use crate::paths::DatasetPaths;
use crate::reader::{self, IngestContext, IngestOptions};
use crate::scalar::ScalarSurface;
use crate::schema::Schema;
use crate::snapshot_store::{SnapshotStore, StoreSummary};
use crate::timestamp::OffsetPolicy;
use crate::value::VectorRow;
use crate::writer::{DumpReport, MxsWriter};

/// Results of one model run
///
/// Holds the schema, object index, scalar surface and aggregate surface in
/// memory; vector snapshots stay in the snapshot store on disk. Not meant
/// to be shared between threads.
#[derive(Debug)]
pub struct Dataset {
    paths: DatasetPaths,
    config: DatasetConfig,
    schema: Schema,
    plan: DecodingPlan,
    index: ObjectIndex,
    scalars: ScalarSurface,
    aggregates: AggregateSurface,
    store: SnapshotStore,
    policy: Option<OffsetPolicy>,
    from_cache: bool,
}

impl Dataset {
    /// Open with default options
    pub fn open(mx1: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(mx1, DatasetConfig::default())
    }

    /// Open from a fresh cache, or parse MX1/MX2 and ingest the MXS
    pub fn open_with(mx1: impl Into<PathBuf>, config: DatasetConfig) -> Result<Self> {
        const OP: &str = "open";

        config
            .validate()
            .map_err(|e| MxError::new(OP, ErrorKind::InvalidConfig(e)))?;
        let paths = DatasetPaths::from_mx1(mx1);
        let store = SnapshotStore::new(
            &paths.store,
            CompressionEngine::new(config.compression_config()),
        );
        debug!("Opening {:?} with {:?}", paths.mx1, config);

        if config.skip_cache {
            let removed = cache::delete(&paths).op(OP)?;
            debug!("skip_cache: {} cache files removed", removed);
        } else if cache::is_fresh(&paths.cache, &paths.mx1, &paths.mxs) {
            return Self::load_cached(paths, config, store);
        }

        let schema = Schema::from_file(&paths.mx1).op(OP)?;
        let index = ObjectIndex::from_file(&paths.mx2).op(OP)?;
        let plan = DecodingPlan::from_schema(&schema).op(OP)?;
        cache::write_sidecar(&paths.sidecar, &plan).op(OP)?;

        let mut dataset = Self {
            scalars: ScalarSurface::new(schema.scalar_cids()),
            aggregates: AggregateSurface::new(),
            paths,
            config,
            schema,
            plan,
            index,
            store,
            policy: None,
            from_cache: false,
        };

        if dataset.should_ingest_mxs() {
            let mxs = dataset.paths.mxs.clone();
            let options = IngestOptions::replace()
                .fresh(config.skip_cache)
                .max_records(config.max_records);
            dataset.ingest_stream(&mxs, options)?;
        }
        info!(
            "Opened {:?}: {} channels, {} scalar rows",
            dataset.paths.mx1,
            dataset.schema.channels().len(),
            dataset.scalars.len()
        );
        Ok(dataset)
    }

    fn load_cached(paths: DatasetPaths, config: DatasetConfig, store: SnapshotStore) -> Result<Self> {
        const OP: &str = "open";

        let loaded = cache::load(&paths).op(OP)?;
        match store.summarize(false) {
            Ok(summary) => {
                cache::check_consistency(&loaded.scalars, summary);
            }
            Err(e) => warn!("Snapshot store {:?} unreadable: {}", store.path(), e),
        }
        info!(
            "Opened {:?} from cache: {} scalar rows",
            paths.mx1,
            loaded.scalars.len()
        );
        Ok(Self {
            paths,
            config,
            schema: loaded.schema,
            plan: loaded.plan,
            index: loaded.index,
            scalars: loaded.scalars,
            aggregates: loaded.aggregates,
            store,
            policy: loaded.manifest.offset_policy,
            from_cache: true,
        })
    }

    fn should_ingest_mxs(&self) -> bool {
        if self.config.skip_mxs || !self.paths.mxs.exists() {
            return false;
        }
        let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
        match (modified(&self.paths.mxs), modified(&self.paths.mx1)) {
            (Some(mxs), Some(mx1)) if mxs < mx1 => {
                warn!("{:?} is older than {:?}; not ingested", self.paths.mxs, self.paths.mx1);
                false
            }
            _ => true,
        }
    }

    fn context(&mut self) -> IngestContext<'_> {
        IngestContext {
            schema: &self.schema,
            plan: &self.plan,
            store: &self.store,
            policy: &mut self.policy,
            scalars: &mut self.scalars,
            aggregates: &mut self.aggregates,
        }
    }

    /// Read one record stream; returns the number of new snapshots
    pub fn ingest_stream(&mut self, path: impl AsRef<Path>, options: IngestOptions) -> Result<usize> {
        reader::ingest_stream(self.context(), path.as_ref(), options)
    }

    /// Read every member of a zipped stream archive; returns the number of new snapshots
    pub fn ingest_archive(&mut self, path: impl AsRef<Path>, options: IngestOptions) -> Result<usize> {
        reader::ingest_archive(self.context(), path.as_ref(), options)
    }

    /// Vector rows of the requested timestamps that have one, in request order
    pub fn snapshot_many(&self, timestamps: &[DateTime<Utc>], fast: bool) -> Result<Vec<VectorRow>> {
        const OP: &str = "snapshot_many";

        if !self.store.exists() {
            return Err(MxError::new(
                OP,
                ErrorKind::SnapshotStoreMissing(self.store.path().to_path_buf()),
            ));
        }
        self.store.reader().op(OP)?.get_many(timestamps, fast).op(OP)
    }

    /// TIME/TMIN/TMAX/MIN/MAX/DIF rows for a range of the scalar index
    pub fn aggregates(&mut self, request: &AggregateRequest) -> Result<Aggregates> {
        aggregate::compute(
            request,
            self.scalars.index(),
            &self.schema.vector_cids(),
            &self.store,
            &mut self.aggregates,
        )
    }

    /// Write the cache container (default: `<base>.h5`); returns its size
    pub fn persist_cache(&mut self, target: Option<&Path>) -> Result<u64> {
        const OP: &str = "persist_cache";

        let anchor = self.store.anchor().op(OP)?;
        let tables = CacheTables {
            schema: &self.schema,
            index: &self.index,
            scalars: &mut self.scalars,
            aggregates: &self.aggregates,
            policy: self.policy,
            anchor,
        };
        cache::persist(&self.paths, target, tables, self.config.compression_config()).op(OP)
    }

    /// A writer set up with this dataset's layout and timestamp policy
    pub fn writer(&self) -> MxsWriter<'_> {
        MxsWriter::new(
            &self.schema,
            &self.plan,
            self.policy.unwrap_or(OffsetPolicy::Naive),
        )
        .strict_vectors(self.config.strict_vectors)
    }

    /// Write the scalar surface, with vectors from the store, as an MXS stream
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<DumpReport> {
        self.writer().dump(&self.scalars, &self.store, path.as_ref())
    }

    /// First and last snapshot timestamps and their count
    pub fn summarize(&self, full_check: bool) -> Result<Option<StoreSummary>> {
        let summary = self.store.summarize(full_check).op("summarize")?;
        if let Some(summary) = summary.filter(|s| s.violations > 0) {
            warn!(
                "Snapshot store {:?}: {} inconsistent entries",
                self.store.path(),
                summary.violations
            );
        }
        Ok(summary)
    }

    /// Remove cache, sidecar and snapshot store
    pub fn delete_files(&self) -> Result<()> {
        const OP: &str = "delete_files";

        let removed = cache::delete(&self.paths).op(OP)?;
        let store = self.store.delete().op(OP)?;
        debug!(
            "Deleted {} cache files{}",
            removed,
            if store { " and the snapshot store" } else { "" }
        );
        Ok(())
    }

    /// First scalar column matching `cid` once primary keys are ignored
    pub fn column_for_cid_without_pk(&self, cid: &str) -> Option<&str> {
        self.scalars.column_for_cid_without_pk(cid)
    }

    /// Values of one object in a vector channel at `timestamp`
    ///
    /// Pipe channels with a point per interior pipe point yield every point of
    /// the pipe; other channels yield the single element of the object.
    pub fn vector_for_object(
        &self,
        timestamp: DateTime<Utc>,
        vector_cid: &str,
        pk: &str,
    ) -> Result<Option<Vec<f64>>> {
        const OP: &str = "vector_for_object";

        let Some(slot) = self
            .schema
            .vector_indices()
            .iter()
            .position(|&i| self.schema.channels()[i].cid == vector_cid)
        else {
            return Ok(None);
        };
        let channel = &self.schema.channels()[self.schema.vector_indices()[slot]];
        let Some(position) = self.index.position(&channel.objtype, pk) else {
            return Ok(None);
        };
        let Some(row) = self.snapshot_many(&[timestamp], false)?.pop() else {
            return Err(MxError::new(OP, ErrorKind::SnapshotNotFound(timestamp)));
        };
        let Some(values) = row.vectors.get(slot).and_then(|v| v.to_f64()) else {
            return Ok(None);
        };

        if channel.objtype == OBJTYPE_PIPE {
            if let Some(segments) = self.index.pipe_segments(&values) {
                return Ok(segments.get(position).map(|s| s.to_vec()));
            }
        }
        Ok(values.get(position).map(|v| vec![*v]))
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn plan(&self) -> &DecodingPlan {
        &self.plan
    }

    pub fn object_index(&self) -> &ObjectIndex {
        &self.index
    }

    pub fn scalars(&self) -> &ScalarSurface {
        &self.scalars
    }

    pub fn scalars_mut(&mut self) -> &mut ScalarSurface {
        &mut self.scalars
    }

    pub fn aggregate_surface(&self) -> &AggregateSurface {
        &self.aggregates
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Timestamp policy latched from the first record read, if any
    pub fn offset_policy(&self) -> Option<OffsetPolicy> {
        self.policy
    }

    /// Whether the tables were loaded from the cache
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}
