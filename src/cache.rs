// SPDX-License-Identifier: MIT
//! Cache materialization: write and load the `<base>.h5` container
//!
//! The cache mirrors the schema table, the object index, the scalar surface
//! and the aggregate surface. The decoding plan is kept next to it in the
//! `<base>.h5.metadata` sidecar so that a loaded dataset can decode streams
//! without deriving the plan again.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::AggregateSurface;
use crate::codec::{CodecError, DecodingPlan};
use crate::compression_strategy::CompressionConfig;
use crate::container::{CacheContainer, ContainerError, ContainerWriter};
use crate::format::SectionType;
use crate::object_index::ObjectIndex;
use crate::paths::DatasetPaths;
use crate::scalar::ScalarSurface;
use crate::schema::Schema;
use crate::snapshot_store::StoreSummary;
use crate::timestamp::OffsetPolicy;

/// Manifest section of the cache container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub key_prefix: String,
    /// Logical key of every non-empty section
    pub sections: Vec<String>,
    /// File name of the plan sidecar, next to the cache
    pub sidecar: String,
    pub schema_fingerprint: String,
    pub offset_policy: Option<OffsetPolicy>,
    pub anchor: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Tables persisted to the cache
pub struct CacheTables<'a> {
    pub schema: &'a Schema,
    pub index: &'a ObjectIndex,
    pub scalars: &'a mut ScalarSurface,
    pub aggregates: &'a AggregateSurface,
    pub policy: Option<OffsetPolicy>,
    pub anchor: Option<DateTime<Utc>>,
}

/// Tables read back from the cache
#[derive(Debug)]
pub struct LoadedCache {
    pub manifest: Manifest,
    pub schema: Schema,
    pub index: ObjectIndex,
    pub scalars: ScalarSurface,
    pub aggregates: AggregateSurface,
    pub plan: DecodingPlan,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when `cache` is newer than the MX1 and, if one exists, the MXS
pub fn is_fresh(cache: &Path, mx1: &Path, mxs: &Path) -> bool {
    let Some(cache_time) = modified(cache) else {
        return false;
    };
    let newer_than = |source: &Path| modified(source).map_or(true, |t| cache_time > t);
    newer_than(mx1) && (!mxs.exists() || newer_than(mxs))
}

/// Write the packed plan as a single line
pub fn write_sidecar(path: &Path, plan: &DecodingPlan) -> std::io::Result<()> {
    std::fs::write(path, plan.to_packed())?;
    debug!("Decoding plan written to {:?}", path);
    Ok(())
}

/// Read the packed plan; `None` when there is no sidecar
pub fn read_sidecar(path: &Path) -> Result<Option<DecodingPlan>, CodecError> {
    match std::fs::read_to_string(path) {
        Ok(text) => DecodingPlan::from_packed(text.trim()).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CodecError::BadToken(format!("sidecar {:?} unreadable: {}", path, e))),
    }
}

/// Remove the cache and its sidecar; returns how many files went
pub fn delete(paths: &DatasetPaths) -> std::io::Result<usize> {
    let mut removed = 0;
    for path in [&paths.cache, &paths.sidecar] {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Deleted {:?}", path);
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Persist the tables to `target` (default: the family's cache file)
///
/// Duplicate scalar columns are dropped (first kept) and the write retried
/// once. A failure to serialize the aggregate surface only costs that
/// section. Returns the container size in bytes.
pub fn persist(
    paths: &DatasetPaths,
    target: Option<&Path>,
    mut tables: CacheTables<'_>,
    compression: CompressionConfig,
) -> Result<u64, ContainerError> {
    let target = target.unwrap_or(&paths.cache);
    let plan = DecodingPlan::from_schema(tables.schema).map_err(|e| {
        ContainerError::Serialization {
            section: SectionType::Schema.name(),
            reason: e.to_string(),
        }
    })?;
    write_sidecar(&paths.sidecar, &plan)?;

    let written = match build(paths, &tables, compression) {
        Err(ContainerError::DuplicateColumns(columns)) => {
            warn!(
                "Cache {:?}: duplicate scalar columns {:?}; keeping the first of each",
                target, columns
            );
            let dropped = tables.scalars.drop_duplicate_columns();
            debug!("Dropped {} duplicate columns", dropped);
            build(paths, &tables, compression)?
        }
        other => other?,
    }
    .write_to_path(target)?;

    info!("Cache written to {:?}: {} bytes", target, written);
    Ok(written)
}

fn build(
    paths: &DatasetPaths,
    tables: &CacheTables<'_>,
    compression: CompressionConfig,
) -> Result<ContainerWriter, ContainerError> {
    let duplicates = tables.scalars.duplicate_columns();
    if !duplicates.is_empty() {
        return Err(ContainerError::DuplicateColumns(duplicates));
    }

    let mut writer = ContainerWriter::with_config(compression);
    let mut sections = vec![
        paths.section_key(SectionType::Schema),
        paths.section_key(SectionType::ObjectIndex),
        paths.section_key(SectionType::Scalars),
    ];
    writer.add_json(SectionType::Schema, tables.schema)?;
    writer.add_json(SectionType::ObjectIndex, tables.index)?;
    writer.add_json(SectionType::Scalars, &*tables.scalars)?;

    match writer.add_json(SectionType::VecAggs, tables.aggregates) {
        Ok(()) => sections.push(paths.section_key(SectionType::VecAggs)),
        Err(e) => warn!(
            "Aggregate surface ({} rows) not cached: {}",
            tables.aggregates.len(),
            e
        ),
    }

    let manifest = Manifest {
        key_prefix: paths.key_prefix().to_string(),
        sections,
        sidecar: paths
            .sidecar
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        schema_fingerprint: tables.schema.fingerprint(),
        offset_policy: tables.policy,
        anchor: tables.anchor,
        created_at: Utc::now(),
    };
    writer.add_json(SectionType::Manifest, &manifest)?;
    Ok(writer)
}

/// Load every table from the cache
///
/// A missing or unreadable aggregate section yields an empty surface. The
/// plan is read from this family's sidecar and must match the plan derived
/// from the cached schema; otherwise the sidecar is rewritten from it.
pub fn load(paths: &DatasetPaths) -> Result<LoadedCache, ContainerError> {
    let container = CacheContainer::from_file(&paths.cache)?;
    let manifest: Manifest = container.read_json(SectionType::Manifest)?;
    let schema: Schema = container.read_json(SectionType::Schema)?;
    let index: ObjectIndex = container.read_json(SectionType::ObjectIndex)?;
    let scalars: ScalarSurface = container.read_json(SectionType::Scalars)?;

    if manifest.schema_fingerprint != schema.fingerprint() {
        warn!(
            "Cache {:?}: schema fingerprint differs from manifest",
            paths.cache
        );
    }

    let aggregates = match container.read_json::<AggregateSurface>(SectionType::VecAggs) {
        Ok(aggregates) => aggregates,
        Err(ContainerError::SectionMissing(_)) => AggregateSurface::new(),
        Err(e) => {
            warn!("Cache {:?}: aggregate surface dropped: {}", paths.cache, e);
            AggregateSurface::new()
        }
    };

    let derived = DecodingPlan::from_schema(&schema).map_err(|e| ContainerError::Serialization {
        section: SectionType::Schema.name(),
        reason: e.to_string(),
    })?;
    let plan = match read_sidecar(&paths.sidecar) {
        Ok(Some(plan)) if plan == derived => plan,
        outcome => {
            match outcome {
                Ok(Some(plan)) => warn!(
                    "Decoding plan sidecar {:?} ({} bytes per record) does not match the cached schema ({} bytes); rebuilding",
                    paths.sidecar,
                    plan.record_length(),
                    derived.record_length()
                ),
                Ok(None) => warn!("Decoding plan sidecar {:?} missing; rebuilding", paths.sidecar),
                Err(e) => warn!("Decoding plan sidecar {:?} unusable: {}; rebuilding", paths.sidecar, e),
            }
            write_sidecar(&paths.sidecar, &derived)?;
            derived
        }
    };

    debug!(
        "Cache {:?} loaded: {} scalar rows, {} aggregate rows",
        paths.cache,
        scalars.len(),
        aggregates.len()
    );
    Ok(LoadedCache {
        manifest,
        schema,
        index,
        scalars,
        aggregates,
        plan,
    })
}

/// Warn when the cached surface and the snapshot store disagree
pub fn check_consistency(scalars: &ScalarSurface, summary: Option<StoreSummary>) -> bool {
    let from_surface = match (scalars.first(), scalars.last()) {
        (Some(first), Some(last)) => Some((first, last, scalars.len())),
        _ => None,
    };
    let from_store = summary.map(|s| (s.first, s.last, s.count));
    if from_surface != from_store {
        warn!(
            "Scalar surface {:?} and snapshot store {:?} disagree",
            from_surface, from_store
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_freshness() {
        let dir = TempDir::new().unwrap();
        let mx1 = dir.path().join("m.MX1");
        let mxs = dir.path().join("m.MXS");
        let cache = dir.path().join("m.h5");

        std::fs::write(&mx1, b"x").unwrap();
        assert!(!is_fresh(&cache, &mx1, &mxs));

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(&cache, b"x").unwrap();
        assert!(is_fresh(&cache, &mx1, &mxs));

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(&mxs, b"x").unwrap();
        assert!(!is_fresh(&cache, &mx1, &mxs));
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.h5.metadata");
        assert!(read_sidecar(&path).unwrap().is_none());

        let plan = DecodingPlan::from_packed("C32 C4 R I R2").unwrap();
        write_sidecar(&path, &plan).unwrap();
        assert_eq!(read_sidecar(&path).unwrap(), Some(plan));
    }

    #[test]
    fn test_consistency_check() {
        let empty = ScalarSurface::new(vec!["a".to_string()]);
        assert!(check_consistency(&empty, None));

        let t = DateTime::from_timestamp(1_520_035_200, 0).unwrap();
        let summary = StoreSummary {
            first: t,
            last: t,
            count: 1,
            violations: 0,
        };
        assert!(!check_consistency(&empty, Some(summary)));
    }
}
