// SPDX-License-Identifier: MIT
//! Aggregate surface and engine
//!
//! The surface holds one value vector per (kind, channel, left, right).
//! `TIME`, `TMIN` and `TMAX` rows come from the solver during ingest; `MIN`,
//! `MAX` and `DIF` rows are computed on request by streaming the snapshots
//! of a range out of the store, one at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Context, ErrorKind, MxError, Result};
use crate::snapshot_store::SnapshotStore;
use crate::timestamp::SnapshotType;
use crate::value::{reals64, Vector};

/// Kind of an aggregate row, in surface order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    Time,
    Tmin,
    Tmax,
    Min,
    Max,
    Dif,
}

impl AggregateKind {
    pub fn all() -> &'static [AggregateKind] {
        &[
            AggregateKind::Time,
            AggregateKind::Tmin,
            AggregateKind::Tmax,
            AggregateKind::Min,
            AggregateKind::Max,
            AggregateKind::Dif,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Time => "TIME",
            AggregateKind::Tmin => "TMIN",
            AggregateKind::Tmax => "TMAX",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Dif => "DIF",
        }
    }

    /// Kind a solver record of this snapshot type contributes, if any
    pub fn from_snapshot(snapshot: SnapshotType) -> Option<Self> {
        match snapshot {
            SnapshotType::Time => Some(AggregateKind::Time),
            SnapshotType::Tmin => Some(AggregateKind::Tmin),
            SnapshotType::Tmax => Some(AggregateKind::Tmax),
            SnapshotType::Stat => None,
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of one aggregate row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub kind: AggregateKind,
    pub cid: String,
    pub left: DateTime<Utc>,
    pub right: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct AggregateEntry {
    #[serde(flatten)]
    key: AggregateKey,
    #[serde(with = "reals64")]
    values: Vec<f64>,
}

/// Memoized aggregate rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<AggregateEntry>", into = "Vec<AggregateEntry>")]
pub struct AggregateSurface {
    rows: BTreeMap<AggregateKey, Vec<f64>>,
}

impl From<Vec<AggregateEntry>> for AggregateSurface {
    fn from(entries: Vec<AggregateEntry>) -> Self {
        let mut surface = AggregateSurface::default();
        for entry in entries {
            surface.rows.entry(entry.key).or_insert(entry.values);
        }
        surface
    }
}

impl From<AggregateSurface> for Vec<AggregateEntry> {
    fn from(surface: AggregateSurface) -> Self {
        surface
            .rows
            .into_iter()
            .map(|(key, values)| AggregateEntry { key, values })
            .collect()
    }
}

impl AggregateSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Longest value vector
    pub fn width(&self) -> usize {
        self.rows.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn kinds(&self) -> BTreeSet<AggregateKind> {
        self.rows.keys().map(|key| key.kind).collect()
    }

    /// Rows of one kind
    pub fn count_kind(&self, kind: AggregateKind) -> usize {
        self.rows.keys().filter(|key| key.kind == kind).count()
    }

    pub fn get(&self, key: &AggregateKey) -> Option<&[f64]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggregateKey, &[f64])> + '_ {
        self.rows.iter().map(|(key, values)| (key, values.as_slice()))
    }

    /// Add a row unless its key exists; returns whether it was added
    pub fn insert(&mut self, key: AggregateKey, values: Vec<f64>) -> bool {
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, values);
        true
    }

    /// Add one row per numeric vector channel; character channels are skipped
    pub fn insert_snapshot(
        &mut self,
        kind: AggregateKind,
        left: DateTime<Utc>,
        right: DateTime<Utc>,
        cids: &[String],
        vectors: &[Vector],
    ) -> usize {
        cids.iter()
            .zip(vectors)
            .filter_map(|(cid, vector)| Some((cid, vector.to_f64()?)))
            .filter(|(cid, values)| {
                self.insert(
                    AggregateKey {
                        kind,
                        cid: (*cid).clone(),
                        left,
                        right,
                    },
                    values.clone(),
                )
            })
            .count()
    }

    fn has(&self, kind: AggregateKind, left: DateTime<Utc>, right: DateTime<Utc>) -> bool {
        self.rows
            .keys()
            .any(|key| key.kind == kind && key.left == left && key.right == right)
    }

    fn select(&self, left: DateTime<Utc>, right: DateTime<Utc>, cached: bool) -> Aggregates {
        let rows = self
            .rows
            .iter()
            .filter(|(key, _)| key.left == left && key.right == right)
            .map(|(key, values)| ((key.kind, key.cid.clone()), values.clone()))
            .collect();
        Aggregates {
            left,
            right,
            cached,
            rows,
        }
    }
}

/// Parameters of an aggregate request
///
/// Missing ends default to the first and last scalar timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateRequest {
    pub t_left: Option<DateTime<Utc>>,
    pub t_right: Option<DateTime<Utc>>,
    pub include_left: bool,
    pub include_right: bool,
    pub single_time: bool,
}

impl Default for AggregateRequest {
    fn default() -> Self {
        Self {
            t_left: None,
            t_right: None,
            include_left: true,
            include_right: true,
            single_time: false,
        }
    }
}

impl AggregateRequest {
    pub fn range(left: DateTime<Utc>, right: DateTime<Utc>) -> Self {
        Self {
            t_left: Some(left),
            t_right: Some(right),
            ..Self::default()
        }
    }

    /// The snapshot at one instant
    pub fn single(at: DateTime<Utc>) -> Self {
        Self {
            t_left: Some(at),
            t_right: Some(at),
            single_time: true,
            ..Self::default()
        }
    }

    pub fn include(mut self, left: bool, right: bool) -> Self {
        self.include_left = left;
        self.include_right = right;
        self
    }
}

/// Aggregate rows of one request, indexed by (kind, channel)
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregates {
    pub left: DateTime<Utc>,
    pub right: DateTime<Utc>,
    /// Served from the aggregate surface without touching the store
    pub cached: bool,
    rows: BTreeMap<(AggregateKind, String), Vec<f64>>,
}

impl Aggregates {
    pub fn get(&self, kind: AggregateKind, cid: &str) -> Option<&[f64]> {
        self.rows.get(&(kind, cid.to_string())).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn kinds(&self) -> BTreeSet<AggregateKind> {
        self.rows.keys().map(|(kind, _)| *kind).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AggregateKind, &str, &[f64])> + '_ {
        self.rows
            .iter()
            .map(|((kind, cid), values)| (*kind, cid.as_str(), values.as_slice()))
    }
}

/// Running elementwise statistics of one channel
struct Accumulator {
    first: Vec<f64>,
    last: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Accumulator {
    fn new(values: Vec<f64>) -> Self {
        Self {
            first: values.clone(),
            last: values.clone(),
            min: values.clone(),
            max: values,
        }
    }

    fn update(&mut self, values: Vec<f64>) {
        for (m, v) in self.min.iter_mut().zip(&values) {
            *m = m.min(*v);
        }
        for (m, v) in self.max.iter_mut().zip(&values) {
            *m = m.max(*v);
        }
        self.last = values;
    }

    fn dif(&self) -> Vec<f64> {
        self.last.iter().zip(&self.first).map(|(l, f)| l - f).collect()
    }
}

/// Serve or compute the aggregates of `request`
///
/// `index` is the scalar surface index and `cids` the vector channel
/// identifiers in store order.
pub fn compute(
    request: &AggregateRequest,
    index: &[DateTime<Utc>],
    cids: &[String],
    store: &SnapshotStore,
    surface: &mut AggregateSurface,
) -> Result<Aggregates> {
    const OP: &str = "aggregates";

    let (Some(&first), Some(&last)) = (index.first(), index.last()) else {
        return Err(MxError::new(OP, ErrorKind::EmptySurface));
    };
    let left = request.t_left.unwrap_or(first);
    let right = request.t_right.unwrap_or(last);
    if !request.single_time && right <= left {
        return Err(MxError::new(OP, ErrorKind::InvalidRange { left, right }));
    }
    let l = index
        .binary_search(&left)
        .map_err(|_| MxError::new(OP, ErrorKind::TimestampNotInIndex(left)))?;
    let r = index
        .binary_search(&right)
        .map_err(|_| MxError::new(OP, ErrorKind::TimestampNotInIndex(right)))?;

    let start = l + usize::from(!request.include_left);
    let end = r + usize::from(request.include_right);
    let times = index.get(start..end).unwrap_or(&[]);
    let (Some(&t_first), Some(&t_last)) = (times.first(), times.last()) else {
        return Err(MxError::new(OP, ErrorKind::InvalidRange { left, right }));
    };
    let t_last = if request.single_time { t_first } else { t_last };

    let probe = if request.single_time {
        AggregateKind::Time
    } else {
        AggregateKind::Min
    };
    if surface.has(probe, t_first, t_last) {
        debug!("Aggregates {}..{} served from cache", t_first, t_last);
        return Ok(surface.select(t_first, t_last, true));
    }

    if !store.exists() {
        return Err(MxError::new(
            OP,
            ErrorKind::SnapshotStoreMissing(store.path().to_path_buf()),
        ));
    }
    let mut reader = store.reader().op(OP)?;

    if request.single_time {
        let row = reader
            .find(t_first, false)
            .op(OP)?
            .ok_or_else(|| MxError::new(OP, ErrorKind::SnapshotNotFound(t_first)))?;
        let added = surface.insert_snapshot(AggregateKind::Time, t_first, t_first, cids, &row.vectors);
        debug!("Aggregates at {}: {} TIME rows", t_first, added);
        return Ok(surface.select(t_first, t_first, false));
    }

    let mut accumulators: Vec<Option<Accumulator>> = Vec::new();
    for &t in times {
        let row = reader
            .find(t, false)
            .op(OP)?
            .ok_or_else(|| MxError::new(OP, ErrorKind::SnapshotNotFound(t)))?;
        if accumulators.is_empty() {
            accumulators = row
                .vectors
                .into_iter()
                .map(|vector| vector.to_f64().map(Accumulator::new))
                .collect();
            continue;
        }
        for (accumulator, vector) in accumulators.iter_mut().zip(row.vectors) {
            if let (Some(accumulator), Some(values)) = (accumulator, vector.to_f64()) {
                accumulator.update(values);
            }
        }
    }

    for (cid, accumulator) in cids.iter().zip(&accumulators) {
        let Some(accumulator) = accumulator else { continue };
        for (kind, values) in [
            (AggregateKind::Min, accumulator.min.clone()),
            (AggregateKind::Max, accumulator.max.clone()),
            (AggregateKind::Dif, accumulator.dif()),
        ] {
            surface.insert(
                AggregateKey {
                    kind,
                    cid: cid.clone(),
                    left: t_first,
                    right: t_last,
                },
                values,
            );
        }
    }
    info!(
        "Aggregated {} snapshots {}..{} over {} channels",
        times.len(),
        t_first,
        t_last,
        cids.len()
    );

    Ok(surface.select(t_first, t_last, false))
}
