// SPDX-License-Identifier: MIT
//! Scalar surface: one row of scalar channel values per timestamp
//!
//! Rows are kept unique and ascending by timestamp at all times; the only
//! place where duplicates and disorder can exist is [`PendingScalars`], the
//! buffer an ingest pass fills before it is finished into a surface.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cid;
use crate::value::{Value, Vector};

/// Rows collected during one ingest pass, in stream order
#[derive(Debug, Clone)]
pub struct PendingScalars {
    columns: Vec<String>,
    rows: Vec<(DateTime<Utc>, Vec<Value>)>,
    seen: HashSet<DateTime<Utc>>,
}

impl PendingScalars {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, values: Vec<Value>) {
        self.seen.insert(timestamp);
        self.rows.push((timestamp, values));
    }

    /// Rows pushed so far, duplicates included
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct timestamps pushed so far
    pub fn unique_len(&self) -> usize {
        self.seen.len()
    }

    /// Smallest timestamp pushed so far
    pub fn min_timestamp(&self) -> Option<DateTime<Utc>> {
        self.seen.iter().min().copied()
    }

    /// Drop repeated timestamps (first occurrence wins) and sort ascending
    pub fn finish(self) -> ScalarSurface {
        let mut kept = HashSet::with_capacity(self.seen.len());
        let mut rows: Vec<_> = self
            .rows
            .into_iter()
            .filter(|(timestamp, _)| kept.insert(*timestamp))
            .collect();
        rows.sort_by_key(|(timestamp, _)| *timestamp);

        let (index, rows) = rows.into_iter().unzip();
        ScalarSurface {
            columns: self.columns,
            index,
            rows,
        }
    }
}

/// Timestamp-indexed table of scalar values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ColumnarScalars", into = "ColumnarScalars")]
pub struct ScalarSurface {
    columns: Vec<String>,
    index: Vec<DateTime<Utc>>,
    rows: Vec<Vec<Value>>,
}

impl ScalarSurface {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            index: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.index.len(), self.columns.len())
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.index.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.index.last().copied()
    }

    pub fn position(&self, timestamp: DateTime<Utc>) -> Option<usize> {
        self.index.binary_search(&timestamp).ok()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.position(timestamp).is_some()
    }

    pub fn row(&self, timestamp: DateTime<Utc>) -> Option<&[Value]> {
        self.position(timestamp).map(|i| self.rows[i].as_slice())
    }

    pub fn row_at(&self, position: usize) -> Option<(DateTime<Utc>, &[Value])> {
        Some((*self.index.get(position)?, self.rows.get(position)?.as_slice()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &[Value])> + '_ {
        self.index
            .iter()
            .copied()
            .zip(self.rows.iter().map(Vec::as_slice))
    }

    pub fn column_position(&self, cid: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == cid)
    }

    pub fn get(&self, timestamp: DateTime<Utc>, cid: &str) -> Option<&Value> {
        let column = self.column_position(cid)?;
        self.row(timestamp)?.get(column)
    }

    /// All values of one column, in index order
    pub fn column(&self, cid: &str) -> Option<Vec<&Value>> {
        let column = self.column_position(cid)?;
        Some(self.rows.iter().map(|row| &row[column]).collect())
    }

    /// First column whose identifier without primary key matches `cid`
    ///
    /// `cid` may be given in either form.
    pub fn column_for_cid_without_pk(&self, cid: &str) -> Option<&str> {
        let wanted = cid::normalize(cid)?;
        self.columns
            .iter()
            .find(|column| cid::normalize(column).as_deref() == Some(wanted.as_str()))
            .map(String::as_str)
    }

    /// Merge another surface in; on repeated timestamps the existing row wins
    ///
    /// Incoming columns are matched by name. Fails when a column of this
    /// surface is missing from `other`.
    pub fn append(&mut self, other: ScalarSurface) -> Result<(), String> {
        let mapping = self
            .columns
            .iter()
            .map(|cid| {
                other
                    .column_position(cid)
                    .ok_or_else(|| format!("column {cid} missing from appended rows"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = PendingScalars::new(std::mem::take(&mut self.columns));
        for (timestamp, row) in self.index.drain(..).zip(self.rows.drain(..)) {
            pending.push(timestamp, row);
        }
        let before = pending.unique_len();
        for (timestamp, row) in other.index.into_iter().zip(other.rows) {
            pending.push(timestamp, mapping.iter().map(|&i| row[i].clone()).collect());
        }
        debug!(
            "Appending scalar rows: {} existing, {} new timestamps",
            before,
            pending.unique_len() - before
        );

        *self = pending.finish();
        Ok(())
    }

    /// Copy with every timestamp moved by `delta`
    pub fn shift(&self, delta: Duration) -> ScalarSurface {
        ScalarSurface {
            columns: self.columns.clone(),
            index: self.index.iter().map(|t| *t + delta).collect(),
            rows: self.rows.clone(),
        }
    }

    /// Rename columns to their form without primary key
    ///
    /// Columns whose identifier does not parse keep their name. This can
    /// produce duplicate column names.
    pub fn strip_primary_keys(&mut self) {
        for column in &mut self.columns {
            if let Some(stripped) = cid::normalize(column) {
                *column = stripped;
            }
        }
    }

    pub fn duplicate_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for column in &self.columns {
            if !seen.insert(column.as_str()) && !duplicates.contains(column) {
                duplicates.push(column.clone());
            }
        }
        duplicates
    }

    /// Remove repeated column names, keeping the first; returns how many went
    pub fn drop_duplicate_columns(&mut self) -> usize {
        let mut seen = HashSet::new();
        let keep: Vec<bool> = self
            .columns
            .iter()
            .map(|column| seen.insert(column.clone()))
            .collect();
        let dropped = keep.iter().filter(|k| !**k).count();
        if dropped == 0 {
            return 0;
        }

        let mut flags = keep.iter();
        self.columns.retain(|_| *flags.next().unwrap_or(&true));
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
        dropped
    }
}

/// Column-major form used for persistence
#[derive(Serialize, Deserialize)]
struct ColumnarScalars {
    index: Vec<DateTime<Utc>>,
    columns: Vec<String>,
    data: Vec<ColumnData>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ColumnData {
    Typed(Vector),
    Mixed(Vec<Value>),
}

impl ColumnData {
    fn collect(values: Vec<&Value>) -> Self {
        let typed = match values.first() {
            Some(Value::Chars(_)) => values
                .iter()
                .map(|v| match v {
                    Value::Chars(bytes) => Some(bytes.clone()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Vector::Chars),
            Some(Value::Int(_)) => values
                .iter()
                .map(|v| match v {
                    Value::Int(x) => Some(*x),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Vector::Ints),
            Some(Value::Real(_)) | None => values
                .iter()
                .map(|v| match v {
                    Value::Real(x) => Some(*x),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Vector::Reals),
        };
        match typed {
            Some(vector) => ColumnData::Typed(vector),
            None => ColumnData::Mixed(values.into_iter().cloned().collect()),
        }
    }

    fn into_values(self) -> Vec<Value> {
        match self {
            ColumnData::Typed(Vector::Chars(v)) => v.into_iter().map(Value::Chars).collect(),
            ColumnData::Typed(Vector::Ints(v)) => v.into_iter().map(Value::Int).collect(),
            ColumnData::Typed(Vector::Reals(v)) => v.into_iter().map(Value::Real).collect(),
            ColumnData::Mixed(v) => v,
        }
    }
}

impl From<ScalarSurface> for ColumnarScalars {
    fn from(surface: ScalarSurface) -> Self {
        let data = (0..surface.columns.len())
            .map(|j| ColumnData::collect(surface.rows.iter().map(|row| &row[j]).collect()))
            .collect();
        ColumnarScalars {
            index: surface.index,
            columns: surface.columns,
            data,
        }
    }
}

impl TryFrom<ColumnarScalars> for ScalarSurface {
    type Error = String;

    fn try_from(columnar: ColumnarScalars) -> Result<Self, Self::Error> {
        if columnar.data.len() != columnar.columns.len() {
            return Err(format!(
                "{} columns named, {} stored",
                columnar.columns.len(),
                columnar.data.len()
            ));
        }
        if columnar.index.windows(2).any(|w| w[0] >= w[1]) {
            return Err("scalar index is not strictly ascending".to_string());
        }

        let n = columnar.index.len();
        let mut rows: Vec<Vec<Value>> = (0..n)
            .map(|_| Vec::with_capacity(columnar.columns.len()))
            .collect();
        for (column, data) in columnar.columns.iter().zip(columnar.data) {
            let values = data.into_values();
            if values.len() != n {
                return Err(format!("column {column} has {} of {n} values", values.len()));
            }
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(value);
            }
        }

        Ok(ScalarSurface {
            columns: columnar.columns,
            index: columnar.index,
            rows,
        })
    }
}
