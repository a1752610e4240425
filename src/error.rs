// SPDX-License-Identifier: MIT
//! Error types surfaced by [`crate::Dataset`]
//!
//! Every component owns a narrow error enum; they all roll up into
//! [`ErrorKind`], which [`MxError`] carries together with the name of the
//! failing operation and the source line the failure was raised from.

use std::panic::Location;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::codec::CodecError;
use crate::container::ContainerError;
use crate::object_index::IndexError;
use crate::schema::SchemaError;
use crate::snapshot_store::StoreError;

/// Underlying cause of an [`MxError`]
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream missing: {}", .0.display())]
    StreamMissing(PathBuf),

    #[error("Archive missing: {}", .0.display())]
    ArchiveMissing(PathBuf),

    #[error("Archive unreadable: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Snapshot store missing: {}", .0.display())]
    SnapshotStoreMissing(PathBuf),

    #[error("Timestamp not in index: {0}")]
    TimestampNotInIndex(DateTime<Utc>),

    #[error("Invalid range: right {right} <= left {left}")]
    InvalidRange {
        left: DateTime<Utc>,
        right: DateTime<Utc>,
    },

    #[error("No snapshot for {0}")]
    SnapshotNotFound(DateTime<Utc>),

    #[error("Scalar surface is empty")]
    EmptySurface,

    #[error("Column mismatch: {0}")]
    ColumnMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The single error type returned by the public API
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed (line {line}): {kind}")]
pub struct MxError {
    /// Name of the operation that failed, e.g. `"ingest_stream"`
    pub operation: &'static str,

    /// Source line the error was raised from
    pub line: u32,

    #[source]
    pub kind: ErrorKind,
}

impl MxError {
    /// Build an error at the caller's location
    #[track_caller]
    pub fn new(operation: &'static str, kind: impl Into<ErrorKind>) -> Self {
        Self {
            operation,
            line: Location::caller().line(),
            kind: kind.into(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

/// Attach an operation name (and the caller's line) to a component error
pub(crate) trait Context<T> {
    fn op(self, operation: &'static str) -> Result<T, MxError>;
}

impl<T, E> Context<T> for Result<T, E>
where
    E: Into<ErrorKind>,
{
    #[track_caller]
    fn op(self, operation: &'static str) -> Result<T, MxError> {
        let line = Location::caller().line();
        self.map_err(|e| MxError {
            operation,
            line,
            kind: e.into(),
        })
    }
}

pub type Result<T, E = MxError> = std::result::Result<T, E>;
