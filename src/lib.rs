// SPDX-License-Identifier: MIT
//! # MX result datasets
//!
//! Reader, cache and writer for the result files of an MX hydraulic
//! simulation run.
//!
//! ## Files
//!
//! A run is addressed by its schema file `<base><dotres>.MX1`. Next to it:
//!
//! | File | Role |
//! |------|------|
//! | `<base>.MX2` | object index (object keys, pipe point counts) |
//! | `<base><dotres>.MXS` / `.ZIP` | fixed-width result records |
//! | `<base>.h5` | cache of schema, index, scalar and aggregate tables |
//! | `<base>.h5.metadata` | decoding plan sidecar |
//! | `<base><dotres>.vec.h5` | snapshot store of vector results |
//!
//! ## Data flow
//!
//! ```text
//! MX1 ──► Schema ──► DecodingPlan
//!                        │
//! MXS/ZIP ──records──────┴──► scalar values ──► ScalarSurface ──► cache
//!                             vector values ──► SnapshotStore
//!                                                    │
//!                              AggregateRequest ─────┴──► AggregateSurface
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use mx_dataset::{AggregateRequest, Dataset, DatasetConfig};
//!
//! let mut dataset = Dataset::open_with("B1/V0/BZ1/M-1-0-1.MX1", DatasetConfig::default())?;
//! println!("{:?}", dataset.scalars().shape());
//!
//! let aggregates = dataset.aggregates(&AggregateRequest::default())?;
//! println!("{} aggregate rows", aggregates.len());
//!
//! dataset.persist_cache(None)?;
//! # Ok::<(), mx_dataset::MxError>(())
//! ```

pub mod aggregate;
pub mod cache;
pub mod cid;
pub mod codec;
pub mod compression_strategy;
pub mod config;
pub mod container;
pub mod dataset;
pub mod error;
pub mod format;
pub mod object_index;
pub mod paths;
pub mod reader;
pub mod scalar;
pub mod schema;
pub mod snapshot_store;
pub mod timestamp;
pub mod value;
pub mod writer;

// Re-export main types
pub use aggregate::{AggregateKind, AggregateRequest, AggregateSurface, Aggregates};
pub use cid::Cid;
pub use codec::{CodecError, DecodingPlan, PlanItem};
pub use compression_strategy::{CompressionConfig, CompressionEngine, CompressionMode};
pub use config::DatasetConfig;
pub use container::{CacheContainer, ContainerError, ContainerWriter};
pub use dataset::Dataset;
pub use error::{ErrorKind, MxError, Result};
pub use format::SectionType;
pub use object_index::{IndexError, ObjectIndex};
pub use paths::DatasetPaths;
pub use reader::{IngestMode, IngestOptions};
pub use scalar::ScalarSurface;
pub use schema::{Channel, Schema, SchemaError};
pub use snapshot_store::{SnapshotStore, StoreError, StoreSummary};
pub use timestamp::{OffsetPolicy, SnapshotType};
pub use value::{Slot, Value, Vector, VectorRow};
pub use writer::{DumpReport, MxsWriter};
