//! Partitioned, multi-threaded hash join.
//!
//! [`PartitionedHashJoinExec`] reads its build input into per-partition row
//! tables, indexes them in parallel and then streams the probe input through a
//! pool of probe workers. Joins that must emit build rows nobody matched run a
//! residual scan over the row tables once probing is done.

mod build;
pub mod chunk;
pub mod codec;
pub mod config;
mod context;
pub mod error;
mod exec;
pub mod hash_table;
mod join_probe;
pub mod meta;
pub mod predicate;
mod probe;
pub mod row_table;
mod row_table_builder;
pub mod source;
pub mod stats;
pub mod tracker;

pub use chunk::{Chunk, Datum, FieldType, Row, TypeKind};
pub use config::{JoinConfig, JoinType};
pub use error::{JoinError, Result, Side};
pub use exec::PartitionedHashJoinExec;
pub use predicate::Predicate;
pub use source::{MemorySource, RowSource};
pub use stats::HashJoinRuntimeStats;
pub use tracker::{DiskTracker, MemTracker};
