//! tabletdb: a single-node, column-oriented, mutable key-ordered tablet
//! storage engine with MVCC.
//!
//! A [`Tablet`] owns a disjoint key range of a larger table and provides
//! durable, snapshot-isolated inserts, updates, deletes, and projected
//! range scans, with background flush and compaction swapping storage
//! underneath concurrent readers and writers.

#![feature(error_generic_member_access)]
#![deny(unused_must_use)]

// public modules and structures
pub mod clock;
pub mod error;
pub mod iterator;
pub mod mutation;
pub mod mvcc;
pub mod options;
pub mod schema;
pub mod tablet;

// internal modules and structures
mod bloom;
mod cfile;
mod compaction;
mod components;
mod delta;
mod keycode;
mod lock_manager;
mod memrowset;
mod metadata;
pub mod probe;
mod proto;
mod rowset;
mod rowset_tree;

pub use clock::{HybridClock, Timestamp};
pub use compaction::{CompactFlags, CompactionStats};
pub use error::{TabletError, TabletResult, TracedTabletError};
pub use iterator::{
    ColumnPredicate, PredicateOp, RowBlock, ScanRange, ScanSpec, TabletIterator,
};
pub use mutation::{ColumnUpdate, RowChange};
pub use mvcc::MvccSnapshot;
pub use options::TabletOptions;
pub use schema::{ColumnDesc, ColumnId, DataType, Datum, Row, Schema};
pub use tablet::{PreparedWrite, Tablet, WriteTransaction};

#[cfg(any(test, feature = "failpoints"))]
pub use probe as fault_probe;
